use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisId, AnalysisResult, QualityFlags, TrackRecord, VideoInfo};
use crate::color::torso_signature;
use crate::config::Config;
use crate::detection::{Detection, RawDetection};
use crate::error::{DetectError, Error, PipelineError, Stage};
use crate::frame::Frame;
use crate::metrics;
use crate::motion::CameraMotionEstimator;
use crate::scene::{Candidate, Scene};
use crate::team::{TeamClassifier, TeamVerdict};

/// Ordered, finite stream of decoded frames. Not restartable.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error>;

    /// Native frame rate, if the container reports one.
    fn fps(&self) -> Option<f32> {
        None
    }
}

/// Frame source over any iterator of frames.
pub struct IterSource<I> {
    frames: I,
    fps: Option<f32>,
}

impl<I: Iterator<Item = Frame> + Send> IterSource<I> {
    pub fn new<T: IntoIterator<IntoIter = I>>(frames: T, fps: Option<f32>) -> Self {
        Self {
            frames: frames.into_iter(),
            fps,
        }
    }
}

impl<I: Iterator<Item = Frame> + Send> FrameSource for IterSource<I> {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        Ok(self.frames.next())
    }

    fn fps(&self) -> Option<f32> {
        self.fps
    }
}

/// Object detector. Called from several worker threads at once.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, DetectError>;
}

impl<F> Detector for F
where
    F: Fn(&Frame) -> Result<Vec<RawDetection>, DetectError> + Send + Sync,
{
    fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, DetectError> {
        self(frame)
    }
}

/// Cooperative cancellation, observed between frames only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum Detected {
    Candidates { candidates: Vec<Candidate>, invalid: u64 },
    Skipped,
    Fatal(String),
}

fn detect_frame(detector: &dyn Detector, frame: &Frame, retries: u32) -> Detected {
    let mut attempt = 0;

    let raw = loop {
        match detector.detect(frame) {
            Ok(raw) => break raw,
            Err(DetectError::Transient(message)) if attempt < retries => {
                attempt += 1;
                debug!(frame_index = frame.index, attempt, %message, "retrying detection");
            }
            Err(DetectError::Transient(message)) => {
                warn!(frame_index = frame.index, attempts = attempt + 1, %message, "detection skipped");
                return Detected::Skipped;
            }
            Err(DetectError::Fatal(message)) => return Detected::Fatal(message),
        }
    };

    let mut invalid = 0;
    let candidates = raw
        .iter()
        .filter_map(|r| match Detection::validate(frame.index, r) {
            Ok(det) => Some(det),
            Err(err) => {
                debug!(%err, "detection rejected");
                invalid += 1;
                None
            }
        })
        .map(|det| {
            let signature = if det.class.is_person() {
                frame.crop(&det.bbox).and_then(torso_signature)
            } else {
                None
            };

            Candidate::new(det, signature)
        })
        .collect();

    Detected::Candidates { candidates, invalid }
}

/// Per-run state threaded through every stage. Never shared between runs.
pub struct RunContext {
    analysis_id: AnalysisId,
    scene: Scene,
    motion: CameraMotionEstimator,
    teams: TeamClassifier,
    quality: QualityFlags,
    frames: u64,
    dims: (usize, usize),
    last_timestamp: f32,
}

impl RunContext {
    pub fn new(analysis_id: AnalysisId, config: &Config) -> Self {
        Self {
            analysis_id,
            scene: Scene::new(config.tracker.clone()),
            motion: CameraMotionEstimator::new(config.motion.clone()),
            teams: TeamClassifier::new(config.team.clone()),
            quality: QualityFlags::default(),
            frames: 0,
            dims: (0, 0),
            last_timestamp: 0.0,
        }
    }

    fn fail(&self, stage: Stage, source: Error) -> PipelineError {
        PipelineError::new(self.analysis_id, stage, source)
    }

    fn apply_verdicts(&mut self, verdicts: Vec<TeamVerdict>) {
        for v in verdicts {
            if let Some(track) = self.scene.track_mut(v.track_id) {
                track.assign_team(v.team, v.low_confidence);
            }
        }
    }

    /// Tracking, camera compensation and team accumulation for one frame.
    pub fn process(&mut self, frame: &Frame, candidates: &[Candidate]) -> Result<(), PipelineError> {
        let deltas = self
            .scene
            .update(frame.index, frame.timestamp, candidates)
            .map_err(|e| self.fail(Stage::Tracking, e))?;

        let exclude = self.scene.observed_boxes(frame.index);
        let transform = self.motion.process(frame.gray(), &exclude);
        if !transform.compensated {
            self.quality.uncompensated_frames.push(frame.index);
        }

        let motion = &self.motion;
        self.scene
            .compensate(frame.index, !transform.compensated, |p| motion.compensate(p));

        for (track_id, class, signature) in self.scene.observed(frame.index) {
            let verdicts = self.teams.classify(track_id, class, signature);
            self.apply_verdicts(verdicts);
        }

        debug!(
            analysis_id = %self.analysis_id,
            frame_index = frame.index,
            deltas = deltas.len(),
            dx = transform.dx,
            dy = transform.dy,
            "frame processed"
        );

        self.frames += 1;
        self.dims = frame.dims();
        self.last_timestamp = frame.timestamp;

        Ok(())
    }

    pub fn finish(mut self, fps: f32, config: &Config) -> Result<AnalysisResult, PipelineError> {
        let verdicts = self.teams.finalize();
        self.apply_verdicts(verdicts);

        let assignment = self.teams.assignment();
        self.quality.low_confidence_teams = assignment.labels.values().any(|v| v.low_confidence);

        let tracks = self.scene.into_tracks();
        let metrics = metrics::aggregate(&tracks, fps, &config.metrics)
            .map_err(|e| PipelineError::new(self.analysis_id, Stage::Metrics, e))?;

        self.quality.no_ball = metrics.possession.ball_frames == 0;
        if self.quality.no_ball {
            warn!(analysis_id = %self.analysis_id, "ball never detected, possession unavailable");
        }

        let (width, height) = self.dims;
        let duration_secs = if self.last_timestamp > 0.0 {
            self.last_timestamp + 1.0 / fps
        } else {
            self.frames as f32 / fps
        };

        Ok(AnalysisResult {
            analysis_id: self.analysis_id,
            video: VideoInfo {
                frames: self.frames,
                fps,
                duration_secs,
                width,
                height,
            },
            metrics,
            teams: assignment,
            tracks: tracks.iter().map(TrackRecord::from).collect(),
            quality: self.quality,
        })
    }
}

/// Runs analyses. Detection of a batch of frames fans out on a bounded pool;
/// everything downstream consumes frames strictly in order.
pub struct Pipeline {
    config: Config,
    pool: ThreadPool,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .thread_name(|idx| format!("detect-worker-{idx}"))
            .num_threads(config.pipeline.detection_workers)
            .build()
            .map_err(|err| Error::Config(format!("failed to build worker pool: {err}")))?;

        Ok(Self { config, pool })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run<F>(
        &self,
        analysis_id: AnalysisId,
        source: &mut dyn FrameSource,
        detector: &dyn Detector,
        cancel: &CancelToken,
        mut progress: F,
    ) -> Result<AnalysisResult, PipelineError>
    where
        F: FnMut(u64),
    {
        let fps = source.fps().unwrap_or(self.config.metrics.default_fps);
        let batch_size = self.config.pipeline.batch_size;
        let retries = self.config.pipeline.detector_retries;
        let mut ctx = RunContext::new(analysis_id, &self.config);

        info!(%analysis_id, fps, "analysis started");

        let cancelled = || PipelineError::new(analysis_id, Stage::Source, Error::Cancelled);

        loop {
            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                if cancel.is_cancelled() {
                    return Err(cancelled());
                }

                match source.next_frame() {
                    Ok(Some(frame)) => {
                        frame
                            .validate()
                            .map_err(|e| PipelineError::new(analysis_id, Stage::Source, e))?;
                        batch.push(frame);
                    }
                    Ok(None) => break,
                    Err(e) => return Err(PipelineError::new(analysis_id, Stage::Source, e)),
                }
            }

            if batch.is_empty() {
                break;
            }

            let detected: Vec<Detected> = self.pool.install(|| {
                batch
                    .par_iter()
                    .map(|frame| detect_frame(detector, frame, retries))
                    .collect()
            });

            for (frame, detected) in batch.iter().zip(detected) {
                if cancel.is_cancelled() {
                    return Err(cancelled());
                }

                let candidates = match detected {
                    Detected::Candidates { candidates, invalid } => {
                        ctx.quality.invalid_detections += invalid;
                        candidates
                    }
                    Detected::Skipped => {
                        ctx.quality.skipped_frames.push(frame.index);
                        Vec::new()
                    }
                    Detected::Fatal(message) => {
                        return Err(PipelineError::new(
                            analysis_id,
                            Stage::Detection,
                            Error::Detector {
                                frame_index: frame.index,
                                message,
                            },
                        ));
                    }
                };

                ctx.process(frame, &candidates)?;
                progress(ctx.frames);
            }
        }

        let result = ctx.finish(fps, &self.config)?;

        info!(
            %analysis_id,
            frames = result.video.frames,
            tracks = result.tracks.len(),
            uncompensated = result.quality.uncompensated_frames.len(),
            skipped = result.quality.skipped_frames.len(),
            "analysis finished"
        );

        Ok(result)
    }
}
