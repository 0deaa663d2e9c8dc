use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::analysis::{AnalysisId, AnalysisResult};
use crate::config::Config;
use crate::error::{Error, Stage};
use crate::metrics::{Rankings, TrackMetrics};
use crate::pipeline::{CancelToken, Detector, FrameSource, Pipeline};
use crate::query::{LanguageModel, QueryEngine, QueryOutcome};
use crate::store::{AnalysisStatus, AnalysisStore};
use crate::track::TrackId;

/// Metrics of one track together with its standing among field players.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlayerStats {
    pub metrics: TrackMetrics,
    pub rankings: Option<Rankings>,
}

/// Outward interface: submit videos, poll them, ask about finished ones.
///
/// Runs execute on tokio's blocking pool, so `submit` must be called from
/// within a runtime.
#[derive(Clone)]
pub struct AnalysisService {
    pipeline: Arc<Pipeline>,
    store: AnalysisStore,
    engine: Arc<QueryEngine>,
    running: Arc<Mutex<HashMap<AnalysisId, CancelToken>>>,
}

impl AnalysisService {
    pub fn new(config: Config, store: AnalysisStore, model: Arc<dyn LanguageModel>) -> Result<Self, Error> {
        let engine = QueryEngine::new(model, config.query.clone());
        let pipeline = Pipeline::new(config)?;

        Ok(Self {
            pipeline: Arc::new(pipeline),
            store,
            engine: Arc::new(engine),
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    #[inline]
    pub fn store(&self) -> &AnalysisStore {
        &self.store
    }

    #[inline]
    pub fn generation_available(&self) -> bool {
        self.engine.is_available()
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<AnalysisId, CancelToken>> {
        match self.running.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn submit(&self, source: Box<dyn FrameSource>, detector: Arc<dyn Detector>) -> AnalysisId {
        let id = AnalysisId::new();
        let cancel = CancelToken::new();

        self.store.register(id);
        self.tokens().insert(id, cancel.clone());
        info!(analysis_id = %id, "analysis submitted");

        let this = self.clone();
        let run = tokio::task::spawn_blocking(move || {
            let mut source = source;
            let store = this.store.clone();

            store.set_running(id, 0);
            let outcome = this.pipeline.run(id, source.as_mut(), detector.as_ref(), &cancel, |frames| {
                store.set_running(id, frames)
            });

            this.tokens().remove(&id);

            match outcome {
                Ok(result) => {
                    if let Err(err) = store.complete(result) {
                        error!(analysis_id = %id, %err, "failed to persist analysis");
                        store.fail(id, Stage::Persistence, err.to_string());
                    }
                }
                Err(err) => store.fail(id, err.stage, err.source.to_string()),
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = run.await {
                error!(analysis_id = %id, %err, "analysis run aborted");
                this.tokens().remove(&id);
                this.store.fail(id, Stage::Internal, err.to_string());
            }
        });

        id
    }

    pub fn status(&self, id: AnalysisId) -> Option<AnalysisStatus> {
        self.store.status(id)
    }

    /// Requests cancellation of a running analysis. Returns false when
    /// nothing is running under `id`.
    pub fn cancel(&self, id: AnalysisId) -> bool {
        match self.tokens().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn wait(&self, id: AnalysisId) -> Option<AnalysisStatus> {
        self.store.wait_finished(id).await
    }

    /// A failed analysis never gets a result and is reported as not found.
    fn completed(&self, id: AnalysisId) -> Result<Arc<AnalysisResult>, QueryOutcome> {
        match self.store.status(id) {
            None | Some(AnalysisStatus::Failed { .. }) => Err(QueryOutcome::NotFound),
            Some(AnalysisStatus::Completed(result)) => Ok(result),
            Some(_) => Err(QueryOutcome::NotReady),
        }
    }

    pub async fn summary(&self, id: AnalysisId) -> QueryOutcome {
        match self.completed(id) {
            Ok(result) => self.engine.summarize(&result).await,
            Err(outcome) => outcome,
        }
    }

    pub async fn query(&self, id: AnalysisId, question: &str) -> QueryOutcome {
        match self.completed(id) {
            Ok(result) => self.engine.answer(&result, question).await,
            Err(outcome) => outcome,
        }
    }

    pub fn player_stats(&self, id: AnalysisId, track_id: TrackId) -> Result<PlayerStats, QueryOutcome> {
        let result = self.completed(id)?;
        let metrics = result.metrics.track(track_id).ok_or(QueryOutcome::NotFound)?;

        Ok(PlayerStats {
            metrics: metrics.clone(),
            rankings: result.metrics.rankings(track_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::RawDetection;
    use crate::error::DetectError;
    use crate::frame::Frame;
    use crate::pipeline::IterSource;
    use async_trait::async_trait;
    use ndarray::Array3;

    struct Canned;

    #[async_trait]
    impl LanguageModel for Canned {
        async fn generate(&self, _system: &str, _prompt: &str) -> Result<String, Error> {
            Ok("summary".into())
        }
    }

    fn service() -> AnalysisService {
        AnalysisService::new(Config::default(), AnalysisStore::in_memory(), Arc::new(Canned)).unwrap()
    }

    fn source(n: u64) -> Box<dyn FrameSource> {
        let frames: Vec<Frame> = (0..n)
            .map(|i| Frame::new(i, i as f32 / 25.0, Array3::from_elem((48, 64, 3), 90)))
            .collect();

        Box::new(IterSource::new(frames, Some(25.0)))
    }

    fn walker() -> Arc<dyn Detector> {
        Arc::new(|frame: &Frame| -> Result<Vec<RawDetection>, DetectError> {
            Ok(vec![RawDetection {
                x: 4.0 + frame.index as f32,
                y: 10.0,
                w: 8.0,
                h: 20.0,
                confidence: 0.9,
                class: "player".into(),
            }])
        })
    }

    #[tokio::test]
    async fn unknown_analysis_is_not_found() {
        let service = service();
        assert!(service.generation_available());
        assert_eq!(service.summary(AnalysisId::new()).await, QueryOutcome::NotFound);
    }

    #[tokio::test]
    async fn pending_analysis_is_not_ready() {
        let service = service();
        let id = AnalysisId::new();
        service.store().register(id);

        assert_eq!(service.query(id, "who was fastest?").await, QueryOutcome::NotReady);
        assert_eq!(service.player_stats(id, TrackId(1)), Err(QueryOutcome::NotReady));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submitted_analysis_completes() {
        let service = service();
        let id = service.submit(source(10), walker());

        let status = service.wait(id).await.unwrap();
        let result = status.result().unwrap();
        assert_eq!(result.video.frames, 10);
        assert_eq!(result.tracks.len(), 1);

        let track_id = result.tracks[0].track_id;
        let stats = service.player_stats(id, track_id).unwrap();
        assert_eq!(stats.metrics.frames, 10);
        assert_eq!(stats.rankings.unwrap().distance.position, 1);

        assert_eq!(service.summary(id).await.answer(), Some("summary"));
        assert!(!service.cancel(id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_run_reports_its_stage() {
        let service = service();
        let detector: Arc<dyn Detector> = Arc::new(|_: &Frame| -> Result<Vec<RawDetection>, DetectError> {
            Err(DetectError::Fatal("gpu lost".into()))
        });
        let id = service.submit(source(3), detector);

        let status = service.wait(id).await.unwrap();
        assert!(matches!(status, AnalysisStatus::Failed { stage: Stage::Detection, .. }));
        assert_eq!(service.summary(id).await, QueryOutcome::NotFound);
    }
}
