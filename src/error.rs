use crate::analysis::AnalysisId;
use crate::track::TrackId;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid detection at frame {frame_index}: {reason}")]
    InvalidDetection { frame_index: u64, reason: String },

    #[error("frame {got} arrived out of order (last processed frame was {expected_after})")]
    OutOfOrderFrame { expected_after: u64, got: u64 },

    #[error("track id {0} was already issued in this run")]
    TrackIdReused(TrackId),

    #[error("track {0} is terminated and cannot be updated")]
    TerminatedTrackUpdate(TrackId),

    #[error("detector failed at frame {frame_index}: {message}")]
    Detector { frame_index: u64, message: String },

    #[error("frame source failed: {0}")]
    Source(String),

    #[error("language model failed: {0}")]
    Generation(String),

    #[error("run was cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline stage in which a run aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde_derive::Serialize, serde_derive::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Source,
    Detection,
    Tracking,
    CameraMotion,
    TeamClassification,
    Metrics,
    Persistence,
    /// The run panicked; the failing stage is unknown.
    Internal,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Detection => "detection",
            Stage::Tracking => "tracking",
            Stage::CameraMotion => "camera motion",
            Stage::TeamClassification => "team classification",
            Stage::Metrics => "metrics",
            Stage::Persistence => "persistence",
            Stage::Internal => "internal",
        };

        f.write_str(name)
    }
}

/// An unrecoverable failure that aborted one analysis run.
#[derive(Debug, Error)]
#[error("analysis {analysis_id} failed during {stage}: {source}")]
pub struct PipelineError {
    pub analysis_id: AnalysisId,
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl PipelineError {
    pub fn new(analysis_id: AnalysisId, stage: Stage, source: Error) -> Self {
        Self {
            analysis_id,
            stage,
            source,
        }
    }
}

/// Failure reported by a detector adapter for a single frame.
#[derive(Debug, Clone, Error)]
pub enum DetectError {
    #[error("transient detector failure: {0}")]
    Transient(String),

    #[error("fatal detector failure: {0}")]
    Fatal(String),
}
