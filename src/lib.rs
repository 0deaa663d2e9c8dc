pub mod analysis;
pub mod bbox;
pub mod color;
pub mod config;
pub mod detection;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod motion;
pub mod pipeline;
pub mod query;
pub mod scene;
pub mod service;
pub mod store;
pub mod team;
pub mod track;
pub mod view;

mod cluster;
mod math;
mod predictor;
mod rolling_avg;
mod tracker;

pub use analysis::{AnalysisId, AnalysisResult};
pub use config::Config;
pub use detection::{Detection, ObjectClass, RawDetection};
pub use error::{DetectError, Error, PipelineError, Stage};
pub use frame::Frame;
pub use pipeline::{CancelToken, Detector, FrameSource, IterSource, Pipeline};
pub use query::{LanguageModel, QueryEngine, QueryOutcome};
pub use service::AnalysisService;
pub use store::{AnalysisStatus, AnalysisStore};
pub use track::{TeamLabel, Track, TrackId};
