use serde_derive::Deserialize;
use std::path::Path;

use crate::error::Error;
use crate::view::Calibration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub motion: MotionConfig,
    pub team: TeamConfig,
    pub metrics: MetricsConfig,
    pub pipeline: PipelineConfig,
    pub query: QueryConfig,
}

impl Config {
    pub fn from_json_str(src: &str) -> Result<Self, Error> {
        let config: Config = serde_json::from_str(src)?;
        config.validate()?;

        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let src = std::fs::read_to_string(path)?;

        Self::from_json_str(&src)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::Config(format!("{} must be within [0, 1], got {}", name, v)))
            }
        };

        let positive = |name: &str, v: f32| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(Error::Config(format!("{} must be positive, got {}", name, v)))
            }
        };

        unit("tracker.confidence_floor", self.tracker.confidence_floor)?;
        positive("tracker.max_cost", self.tracker.max_cost)?;
        unit("tracker.appearance_weight", self.tracker.appearance_weight)?;
        unit("motion.min_consensus", self.motion.min_consensus)?;
        positive("metrics.possession_distance", self.metrics.possession_distance)?;
        positive("metrics.default_fps", self.metrics.default_fps)?;
        positive("metrics.window_secs", self.metrics.window_secs)?;
        positive("metrics.max_plausible_kmh", self.metrics.max_plausible_kmh)?;

        if self.tracker.predictor_horizon < 2 {
            return Err(Error::Config("tracker.predictor_horizon must be at least 2".into()));
        }

        if self.team.min_samples == 0 {
            return Err(Error::Config("team.min_samples must be at least 1".into()));
        }

        if self.pipeline.detection_workers == 0 || self.pipeline.batch_size == 0 {
            return Err(Error::Config(
                "pipeline.detection_workers and pipeline.batch_size must be at least 1".into(),
            ));
        }

        self.metrics.calibration.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Detections below this confidence are dropped before association.
    pub confidence_floor: f32,
    /// Assignments costing more than this are rejected.
    pub max_cost: f32,
    /// Frames a lost track survives before it is terminated.
    pub occlusion_tolerance: u32,
    /// Observations used by the constant-velocity predictor.
    pub predictor_horizon: usize,
    pub appearance_weight: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
            max_cost: 0.8,
            occlusion_tolerance: 30,
            predictor_horizon: 3,
            appearance_weight: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Upper bound on background corners tracked per frame.
    pub max_features: usize,
    /// Fewer matched corners than this leaves the frame uncompensated.
    pub min_features: usize,
    /// Half size of the matching patch, in pixels.
    pub patch_radius: usize,
    /// Maximum displacement searched in each direction, in pixels.
    pub search_range: usize,
    /// Minimum spacing between selected corners.
    pub min_distance: usize,
    /// Corners with a weaker response than this fraction of the strongest are ignored.
    pub quality_level: f32,
    /// Inlier radius of the consensus fit, in pixels.
    pub inlier_threshold: f32,
    /// Minimal inlier share for a transform to be trusted.
    pub min_consensus: f32,
    /// Displacements below this are treated as a still camera.
    pub min_displacement: f32,
    /// Extra margin around track boxes excluded from corner selection.
    pub box_margin: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            max_features: 100,
            min_features: 6,
            patch_radius: 4,
            search_range: 12,
            min_distance: 8,
            quality_level: 0.05,
            inlier_threshold: 1.5,
            min_consensus: 0.5,
            min_displacement: 0.5,
            box_margin: 4.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    /// Signatures a player needs before it takes part in clustering.
    pub min_samples: usize,
    /// Distinct players needed for the first match-wide clustering.
    pub min_players: usize,
    /// Centroid distance (RGB) below which the two kits are considered inseparable.
    pub min_separation: f32,
    pub max_iterations: usize,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            min_players: 4,
            min_separation: 40.0,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub calibration: Calibration,
    /// Frame rate assumed when the source reports none.
    pub default_fps: f32,
    /// Frames of the sliding window used to smooth speeds.
    pub speed_window: usize,
    /// Ball-to-feet distance (pixels) within which a player controls the ball.
    pub possession_distance: f32,
    /// Two players of different teams closer than this margin contest the ball.
    pub contest_margin: f32,
    pub sprint_kmh: f32,
    /// Speeds above this are treated as tracking glitches and not reported.
    pub max_plausible_kmh: f32,
    /// Length of the possession breakdown windows, in seconds.
    pub window_secs: f32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            calibration: Calibration::default(),
            default_fps: 25.0,
            speed_window: 5,
            possession_distance: 70.0,
            contest_margin: 10.0,
            sprint_kmh: 25.2,
            max_plausible_kmh: 45.0,
            window_secs: 15.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection_workers: usize,
    /// Frames detected in parallel before they are handed to the tracker in order.
    pub batch_size: usize,
    /// Attempts after the first transient detector failure.
    pub detector_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_workers: 4,
            batch_size: 8,
            detector_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub timeout_secs: u64,
    /// Leaders listed per statistic in the grounding context.
    pub top_n: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            top_n: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            Config::from_json_str(r#"{"tracker": {"occlusion_tolerance": 12}}"#).unwrap();
        assert_eq!(config.tracker.occlusion_tolerance, 12);
        assert_eq!(config.tracker.predictor_horizon, 3);
        assert_eq!(config.metrics.possession_distance, 70.0);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(Config::from_json_str(r#"{"tracker": {"confidence_floor": 1.5}}"#).is_err());
        assert!(Config::from_json_str(r#"{"pipeline": {"batch_size": 0}}"#).is_err());
    }

    #[test]
    fn homography_calibration_from_json() {
        let src = r#"{"metrics": {"calibration": {"homography": {
            "pixel": [[0, 1080], [0, 0], [1920, 0], [1920, 1080]],
            "pitch": [[0, 68], [0, 0], [105, 0], [105, 68]]
        }}}}"#;
        let config = Config::from_json_str(src).unwrap();
        assert!(matches!(
            config.metrics.calibration,
            Calibration::Homography { .. }
        ));
    }
}
