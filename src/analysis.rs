use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::detection::ObjectClass;
use crate::metrics::MatchMetrics;
use crate::team::TeamAssignment;
use crate::track::{TeamLabel, Track, TrackId, TrackPoint};

/// Opaque identifier of one submitted analysis.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AnalysisId(Uuid);

impl AnalysisId {
    pub fn new() -> Self {
        AnalysisId(Uuid::new_v4())
    }
}

impl Default for AnalysisId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AnalysisId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(AnalysisId)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub frames: u64,
    pub fps: f32,
    pub duration_secs: f32,
    pub width: usize,
    pub height: usize,
}

/// Data-quality conditions absorbed during the run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct QualityFlags {
    /// Frames whose camera motion fell back to identity.
    pub uncompensated_frames: Vec<u64>,
    /// Frames treated as detection-less after transient detector failures.
    pub skipped_frames: Vec<u64>,
    /// Detections rejected at the adapter boundary.
    pub invalid_detections: u64,
    pub low_confidence_teams: bool,
    pub no_ball: bool,
}

impl QualityFlags {
    pub fn is_clean(&self) -> bool {
        self.uncompensated_frames.is_empty()
            && self.skipped_frames.is_empty()
            && self.invalid_detections == 0
            && !self.low_confidence_teams
            && !self.no_ball
    }
}

/// Serializable copy of a finished track.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackRecord {
    pub track_id: TrackId,
    pub class: ObjectClass,
    pub team: Option<TeamLabel>,
    pub history: Vec<TrackPoint>,
}

impl From<&Track> for TrackRecord {
    fn from(t: &Track) -> Self {
        TrackRecord {
            track_id: t.id(),
            class: t.class(),
            team: t.team(),
            history: t.history().to_vec(),
        }
    }
}

/// Persisted output of one pipeline run. Read-only once created.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub analysis_id: AnalysisId,
    pub video: VideoInfo,
    pub metrics: MatchMetrics,
    pub teams: TeamAssignment,
    pub tracks: Vec<TrackRecord>,
    pub quality: QualityFlags,
}

impl AnalysisResult {
    pub fn track(&self, track_id: TrackId) -> Option<&TrackRecord> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips_through_text() {
        let id = AnalysisId::new();
        let parsed: AnalysisId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-an-id".parse::<AnalysisId>().is_err());
    }

    #[test]
    fn flags_start_clean() {
        let mut flags = QualityFlags::default();
        assert!(flags.is_clean());

        flags.uncompensated_frames.push(3);
        assert!(!flags.is_clean());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(AnalysisId::new(), AnalysisId::new());
    }
}
