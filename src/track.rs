use nalgebra as na;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::bbox::{BBox, Ltwh};
use crate::detection::ObjectClass;
use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Team label. Goalkeepers and referees get fixed labels and are never clustered.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TeamLabel {
    A,
    B,
    Goalkeeper,
    Referee,
}

impl TeamLabel {
    #[inline]
    pub fn is_team(&self) -> bool {
        matches!(self, TeamLabel::A | TeamLabel::B)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TeamLabel::A => "team A",
            TeamLabel::B => "team B",
            TeamLabel::Goalkeeper => "goalkeeper",
            TeamLabel::Referee => "referee",
        }
    }
}

impl fmt::Display for TeamLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle: Active -> Lost -> Terminated. A terminated track never comes back.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TrackState {
    Active,
    Lost { since: u64, missed: u32 },
    Terminated { at: u64 },
}

impl TrackState {
    #[inline]
    pub fn is_terminated(&self) -> bool {
        matches!(self, TrackState::Terminated { .. })
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, TrackState::Active)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackPoint {
    pub frame_index: u64,
    pub timestamp: f32,
    pub bbox: BBox<Ltwh>,
    /// Anchor point with camera motion removed, in pixels of the first frame.
    pub compensated: Option<[f32; 2]>,
    /// Set when camera motion could not be estimated for this frame.
    pub uncompensated: bool,
}

impl TrackPoint {
    pub fn new(frame_index: u64, timestamp: f32, bbox: BBox<Ltwh>) -> Self {
        Self {
            frame_index,
            timestamp,
            bbox,
            compensated: None,
            uncompensated: false,
        }
    }

    #[inline]
    pub fn compensated_point(&self) -> Option<na::Point2<f32>> {
        self.compensated.map(|[x, y]| na::Point2::new(x, y))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "track_id")]
pub enum TrackDelta {
    Spawned(TrackId),
    Updated(TrackId),
    Lost(TrackId),
    Terminated(TrackId),
}

impl TrackDelta {
    pub fn track_id(&self) -> TrackId {
        match self {
            TrackDelta::Spawned(id)
            | TrackDelta::Updated(id)
            | TrackDelta::Lost(id)
            | TrackDelta::Terminated(id) => *id,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Track {
    id: TrackId,
    class: ObjectClass,
    state: TrackState,
    history: Vec<TrackPoint>,
    team: Option<TeamLabel>,
    team_low_confidence: bool,
    confidence_sum: f32,
}

impl Track {
    pub fn new(id: TrackId, class: ObjectClass, first: TrackPoint, confidence: f32) -> Self {
        Self {
            id,
            class,
            state: TrackState::Active,
            history: vec![first],
            team: None,
            team_low_confidence: false,
            confidence_sum: confidence,
        }
    }

    #[inline]
    pub fn id(&self) -> TrackId {
        self.id
    }

    #[inline]
    pub fn class(&self) -> ObjectClass {
        self.class
    }

    #[inline]
    pub fn state(&self) -> TrackState {
        self.state
    }

    #[inline]
    pub fn history(&self) -> &[TrackPoint] {
        &self.history
    }

    #[inline]
    pub fn last(&self) -> Option<&TrackPoint> {
        self.history.last()
    }

    #[inline]
    pub fn team(&self) -> Option<TeamLabel> {
        self.team
    }

    #[inline]
    pub fn team_low_confidence(&self) -> bool {
        self.team_low_confidence
    }

    pub fn mean_confidence(&self) -> f32 {
        self.confidence_sum / self.history.len().max(1) as f32
    }

    /// Appends an observation. History stays strictly increasing in frame index.
    pub fn observe(&mut self, point: TrackPoint, confidence: f32) -> Result<(), Error> {
        if self.state.is_terminated() {
            return Err(Error::TerminatedTrackUpdate(self.id));
        }

        if let Some(last) = self.history.last() {
            if point.frame_index <= last.frame_index {
                return Err(Error::OutOfOrderFrame {
                    expected_after: last.frame_index,
                    got: point.frame_index,
                });
            }
        }

        self.history.push(point);
        self.confidence_sum += confidence;
        self.state = TrackState::Active;

        Ok(())
    }

    /// Ages the track by one missed frame. Returns the new state.
    pub fn miss(&mut self, frame_index: u64, tolerance: u32) -> TrackState {
        self.state = match self.state {
            TrackState::Active => TrackState::Lost {
                since: frame_index,
                missed: 1,
            },
            TrackState::Lost { since, missed } => TrackState::Lost {
                since,
                missed: missed + 1,
            },
            terminated @ TrackState::Terminated { .. } => terminated,
        };

        if let TrackState::Lost { missed, .. } = self.state {
            if missed > tolerance {
                self.state = TrackState::Terminated { at: frame_index };
            }
        }

        self.state
    }

    /// Writes the camera-compensated anchor of the latest observation.
    pub fn compensate_last(&mut self, point: Option<na::Point2<f32>>, uncompensated: bool) {
        if let Some(last) = self.history.last_mut() {
            last.compensated = point.map(|p| [p.x, p.y]);
            last.uncompensated = uncompensated;
        }
    }

    /// Sets the team once. Returns `false` when a label is already finalized.
    pub fn assign_team(&mut self, team: TeamLabel, low_confidence: bool) -> bool {
        if self.team.is_some() {
            return false;
        }

        self.team = Some(team);
        self.team_low_confidence = low_confidence;
        true
    }

    /// Explicit re-classification, the only way a finalized label may change.
    pub fn reclassify_team(&mut self, team: TeamLabel, low_confidence: bool) {
        self.team = Some(team);
        self.team_low_confidence = low_confidence;
    }

    /// Anchor point used for motion: feet for people, center for the ball.
    pub fn anchor(&self, bbox: &BBox<Ltwh>) -> na::Point2<f32> {
        if self.class.is_person() {
            bbox.foot()
        } else {
            bbox.center()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(idx: u64) -> TrackPoint {
        TrackPoint::new(idx, idx as f32 / 25.0, BBox::ltwh(0.0, 0.0, 10.0, 20.0))
    }

    #[test]
    fn history_rejects_out_of_order_frames() {
        let mut t = Track::new(TrackId(1), ObjectClass::Player, point(5), 0.9);
        assert!(t.observe(point(6), 0.9).is_ok());
        assert!(matches!(
            t.observe(point(6), 0.9),
            Err(Error::OutOfOrderFrame { .. })
        ));
    }

    #[test]
    fn lost_track_terminates_after_tolerance() {
        let mut t = Track::new(TrackId(1), ObjectClass::Player, point(0), 0.9);
        assert!(matches!(t.miss(1, 2), TrackState::Lost { missed: 1, .. }));
        assert!(matches!(t.miss(2, 2), TrackState::Lost { missed: 2, .. }));
        assert!(matches!(t.miss(3, 2), TrackState::Terminated { at: 3 }));
        assert!(matches!(
            t.observe(point(4), 0.9),
            Err(Error::TerminatedTrackUpdate(_))
        ));
    }

    #[test]
    fn observation_revives_lost_track() {
        let mut t = Track::new(TrackId(1), ObjectClass::Player, point(0), 0.9);
        t.miss(1, 5);
        t.observe(point(2), 0.9).unwrap();
        assert!(t.state().is_active());
    }

    #[test]
    fn team_is_assigned_once() {
        let mut t = Track::new(TrackId(1), ObjectClass::Player, point(0), 0.9);
        assert!(t.assign_team(TeamLabel::A, false));
        assert!(!t.assign_team(TeamLabel::B, false));
        assert_eq!(t.team(), Some(TeamLabel::A));

        t.reclassify_team(TeamLabel::B, true);
        assert_eq!(t.team(), Some(TeamLabel::B));
    }
}
