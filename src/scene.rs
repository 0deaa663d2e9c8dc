use std::collections::HashSet;

use munkres::{solve_assignment, WeightMatrix};
use nalgebra as na;
use tracing::{debug, info, warn};

use crate::bbox::{BBox, Ltwh};
use crate::color::ColorSignature;
use crate::config::TrackerConfig;
use crate::detection::{Detection, ObjectClass};
use crate::error::Error;
use crate::track::{Track, TrackDelta, TrackId, TrackPoint, TrackState};
use crate::tracker::Object;

const PADDING_COST: f32 = 100000.0;
const CLASSES: [ObjectClass; 4] = [
    ObjectClass::Player,
    ObjectClass::Goalkeeper,
    ObjectClass::Referee,
    ObjectClass::Ball,
];

/// A validated detection together with its appearance, ready for association.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub detection: Detection,
    pub signature: Option<ColorSignature>,
}

impl Candidate {
    pub fn new(detection: Detection, signature: Option<ColorSignature>) -> Self {
        Self {
            detection,
            signature,
        }
    }
}

struct IndexedSlice<'a, T> {
    slice: &'a [T],
    idxs: Vec<usize>,
}

impl<'a, T> IndexedSlice<'a, T> {
    pub fn new_with_indexes(slice: &'a [T], idxs: Vec<usize>) -> Self {
        Self { slice, idxs }
    }

    #[inline]
    pub fn get_index(&self, idx: usize) -> usize {
        self.idxs[idx]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.idxs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.idxs.is_empty()
    }

    #[inline]
    pub fn all_indexes(&self) -> &[usize] {
        &self.idxs
    }
}

impl<'a, T> std::ops::Index<usize> for IndexedSlice<'a, T> {
    type Output = T;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.slice[self.idxs[index]]
    }
}

/// One live identity: its public track plus the association state.
#[derive(Debug)]
struct Participant {
    track: Track,
    object: Object,
    /// Appearance seen in the latest observation.
    signature: Option<ColorSignature>,
}

/// Result of matching one frame's candidates against the live tracks.
struct DetectionsMapping<'a> {
    frame_index: u64,
    timestamp: f32,
    candidates: &'a [Candidate],
    matched: Vec<(usize, usize, f32)>,
    missed: Vec<usize>,
}

/// Multi-object tracker for one analysis run.
///
/// Identities are issued from a monotonic counter and never handed out twice;
/// terminated tracks are moved out of the live set and can not be matched again.
pub struct Scene {
    config: TrackerConfig,
    participants: Vec<Participant>,
    retired: Vec<Track>,
    issued: HashSet<TrackId>,
    next_id: u32,
    last_frame: Option<u64>,
}

impl Scene {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            participants: Vec::with_capacity(64),
            retired: Vec::new(),
            issued: HashSet::new(),
            next_id: 1,
            last_frame: None,
        }
    }

    #[inline]
    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }

    /// Processes one frame and returns what changed.
    pub fn update(
        &mut self,
        frame_index: u64,
        timestamp: f32,
        candidates: &[Candidate],
    ) -> Result<Vec<TrackDelta>, Error> {
        if let Some(last) = self.last_frame {
            if frame_index <= last {
                return Err(Error::OutOfOrderFrame {
                    expected_after: last,
                    got: frame_index,
                });
            }
        }

        let mapping = self.map_detections(frame_index, timestamp, candidates);
        let deltas = self.apply(mapping)?;
        self.last_frame = Some(frame_index);

        Ok(deltas)
    }

    fn assignment<'a>(
        &self,
        frame_index: u64,
        dets: IndexedSlice<'a, Candidate>,
        objs: IndexedSlice<'_, Participant>,
    ) -> (Vec<(usize, usize, f32)>, IndexedSlice<'a, Candidate>) {
        if objs.is_empty() || dets.is_empty() {
            return (Vec::new(), dets);
        }

        let n = dets.len().max(objs.len());
        let max_cost = self.config.max_cost;
        let weight = self.config.appearance_weight;

        let costs: Vec<f32> = (0..n * n)
            .map(|i| {
                let (r, c) = (i / n, i % n);
                if r < objs.len() && c < dets.len() {
                    let cand = &dets[c];
                    objs[r].object.cost(
                        frame_index,
                        &cand.detection,
                        cand.signature.as_ref(),
                        weight,
                    )
                } else {
                    PADDING_COST
                }
            })
            .collect();

        let mut mat = WeightMatrix::from_fn(n, |(r, c)| costs[r * n + c]);

        let pairs: Vec<(usize, usize)> = match solve_assignment(&mut mat) {
            Ok(solution) => solution.into_iter().map(|p| (p.row, p.column)).collect(),
            Err(err) => {
                warn!(frame_index, ?err, "assignment could not be solved, matching greedily");
                greedy(n, |r, c| costs[r * n + c])
            }
        };

        let mut assignments = Vec::new();
        for (row, column) in pairs {
            if row < objs.len() && column < dets.len() {
                let cost = costs[row * n + column];

                if cost <= max_cost {
                    assignments.push((row, column, cost));
                }
            }
        }

        let missed: Vec<usize> = (0..dets.len())
            .filter(|c| !assignments.iter().any(|&(_, d, _)| d == *c))
            .map(|c| dets.get_index(c))
            .collect();

        assignments.iter_mut().for_each(|(r, c, _)| {
            *r = objs.get_index(*r);
            *c = dets.get_index(*c);
        });

        (assignments, IndexedSlice::new_with_indexes(dets.slice, missed))
    }

    /// Active tracks get the first pick; lost ones compete for the leftovers.
    fn map_detections<'a>(
        &self,
        frame_index: u64,
        timestamp: f32,
        candidates: &'a [Candidate],
    ) -> DetectionsMapping<'a> {
        let mut matched = Vec::new();
        let mut missed = Vec::new();

        for class in CLASSES {
            let dets: Vec<usize> = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| {
                    c.detection.class == class && c.detection.confidence >= self.config.confidence_floor
                })
                .map(|(i, _)| i)
                .collect();

            if dets.is_empty() {
                continue;
            }

            let mut active = Vec::new();
            let mut lost = Vec::new();
            for (idx, p) in self.participants.iter().enumerate() {
                if p.track.class() != class {
                    continue;
                }

                match p.track.state() {
                    TrackState::Active => active.push(idx),
                    TrackState::Lost { .. } => lost.push(idx),
                    TrackState::Terminated { .. } => (),
                }
            }

            let dets = IndexedSlice::new_with_indexes(candidates, dets);

            let active = IndexedSlice::new_with_indexes(&self.participants, active);
            let (active_matched, dets_active_missed) = self.assignment(frame_index, dets, active);

            let lost = IndexedSlice::new_with_indexes(&self.participants, lost);
            let (lost_matched, dets_missed) =
                self.assignment(frame_index, dets_active_missed, lost);

            matched.extend(active_matched);
            matched.extend(lost_matched);
            missed.extend_from_slice(dets_missed.all_indexes());
        }

        if candidates.len() > missed.len() + matched.len() {
            debug!(
                frame_index,
                dropped = candidates.len() - missed.len() - matched.len(),
                "detections below confidence floor"
            );
        }

        DetectionsMapping {
            frame_index,
            timestamp,
            candidates,
            matched,
            missed,
        }
    }

    fn apply(&mut self, mapping: DetectionsMapping<'_>) -> Result<Vec<TrackDelta>, Error> {
        let frame_index = mapping.frame_index;
        let cands = mapping.candidates;
        let mut deltas = Vec::new();
        let mut updated = vec![false; self.participants.len()];

        for &(i, j, cost) in &mapping.matched {
            let cand = &cands[j];
            let p = &mut self.participants[i];

            p.track.observe(
                TrackPoint::new(frame_index, mapping.timestamp, cand.detection.bbox),
                cand.detection.confidence,
            )?;
            p.object.update(frame_index, &cand.detection.bbox, cand.signature);
            p.signature = cand.signature;
            updated[i] = true;

            debug!(frame_index, track_id = %p.track.id(), cost, "track matched");
            deltas.push(TrackDelta::Updated(p.track.id()));
        }

        let tolerance = self.config.occlusion_tolerance;
        for (p, _) in self
            .participants
            .iter_mut()
            .zip(updated.iter())
            .filter(|(_, u)| !**u)
        {
            let was_active = p.track.state().is_active();

            match p.track.miss(frame_index, tolerance) {
                TrackState::Lost { .. } if was_active => {
                    deltas.push(TrackDelta::Lost(p.track.id()));
                }
                TrackState::Terminated { .. } => {
                    info!(frame_index, track_id = %p.track.id(), class = %p.track.class(), "track terminated");
                    deltas.push(TrackDelta::Terminated(p.track.id()));
                }
                _ => (),
            }
        }

        let (terminated, live): (Vec<Participant>, Vec<Participant>) = self
            .participants
            .drain(..)
            .partition(|p| p.track.state().is_terminated());

        self.participants = live;
        self.retired.extend(terminated.into_iter().map(|p| p.track));

        for &j in &mapping.missed {
            let cand = &cands[j];
            let id = self.issue_id()?;

            let track = Track::new(
                id,
                cand.detection.class,
                TrackPoint::new(frame_index, mapping.timestamp, cand.detection.bbox),
                cand.detection.confidence,
            );
            let object = Object::new(
                self.config.predictor_horizon,
                frame_index,
                &cand.detection.bbox,
                cand.signature,
            );

            info!(frame_index, track_id = %id, class = %cand.detection.class, "track spawned");
            self.participants.push(Participant {
                track,
                object,
                signature: cand.signature,
            });
            deltas.push(TrackDelta::Spawned(id));
        }

        Ok(deltas)
    }

    fn issue_id(&mut self) -> Result<TrackId, Error> {
        let id = TrackId(self.next_id);
        if !self.issued.insert(id) {
            return Err(Error::TrackIdReused(id));
        }

        self.next_id += 1;

        Ok(id)
    }

    /// Live (active and lost) tracks, in creation order.
    pub fn live(&self) -> impl Iterator<Item = &Track> {
        self.participants.iter().map(|p| &p.track)
    }

    /// Tracks observed in `frame_index` with the appearance of that observation.
    pub fn observed(&self, frame_index: u64) -> Vec<(TrackId, ObjectClass, Option<ColorSignature>)> {
        self.participants
            .iter()
            .filter(|p| p.track.last().map(|pt| pt.frame_index) == Some(frame_index))
            .map(|p| (p.track.id(), p.track.class(), p.signature))
            .collect()
    }

    /// Boxes of tracks observed in `frame_index`.
    pub fn observed_boxes(&self, frame_index: u64) -> Vec<BBox<Ltwh>> {
        self.participants
            .iter()
            .filter_map(|p| p.track.last())
            .filter(|pt| pt.frame_index == frame_index)
            .map(|pt| pt.bbox)
            .collect()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.participants
            .iter()
            .map(|p| &p.track)
            .chain(self.retired.iter())
            .find(|t| t.id() == id)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.participants
            .iter_mut()
            .map(|p| &mut p.track)
            .chain(self.retired.iter_mut())
            .find(|t| t.id() == id)
    }

    /// Writes compensated anchors for every track observed in `frame_index`.
    pub fn compensate<F>(&mut self, frame_index: u64, uncompensated: bool, to_reference: F)
    where
        F: Fn(na::Point2<f32>) -> na::Point2<f32>,
    {
        for p in self.participants.iter_mut() {
            let anchor = match p.track.last() {
                Some(last) if last.frame_index == frame_index => p.track.anchor(&last.bbox),
                _ => continue,
            };

            p.track.compensate_last(Some(to_reference(anchor)), uncompensated);
        }
    }

    /// Every track of the run ordered by id.
    pub fn into_tracks(self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self
            .retired
            .into_iter()
            .chain(self.participants.into_iter().map(|p| p.track))
            .collect();

        tracks.sort_by_key(|t| t.id());
        tracks
    }
}

/// Cheapest-first matching, used only when the exact solver gives up.
fn greedy<F: Fn(usize, usize) -> f32>(n: usize, cost: F) -> Vec<(usize, usize)> {
    let mut cells: Vec<(usize, usize, f32)> = (0..n)
        .flat_map(|r| (0..n).map(move |c| (r, c)))
        .map(|(r, c)| (r, c, cost(r, c)))
        .collect();

    cells.sort_by(|a, b| a.2.total_cmp(&b.2).then(a.0.cmp(&b.0)).then(a.1.cmp(&b.1)));

    let mut rows = vec![false; n];
    let mut cols = vec![false; n];
    let mut out = Vec::new();

    for (r, c, _) in cells {
        if !rows[r] && !cols[c] {
            rows[r] = true;
            cols[c] = true;
            out.push((r, c));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x: f32, y: f32, class: ObjectClass, confidence: f32) -> Candidate {
        let (w, h) = if class == ObjectClass::Ball {
            (8.0, 8.0)
        } else {
            (20.0, 40.0)
        };

        Candidate::new(Detection::new(0, BBox::ltwh(x, y, w, h), class, confidence), None)
    }

    fn player(x: f32, y: f32) -> Candidate {
        cand(x, y, ObjectClass::Player, 0.9)
    }

    fn scene() -> Scene {
        Scene::new(TrackerConfig {
            occlusion_tolerance: 5,
            ..Default::default()
        })
    }

    #[test]
    fn keeps_identity_under_constant_motion() {
        let mut s = scene();
        for f in 0..20u64 {
            let x = 100.0 + f as f32 * 4.0;
            s.update(f, f as f32 / 25.0, &[player(x, 100.0), player(400.0 - x, 300.0)])
                .unwrap();
        }

        let tracks = s.into_tracks();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| t.history().len() == 20));
    }

    #[test]
    fn low_confidence_is_dropped() {
        let mut s = scene();
        let deltas = s
            .update(0, 0.0, &[cand(10.0, 10.0, ObjectClass::Player, 0.1)])
            .unwrap();
        assert!(deltas.is_empty());
        assert_eq!(s.live().count(), 0);
    }

    #[test]
    fn empty_frame_ages_tracks() {
        let mut s = scene();
        s.update(0, 0.0, &[player(10.0, 10.0)]).unwrap();
        let deltas = s.update(1, 0.04, &[]).unwrap();
        assert_eq!(deltas, vec![TrackDelta::Lost(TrackId(1))]);
        assert!(matches!(
            s.live().next().unwrap().state(),
            TrackState::Lost { missed: 1, .. }
        ));
    }

    #[test]
    fn reappearing_within_tolerance_keeps_id() {
        let mut s = scene();
        for f in 0..5u64 {
            s.update(f, 0.0, &[player(100.0 + f as f32 * 2.0, 100.0)]).unwrap();
        }
        for f in 5..9u64 {
            s.update(f, 0.0, &[]).unwrap();
        }
        let deltas = s.update(9, 0.0, &[player(118.0, 100.0)]).unwrap();
        assert_eq!(deltas, vec![TrackDelta::Updated(TrackId(1))]);
    }

    #[test]
    fn terminated_id_is_never_revived() {
        let mut s = scene();
        s.update(0, 0.0, &[player(100.0, 100.0)]).unwrap();
        for f in 1..=6u64 {
            s.update(f, 0.0, &[]).unwrap();
        }
        assert!(s.track(TrackId(1)).unwrap().state().is_terminated());

        let deltas = s.update(7, 0.0, &[player(100.0, 100.0)]).unwrap();
        assert_eq!(deltas, vec![TrackDelta::Spawned(TrackId(2))]);
    }

    #[test]
    fn classes_are_not_mixed() {
        let mut s = scene();
        s.update(0, 0.0, &[player(100.0, 100.0)]).unwrap();
        let deltas = s
            .update(1, 0.04, &[cand(100.0, 100.0, ObjectClass::Referee, 0.9)])
            .unwrap();
        assert!(deltas.contains(&TrackDelta::Spawned(TrackId(2))));
        assert!(deltas.contains(&TrackDelta::Lost(TrackId(1))));
    }

    #[test]
    fn higher_confidence_wins_a_tie() {
        let mut s = scene();
        s.update(0, 0.0, &[player(100.0, 100.0)]).unwrap();
        let frame = [
            cand(100.0, 100.0, ObjectClass::Player, 0.5),
            cand(100.0, 100.0, ObjectClass::Player, 0.95),
        ];
        s.update(1, 0.04, &frame).unwrap();

        let t = s.track(TrackId(1)).unwrap();
        assert!((t.mean_confidence() - (0.9 + 0.95) / 2.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_out_of_order_frames() {
        let mut s = scene();
        s.update(3, 0.0, &[]).unwrap();
        assert!(matches!(
            s.update(3, 0.0, &[]),
            Err(Error::OutOfOrderFrame { expected_after: 3, got: 3 })
        ));
    }

    #[test]
    fn fast_ball_is_followed() {
        let mut s = scene();
        for f in 0..10u64 {
            let x = 50.0 + f as f32 * 15.0;
            s.update(f, 0.0, &[cand(x, 200.0, ObjectClass::Ball, 0.6)]).unwrap();
        }
        assert_eq!(s.into_tracks().len(), 1);
    }

    #[test]
    fn greedy_takes_cheapest_pairs() {
        let costs = [[0.1, 0.2], [0.05, 0.9]];
        let pairs = greedy(2, |r, c| costs[r][c]);
        assert_eq!(pairs, vec![(1, 0), (0, 1)]);
    }
}
