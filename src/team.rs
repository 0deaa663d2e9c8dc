use ndarray::ArrayView3;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::cluster::KMeans;
use crate::color::{torso_signature, ColorSignature};
use crate::config::TeamConfig;
use crate::detection::ObjectClass;
use crate::track::{TeamLabel, TrackId};

/// Final label for one track.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TeamVerdict {
    pub track_id: TrackId,
    pub team: TeamLabel,
    pub low_confidence: bool,
}

/// Reference kit colors, team A is the lighter kit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TeamModel {
    pub team_a: ColorSignature,
    pub team_b: ColorSignature,
    /// Set when the kits could not be separated by color and brightness decided instead.
    pub low_confidence: bool,
    /// Brightness split used by the low-confidence fallback.
    pub brightness_split: Option<f32>,
}

impl TeamModel {
    fn label(&self, signature: &ColorSignature) -> TeamLabel {
        match self.brightness_split {
            Some(split) => {
                if signature.brightness() >= split {
                    TeamLabel::A
                } else {
                    TeamLabel::B
                }
            }
            None => {
                if signature.distance(&self.team_a) <= signature.distance(&self.team_b) {
                    TeamLabel::A
                } else {
                    TeamLabel::B
                }
            }
        }
    }
}

/// Snapshot of the classifier output that goes into the analysis record.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TeamAssignment {
    pub labels: BTreeMap<TrackId, TeamVerdict>,
    pub model: Option<TeamModel>,
}

impl TeamAssignment {
    pub fn team_of(&self, track_id: TrackId) -> Option<TeamLabel> {
        self.labels.get(&track_id).map(|v| v.team)
    }
}

/// Accumulates jersey colors per track and splits players into two teams.
#[derive(Debug)]
pub struct TeamClassifier {
    config: TeamConfig,
    samples: BTreeMap<TrackId, Vec<ColorSignature>>,
    verdicts: BTreeMap<TrackId, TeamVerdict>,
    model: Option<TeamModel>,
}

impl TeamClassifier {
    pub fn new(config: TeamConfig) -> Self {
        Self {
            config,
            samples: BTreeMap::new(),
            verdicts: BTreeMap::new(),
            model: None,
        }
    }

    #[inline]
    pub fn model(&self) -> Option<&TeamModel> {
        self.model.as_ref()
    }

    #[inline]
    pub fn verdict(&self, track_id: TrackId) -> Option<&TeamVerdict> {
        self.verdicts.get(&track_id)
    }

    pub fn assignment(&self) -> TeamAssignment {
        TeamAssignment {
            labels: self.verdicts.clone(),
            model: self.model,
        }
    }

    /// Crop based entry point; extracts the torso signature and classifies.
    pub fn classify_crop(
        &mut self,
        track_id: TrackId,
        class: ObjectClass,
        crop: ArrayView3<'_, u8>,
    ) -> Vec<TeamVerdict> {
        let signature = if class == ObjectClass::Player {
            torso_signature(crop)
        } else {
            None
        };

        self.classify(track_id, class, signature)
    }

    /// Feeds one observation and returns every verdict finalized by it.
    ///
    /// Finalized tracks are never re-labelled here; the first clustering can
    /// finalize many waiting tracks at once.
    pub fn classify(
        &mut self,
        track_id: TrackId,
        class: ObjectClass,
        signature: Option<ColorSignature>,
    ) -> Vec<TeamVerdict> {
        if self.verdicts.contains_key(&track_id) {
            return Vec::new();
        }

        let fixed = match class {
            ObjectClass::Ball => return Vec::new(),
            ObjectClass::Goalkeeper => Some(TeamLabel::Goalkeeper),
            ObjectClass::Referee => Some(TeamLabel::Referee),
            ObjectClass::Player => None,
        };

        if let Some(team) = fixed {
            return vec![self.finalize_track(track_id, team, false)];
        }

        let signature = match signature {
            Some(s) => s,
            None => return Vec::new(),
        };

        let count = {
            let entry = self.samples.entry(track_id).or_default();
            entry.push(signature);
            entry.len()
        };

        if count < self.config.min_samples {
            return Vec::new();
        }

        if let Some(model) = self.model {
            let repr = self.representative(track_id);
            return match repr {
                Some(repr) => {
                    let team = model.label(&repr);
                    vec![self.finalize_track(track_id, team, model.low_confidence)]
                }
                None => Vec::new(),
            };
        }

        let ready = self.ready_tracks(self.config.min_samples);
        if ready.len() < self.config.min_players.max(2) {
            return Vec::new();
        }

        self.fit(&ready)
    }

    /// Labels every remaining player with at least one sample. Used at end of run.
    pub fn finalize(&mut self) -> Vec<TeamVerdict> {
        let mut out = Vec::new();

        if self.model.is_none() {
            let ready = self.ready_tracks(1);
            if ready.len() >= 2 {
                out.extend(self.fit(&ready));
            }
        }

        let model = match self.model {
            Some(m) => m,
            None => return out,
        };

        let waiting: Vec<TrackId> = self
            .samples
            .keys()
            .copied()
            .filter(|id| !self.verdicts.contains_key(id))
            .collect();

        for track_id in waiting {
            let sparse = self.samples.get(&track_id).map(Vec::len).unwrap_or(0) < self.config.min_samples;

            if let Some(repr) = self.representative(track_id) {
                let team = model.label(&repr);
                out.push(self.finalize_track(track_id, team, model.low_confidence || sparse));
            }
        }

        out
    }

    fn ready_tracks(&self, min_samples: usize) -> Vec<TrackId> {
        self.samples
            .iter()
            .filter(|(id, s)| s.len() >= min_samples && !self.verdicts.contains_key(id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Per-channel median of the accumulated signatures.
    fn representative(&self, track_id: TrackId) -> Option<ColorSignature> {
        let samples = self.samples.get(&track_id)?;
        if samples.is_empty() {
            return None;
        }

        let mut rgb = [0f32; 3];
        for (c, out) in rgb.iter_mut().enumerate() {
            let mut channel: Vec<f32> = samples.iter().map(|s| s.rgb[c]).collect();
            *out = crate::math::median(&mut channel)?;
        }

        Some(ColorSignature::new(rgb))
    }

    fn fit(&mut self, ready: &[TrackId]) -> Vec<TeamVerdict> {
        let reprs: Vec<(TrackId, ColorSignature)> = ready
            .iter()
            .filter_map(|id| self.representative(*id).map(|r| (*id, r)))
            .collect();

        let points: Vec<[f32; 3]> = reprs.iter().map(|(_, r)| r.as_vector()).collect();
        let km = match KMeans::fit(&points, 2, self.config.max_iterations) {
            Some(km) => km,
            None => return Vec::new(),
        };

        let c0 = ColorSignature::new(km.centroids[0]);
        let c1 = ColorSignature::new(km.centroids[1]);
        let (team_a, team_b) = if c0.brightness() >= c1.brightness() {
            (c0, c1)
        } else {
            (c1, c0)
        };

        let sizes = km.cluster_sizes();
        let separated = team_a.distance(&team_b) >= self.config.min_separation
            && sizes.iter().all(|&s| s >= 2 || reprs.len() < 4);

        let model = if separated {
            TeamModel {
                team_a,
                team_b,
                low_confidence: false,
                brightness_split: None,
            }
        } else {
            let mut brightness: Vec<f32> = reprs.iter().map(|(_, r)| r.brightness()).collect();
            let split = crate::math::median(&mut brightness).unwrap_or(128.0);

            warn!(
                separation = team_a.distance(&team_b),
                split, "team kits not separable by color, falling back to brightness"
            );

            TeamModel {
                team_a,
                team_b,
                low_confidence: true,
                brightness_split: Some(split),
            }
        };

        info!(
            players = reprs.len(),
            team_a = ?model.team_a.rgb,
            team_b = ?model.team_b.rgb,
            low_confidence = model.low_confidence,
            "team colors established"
        );

        self.model = Some(model);

        reprs
            .into_iter()
            .map(|(id, repr)| {
                let team = model.label(&repr);
                self.finalize_track(id, team, model.low_confidence)
            })
            .collect()
    }

    fn finalize_track(&mut self, track_id: TrackId, team: TeamLabel, low_confidence: bool) -> TeamVerdict {
        let verdict = TeamVerdict {
            track_id,
            team,
            low_confidence,
        };

        debug!(track_id = %track_id, team = %team, low_confidence, "team finalized");
        self.verdicts.insert(track_id, verdict);

        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: [f32; 3] = [200.0, 30.0, 30.0];
    const WHITE: [f32; 3] = [235.0, 235.0, 235.0];

    fn classifier() -> TeamClassifier {
        TeamClassifier::new(TeamConfig {
            min_samples: 2,
            min_players: 4,
            ..Default::default()
        })
    }

    fn feed(tc: &mut TeamClassifier, id: u32, rgb: [f32; 3]) -> Vec<TeamVerdict> {
        tc.classify(TrackId(id), ObjectClass::Player, Some(ColorSignature::new(rgb)))
    }

    #[test]
    fn referees_and_goalkeepers_get_fixed_labels() {
        let mut tc = classifier();
        let v = tc.classify(TrackId(1), ObjectClass::Referee, None);
        assert_eq!(v[0].team, TeamLabel::Referee);
        let v = tc.classify(TrackId(2), ObjectClass::Goalkeeper, None);
        assert_eq!(v[0].team, TeamLabel::Goalkeeper);
        assert!(tc.classify(TrackId(3), ObjectClass::Ball, None).is_empty());
    }

    #[test]
    fn first_clustering_finalizes_waiting_players() {
        let mut tc = classifier();
        for round in 0..2 {
            for id in 0..4u32 {
                let rgb = if id % 2 == 0 { WHITE } else { RED };
                let verdicts = feed(&mut tc, id, rgb);
                if round == 1 && id == 3 {
                    assert_eq!(verdicts.len(), 4);
                }
            }
        }

        assert_eq!(tc.verdict(TrackId(0)).unwrap().team, TeamLabel::A);
        assert_eq!(tc.verdict(TrackId(1)).unwrap().team, TeamLabel::B);
        assert!(!tc.model().unwrap().low_confidence);
    }

    #[test]
    fn late_players_reuse_centroids() {
        let mut tc = classifier();
        for _ in 0..2 {
            for id in 0..4u32 {
                feed(&mut tc, id, if id % 2 == 0 { WHITE } else { RED });
            }
        }
        let model_before = *tc.model().unwrap();

        assert!(feed(&mut tc, 10, [190.0, 40.0, 35.0]).is_empty());
        let v = feed(&mut tc, 10, [195.0, 35.0, 30.0]);
        assert_eq!(v[0].team, TeamLabel::B);
        assert_eq!(*tc.model().unwrap(), model_before);
    }

    #[test]
    fn finalized_labels_do_not_change() {
        let mut tc = classifier();
        for _ in 0..2 {
            for id in 0..4u32 {
                feed(&mut tc, id, if id % 2 == 0 { WHITE } else { RED });
            }
        }
        assert!(feed(&mut tc, 0, RED).is_empty());
        assert_eq!(tc.verdict(TrackId(0)).unwrap().team, TeamLabel::A);
    }

    #[test]
    fn identical_kits_fall_back_to_low_confidence() {
        let mut tc = classifier();
        for _ in 0..2 {
            for id in 0..4u32 {
                let shade = 100.0 + id as f32 * 3.0;
                feed(&mut tc, id, [shade, shade, shade]);
            }
        }
        let model = tc.model().unwrap();
        assert!(model.low_confidence);
        assert!(tc.verdict(TrackId(0)).unwrap().low_confidence);
    }

    #[test]
    fn finalize_labels_sparse_players() {
        let mut tc = classifier();
        feed(&mut tc, 0, WHITE);
        feed(&mut tc, 1, RED);
        let verdicts = tc.finalize();
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts.iter().all(|v| v.low_confidence));
    }

    #[test]
    fn crops_are_reduced_to_torso_colors() {
        let mut tc = classifier();
        for _ in 0..2 {
            feed(&mut tc, 0, WHITE);
            feed(&mut tc, 1, WHITE);
            feed(&mut tc, 2, RED);
        }

        let kit = ndarray::Array3::from_shape_fn((40, 20, 3), |(_, _, c)| RED[c] as u8);
        assert!(tc.classify_crop(TrackId(3), ObjectClass::Player, kit.view()).is_empty());
        let verdicts = tc.classify_crop(TrackId(3), ObjectClass::Player, kit.view());

        assert_eq!(verdicts.len(), 4);
        assert_eq!(tc.verdict(TrackId(3)).unwrap().team, tc.verdict(TrackId(2)).unwrap().team);
        assert!(tc.classify_crop(TrackId(4), ObjectClass::Ball, kit.view()).is_empty());
    }
}
