use nalgebra as na;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::MetricsConfig;
use crate::detection::ObjectClass;
use crate::error::Error;
use crate::rolling_avg::RollingAvg;
use crate::track::{TeamLabel, Track, TrackId, TrackPoint};
use crate::view::ViewTransformer;

const MPS_TO_KMH: f32 = 3.6;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackMetrics {
    pub track_id: TrackId,
    pub class: ObjectClass,
    pub team: Option<TeamLabel>,
    pub team_low_confidence: bool,
    pub frames: usize,
    pub first_frame: u64,
    pub last_frame: u64,
    pub distance_m: f32,
    pub avg_speed_kmh: f32,
    pub max_speed_kmh: f32,
    pub sprints: u32,
    pub possession_frames: u64,
    /// Share of ball-visible frames this track controlled the ball.
    pub possession_pct: f32,
    pub passes: u32,
    /// 1 minus the share of observations without camera compensation.
    pub confidence: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TeamMetrics {
    pub team: TeamLabel,
    pub players: usize,
    pub distance_m: f32,
    pub avg_speed_kmh: f32,
    pub possession_frames: u64,
    pub possession_pct: f32,
    pub passes: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Controller {
    Player {
        track_id: TrackId,
        team: Option<TeamLabel>,
    },
    /// Two players of opposing teams are equally close.
    Contested,
    /// Ball visible but nobody close enough.
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PossessionSample {
    pub frame_index: u64,
    pub timestamp: f32,
    pub controller: Controller,
}

/// Possession split over frames where the ball was seen.
///
/// `team_a_pct + team_b_pct + contested_pct + unknown_pct` is 100 whenever
/// `ball_frames` is non-zero; frames without a ball are left out entirely.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Possession {
    pub ball_frames: u64,
    pub team_a_frames: u64,
    pub team_b_frames: u64,
    pub contested_frames: u64,
    pub unknown_frames: u64,
    pub team_a_pct: f32,
    pub team_b_pct: f32,
    pub contested_pct: f32,
    pub unknown_pct: f32,
    pub timeline: Vec<PossessionSample>,
}

impl Possession {
    fn from_timeline(timeline: Vec<PossessionSample>) -> Self {
        let mut p = Possession {
            ball_frames: timeline.len() as u64,
            ..Default::default()
        };

        for sample in &timeline {
            match sample.controller {
                Controller::Player {
                    team: Some(TeamLabel::A),
                    ..
                } => p.team_a_frames += 1,
                Controller::Player {
                    team: Some(TeamLabel::B),
                    ..
                } => p.team_b_frames += 1,
                Controller::Contested => p.contested_frames += 1,
                _ => p.unknown_frames += 1,
            }
        }

        p.team_a_pct = pct(p.team_a_frames, p.ball_frames);
        p.team_b_pct = pct(p.team_b_frames, p.ball_frames);
        p.contested_pct = pct(p.contested_frames, p.ball_frames);
        p.unknown_pct = if p.ball_frames == 0 {
            0.0
        } else {
            (100.0 - p.team_a_pct - p.team_b_pct - p.contested_pct).max(0.0)
        };
        p.timeline = timeline;

        p
    }

    /// Possession split over consecutive windows of `window_frames` frames.
    pub fn windows(&self, window_frames: u64) -> Vec<PossessionWindow> {
        let window_frames = window_frames.max(1);
        let mut buckets: BTreeMap<u64, Vec<PossessionSample>> = BTreeMap::new();

        for sample in &self.timeline {
            buckets
                .entry(sample.frame_index / window_frames)
                .or_default()
                .push(*sample);
        }

        buckets
            .into_iter()
            .map(|(bucket, samples)| {
                let p = Possession::from_timeline(samples);
                PossessionWindow {
                    start_frame: bucket * window_frames,
                    end_frame: (bucket + 1) * window_frames - 1,
                    ball_frames: p.ball_frames,
                    team_a_pct: p.team_a_pct,
                    team_b_pct: p.team_b_pct,
                    contested_pct: p.contested_pct,
                    unknown_pct: p.unknown_pct,
                }
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PossessionWindow {
    pub start_frame: u64,
    pub end_frame: u64,
    pub ball_frames: u64,
    pub team_a_pct: f32,
    pub team_b_pct: f32,
    pub contested_pct: f32,
    pub unknown_pct: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MatchEvent {
    PossessionChange {
        frame_index: u64,
        timestamp: f32,
        from: Option<TrackId>,
        to: TrackId,
    },
    Pass {
        frame_index: u64,
        timestamp: f32,
        from: TrackId,
        to: TrackId,
        team: TeamLabel,
    },
    Sprint {
        frame_index: u64,
        timestamp: f32,
        track_id: TrackId,
        speed_kmh: f32,
    },
}

impl MatchEvent {
    pub fn frame_index(&self) -> u64 {
        match self {
            MatchEvent::PossessionChange { frame_index, .. }
            | MatchEvent::Pass { frame_index, .. }
            | MatchEvent::Sprint { frame_index, .. } => *frame_index,
        }
    }
}

/// Ball position on the pitch, in metres.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BallPoint {
    pub frame_index: u64,
    pub timestamp: f32,
    pub position: [f32; 2],
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MatchMetrics {
    pub per_track: Vec<TrackMetrics>,
    pub per_team: Vec<TeamMetrics>,
    pub possession: Possession,
    pub possession_windows: Vec<PossessionWindow>,
    pub events: Vec<MatchEvent>,
    pub ball_trajectory: Vec<BallPoint>,
}

/// Position of a player among all ranked players, 1 is the best.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rank {
    pub position: usize,
    pub of: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rankings {
    pub distance: Rank,
    pub max_speed: Rank,
    pub possession: Rank,
}

impl MatchMetrics {
    pub fn track(&self, track_id: TrackId) -> Option<&TrackMetrics> {
        self.per_track.iter().find(|t| t.track_id == track_id)
    }

    pub fn team(&self, team: TeamLabel) -> Option<&TeamMetrics> {
        self.per_team.iter().find(|t| t.team == team)
    }

    /// Field players ordered by `key`, highest first, ties by track id.
    pub fn leaders<F>(&self, key: F) -> Vec<&TrackMetrics>
    where
        F: Fn(&TrackMetrics) -> f32,
    {
        let mut players: Vec<&TrackMetrics> = self
            .per_track
            .iter()
            .filter(|t| t.class == ObjectClass::Player || t.class == ObjectClass::Goalkeeper)
            .collect();

        players.sort_by(|a, b| key(b).total_cmp(&key(a)).then(a.track_id.cmp(&b.track_id)));
        players
    }

    pub fn rankings(&self, track_id: TrackId) -> Option<Rankings> {
        let rank = |key: fn(&TrackMetrics) -> f32| {
            let ordered = self.leaders(key);
            ordered
                .iter()
                .position(|t| t.track_id == track_id)
                .map(|i| Rank {
                    position: i + 1,
                    of: ordered.len(),
                })
        };

        Some(Rankings {
            distance: rank(|t| t.distance_m)?,
            max_speed: rank(|t| t.max_speed_kmh)?,
            possession: rank(|t| t.possession_pct)?,
        })
    }
}

#[inline]
fn pct(n: u64, d: u64) -> f32 {
    if d == 0 {
        0.0
    } else {
        n as f32 * 100.0 / d as f32
    }
}

struct Kinematics {
    distance_m: f32,
    avg_speed_kmh: f32,
    max_speed_kmh: f32,
    sprints: Vec<(u64, f32, f32)>,
}

/// Converts the tracks of one run into match metrics.
///
/// Positions are the camera-compensated anchors mapped through the
/// calibration; observations without compensation fall back to raw pixels.
pub fn aggregate(tracks: &[Track], fps: f32, config: &MetricsConfig) -> Result<MatchMetrics, Error> {
    let view = ViewTransformer::new(&config.calibration)?;
    let fps = if fps > 0.0 && fps.is_finite() {
        fps
    } else {
        config.default_fps
    };

    let timeline = possession_timeline(tracks, config);
    let possession = Possession::from_timeline(timeline);

    let mut possession_frames: BTreeMap<TrackId, u64> = BTreeMap::new();
    for sample in &possession.timeline {
        if let Controller::Player { track_id, .. } = sample.controller {
            *possession_frames.entry(track_id).or_default() += 1;
        }
    }

    let mut events = Vec::new();
    let mut passes: BTreeMap<TrackId, u32> = BTreeMap::new();
    let mut team_passes: BTreeMap<TeamLabel, u32> = BTreeMap::new();

    let mut holder: Option<(TrackId, Option<TeamLabel>)> = None;
    for sample in &possession.timeline {
        let (to, to_team) = match sample.controller {
            Controller::Player { track_id, team } => (track_id, team),
            _ => continue,
        };

        if holder.map(|(id, _)| id) == Some(to) {
            continue;
        }

        events.push(MatchEvent::PossessionChange {
            frame_index: sample.frame_index,
            timestamp: sample.timestamp,
            from: holder.map(|(id, _)| id),
            to,
        });

        if let Some((from, from_team)) = holder {
            if let (Some(a), Some(b)) = (from_team, to_team) {
                if a == b && a.is_team() {
                    events.push(MatchEvent::Pass {
                        frame_index: sample.frame_index,
                        timestamp: sample.timestamp,
                        from,
                        to,
                        team: a,
                    });
                    *passes.entry(from).or_default() += 1;
                    *team_passes.entry(a).or_default() += 1;
                }
            }
        }

        holder = Some((to, to_team));
    }

    let mut per_track = Vec::with_capacity(tracks.len());
    let mut ball_trajectory = Vec::new();

    for track in tracks {
        let history = track.history();
        let (first, last) = match (history.first(), history.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => continue,
        };

        let kin = kinematics(track, &view, fps, config);

        for &(frame_index, timestamp, speed_kmh) in &kin.sprints {
            events.push(MatchEvent::Sprint {
                frame_index,
                timestamp,
                track_id: track.id(),
                speed_kmh,
            });
        }

        if track.class() == ObjectClass::Ball {
            ball_trajectory.extend(history.iter().filter_map(|pt| {
                world(&view, track, pt).map(|p| BallPoint {
                    frame_index: pt.frame_index,
                    timestamp: pt.timestamp,
                    position: [p.x, p.y],
                })
            }));
        }

        let uncompensated = history.iter().filter(|p| p.uncompensated).count();
        let held = possession_frames.get(&track.id()).copied().unwrap_or(0);

        per_track.push(TrackMetrics {
            track_id: track.id(),
            class: track.class(),
            team: track.team(),
            team_low_confidence: track.team_low_confidence(),
            frames: history.len(),
            first_frame: first.frame_index,
            last_frame: last.frame_index,
            distance_m: kin.distance_m,
            avg_speed_kmh: kin.avg_speed_kmh,
            max_speed_kmh: kin.max_speed_kmh,
            sprints: kin.sprints.len() as u32,
            possession_frames: held,
            possession_pct: pct(held, possession.ball_frames),
            passes: passes.get(&track.id()).copied().unwrap_or(0),
            confidence: 1.0 - uncompensated as f32 / history.len() as f32,
        });
    }

    ball_trajectory.sort_by_key(|b| b.frame_index);
    events.sort_by_key(|e| e.frame_index());

    let per_team = [TeamLabel::A, TeamLabel::B]
        .iter()
        .map(|&team| {
            let players: Vec<&TrackMetrics> = per_track
                .iter()
                .filter(|t| t.class == ObjectClass::Player && t.team == Some(team))
                .collect();

            let n = players.len();
            let (frames, share) = match team {
                TeamLabel::A => (possession.team_a_frames, possession.team_a_pct),
                _ => (possession.team_b_frames, possession.team_b_pct),
            };

            TeamMetrics {
                team,
                players: n,
                distance_m: players.iter().map(|t| t.distance_m).sum(),
                avg_speed_kmh: if n == 0 {
                    0.0
                } else {
                    players.iter().map(|t| t.avg_speed_kmh).sum::<f32>() / n as f32
                },
                possession_frames: frames,
                possession_pct: share,
                passes: team_passes.get(&team).copied().unwrap_or(0),
            }
        })
        .collect();

    let window_frames = (config.window_secs * fps).round().max(1.0) as u64;
    let possession_windows = possession.windows(window_frames);

    debug!(
        tracks = per_track.len(),
        ball_frames = possession.ball_frames,
        events = events.len(),
        "metrics aggregated"
    );

    Ok(MatchMetrics {
        per_track,
        per_team,
        possession,
        possession_windows,
        events,
        ball_trajectory,
    })
}

fn world(view: &ViewTransformer, track: &Track, pt: &TrackPoint) -> Option<na::Point2<f32>> {
    let p = pt
        .compensated_point()
        .unwrap_or_else(|| track.anchor(&pt.bbox));

    view.to_pitch(p)
}

fn kinematics(track: &Track, view: &ViewTransformer, fps: f32, config: &MetricsConfig) -> Kinematics {
    let mut smoother = RollingAvg::new(config.speed_window);
    let mut distance_m = 0.0f32;
    let mut max_speed_kmh = 0.0f32;
    let mut moving_secs = 0.0f32;
    let mut sprinting = false;
    let mut sprints = Vec::new();

    let points: Vec<(&TrackPoint, na::Point2<f32>)> = track
        .history()
        .iter()
        .filter_map(|pt| world(view, track, pt).map(|w| (pt, w)))
        .collect();

    for pair in points.windows(2) {
        let (a, pa) = pair[0];
        let (b, pb) = pair[1];

        let dt = (b.frame_index - a.frame_index) as f32 / fps;
        if dt <= 0.0 {
            continue;
        }

        let d = na::distance(&pa, &pb);
        let raw_kmh = d / dt * MPS_TO_KMH;

        if !raw_kmh.is_finite() || raw_kmh > config.max_plausible_kmh {
            // a jump no player can make, most likely a tracking glitch
            smoother.clear();
            continue;
        }

        distance_m += d;
        moving_secs += dt;

        let speed = smoother.push(raw_kmh);
        max_speed_kmh = max_speed_kmh.max(speed);

        if speed >= config.sprint_kmh {
            if !sprinting {
                sprints.push((b.frame_index, b.timestamp, speed));
            }
            sprinting = true;
        } else {
            sprinting = false;
        }
    }

    let avg_speed_kmh = if moving_secs > 0.0 {
        distance_m / moving_secs * MPS_TO_KMH
    } else {
        0.0
    };

    Kinematics {
        distance_m,
        avg_speed_kmh,
        max_speed_kmh,
        sprints,
    }
}

/// Ball controller per frame with a visible ball, in frame order.
fn possession_timeline(tracks: &[Track], config: &MetricsConfig) -> Vec<PossessionSample> {
    // most confident ball observation per frame
    let mut balls: BTreeMap<u64, (&TrackPoint, f32)> = BTreeMap::new();
    let mut people: BTreeMap<u64, Vec<(&Track, &TrackPoint)>> = BTreeMap::new();

    for track in tracks {
        match track.class() {
            ObjectClass::Ball => {
                let conf = track.mean_confidence();
                for pt in track.history() {
                    let entry = balls.entry(pt.frame_index).or_insert((pt, conf));
                    if conf > entry.1 {
                        *entry = (pt, conf);
                    }
                }
            }
            ObjectClass::Player | ObjectClass::Goalkeeper => {
                for pt in track.history() {
                    people.entry(pt.frame_index).or_default().push((track, pt));
                }
            }
            ObjectClass::Referee => (),
        }
    }

    balls
        .into_iter()
        .map(|(frame_index, (ball, _))| {
            let center = ball.bbox.center();

            let mut near: Vec<(f32, &Track)> = people
                .get(&frame_index)
                .map(|v| v.as_slice())
                .unwrap_or(&[])
                .iter()
                .map(|(track, pt)| (reach(&pt.bbox, center), *track))
                .filter(|(d, _)| *d < config.possession_distance)
                .collect();

            near.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id().cmp(&b.1.id())));

            let controller = match near.as_slice() {
                [] => Controller::Unknown,
                [(d1, first), (d2, second), ..]
                    if d2 - d1 <= config.contest_margin
                        && opposing(first.team(), second.team()) =>
                {
                    Controller::Contested
                }
                [(_, first), ..] => Controller::Player {
                    track_id: first.id(),
                    team: first.team(),
                },
            };

            PossessionSample {
                frame_index,
                timestamp: ball.timestamp,
                controller,
            }
        })
        .collect()
}

/// Distance from the ball to the closer bottom corner of a player box.
fn reach(bbox: &crate::bbox::BBox<crate::bbox::Ltwh>, ball: na::Point2<f32>) -> f32 {
    let bottom = bbox.top() + bbox.height();
    let left = na::Point2::new(bbox.left(), bottom);
    let right = na::Point2::new(bbox.left() + bbox.width(), bottom);

    na::distance(&left, &ball).min(na::distance(&right, &ball))
}

#[inline]
fn opposing(a: Option<TeamLabel>, b: Option<TeamLabel>) -> bool {
    matches!(
        (a, b),
        (Some(TeamLabel::A), Some(TeamLabel::B)) | (Some(TeamLabel::B), Some(TeamLabel::A))
    )
}
