mod common;

use common::{kit, match_scene, slot, COLS, FPS, ROWS};
use pitchtrack::analysis::TrackRecord;
use pitchtrack::{
    AnalysisId, AnalysisResult, CancelToken, Config, IterSource, ObjectClass, Pipeline, TeamLabel,
};

fn run_scene(id: AnalysisId, frames: u64) -> AnalysisResult {
    let (frames, script) = match_scene(frames);
    let pipeline = Pipeline::new(Config::default()).unwrap();
    let mut source = IterSource::new(frames, Some(FPS));

    pipeline
        .run(id, &mut source, &script, &CancelToken::new(), |_| ())
        .unwrap()
}

/// Slot index of a track, recovered from where it was first seen.
fn slot_of(track: &TrackRecord) -> Option<usize> {
    let first = track.history.first()?;

    (0..COLS * ROWS).find(|&i| {
        let (left, top) = slot(i);
        (first.bbox.left() - left as f32).abs() < 1.0 && (first.bbox.top() - top as f32).abs() < 1.0
    })
}

#[test]
fn two_kits_split_into_two_teams() {
    let result = run_scene(AnalysisId::new(), 8);

    let mut by_kit: [Vec<TeamLabel>; 2] = [Vec::new(), Vec::new()];
    for track in result.tracks.iter().filter(|t| t.class == ObjectClass::Player) {
        let i = slot_of(track).unwrap();
        let team = result.teams.team_of(track.track_id).unwrap();
        by_kit[kit(i)].push(team);
    }

    assert_eq!(by_kit[0].len() + by_kit[1].len(), 50);

    let majority = |labels: &[TeamLabel]| {
        let a = labels.iter().filter(|&&l| l == TeamLabel::A).count();
        if a * 2 >= labels.len() {
            TeamLabel::A
        } else {
            TeamLabel::B
        }
    };

    let first = majority(&by_kit[0]);
    let second = majority(&by_kit[1]);
    assert_ne!(first, second);

    let correct = by_kit[0].iter().filter(|&&l| l == first).count()
        + by_kit[1].iter().filter(|&&l| l == second).count();
    assert!(correct * 100 >= 50 * 95, "only {} of 50 players classified correctly", correct);

    let model = result.teams.model.as_ref().unwrap();
    assert!(model.brightness_split.is_none());
}

#[test]
fn possession_adds_up_to_one_hundred() {
    let result = run_scene(AnalysisId::new(), 20);
    let p = &result.metrics.possession;

    assert_eq!(p.ball_frames, 20);
    assert!(!result.quality.no_ball);

    let total = p.team_a_pct + p.team_b_pct + p.contested_pct + p.unknown_pct;
    assert!((total - 100.0).abs() < 0.01, "possession sums to {}", total);
    assert_eq!(
        p.team_a_frames + p.team_b_frames + p.contested_frames + p.unknown_frames,
        p.ball_frames
    );

    assert_eq!(result.metrics.ball_trajectory.len(), 20);
    assert!(result
        .metrics
        .ball_trajectory
        .windows(2)
        .all(|w| w[0].frame_index < w[1].frame_index));
}

#[test]
fn reruns_are_identical() {
    let id = AnalysisId::new();

    let first = run_scene(id, 12);
    let second = run_scene(id, 12);

    assert_eq!(first, second);
}
