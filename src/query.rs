//! Grounded summaries and answers over a finished analysis.
//!
//! Only aggregated statistics ever reach the language model. When the
//! model is unavailable or too slow the caller gets
//! [`QueryOutcome::GenerationUnavailable`] and no text is made up locally.

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::analysis::AnalysisResult;
use crate::config::QueryConfig;
use crate::error::Error;
use crate::metrics::{MatchEvent, TrackMetrics};
use crate::track::{TeamLabel, TrackId};

pub const SYSTEM_PROMPT: &str = "You are a football analyst. Answer only from the match data supplied \
below. Speeds are in km/h and distances in metres. If the data does not contain what is asked \
(for example formations or tactics), reply exactly: \"That data isn't tracked\".";

/// External text generator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, Error>;

    fn is_available(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Answer(String),
    /// The analysis exists but has not completed.
    NotReady,
    NotFound,
    /// Blank question, the model is not asked.
    EmptyQuestion,
    GenerationUnavailable { reason: String },
}

impl QueryOutcome {
    pub fn answer(&self) -> Option<&str> {
        match self {
            QueryOutcome::Answer(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TeamLine {
    pub team: TeamLabel,
    pub possession_pct: f32,
    pub distance_m: f32,
    pub passes: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlayerLine {
    pub track_id: TrackId,
    pub team: Option<TeamLabel>,
    pub value: f32,
}

/// The statistics handed to the model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroundingContext {
    pub duration_secs: f32,
    pub fps: f32,
    pub players_tracked: usize,
    pub ball_seen_pct: f32,
    pub contested_pct: f32,
    pub teams: Vec<TeamLine>,
    pub possession_leaders: Vec<PlayerLine>,
    pub speed_leaders: Vec<PlayerLine>,
    pub distance_leaders: Vec<PlayerLine>,
    pub passes: usize,
    pub sprints: usize,
    pub low_confidence_teams: bool,
    pub no_ball: bool,
}

fn top(result: &AnalysisResult, n: usize, key: fn(&TrackMetrics) -> f32) -> Vec<PlayerLine> {
    result
        .metrics
        .leaders(key)
        .into_iter()
        .take(n)
        .map(|t| PlayerLine {
            track_id: t.track_id,
            team: t.team,
            value: key(t),
        })
        .collect()
}

impl GroundingContext {
    pub fn new(result: &AnalysisResult, top_n: usize) -> Self {
        let metrics = &result.metrics;
        let ball_seen_pct = if result.video.frames == 0 {
            0.0
        } else {
            metrics.possession.ball_frames as f32 * 100.0 / result.video.frames as f32
        };

        let teams = metrics
            .per_team
            .iter()
            .map(|t| TeamLine {
                team: t.team,
                possession_pct: t.possession_pct,
                distance_m: t.distance_m,
                passes: t.passes,
            })
            .collect();

        let count = |f: fn(&MatchEvent) -> bool| metrics.events.iter().filter(|e| f(e)).count();

        GroundingContext {
            duration_secs: result.video.duration_secs,
            fps: result.video.fps,
            players_tracked: metrics.leaders(|t| t.distance_m).len(),
            ball_seen_pct,
            contested_pct: metrics.possession.contested_pct,
            teams,
            possession_leaders: top(result, top_n, |t| t.possession_pct),
            speed_leaders: top(result, top_n, |t| t.max_speed_kmh),
            distance_leaders: top(result, top_n, |t| t.distance_m),
            passes: count(|e| matches!(e, MatchEvent::Pass { .. })),
            sprints: count(|e| matches!(e, MatchEvent::Sprint { .. })),
            low_confidence_teams: result.quality.low_confidence_teams,
            no_ball: result.quality.no_ball,
        }
    }

    /// Line-per-fact rendering used in prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let player = |p: &PlayerLine| match p.team {
            Some(team) => format!("player {} ({})", p.track_id, team),
            None => format!("player {}", p.track_id),
        };

        let _ = writeln!(
            out,
            "CLIP: {:.1}s at {:.1} fps, {} players tracked",
            self.duration_secs, self.fps, self.players_tracked
        );

        if self.no_ball {
            let _ = writeln!(out, "BALL: never detected, possession unavailable");
        } else {
            let _ = writeln!(out, "BALL: visible in {:.1}% of frames", self.ball_seen_pct);
            let _ = writeln!(out, "POSSESSION:");
            for t in &self.teams {
                let _ = writeln!(out, "  {}: {:.1}%", t.team, t.possession_pct);
            }
            let _ = writeln!(out, "  contested: {:.1}%", self.contested_pct);
        }

        let _ = writeln!(out, "TEAMS:");
        for t in &self.teams {
            let _ = writeln!(out, "  {}: {:.0} m covered, {} passes", t.team, t.distance_m, t.passes);
        }
        if self.low_confidence_teams {
            let _ = writeln!(out, "  note: team assignment is low confidence");
        }

        let _ = writeln!(out, "TOP POSSESSION:");
        for p in &self.possession_leaders {
            let _ = writeln!(out, "  {}: {:.1}%", player(p), p.value);
        }
        let _ = writeln!(out, "TOP SPEED:");
        for p in &self.speed_leaders {
            let _ = writeln!(out, "  {}: {:.1} km/h", player(p), p.value);
        }
        let _ = writeln!(out, "TOP DISTANCE:");
        for p in &self.distance_leaders {
            let _ = writeln!(out, "  {}: {:.0} m", player(p), p.value);
        }

        let _ = write!(out, "EVENTS: {} passes, {} sprints", self.passes, self.sprints);

        out
    }
}

pub struct QueryEngine {
    model: Arc<dyn LanguageModel>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(model: Arc<dyn LanguageModel>, config: QueryConfig) -> Self {
        Self { model, config }
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        self.model.is_available()
    }

    pub fn context(&self, result: &AnalysisResult) -> GroundingContext {
        GroundingContext::new(result, self.config.top_n)
    }

    pub async fn summarize(&self, result: &AnalysisResult) -> QueryOutcome {
        let prompt = format!(
            "Match data:\n{}\n\nWrite a short summary of this clip covering possession, \
             standout players and notable events.",
            self.context(result).render()
        );

        self.generate(&prompt).await
    }

    pub async fn answer(&self, result: &AnalysisResult, question: &str) -> QueryOutcome {
        let question = question.trim();
        if question.is_empty() {
            return QueryOutcome::EmptyQuestion;
        }

        let prompt = format!(
            "Match data:\n{}\n\nQuestion: {}",
            self.context(result).render(),
            question
        );

        self.generate(&prompt).await
    }

    async fn generate(&self, prompt: &str) -> QueryOutcome {
        if !self.model.is_available() {
            return QueryOutcome::GenerationUnavailable {
                reason: "language model is not configured".into(),
            };
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        debug!(prompt_len = prompt.len(), "generating");

        match tokio::time::timeout(timeout, self.model.generate(SYSTEM_PROMPT, prompt)).await {
            Ok(Ok(text)) => QueryOutcome::Answer(text),
            Ok(Err(err)) => {
                warn!(%err, "language model failed");
                QueryOutcome::GenerationUnavailable {
                    reason: err.to_string(),
                }
            }
            Err(_) => {
                warn!(timeout_secs = self.config.timeout_secs, "language model timed out");
                QueryOutcome::GenerationUnavailable {
                    reason: format!("no response within {}s", self.config.timeout_secs),
                }
            }
        }
    }
}
