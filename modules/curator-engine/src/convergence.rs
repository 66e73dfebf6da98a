use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Progress stayed below the improvement threshold for two consecutive
    /// rounds, or no eligible community was left.
    Converged,
    /// A round changed neither the pending count nor the community count.
    ZeroProgress,
    MaxRoundsReached,
    /// Cooperative stop requested between rounds.
    Stopped,
    /// A structural failure (graph or community rebuild) ended the round.
    Aborted,
}

impl RunOutcome {
    /// Whether the run can be resumed from its saved state.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Stopped | Self::Aborted)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::ZeroProgress => write!(f, "zero_progress"),
            Self::MaxRoundsReached => write!(f, "max_rounds_reached"),
            Self::Stopped => write!(f, "stopped"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Relative change from `previous` to `current`. Going from zero to zero is
/// no change; going from zero to anything else counts as full change.
pub fn relative_delta(previous: usize, current: usize) -> f64 {
    if previous == 0 {
        return if current == 0 { 0.0 } else { 1.0 };
    }
    (previous as f64 - current as f64).abs() / previous as f64
}

/// Progress measured over one round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundProgress {
    pub round: u32,
    pub pending_before: usize,
    pub pending_after: usize,
    pub communities_before: usize,
    pub communities_after: usize,
    pub pending_delta: f64,
    pub community_delta: f64,
}

impl RoundProgress {
    pub fn measure(
        round: u32,
        (pending_before, pending_after): (usize, usize),
        (communities_before, communities_after): (usize, usize),
    ) -> Self {
        Self {
            round,
            pending_before,
            pending_after,
            communities_before,
            communities_after,
            pending_delta: relative_delta(pending_before, pending_after),
            community_delta: relative_delta(communities_before, communities_after),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop(RunOutcome),
}

/// Tracks consecutive low-progress rounds. The streak is part of the run
/// state so a resumed run keeps counting where it left off.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceTracker {
    threshold: f64,
    streak: u32,
}

impl ConvergenceTracker {
    pub fn new(threshold: f64, streak: u32) -> Self {
        Self { threshold, streak }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn observe(&mut self, pending_delta: f64, community_delta: f64) -> Step {
        if pending_delta == 0.0 && community_delta == 0.0 {
            return Step::Stop(RunOutcome::ZeroProgress);
        }
        if pending_delta < self.threshold && community_delta < self.threshold {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        if self.streak >= 2 {
            Step::Stop(RunOutcome::Converged)
        } else {
            Step::Continue
        }
    }
}
