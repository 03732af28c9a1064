//! Handoff interception (§4.9): guards against a second handoff firing
//! while one is still in flight or has only just landed. The agent side can
//! legitimately ask to hand off again almost immediately (e.g. a
//! misrouted triage followed by a corrective handoff), so the guard blocks
//! on overlap, not on every repeat handoff.

use chrono::{DateTime, Duration, Utc};

/// Approximates "one turn": long enough that a handoff the target agent is
/// still acking cannot be immediately followed by another, short enough
/// that a legitimate back-to-back correction isn't blocked for long.
pub const HANDOFF_COOLDOWN_SECONDS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffCheck {
    Allowed,
    Blocked,
}

#[derive(Debug, Clone, Default)]
pub struct HandoffGuard {
    in_progress: bool,
    completed_at: Option<DateTime<Utc>>,
}

impl HandoffGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a new handoff request may proceed right now.
    pub fn check(&self, now: DateTime<Utc>) -> HandoffCheck {
        if self.in_progress {
            return HandoffCheck::Blocked;
        }
        if let Some(completed_at) = self.completed_at {
            if now - completed_at < Duration::seconds(HANDOFF_COOLDOWN_SECONDS) {
                return HandoffCheck::Blocked;
            }
        }
        HandoffCheck::Allowed
    }

    /// Marks a handoff as in flight. Caller must have already confirmed
    /// `check` returned `Allowed`.
    pub fn begin(&mut self) {
        self.in_progress = true;
    }

    /// Marks the handoff as landed, starting the cooldown window.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.in_progress = false;
        self.completed_at = Some(now);
    }

    /// Aborts an in-flight handoff without starting the cooldown, e.g. when
    /// the target agent is unreachable and the session stays put.
    pub fn cancel(&mut self) {
        self.in_progress = false;
    }
}
