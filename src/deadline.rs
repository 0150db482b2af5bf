//! Cooperative wall-clock deadline shared by a batch of work.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// The deadline as a timer instant, for `tokio::time::timeout_at`.
    pub fn instant(&self) -> tokio::time::Instant {
        self.at.into()
    }

    /// This deadline pushed back by `extra`.
    pub fn extended(&self, extra: Duration) -> Self {
        Self {
            at: self.at + extra,
        }
    }

    pub fn is_past(&self) -> bool {
        self.remaining().is_zero()
    }

    /// True once less than `margin` remains, or the deadline has passed.
    pub fn is_near(&self, margin: Duration) -> bool {
        let remaining = self.remaining();
        remaining.is_zero() || remaining < margin
    }
}
