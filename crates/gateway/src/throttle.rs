//! Per-user burst ceilings on the expensive write paths.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use berth_common::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleScope {
    WorkspaceCreate,
    LoopCreate,
    RunStart,
    Fork,
}

impl ThrottleScope {
    fn limit(self) -> (usize, Duration) {
        match self {
            Self::WorkspaceCreate => (5, Duration::from_secs(60)),
            Self::LoopCreate => (10, Duration::from_secs(60)),
            Self::RunStart => (20, Duration::from_secs(60)),
            Self::Fork => (3, Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started_at: Instant,
    count: usize,
}

/// Fixed-window counters keyed by (user, scope).
#[derive(Default)]
pub struct RequestThrottle {
    buckets: DashMap<(String, ThrottleScope), WindowState>,
}

impl RequestThrottle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request; errors once the window's ceiling is hit.
    pub fn check(&self, user_id: &str, scope: ThrottleScope) -> Result<()> {
        let (max_requests, window) = scope.limit();
        let key = (user_id.to_string(), scope);
        let mut entry = self.buckets.entry(key).or_insert(WindowState {
            started_at: Instant::now(),
            count: 0,
        });

        if entry.started_at.elapsed() >= window {
            entry.started_at = Instant::now();
            entry.count = 0;
        }
        if entry.count >= max_requests {
            return Err(Error::rate_limited("too many requests, slow down"));
        }
        entry.count += 1;
        Ok(())
    }
}
