//! Sliding-window admission control keyed by client identity.

use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

/// Per-client sliding window over the trailing minute
#[derive(Debug)]
pub struct RateLimiter {
    requests_per_minute: usize,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: usize) -> Self {
        Self {
            requests_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn requests_per_minute(&self) -> usize {
        self.requests_per_minute
    }

    /// Admit a request from `client_id` now, or fail with `RateLimitExceeded`
    pub fn check_and_admit(&self, client_id: &str) -> Result<()> {
        self.check_and_admit_at(client_id, Instant::now())
    }

    /// Admit a request observed at `now`
    pub fn check_and_admit_at(&self, client_id: &str, now: Instant) -> Result<()> {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = windows.entry(client_id.to_string()).or_default();
        evict_expired(window, now);

        if window.len() >= self.requests_per_minute {
            let retry_after = window
                .front()
                .map(|oldest| WINDOW.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(WINDOW);
            ::log::warn!(
                "Rate limit exceeded for {} ({} requests in the last minute)",
                client_id,
                window.len()
            );
            return Err(Error::RateLimitExceeded {
                client_id: client_id.to_string(),
                retry_after,
            });
        }

        window.push_back(now);
        ::log::trace!(
            "Admitted request for {} ({}/{})",
            client_id,
            window.len(),
            self.requests_per_minute
        );
        Ok(())
    }

    /// Requests the client may still make in the current window
    pub fn remaining(&self, client_id: &str) -> usize {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match windows.get_mut(client_id) {
            Some(window) => {
                evict_expired(window, now);
                self.requests_per_minute.saturating_sub(window.len())
            }
            None => self.requests_per_minute,
        }
    }

    /// Drop clients with no requests in the trailing minute; returns how many were removed
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = windows.len();
        windows.retain(|_, window| {
            evict_expired(window, now);
            !window.is_empty()
        });
        before - windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(60)
    }
}

fn evict_expired(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}
