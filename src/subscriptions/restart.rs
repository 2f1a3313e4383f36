//! Restart policy for dropped consumer-group subscriptions.

use rand::Rng;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Exponential backoff with jitter, bounded by a restart budget.
#[derive(Clone, Debug)]
pub struct RestartSettings {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Each delay is stretched by a random factor in `[1, 1 + random_factor]`.
    pub random_factor: f64,
    pub max_restarts: usize,
    /// Restarts older than this no longer count against `max_restarts`.
    pub max_restarts_within: Duration,
}

impl RestartSettings {
    /// Unlimited restarts with the given backoff bounds.
    pub fn new(min_backoff: Duration, max_backoff: Duration, random_factor: f64) -> Self {
        Self {
            min_backoff,
            max_backoff,
            random_factor: random_factor.max(0.0),
            max_restarts: usize::MAX,
            max_restarts_within: Duration::from_secs(u32::MAX as u64),
        }
    }

    /// Give up after `max_restarts` restarts within `within`.
    pub fn with_max_restarts(mut self, max_restarts: usize, within: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.max_restarts_within = within;
        self
    }

    /// Delay before restart number `attempt` (1-based) within the window.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let base = self
            .min_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        if self.random_factor <= 0.0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=self.random_factor);
        stretch(base, 1.0 + jitter).min(stretch(self.max_backoff, 1.0 + self.random_factor))
    }

    /// Fresh restart counter for one subscription.
    pub fn tracker(&self) -> RestartTracker {
        RestartTracker {
            settings: self.clone(),
            restarts: VecDeque::new(),
        }
    }
}

/// `delay * factor`, clamped to `Duration::MAX` instead of panicking.
fn stretch(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10), 0.2)
    }
}

/// Counts restarts inside the sliding window.
#[derive(Debug)]
pub struct RestartTracker {
    settings: RestartSettings,
    restarts: VecDeque<Instant>,
}

impl RestartTracker {
    /// Record a restart and return its delay, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) > self.settings.max_restarts_within {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        if self.restarts.len() >= self.settings.max_restarts {
            return None;
        }
        self.restarts.push_back(now);
        Some(self.settings.backoff(self.restarts.len()))
    }

    /// Restarts still counted in the window.
    pub fn restarts(&self) -> usize {
        self.restarts.len()
    }
}
