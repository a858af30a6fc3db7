use std::collections::VecDeque;
use std::time::Duration;

use sweaty_core::config::{RateLimitPolicy, WindowBudget};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request budget exhausted, next slot in {}s", .retry_after.as_secs())]
pub struct BudgetExhausted {
    pub retry_after: Duration,
}

#[derive(Debug, Default)]
struct Window {
    sent: VecDeque<Instant>,
}

impl Window {
    fn evict(&mut self, budget: &WindowBudget, now: Instant) {
        while let Some(front) = self.sent.front() {
            if now.saturating_duration_since(*front) >= budget.period {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until one more request fits, zero when it fits now.
    fn wait(&self, budget: &WindowBudget, now: Instant) -> Duration {
        if (self.sent.len() as u64) < u64::from(budget.requests) {
            return Duration::ZERO;
        }
        let overflow = self.sent.len() + 1 - budget.requests as usize;
        self.sent
            .get(overflow - 1)
            .map(|at| (*at + budget.period).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Align the local count with what the provider reports as used.
    fn pad_to(&mut self, used: u32, now: Instant) {
        while self.sent.len() < used as usize {
            self.sent.push_back(now);
        }
    }
}

#[derive(Debug, Default)]
struct Windows {
    short: Window,
    long: Window,
}

/// Sliding-window request budget for one provider.
///
/// Every outbound request calls [`RateLimiter::acquire`] first. Short waits
/// are slept through; a wait longer than the policy's `max_wait` is returned
/// as [`BudgetExhausted`] so the run can stop cleanly instead of stalling.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn unconstrained() -> Self {
        Self::new(RateLimitPolicy::unconstrained())
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub async fn acquire(&self) -> Result<(), BudgetExhausted> {
        if self.policy.is_unconstrained() {
            return Ok(());
        }
        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                let now = Instant::now();
                let wait = self.pending_wait(&mut windows, now);
                if wait.is_zero() {
                    windows.short.sent.push_back(now);
                    windows.long.sent.push_back(now);
                    return Ok(());
                }
                wait
            };

            if wait > self.policy.max_wait {
                info!(
                    wait_secs = wait.as_secs(),
                    max_wait_secs = self.policy.max_wait.as_secs(),
                    "rate budget exhausted"
                );
                return Err(BudgetExhausted { retry_after: wait });
            }
            debug!(wait_ms = wait.as_millis() as u64, "waiting for rate budget");
            sleep(wait).await;
        }
    }

    /// Feed the provider's own usage counters back in. Another client sharing
    /// the same application budget shows up here and nowhere else.
    pub async fn observe_usage(&self, short_used: Option<u32>, long_used: Option<u32>) {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        if let (Some(budget), Some(used)) = (self.policy.short, short_used) {
            windows.short.evict(&budget, now);
            windows.short.pad_to(used, now);
        }
        if let (Some(budget), Some(used)) = (self.policy.long, long_used) {
            windows.long.evict(&budget, now);
            windows.long.pad_to(used, now);
        }
    }

    /// Requests still available before the tightest window blocks, or `None`
    /// when nothing is enforced.
    pub async fn remaining(&self) -> Option<u32> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let short = remaining_in(self.policy.short, &mut windows.short, now);
        let long = remaining_in(self.policy.long, &mut windows.long, now);
        match (short, long) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn pending_wait(&self, windows: &mut Windows, now: Instant) -> Duration {
        let mut wait = Duration::ZERO;
        if let Some(budget) = self.policy.short {
            windows.short.evict(&budget, now);
            wait = wait.max(windows.short.wait(&budget, now));
        }
        if let Some(budget) = self.policy.long {
            windows.long.evict(&budget, now);
            wait = wait.max(windows.long.wait(&budget, now));
        }
        wait
    }
}

fn remaining_in(budget: Option<WindowBudget>, window: &mut Window, now: Instant) -> Option<u32> {
    let budget = budget?;
    window.evict(&budget, now);
    Some(budget.requests.saturating_sub(window.sent.len() as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(requests: u32, period_secs: u64, max_wait_secs: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            short: Some(WindowBudget {
                requests,
                period: Duration::from_secs(period_secs),
            }),
            long: None,
            max_wait: Duration::from_secs(max_wait_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_window_to_slide() {
        let limiter = RateLimiter::new(policy(2, 10, 60));
        let started = Instant::now();

        limiter.acquire().await.expect("first");
        limiter.acquire().await.expect("second");
        assert_eq!(limiter.remaining().await, Some(0));

        limiter.acquire().await.expect("third waits");
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn long_waits_are_reported_instead_of_slept() {
        let limiter = RateLimiter::new(policy(1, 900, 30));
        limiter.acquire().await.expect("first");

        let err = limiter.acquire().await.expect_err("budget exhausted");
        assert_eq!(err.retry_after, Duration::from_secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_usage_consumes_local_budget() {
        let limiter = RateLimiter::new(policy(100, 900, 0));
        assert_eq!(limiter.remaining().await, Some(100));

        limiter.observe_usage(Some(97), None).await;
        assert_eq!(limiter.remaining().await, Some(3));

        limiter.observe_usage(Some(100), None).await;
        assert!(limiter.acquire().await.is_err());
    }

    #[tokio::test]
    async fn unconstrained_never_blocks() {
        let limiter = RateLimiter::unconstrained();
        for _ in 0..1000 {
            limiter.acquire().await.expect("unconstrained");
        }
        assert_eq!(limiter.remaining().await, None);
    }
}
