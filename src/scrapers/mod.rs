//! Marketplace HTTP clients.
//!
//! Both upstreams throttle aggressively, so each client funnels every
//! request through a process-wide pacing clock for its marketplace and a
//! shared retry policy. Catalogue walks live on the clients themselves;
//! page-level concurrency is deliberately absent so the pacing clock stays
//! the only source of request timing.

pub mod buff;
pub mod youpin;

pub use buff::BuffClient;
pub use youpin::YoupinClient;

use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::FetchError;

/// Every `EXTRA_DELAY_EVERY`th request sleeps an extra uniform
/// `EXTRA_DELAY_RANGE_SECS` on top of the base interval. The upstreams
/// tolerate a steady trickle but flag perfectly regular trains.
const EXTRA_DELAY_EVERY: u64 = 10;
const EXTRA_DELAY_RANGE_SECS: (f64, f64) = (3.0, 6.0);

/// Process-wide request pacing for one marketplace.
///
/// All callers share one clock: before each request the elapsed time since
/// the previous request (from any task) is measured and the remainder of
/// the minimum interval is slept. The wait is a cancellation point.
#[derive(Debug, Default)]
pub struct Pacer {
    state: Mutex<PacerState>,
}

#[derive(Debug, Default)]
struct PacerState {
    last_request_at: Option<Instant>,
    request_count: u64,
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until this marketplace's minimum inter-request interval has
    /// elapsed, then claims the clock for the caller's request.
    pub async fn pace(
        &self,
        min_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let (wait, extra) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let wait = match state.last_request_at {
                None => Duration::ZERO,
                // A concurrent caller may already hold a slot in the
                // future; queue behind it.
                Some(last) => match now.checked_duration_since(last) {
                    Some(elapsed) => compute_wait(Some(elapsed), min_interval),
                    None => (last - now) + min_interval,
                },
            };

            state.request_count += 1;
            let extra = if state.request_count % EXTRA_DELAY_EVERY == 0 {
                let (lo, hi) = EXTRA_DELAY_RANGE_SECS;
                Duration::from_secs_f64(rand::thread_rng().gen_range(lo..hi))
            } else {
                Duration::ZERO
            };

            // Claim the send slot up front so the next caller computes its
            // wait against this request, not the previous one.
            state.last_request_at = Some(now + wait + extra);
            (wait, extra)
        };

        let total = wait + extra;
        if !extra.is_zero() {
            debug!(extra_secs = extra.as_secs_f64(), "Pacing: periodic extra delay");
        }
        if total.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(total) => Ok(()),
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
        }
    }
}

/// Remaining wait given the time since the previous request.
fn compute_wait(since_last: Option<Duration>, min_interval: Duration) -> Duration {
    match since_last {
        None => Duration::ZERO,
        Some(elapsed) => min_interval.saturating_sub(elapsed),
    }
}

/// Exponential backoff with jitter for upstream retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (1-based):
    /// `min(base · 2^(attempt-1) · U(1, 2), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        let jittered = exp * rand::thread_rng().gen_range(1.0..2.0);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    /// Sleeps the backoff for `attempt`, honouring cancellation.
    pub async fn wait(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let delay = self.backoff(attempt);
        debug!(attempt, delay_secs = delay.as_secs_f64(), "Retrying after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
        }
    }
}
