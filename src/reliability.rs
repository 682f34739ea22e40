// src/reliability.rs
//
// Retry-with-backoff and circuit breaking for transient failures.
//
// Only `Error::Transient` is retried.  Once retries exhaust, a per-peer
// circuit breaker short-circuits subsequent calls until a cool-down passes,
// then lets a bounded number of half-open probes through.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Error;

// ─── Retry policy ───────────────────────────────────────────────────────────

/// Exponential backoff with ±25 % jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Jitter fraction; 0.25 means each delay is scaled by a random factor
    /// in `[0.75, 1.25]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (attempt is 1-based: the delay before
    /// attempt 2 is `backoff_for(1)`).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_backoff);

        let factor = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            rng.gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        capped.mul_f64(factor)
    }
}

/// Run `op` with retries on `Error::Transient`.
///
/// Non-transient errors abort immediately; the last transient error is
/// returned after `max_attempts`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff_for(attempt);
                debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(op = op_name, attempts = attempt, error = %e, "retries exhausted");
                }
                return Err(e);
            }
        }
    }
}

// ─── Circuit breaker ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// A classic three-state circuit breaker.
///
/// Closed → Open after `failure_threshold` consecutive failures;
/// Open → HalfOpen after `open_timeout`; HalfOpen admits at most
/// `half_open_max` concurrent probes and closes again on the first success.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_timeout: Duration,
    half_open_max: u32,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_timeout: Duration, half_open_max: u32) -> Self {
        Self {
            failure_threshold,
            open_timeout,
            half_open_max,
            state: Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// Defaults: threshold 5, open 30 s, half-open max 3.
    pub fn with_defaults() -> Self {
        Self::new(5, Duration::from_secs(30), 3)
    }

    /// Ask permission to attempt a call.  Returns a transient short-circuit
    /// error while the breaker is open or half-open capacity is exhausted.
    pub fn acquire(&self) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        match st.phase {
            BreakerPhase::Closed => Ok(()),
            BreakerPhase::Open => {
                let elapsed = st
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.open_timeout {
                    st.phase = BreakerPhase::HalfOpen;
                    st.half_open_in_flight = 1;
                    Ok(())
                } else {
                    Err(Error::Transient("circuit breaker open".into()))
                }
            }
            BreakerPhase::HalfOpen => {
                if st.half_open_in_flight < self.half_open_max {
                    st.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(Error::Transient("circuit breaker half-open saturated".into()))
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut st = self.state.lock().unwrap();
        st.consecutive_failures = 0;
        st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        if st.phase != BreakerPhase::Closed {
            debug!("circuit breaker closed");
        }
        st.phase = BreakerPhase::Closed;
        st.opened_at = None;
    }

    pub fn on_failure(&self) {
        let mut st = self.state.lock().unwrap();
        st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        st.consecutive_failures += 1;
        let trip = match st.phase {
            // A half-open probe failing reopens immediately.
            BreakerPhase::HalfOpen => true,
            _ => st.consecutive_failures >= self.failure_threshold,
        };
        if trip && st.phase != BreakerPhase::Open {
            warn!(
                failures = st.consecutive_failures,
                "circuit breaker opened"
            );
            st.phase = BreakerPhase::Open;
            st.opened_at = Some(Instant::now());
        }
    }

    #[cfg(test)]
    fn force_open_elapsed(&self) {
        let mut st = self.state.lock().unwrap();
        st.opened_at = Some(Instant::now() - self.open_timeout);
    }
}

/// Run `op` under a breaker: acquire, retry transients, record the outcome.
pub async fn guarded<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    op_name: &str,
    op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    breaker.acquire()?;
    match with_retry(policy, op_name, op).await {
        Ok(v) => {
            breaker.on_success();
            Ok(v)
        }
        Err(e) => {
            if e.is_transient() {
                breaker.on_failure();
            } else {
                breaker.on_success();
            }
            Err(e)
        }
    }
}

// ─── Per-peer breaker registry ──────────────────────────────────────────────

/// Peer-scoped circuit breakers for peer-specific operations.
#[derive(Default)]
pub struct PeerBreakers {
    inner: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl PeerBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_peer(&self, peer_id: &str) -> Arc<CircuitBreaker> {
        let mut map = self.inner.lock().unwrap();
        map.entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_defaults()))
            .clone()
    }

    /// Drop breaker state when the peer leaves.
    pub fn remove(&self, peer_id: &str) {
        self.inner.lock().unwrap().remove(peer_id);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
