use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation - calls pass through
    Closed,
    /// Guarded dependency is failing - calls are rejected
    Open,
    /// Cooldown elapsed - a single probe is in flight
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    probe_inflight: bool,
}

/// Three-state gate guarding embedding calls.
///
/// `allow()` is the only pre-call gate; the caller reports the guarded
/// operation's outcome via `record_success` / `record_failure`. In half-open
/// exactly one probe is admitted until its outcome lands.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                probe_inflight: false,
            }),
        }
    }

    pub fn with_settings(failure_threshold: u32, cooldown_ms: u64) -> Self {
        Self::new(BreakerConfig {
            failure_threshold: failure_threshold.max(1),
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    /// Whether the guarded call may proceed right now.
    pub fn allow(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_inflight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_inflight {
                    false
                } else {
                    inner.probe_inflight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            // One success closes the circuit
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.probe_inflight = false;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        match inner.state {
            BreakerState::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                if inner.failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        failures = inner.failures,
                        "embedding circuit opened after consecutive failures"
                    );
                }
            }
            // A failed probe reopens and restarts the cooldown clock
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_inflight = false;
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .map_or(BreakerState::Open, |inner| inner.state)
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().map_or(0, |inner| inner.failures)
    }
}
