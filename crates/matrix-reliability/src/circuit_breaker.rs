//! Per-resource circuit breaker (spec §4.7).
//!
//! The lock-free atomics core is grounded in the teacher's canonical
//! `riptide_utils::circuit_breaker::CircuitBreaker` (state/failures/successes
//! as atomics, a semaphore gating half-open trial calls). Spec §4.7 adds a
//! second trip condition the teacher's version doesn't have — an error-rate
//! threshold over a rolling window with a volume floor — so a small
//! `parking_lot`-guarded window sits alongside the atomics for that check,
//! the way `riptide_reliability::circuit_breaker_pool` layers windowed
//! bookkeeping on top of the canonical breaker for its own extra triggers.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

/// Clock abstraction for testability, matching the teacher's `Clock` trait.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Default, Debug)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before tripping open.
    pub failure_threshold: u32,
    /// Error rate (0.0-1.0) that trips open once `volume_threshold` calls land in the window.
    pub error_rate_threshold: f64,
    pub volume_threshold: u32,
    pub window: Duration,
    pub reset_timeout: Duration,
    pub half_open_max_in_flight: u32,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_rate_threshold: 0.5,
            volume_threshold: 10,
            window: Duration::from_secs(300),
            reset_timeout: Duration::from_secs(60),
            half_open_max_in_flight: 3,
            success_threshold: 3,
        }
    }
}

impl From<&matrix_config::BreakerConfig> for BreakerConfig {
    fn from(c: &matrix_config::BreakerConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            error_rate_threshold: 0.5,
            volume_threshold: c.volume_threshold,
            window: Duration::from_millis(c.window_ms),
            reset_timeout: Duration::from_millis(c.reset_ms),
            half_open_max_in_flight: 3,
            success_threshold: c.success_threshold,
        }
    }
}

/// A single call outcome timestamped for the rolling-error-rate window.
struct WindowEntry {
    at: Instant,
    success: bool,
}

/// Per-resource circuit breaker. `try_acquire` gates a call; `on_success`/
/// `on_failure` report the outcome.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    open_until: Mutex<Option<Instant>>,
    half_open_permits: Arc<Semaphore>,
    window: Mutex<VecDeque<WindowEntry>>,
    cfg: BreakerConfig,
    clock: Arc<dyn Clock>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let permits = cfg.half_open_max_in_flight as usize;
        Arc::new(Self {
            state: AtomicU8::new(State::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            open_until: Mutex::new(None),
            half_open_permits: Arc::new(Semaphore::new(permits)),
            window: Mutex::new(VecDeque::new()),
            cfg,
            clock,
            trips: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> State {
        self.state.load(Relaxed).into()
    }

    pub fn trip_count(&self) -> u64 {
        self.trips.load(Relaxed)
    }

    /// Returns `Ok` (with an optional half-open permit to hold for the call's
    /// duration) if the call may proceed, `Err(BreakerOpen)` otherwise.
    pub fn try_acquire(&self) -> Result<Option<OwnedSemaphorePermit>, BreakerOpenError> {
        match self.state() {
            State::Closed => Ok(None),
            State::Open => {
                let ready = {
                    let guard = self.open_until.lock();
                    matches!(*guard, Some(until) if self.clock.now() >= until)
                };
                if ready {
                    self.state.store(State::HalfOpen as u8, Relaxed);
                    self.try_acquire()
                } else {
                    Err(BreakerOpenError)
                }
            }
            State::HalfOpen => match Arc::clone(&self.half_open_permits).try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => Err(BreakerOpenError),
            },
        }
    }

    pub fn on_success(&self) {
        self.record(true);
        match self.state() {
            State::Closed => self.consecutive_failures.store(0, Relaxed),
            State::HalfOpen => {
                let succ = self.half_open_successes.fetch_add(1, Relaxed) + 1;
                if succ >= self.cfg.success_threshold {
                    self.close();
                }
            }
            State::Open => {}
        }
    }

    pub fn on_failure(&self) {
        self.record(false);
        match self.state() {
            State::Closed => {
                let f = self.consecutive_failures.fetch_add(1, Relaxed) + 1;
                if f >= self.cfg.failure_threshold || self.window_trips() {
                    self.trip_open();
                }
            }
            State::HalfOpen => self.trip_open(),
            State::Open => {}
        }
    }

    fn record(&self, success: bool) {
        let now = self.clock.now();
        let mut w = self.window.lock();
        w.push_back(WindowEntry { at: now, success });
        while let Some(front) = w.front() {
            if now.duration_since(front.at) > self.cfg.window {
                w.pop_front();
            } else {
                break;
            }
        }
    }

    /// Error-rate-over-volume trip condition (spec §4.7: "error rate > 50%
    /// with >= volume-threshold calls in the window").
    fn window_trips(&self) -> bool {
        let w = self.window.lock();
        if w.len() < self.cfg.volume_threshold as usize {
            return false;
        }
        let failures = w.iter().filter(|e| !e.success).count();
        (failures as f64 / w.len() as f64) > self.cfg.error_rate_threshold
    }

    fn trip_open(&self) {
        self.state.store(State::Open as u8, Relaxed);
        self.consecutive_failures.store(0, Relaxed);
        self.half_open_successes.store(0, Relaxed);
        self.trips.fetch_add(1, Relaxed);
        *self.open_until.lock() = Some(self.clock.now() + self.cfg.reset_timeout);
        let deficit = (self.cfg.half_open_max_in_flight as usize)
            .saturating_sub(self.half_open_permits.available_permits());
        if deficit > 0 {
            self.half_open_permits.add_permits(deficit);
        }
    }

    fn close(&self) {
        self.state.store(State::Closed as u8, Relaxed);
        self.consecutive_failures.store(0, Relaxed);
        self.half_open_successes.store(0, Relaxed);
        self.window.lock().clear();
        let deficit = (self.cfg.half_open_max_in_flight as usize)
            .saturating_sub(self.half_open_permits.available_permits());
        if deficit > 0 {
            self.half_open_permits.add_permits(deficit);
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker open")]
pub struct BreakerOpenError;

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    #[derive(Debug)]
    struct FakeClock(PMutex<Instant>);

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(PMutex::new(Instant::now())))
        }
        fn advance(&self, d: Duration) {
            let mut t = self.0.lock();
            *t += d;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.0.lock()
        }
    }

    #[test]
    fn trips_on_consecutive_failures() {
        let clock = FakeClock::new();
        let cb = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 3,
                ..Default::default()
            },
            clock,
        );

        assert_eq!(cb.state(), State::Closed);
        for _ in 0..3 {
            cb.try_acquire().unwrap();
            cb.on_failure();
        }
        assert_eq!(cb.state(), State::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn half_open_after_reset_timeout() {
        let clock = FakeClock::new();
        let cb = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            clock.clone(),
        );

        cb.try_acquire().unwrap();
        cb.on_failure();
        assert_eq!(cb.state(), State::Open);

        clock.advance(Duration::from_secs(61));
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), State::HalfOpen);
    }

    #[test]
    fn closes_after_success_threshold_in_half_open() {
        let clock = FakeClock::new();
        let cb = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(1),
                success_threshold: 2,
                ..Default::default()
            },
            clock.clone(),
        );

        cb.try_acquire().unwrap();
        cb.on_failure();
        clock.advance(Duration::from_secs(2));

        let _p1 = cb.try_acquire().unwrap();
        cb.on_success();
        assert_eq!(cb.state(), State::HalfOpen);

        let _p2 = cb.try_acquire().unwrap();
        cb.on_success();
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn any_failure_in_half_open_reopens() {
        let clock = FakeClock::new();
        let cb = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(1),
                ..Default::default()
            },
            clock.clone(),
        );

        cb.try_acquire().unwrap();
        cb.on_failure();
        clock.advance(Duration::from_secs(2));

        let _p = cb.try_acquire().unwrap();
        cb.on_failure();
        assert_eq!(cb.state(), State::Open);
    }

    #[test]
    fn error_rate_trips_before_consecutive_threshold() {
        let clock = FakeClock::new();
        let cb = CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 100,
                volume_threshold: 10,
                error_rate_threshold: 0.5,
                ..Default::default()
            },
            clock,
        );

        for i in 0..10 {
            cb.try_acquire().unwrap();
            if i % 2 == 0 {
                cb.on_failure();
            } else {
                cb.on_success();
            }
        }
        assert_eq!(cb.state(), State::Open);
    }
}
