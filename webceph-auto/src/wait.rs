//! Cooperative run control and poll-until-predicate helpers.
//!
//! Every wait in the engine goes through [`poll_until`] with a declared
//! timeout and interval, against a [`Clock`] so tests can run poll loops
//! without wall-clock delays.

use crate::errors::AutomationError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PAUSE_TICK: Duration = Duration::from_millis(100);

/// Time source used by poll loops and settle delays.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Clock that only advances when something sleeps on it.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Total time slept on this clock so far.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Pause and cancel flags shared between a run's worker and its controller.
///
/// The token sits behind a lock so [`RunControl::reset`] can arm a fresh one
/// for every clone after a cancelled stage.
#[derive(Clone, Debug, Default)]
pub struct RunControl {
    paused: Arc<AtomicBool>,
    cancellation_token: Arc<Mutex<CancellationToken>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Request cooperative cancellation. Also releases a pause so the worker
    /// can observe the request.
    pub fn cancel(&self) {
        self.token().cancel();
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Clear an earlier cancellation. Returns whether one was pending.
    pub fn reset(&self) -> bool {
        let mut token = self
            .cancellation_token
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !token.is_cancelled() {
            return false;
        }
        *token = CancellationToken::new();
        true
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Token that fires when the current run attempt is cancelled.
    pub fn token(&self) -> CancellationToken {
        self.cancellation_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Block while paused, then fail if cancellation was requested.
    pub fn checkpoint(&self, clock: &dyn Clock) -> Result<(), AutomationError> {
        while self.is_paused() && !self.is_cancelled() {
            clock.sleep(PAUSE_TICK);
        }
        if self.is_cancelled() {
            return Err(AutomationError::Cancelled(
                "run cancelled by operator".to_string(),
            ));
        }
        Ok(())
    }
}

/// Declared bound for a wait: give up after `timeout`, re-check every `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSpec {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Evaluate exactly once.
    pub const fn once() -> Self {
        Self {
            timeout: Duration::ZERO,
            interval: Duration::ZERO,
        }
    }
}

/// Re-run `probe` until it yields a value, the timeout elapses or the run is
/// cancelled. Probe errors are treated as "not yet" and reported in the
/// timeout message.
pub fn poll_until<T, F>(
    clock: &dyn Clock,
    control: &RunControl,
    spec: PollSpec,
    what: &str,
    mut probe: F,
) -> Result<T, AutomationError>
where
    F: FnMut() -> Result<Option<T>, AutomationError>,
{
    let deadline = clock.now() + spec.timeout;
    let mut last_error: Option<String> = None;

    loop {
        control.checkpoint(clock)?;

        match probe() {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(AutomationError::Cancelled(reason)) => {
                return Err(AutomationError::Cancelled(reason))
            }
            Err(e) => {
                debug!("poll '{}' probe error: {}", what, e);
                last_error = Some(e.to_string());
            }
        }

        let now = clock.now();
        if now >= deadline {
            let detail = last_error
                .map(|e| format!(" (last error: {e})"))
                .unwrap_or_default();
            return Err(AutomationError::Timeout(format!(
                "{what} not satisfied within {:?}{detail}",
                spec.timeout
            )));
        }

        let remaining = deadline - now;
        let step = if spec.interval.is_zero() {
            remaining
        } else {
            spec.interval.min(remaining)
        };
        clock.sleep(step);
    }
}
