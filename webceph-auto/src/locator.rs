use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::errors::AutomationError;
use crate::wait::{poll_until, Clock, PollSpec, RunControl, SystemClock};

// Default bounded wait per strategy before moving on to the next one
const DEFAULT_STRATEGY_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_STRATEGY_INTERVAL: Duration = Duration::from_millis(250);

/// What kind of thing a strategy resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    OsWindow,
    RemoteElement,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::OsWindow => write!(f, "os-window"),
            TargetKind::RemoteElement => write!(f, "remote-element"),
        }
    }
}

/// One candidate rule for finding a target. Lower `priority` is tried first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorStrategy<M> {
    pub priority: u32,
    pub matcher: M,
    pub target_kind: TargetKind,
}

impl<M> LocatorStrategy<M> {
    pub fn new(priority: u32, target_kind: TargetKind, matcher: M) -> Self {
        Self {
            priority,
            matcher,
            target_kind,
        }
    }
}

/// How usable a located target has to be before it counts as a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Requirement {
    /// Exists at all
    Present,
    /// Exists and is displayed with a non-zero size
    Visible,
    /// Visible and enabled
    #[default]
    Interactable,
}

/// Result of checking a located target against a [`Requirement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Unusable(String),
}

/// Something the locator can search: a window list or a remote document.
pub trait TargetSource {
    type Matcher: fmt::Display;
    type Target;

    fn kind(&self) -> TargetKind;

    /// All targets the matcher currently selects, in source order.
    fn find(&self, matcher: &Self::Matcher) -> Result<Vec<Self::Target>, AutomationError>;

    fn readiness(
        &self,
        target: &Self::Target,
        requirement: Requirement,
    ) -> Result<Readiness, AutomationError>;
}

/// A target together with the strategy that produced it.
#[derive(Debug, Clone)]
pub struct Located<T> {
    pub target: T,
    pub priority: u32,
    pub strategy_index: usize,
    pub matcher: String,
}

/// Evaluates an ordered strategy list and returns the first usable match.
///
/// There is no scoring across strategies: an earlier strategy wins even if a
/// later one would produce a "better" target.
#[derive(Clone)]
pub struct Locator {
    clock: Arc<dyn Clock>,
    control: RunControl,
    timeout: Duration, // Bounded wait per strategy
    interval: Duration,
    requirement: Requirement,
}

impl Default for Locator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), RunControl::new())
    }
}

impl Locator {
    pub fn new(clock: Arc<dyn Clock>, control: RunControl) -> Self {
        Self {
            clock,
            control,
            timeout: DEFAULT_STRATEGY_TIMEOUT,
            interval: DEFAULT_STRATEGY_INTERVAL,
            requirement: Requirement::default(),
        }
    }

    /// Set the bounded wait applied to each strategy before trying the next.
    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Copy of this locator with a different readiness requirement.
    pub fn require(&self, requirement: Requirement) -> Locator {
        let mut locator = self.clone();
        locator.requirement = requirement;
        locator
    }

    /// Copy of this locator that evaluates each strategy exactly once.
    pub fn immediate(&self) -> Locator {
        let mut locator = self.clone();
        locator.timeout = Duration::ZERO;
        locator
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Resolve `target` using `strategies` against `source`.
    ///
    /// Strategies are evaluated in ascending priority (ties keep list order).
    /// A found-but-unusable target moves on to the next strategy; only after
    /// every strategy is exhausted does this fail, listing each attempt.
    #[instrument(level = "debug", skip(self, source, strategies), fields(kind = %source.kind()))]
    pub fn resolve<S: TargetSource>(
        &self,
        target: &str,
        source: &S,
        strategies: &[LocatorStrategy<S::Matcher>],
    ) -> Result<Located<S::Target>, AutomationError> {
        let mut order: Vec<usize> = (0..strategies.len()).collect();
        order.sort_by_key(|&i| strategies[i].priority);

        let spec = PollSpec::new(self.timeout, self.interval);
        let mut attempts = Vec::with_capacity(strategies.len());

        for index in order {
            let strategy = &strategies[index];
            let label = format!("[{}] {}", strategy.priority, strategy.matcher);

            if strategy.target_kind != source.kind() {
                attempts.push(format!(
                    "{label}: skipped, strategy targets {} but source is {}",
                    strategy.target_kind,
                    source.kind()
                ));
                continue;
            }

            debug!("Trying strategy {} for '{}'", label, target);
            let mut outcome = String::from("not found");
            let found = poll_until(
                self.clock.as_ref(),
                &self.control,
                spec,
                &label,
                || {
                    let candidates = source.find(&strategy.matcher)?;
                    if candidates.is_empty() {
                        outcome = "not found".to_string();
                        return Ok(None);
                    }
                    let total = candidates.len();
                    let mut last_reason = String::new();
                    for candidate in candidates {
                        match source.readiness(&candidate, self.requirement)? {
                            Readiness::Ready => return Ok(Some(candidate)),
                            Readiness::Unusable(reason) => last_reason = reason,
                        }
                    }
                    outcome = format!("{total} found but not usable ({last_reason})");
                    Ok(None)
                },
            );

            match found {
                Ok(candidate) => {
                    info!(
                        "Resolved '{}' with strategy {} (position {})",
                        target, label, index
                    );
                    return Ok(Located {
                        target: candidate,
                        priority: strategy.priority,
                        strategy_index: index,
                        matcher: strategy.matcher.to_string(),
                    });
                }
                Err(AutomationError::Cancelled(reason)) => {
                    return Err(AutomationError::Cancelled(reason))
                }
                Err(AutomationError::Timeout(detail)) => {
                    if detail.contains("last error") {
                        outcome = format!("{outcome}; {detail}");
                    }
                    attempts.push(format!("{label}: {outcome}"));
                }
                Err(e) => attempts.push(format!("{label}: {e}")),
            }
        }

        Err(AutomationError::LocatorNotFound {
            target: target.to_string(),
            attempts,
        })
    }

    /// Like [`Locator::resolve`] but maps "nothing matched" to `None`.
    pub fn try_resolve<S: TargetSource>(
        &self,
        target: &str,
        source: &S,
        strategies: &[LocatorStrategy<S::Matcher>],
    ) -> Result<Option<Located<S::Target>>, AutomationError> {
        match self.resolve(target, source, strategies) {
            Ok(located) => Ok(Some(located)),
            Err(AutomationError::LocatorNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
