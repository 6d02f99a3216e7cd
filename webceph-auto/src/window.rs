//! Window acquisition: find the desktop application window by title pattern
//! strength and drive it into an interactable state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::errors::AutomationError;
use crate::locator::{
    Locator, LocatorStrategy, Readiness, Requirement, TargetKind, TargetSource,
};
use crate::platforms::{Rect, WindowCommand, WindowHandle, WindowInfo, WindowSystem};

const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Strength of a window-title match, weakest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternTier {
    #[default]
    None,
    General,
    Strong,
    SuperStrong,
}

impl fmt::Display for PatternTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatternTier::None => "NONE",
            PatternTier::General => "GENERAL",
            PatternTier::Strong => "STRONG",
            PatternTier::SuperStrong => "SUPER_STRONG",
        };
        f.write_str(name)
    }
}

/// A title prefix that only counts when every marker also appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerPattern {
    pub prefix: String,
    pub markers: Vec<String>,
}

impl MarkerPattern {
    pub fn new(prefix: &str, markers: &[&str]) -> Self {
        Self {
            prefix: prefix.to_string(),
            markers: markers.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn matches(&self, title: &str) -> bool {
        title.starts_with(&self.prefix) && self.markers.iter().all(|m| title.contains(m.as_str()))
    }
}

/// Title patterns for the three tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternTiers {
    pub super_strong: Vec<MarkerPattern>,
    pub strong_prefixes: Vec<String>,
    /// Matched case-insensitively anywhere in the title
    pub general_keywords: Vec<String>,
}

impl Default for PatternTiers {
    fn default() -> Self {
        Self::dentweb()
    }
}

impl PatternTiers {
    /// Patterns for the Dentweb practice-management client. A patient chart
    /// view puts the chart number and the name label in the title.
    pub fn dentweb() -> Self {
        Self {
            super_strong: vec![
                MarkerPattern::new("▶ 덴트웹", &["Chart No.", "이름"]),
                MarkerPattern::new("덴트웹 ::", &["Chart No.", "이름"]),
            ],
            strong_prefixes: vec!["▶ 덴트웹".to_string(), "덴트웹 ::".to_string()],
            general_keywords: ["dentweb", "덴트웹", "덴트 웹", "치과관리", "치과 관리", "dental"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }

    /// Strongest tier the title satisfies.
    pub fn classify(&self, title: &str) -> PatternTier {
        if self.super_strong.iter().any(|p| p.matches(title)) {
            return PatternTier::SuperStrong;
        }
        if self
            .strong_prefixes
            .iter()
            .any(|prefix| title.starts_with(prefix.as_str()))
        {
            return PatternTier::Strong;
        }
        let lowered = title.to_lowercase();
        if self
            .general_keywords
            .iter()
            .any(|k| lowered.contains(&k.to_lowercase()))
        {
            return PatternTier::General;
        }
        PatternTier::None
    }
}

/// A window seen during one scan, with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTarget {
    pub handle: WindowHandle,
    pub label: String,
    pub geometry: Rect,
    pub is_foreground: bool,
    pub pattern_strength: PatternTier,
    pub is_minimized_or_hidden: bool,
}

impl CandidateTarget {
    fn from_window(info: &WindowInfo, tier: PatternTier, foreground: Option<WindowHandle>) -> Self {
        Self {
            handle: info.handle,
            label: info.title.clone(),
            geometry: info.rect,
            is_foreground: foreground == Some(info.handle),
            pattern_strength: tier,
            is_minimized_or_hidden: info.minimized || !info.visible || info.rect.area() == 0,
        }
    }
}

impl fmt::Display for CandidateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' [{}] {}{}{}",
            self.label,
            self.pattern_strength,
            self.geometry,
            if self.is_foreground { " foreground" } else { "" },
            if self.is_minimized_or_hidden {
                " minimized/hidden"
            } else {
                ""
            }
        )
    }
}

/// Matcher over scanned windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowMatcher {
    Tier(PatternTier),
}

impl fmt::Display for WindowMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowMatcher::Tier(tier) => write!(f, "tier:{tier}"),
        }
    }
}

/// One enumeration of the desktop, searchable by the [`Locator`].
///
/// `find` orders matches best-first: foreground window, then largest area.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    candidates: Vec<CandidateTarget>,
}

impl WindowSnapshot {
    pub fn scan(system: &dyn WindowSystem, tiers: &PatternTiers) -> Result<Self, AutomationError> {
        let foreground = system.foreground();
        let candidates = system
            .enumerate()?
            .iter()
            .map(|info| CandidateTarget::from_window(info, tiers.classify(&info.title), foreground))
            .collect();
        Ok(Self { candidates })
    }

    pub fn candidates(&self) -> &[CandidateTarget] {
        &self.candidates
    }

    /// Candidates with any tier, strongest first.
    pub fn matching(&self) -> Vec<&CandidateTarget> {
        let mut matching: Vec<_> = self
            .candidates
            .iter()
            .filter(|c| c.pattern_strength > PatternTier::None)
            .collect();
        matching.sort_by(|a, b| b.pattern_strength.cmp(&a.pattern_strength));
        matching
    }
}

impl TargetSource for WindowSnapshot {
    type Matcher = WindowMatcher;
    type Target = CandidateTarget;

    fn kind(&self) -> TargetKind {
        TargetKind::OsWindow
    }

    fn find(&self, matcher: &WindowMatcher) -> Result<Vec<CandidateTarget>, AutomationError> {
        let mut found: Vec<CandidateTarget> = self
            .candidates
            .iter()
            .filter(|c| match matcher {
                WindowMatcher::Tier(tier) => c.pattern_strength == *tier,
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.is_foreground
                .cmp(&a.is_foreground)
                .then(b.geometry.area().cmp(&a.geometry.area()))
        });
        Ok(found)
    }

    fn readiness(
        &self,
        target: &CandidateTarget,
        requirement: Requirement,
    ) -> Result<Readiness, AutomationError> {
        // Minimized windows still count as present; escalation restores them
        if requirement == Requirement::Present || !target.is_minimized_or_hidden {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::Unusable("minimized or hidden".to_string()))
        }
    }
}

/// Thresholds and timings for the activation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationPolicy {
    pub min_width: i32,
    pub min_height: i32,
    /// How far a window may sit past the top/left screen edge and still count as on-screen
    pub offscreen_tolerance: i32,
    #[serde(with = "millis")]
    pub settle_delay: Duration,
    pub reposition_max_width: i32,
    pub reposition_max_height: i32,
    pub reposition_screen_fraction: f64,
}

impl Default for ActivationPolicy {
    fn default() -> Self {
        Self {
            min_width: 800,
            min_height: 600,
            offscreen_tolerance: 100,
            settle_delay: DEFAULT_SETTLE_DELAY,
            reposition_max_width: 1200,
            reposition_max_height: 800,
            reposition_screen_fraction: 0.8,
        }
    }
}

impl ActivationPolicy {
    pub fn is_usable(&self, info: &WindowInfo, screen: (i32, i32)) -> bool {
        let rect = info.rect;
        info.visible
            && !info.minimized
            && rect.width >= self.min_width
            && rect.height >= self.min_height
            && rect.x > -self.offscreen_tolerance
            && rect.y > -self.offscreen_tolerance
            && rect.x < screen.0
            && rect.y < screen.1
    }

    fn escalation(&self, screen: (i32, i32)) -> [WindowCommand; 6] {
        [
            WindowCommand::Restore,
            WindowCommand::Show,
            WindowCommand::ShowNormal,
            WindowCommand::BringToFront,
            WindowCommand::Maximize,
            WindowCommand::MoveResize(Rect::centered_on_screen(
                screen.0,
                screen.1,
                self.reposition_max_width,
                self.reposition_max_height,
                self.reposition_screen_fraction,
            )),
        ]
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// The chosen window after activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivatedWindow {
    pub handle: WindowHandle,
    pub title: String,
    pub tier: PatternTier,
    pub geometry: Rect,
    /// Escalation ran out without reaching usable geometry
    pub degraded: bool,
    pub steps: Vec<WindowCommand>,
}

impl ActivatedWindow {
    pub fn capture_region(&self, screen: (i32, i32)) -> Rect {
        capture_region(self.geometry, screen)
    }
}

/// Screen rectangle to capture for a window with the given geometry.
///
/// A maximized window is captured at the fixed top-left 670x470 region where
/// the chart header lives. Otherwise the region is taken relative to the
/// window, at least 400x300 and clipped to the screen.
pub fn capture_region(window: Rect, screen: (i32, i32)) -> Rect {
    let (screen_width, screen_height) = screen;
    let maximized = window.width as f64 >= screen_width as f64 * 0.95
        && window.height as f64 >= screen_height as f64 * 0.95
        && window.x <= 10
        && window.y <= 10;
    if maximized {
        return Rect::new(0, 0, 670, 470);
    }

    let (x, y, width, height) = if window.width >= 800 && window.height >= 600 {
        (
            window.x + 25,
            window.y + 50,
            window.width - 50,
            window.height - 100,
        )
    } else {
        let y = if window.height > 100 {
            window.y + 30
        } else {
            window.y
        };
        (window.x, y, window.width, window.height)
    };

    let mut width = width.max(400);
    let mut height = height.max(300);
    if x + width > screen_width {
        width = screen_width - x;
    }
    if y + height > screen_height {
        height = screen_height - y;
    }
    Rect::new(x, y, width, height)
}

/// Finds the source application window and makes it interactable.
///
/// Window focus and geometry are OS-global; callers must not run two
/// acquisitions at once.
pub struct WindowAcquirer {
    system: Arc<dyn WindowSystem>,
    locator: Locator,
    policy: ActivationPolicy,
}

impl WindowAcquirer {
    pub fn new(system: Arc<dyn WindowSystem>, locator: Locator) -> Self {
        Self {
            system,
            locator,
            policy: ActivationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ActivationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn screen_size(&self) -> (i32, i32) {
        self.system.screen_size()
    }

    /// Enumerate and classify every top-level window without touching any.
    pub fn scan(&self, tiers: &PatternTiers) -> Result<WindowSnapshot, AutomationError> {
        WindowSnapshot::scan(self.system.as_ref(), tiers)
    }

    #[instrument(level = "info", skip(self, tiers))]
    pub fn find_and_activate(
        &self,
        tiers: &PatternTiers,
    ) -> Result<ActivatedWindow, AutomationError> {
        let snapshot = self.scan(tiers)?;
        debug!(
            "Scanned {} windows, {} matching",
            snapshot.candidates().len(),
            snapshot.matching().len()
        );

        let strategies = [
            LocatorStrategy::new(
                0,
                TargetKind::OsWindow,
                WindowMatcher::Tier(PatternTier::SuperStrong),
            ),
            LocatorStrategy::new(1, TargetKind::OsWindow, WindowMatcher::Tier(PatternTier::Strong)),
            LocatorStrategy::new(
                2,
                TargetKind::OsWindow,
                WindowMatcher::Tier(PatternTier::General),
            ),
        ];

        let located = self
            .locator
            .immediate()
            .require(Requirement::Present)
            .try_resolve("source window", &snapshot, &strategies)?;

        let Some(located) = located else {
            let candidates: Vec<String> =
                snapshot.candidates().iter().map(|c| c.to_string()).collect();
            warn!(
                "No window matched any pattern tier ({} windows scanned)",
                candidates.len()
            );
            return Err(AutomationError::AcquisitionFailed { candidates });
        };

        let candidate = located.target;
        info!("Selected window {}", candidate);
        self.activate(&candidate)
    }

    /// Run the escalating activation sequence on one candidate.
    pub fn activate(&self, candidate: &CandidateTarget) -> Result<ActivatedWindow, AutomationError> {
        let handle = candidate.handle;
        let screen = self.system.screen_size();
        let clock = self.locator.clock();
        let control = self.locator.control();
        let mut steps = Vec::new();

        let mut current = self.system.window(handle)?;
        if self.policy.is_usable(&current, screen) {
            self.system.apply(handle, WindowCommand::BringToFront)?;
            steps.push(WindowCommand::BringToFront);
            return Ok(self.activated(candidate, current, false, steps));
        }

        debug!("Window {} is not usable at {}, escalating", handle, current.rect);
        for command in self.policy.escalation(screen) {
            control.checkpoint(clock)?;
            if let Err(e) = self.system.apply(handle, command) {
                warn!("{:?} failed for window {}: {}", command, handle, e);
            }
            steps.push(command);
            clock.sleep(self.policy.settle_delay);

            match self.system.window(handle) {
                Ok(info) => current = info,
                Err(e) => {
                    warn!("Could not re-read window {}: {}", handle, e);
                    continue;
                }
            }
            if self.policy.is_usable(&current, screen) {
                if !steps.contains(&WindowCommand::BringToFront) {
                    self.system.apply(handle, WindowCommand::BringToFront)?;
                    steps.push(WindowCommand::BringToFront);
                }
                info!(
                    "Window {} usable at {} after {} step(s)",
                    handle,
                    current.rect,
                    steps.len()
                );
                return Ok(self.activated(candidate, current, false, steps));
            }
        }

        warn!(
            "Window {} never reached usable geometry, continuing with {}",
            handle, current.rect
        );
        Ok(self.activated(candidate, current, true, steps))
    }

    fn activated(
        &self,
        candidate: &CandidateTarget,
        info: WindowInfo,
        degraded: bool,
        steps: Vec<WindowCommand>,
    ) -> ActivatedWindow {
        ActivatedWindow {
            handle: info.handle,
            title: info.title,
            tier: candidate.pattern_strength,
            geometry: info.rect,
            degraded,
            steps,
        }
    }
}
