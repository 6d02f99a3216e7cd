//! The remote document the workflow drives: navigation plus element lookup,
//! state and input.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::errors::AutomationError;
use crate::locator::{
    Located, Locator, LocatorStrategy, Readiness, Requirement, TargetKind, TargetSource,
};
use crate::selector::Selector;

mod webdriver;

pub use webdriver::WebDriverSurface;

/// Reference to an element inside the current document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementState {
    pub displayed: bool,
    pub enabled: bool,
    pub rect: ElementRect,
}

impl ElementState {
    pub fn has_size(&self) -> bool {
        self.rect.width > 0.0 && self.rect.height > 0.0
    }
}

/// Call-and-wait automation surface over a remote document.
pub trait DocumentSurface: Send + Sync {
    fn navigate(&self, url: &str) -> Result<(), AutomationError>;
    fn refresh(&self) -> Result<(), AutomationError>;
    /// All elements the selector matches, in document order. No match is `Ok(vec![])`.
    fn find_all(&self, selector: &Selector) -> Result<Vec<ElementHandle>, AutomationError>;
    fn state(&self, element: &ElementHandle) -> Result<ElementState, AutomationError>;
    fn text(&self, element: &ElementHandle) -> Result<String, AutomationError>;
    fn clear(&self, element: &ElementHandle) -> Result<(), AutomationError>;
    fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), AutomationError>;
    fn click(&self, element: &ElementHandle) -> Result<(), AutomationError>;
    fn press_enter(&self, element: &ElementHandle) -> Result<(), AutomationError>;
    /// Hand a local file to a file input.
    fn attach_file(&self, element: &ElementHandle, path: &Path) -> Result<(), AutomationError>;
}

/// Adapts a [`DocumentSurface`] for the [`Locator`] and layers the common
/// "locate then act" operations on top.
pub struct RemoteElements<'a> {
    surface: &'a dyn DocumentSurface,
}

impl<'a> RemoteElements<'a> {
    pub fn new(surface: &'a dyn DocumentSurface) -> Self {
        Self { surface }
    }

    pub fn surface(&self) -> &dyn DocumentSurface {
        self.surface
    }

    pub fn locate(
        &self,
        locator: &Locator,
        target: &str,
        strategies: &[LocatorStrategy<Selector>],
    ) -> Result<Located<ElementHandle>, AutomationError> {
        locator.resolve(target, self, strategies)
    }

    /// Clear the located field and type `text` into it.
    pub fn fill(
        &self,
        locator: &Locator,
        target: &str,
        strategies: &[LocatorStrategy<Selector>],
        text: &str,
    ) -> Result<Located<ElementHandle>, AutomationError> {
        let located = self.locate(locator, target, strategies)?;
        self.surface.clear(&located.target)?;
        self.surface.type_text(&located.target, text)?;
        debug!("Filled {} via {}", target, located.matcher);
        Ok(located)
    }

    pub fn click(
        &self,
        locator: &Locator,
        target: &str,
        strategies: &[LocatorStrategy<Selector>],
    ) -> Result<Located<ElementHandle>, AutomationError> {
        let located = self.locate(locator, target, strategies)?;
        self.surface.click(&located.target)?;
        debug!("Clicked {} via {}", target, located.matcher);
        Ok(located)
    }

    /// Whether any strategy currently matches, checked once without waiting.
    pub fn exists(
        &self,
        locator: &Locator,
        strategies: &[LocatorStrategy<Selector>],
    ) -> Result<bool, AutomationError> {
        Ok(locator
            .immediate()
            .require(Requirement::Present)
            .try_resolve("presence check", self, strategies)?
            .is_some())
    }
}

impl TargetSource for RemoteElements<'_> {
    type Matcher = Selector;
    type Target = ElementHandle;

    fn kind(&self) -> TargetKind {
        TargetKind::RemoteElement
    }

    fn find(&self, matcher: &Selector) -> Result<Vec<ElementHandle>, AutomationError> {
        if let Selector::Invalid(reason) = matcher {
            return Err(AutomationError::InvalidArgument(format!(
                "invalid selector: {reason}"
            )));
        }
        self.surface.find_all(matcher)
    }

    fn readiness(
        &self,
        target: &ElementHandle,
        requirement: Requirement,
    ) -> Result<Readiness, AutomationError> {
        if requirement == Requirement::Present {
            return Ok(Readiness::Ready);
        }
        let state = self.surface.state(target)?;
        if !state.displayed {
            return Ok(Readiness::Unusable("not displayed".to_string()));
        }
        if !state.has_size() {
            return Ok(Readiness::Unusable("zero size".to_string()));
        }
        if requirement == Requirement::Interactable && !state.enabled {
            return Ok(Readiness::Unusable("disabled".to_string()));
        }
        Ok(Readiness::Ready)
    }
}
