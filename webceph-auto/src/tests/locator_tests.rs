use std::sync::Arc;
use std::time::Duration;

use super::fakes::{visible_state, FakeSurface};
use crate::errors::AutomationError;
use crate::locator::{Locator, LocatorStrategy, Requirement, TargetKind};
use crate::selector::Selector;
use crate::surface::{ElementState, RemoteElements};
use crate::wait::{ManualClock, RunControl};
use crate::workflow::strategies::table;

fn locator(clock: &Arc<ManualClock>) -> Locator {
    Locator::new(clock.clone(), RunControl::new())
        .set_default_timeout(Duration::from_secs(2))
        .with_interval(Duration::from_millis(500))
}

#[test]
fn first_matching_strategy_wins() {
    let clock = Arc::new(ManualClock::new());
    let surface = FakeSurface::new();
    let second = surface.add(Selector::from("#b"), "B");
    surface.add(Selector::from("#c"), "C");

    let elements = RemoteElements::new(&surface);
    let located = locator(&clock)
        .resolve("button", &elements, &table(&["#a", "#b", "#c"]))
        .unwrap();

    assert_eq!(located.priority, 1);
    assert_eq!(located.strategy_index, 1);
    assert_eq!(located.target, second);
    // only the first strategy waited out its timeout
    assert_eq!(clock.elapsed(), Duration::from_secs(2));
}

#[test]
fn priority_not_list_position_decides_order() {
    let clock = Arc::new(ManualClock::new());
    let surface = FakeSurface::new();
    surface.add(Selector::from("#late"), "late");
    let preferred = surface.add(Selector::from("#early"), "early");

    let strategies = vec![
        LocatorStrategy::new(5, TargetKind::RemoteElement, Selector::from("#late")),
        LocatorStrategy::new(0, TargetKind::RemoteElement, Selector::from("#early")),
    ];
    let elements = RemoteElements::new(&surface);
    let located = locator(&clock).resolve("x", &elements, &strategies).unwrap();
    assert_eq!(located.target, preferred);
    assert_eq!(located.strategy_index, 1);
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

#[test]
fn exhausted_strategies_list_every_attempt() {
    let clock = Arc::new(ManualClock::new());
    let surface = FakeSurface::new();
    let elements = RemoteElements::new(&surface);

    let err = locator(&clock)
        .resolve("login button", &elements, &table(&["#a", "#b", "#c"]))
        .unwrap_err();
    match err {
        AutomationError::LocatorNotFound { target, attempts } => {
            assert_eq!(target, "login button");
            assert_eq!(attempts.len(), 3);
            assert!(attempts[0].starts_with("[0] css:#a"));
            assert!(attempts[2].contains("not found"));
        }
        other => panic!("expected LocatorNotFound, got {other:?}"),
    }
    assert_eq!(clock.elapsed(), Duration::from_secs(6));
}

#[test]
fn unusable_target_falls_through_to_next_strategy() {
    let clock = Arc::new(ManualClock::new());
    let surface = FakeSurface::new();
    surface.add_with_state(
        Selector::from("#hidden"),
        "",
        ElementState {
            displayed: false,
            ..visible_state()
        },
    );
    let fallback = surface.add(Selector::from("#fallback"), "");

    let elements = RemoteElements::new(&surface);
    let located = locator(&clock)
        .resolve("field", &elements, &table(&["#hidden", "#fallback"]))
        .unwrap();
    assert_eq!(located.target, fallback);
    assert_eq!(located.priority, 1);
}

#[test]
fn disabled_element_is_enough_when_only_visibility_is_required() {
    let clock = Arc::new(ManualClock::new());
    let surface = FakeSurface::new();
    let disabled = surface.add_with_state(
        Selector::from("#submit"),
        "",
        ElementState {
            enabled: false,
            ..visible_state()
        },
    );
    let elements = RemoteElements::new(&surface);
    let strategies = table(&["#submit"]);

    let err = locator(&clock)
        .resolve("submit", &elements, &strategies)
        .unwrap_err();
    match err {
        AutomationError::LocatorNotFound { attempts, .. } => {
            assert!(attempts[0].contains("disabled"), "{attempts:?}")
        }
        other => panic!("unexpected {other:?}"),
    }

    let located = locator(&clock)
        .require(Requirement::Visible)
        .resolve("submit", &elements, &strategies)
        .unwrap();
    assert_eq!(located.target, disabled);
}

#[test]
fn kind_mismatch_is_skipped_and_recorded() {
    let clock = Arc::new(ManualClock::new());
    let surface = FakeSurface::new();
    surface.add(Selector::from("#a"), "");
    let strategies = vec![LocatorStrategy::new(
        0,
        TargetKind::OsWindow,
        Selector::from("#a"),
    )];
    let elements = RemoteElements::new(&surface);

    let err = locator(&clock).resolve("a", &elements, &strategies).unwrap_err();
    match err {
        AutomationError::LocatorNotFound { attempts, .. } => {
            assert!(attempts[0].contains("skipped"))
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

#[test]
fn click_reveals_element_for_later_lookups() {
    let clock = Arc::new(ManualClock::new());
    let surface = FakeSurface::new();
    let trigger = surface.add(Selector::from("#trigger"), "");
    surface.reveal_on_click(&trigger, Selector::from("#late"), "late");

    let elements = RemoteElements::new(&surface);
    assert!(!elements
        .exists(&locator(&clock), &table(&["#late"]))
        .unwrap());
    elements
        .click(&locator(&clock), "trigger", &table(&["#trigger"]))
        .unwrap();
    assert!(elements
        .exists(&locator(&clock), &table(&["#late"]))
        .unwrap());
}

#[test]
fn cancellation_stops_resolution() {
    let clock = Arc::new(ManualClock::new());
    let control = RunControl::new();
    control.cancel();
    let surface = FakeSurface::new();
    let elements = RemoteElements::new(&surface);

    let err = Locator::new(clock, control)
        .resolve("anything", &elements, &table(&["#a", "#b"]))
        .unwrap_err();
    assert!(matches!(err, AutomationError::Cancelled(_)));
}

#[test]
fn invalid_selector_does_not_stop_later_strategies() {
    let clock = Arc::new(ManualClock::new());
    let surface = FakeSurface::new();
    let found = surface.add(Selector::from("#ok"), "");
    let elements = RemoteElements::new(&surface);

    let located = locator(&clock)
        .immediate()
        .resolve("field", &elements, &table(&["", "#ok"]))
        .unwrap();
    assert_eq!(located.target, found);
}
