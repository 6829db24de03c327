//! Relay arbitration through the control core: deadlines, budget,
//! polarity, pin failures and the audit trail.

use growctl::app::events::CoreEvent;
use growctl::error::{ArbitrationError, Error};
use growctl::relay::{Granted, RelayState, Requester};
use growctl::snapshot::{Polarity, SafetyBudget, Switch};

use crate::mock_hw::*;

#[test]
fn five_second_request_turns_off_exactly_once() {
    let (mut core, _) = core();
    core.start(base_snapshot(), 0);

    core.request_relay(1, Switch::On, 5.0, 0).unwrap();
    assert_eq!(core.poll_deadlines(4_999), Some(5_000));
    assert_eq!(core.arbitrator().state(1), Some(RelayState::On));

    assert_eq!(core.poll_deadlines(5_000), None);
    assert_eq!(core.poll_deadlines(6_000), None);

    let offs: Vec<_> = core
        .sink()
        .transitions_of(1)
        .into_iter()
        .filter(|t| t.state == Switch::Off)
        .collect();
    assert_eq!(offs.len(), 1);
    assert_eq!(offs[0].at_ms, 5_000);
    assert_eq!(offs[0].requester, Requester::Deadline);
    assert_eq!(offs[0].duration_ms, 5_000);
}

#[test]
fn later_request_replaces_deadline() {
    let (mut core, _) = core();
    core.start(base_snapshot(), 0);

    core.request_relay(1, Switch::On, 5.0, 0).unwrap();
    let granted = core.request_relay(1, Switch::On, 5.0, 3_000).unwrap();
    assert_eq!(granted, Granted::DeadlineReplaced);

    core.poll_deadlines(5_000);
    assert_eq!(core.arbitrator().state(1), Some(RelayState::On));
    core.poll_deadlines(8_000);
    assert_eq!(core.arbitrator().state(1), Some(RelayState::Off));

    let t = core.sink().transitions_of(1);
    assert_eq!(t.len(), 2, "one on edge, one off edge: {:?}", t);
}

#[test]
fn indefinite_request_clears_deadline() {
    let (mut core, _) = core();
    core.start(base_snapshot(), 0);

    core.request_relay(2, Switch::On, 5.0, 0).unwrap();
    assert_eq!(
        core.request_relay(2, Switch::On, 0.0, 1_000).unwrap(),
        Granted::DeadlineCleared
    );
    assert_eq!(core.poll_deadlines(60_000), None);
    assert_eq!(core.arbitrator().state(2), Some(RelayState::On));
}

#[test]
fn repeated_state_is_a_noop() {
    let (mut core, _) = core();
    core.start(base_snapshot(), 0);

    let err = core.request_relay(3, Switch::Off, 0.0, 0).unwrap_err();
    match err {
        Error::Arbitration(e) => {
            assert_eq!(e, ArbitrationError::AlreadyInState(3));
            assert!(e.is_noop());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn budget_blocks_second_heavy_load() {
    let mut snap = base_snapshot();
    snap.relays = vec![relay(1, 10, 8.0), relay(2, 11, 8.0), relay(3, 12, 1.0)];
    snap.budget = SafetyBudget {
        max_amps: 15.0,
        enabled: true,
    };
    let (mut core, _) = core();
    core.start(snap, 0);

    core.request_relay(1, Switch::On, 0.0, 0).unwrap();
    let err = core.request_relay(2, Switch::On, 0.0, 10).unwrap_err();
    assert!(matches!(
        err,
        Error::Arbitration(ArbitrationError::BudgetExceeded { relay: 2, .. })
    ));
    // A small load still fits.
    core.request_relay(3, Switch::On, 0.0, 20).unwrap();
    assert!(core.arbitrator().load_amps() <= 15.0);

    core.request_relay(1, Switch::Off, 0.0, 30).unwrap();
    core.request_relay(2, Switch::On, 0.0, 40).unwrap();
    assert_eq!(core.arbitrator().state(2), Some(RelayState::On));
}

#[test]
fn disabled_budget_admits_everything() {
    let mut snap = base_snapshot();
    snap.relays = vec![relay(1, 10, 30.0), relay(2, 11, 30.0)];
    snap.budget = SafetyBudget {
        max_amps: 1.0,
        enabled: false,
    };
    let (mut core, _) = core();
    core.start(snap, 0);
    core.request_relay(1, Switch::On, 0.0, 0).unwrap();
    core.request_relay(2, Switch::On, 0.0, 0).unwrap();
    assert_eq!(core.arbitrator().load_amps(), 60.0);
}

#[test]
fn active_low_relay_inverts_pin_level() {
    let mut snap = base_snapshot();
    snap.relays[0].polarity = Polarity::ActiveLow;
    let (mut core, _) = core();
    core.start(snap, 0);

    let pin = core.snapshot().relays[0].pin;
    assert_eq!(core.arbitrator().pins().level(pin), Some(true), "off = high");
    core.request_relay(1, Switch::On, 0.0, 0).unwrap();
    assert_eq!(core.arbitrator().pins().level(pin), Some(false), "on = low");
}

#[test]
fn pin_failure_marks_relay_unknown_until_next_write() {
    let (mut core, _) = core();
    core.start(base_snapshot(), 0);
    let pin = core.snapshot().relays[0].pin;

    core.pins_mut().broken.insert(pin);
    let err = core.request_relay(1, Switch::On, 0.0, 10).unwrap_err();
    assert!(matches!(
        err,
        Error::Arbitration(ArbitrationError::PinDriver(_))
    ));
    assert_eq!(core.arbitrator().state(1), Some(RelayState::Unknown));

    core.pins_mut().broken.remove(&pin);
    core.request_relay(1, Switch::Off, 0.0, 20).unwrap();
    assert_eq!(core.arbitrator().state(1), Some(RelayState::Off));
    assert_eq!(core.arbitrator().pins().level(pin), Some(false));
}

#[test]
fn every_transition_is_audited() {
    let (mut core, _) = core();
    core.start(base_snapshot(), 0);
    let before = core
        .sink()
        .count(|e| matches!(e, CoreEvent::Audit(_)));

    core.request_relay(1, Switch::On, 2.0, 0).unwrap();
    core.poll_deadlines(2_000);

    let audits: Vec<_> = core
        .sink()
        .events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::Audit(a) => Some(*a),
            _ => None,
        })
        .skip(before)
        .collect();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[0].state, RelayState::On);
    assert_eq!(audits[0].requested_ms, 2_000);
    assert_eq!(audits[1].state, RelayState::Off);
    assert_eq!(audits[1].completed_on_ms, Some(2_000));
}

#[test]
fn unknown_relay_is_reported() {
    let (mut core, _) = core();
    core.start(base_snapshot(), 0);
    let err = core.request_relay(99, Switch::On, 0.0, 0).unwrap_err();
    assert_eq!(
        err,
        Error::Arbitration(ArbitrationError::UnknownActuator(99))
    );
}
