//! Snapshot reload: diffing running entities against a new snapshot.

use growctl::app::events::CoreEvent;
use growctl::app::service::{ReloadScope, TaskId};
use growctl::error::ConfigInvalid;
use growctl::relay::{RelayState, Requester};
use growctl::snapshot::{Direction, EntityKind, Snapshot, Switch, Variable};

use crate::mock_hw::*;

fn regulated() -> Snapshot {
    let mut snap = base_snapshot();
    let mut ctl = pid(1, 1, 25.0, Direction::Up);
    ctl.kp = 2.0;
    ctl.ki = 0.1;
    ctl.up = Some(bounds(1, 0.0, 600.0));
    snap.pids.push(ctl);
    snap.timers.push(timer(1, 3, 10, 10));
    snap.rules.push(transition_rule(1, 2, Switch::On, 0, vec![]));
    snap
}

fn warm_up(core: &mut TestCore, cache: &growctl::cache::ReadingCache) {
    cache.push(1, Variable::Temperature, 20.0, 0);
    core.poll_task(TaskId::Pid(1), 0);
    assert!(core.pid(1).unwrap().controller().integral() > 0.0);
}

#[test]
fn unchanged_entities_keep_their_state() {
    let (mut core, cache) = core();
    core.start(regulated(), 0);
    warm_up(&mut core, &cache);
    let integral = core.pid(1).unwrap().controller().integral();

    let plan = core.reload(regulated(), ReloadScope::All, 1_000);
    assert!(plan.started.is_empty() && plan.stopped.is_empty());
    assert_eq!(core.pid(1).unwrap().controller().integral(), integral);
    assert_eq!(core.arbitrator().state(1), Some(RelayState::On));
    assert!(matches!(
        core.sink().events.last(),
        Some(CoreEvent::Reloaded { started: 0, stopped: 0, .. })
    ));
}

#[test]
fn override_flag_applies_in_place() {
    let (mut core, cache) = core();
    core.start(regulated(), 0);
    warm_up(&mut core, &cache);

    let mut next = regulated();
    next.pids[0].enabled = false;
    let plan = core.reload(next, ReloadScope::All, 1_000);
    assert!(plan.stopped.is_empty());
    assert!(!core.pid(1).unwrap().config().enabled);
    // Granted duration stands.
    assert_eq!(core.arbitrator().state(1), Some(RelayState::On));
}

#[test]
fn changed_controller_is_torn_down_and_replaced() {
    let (mut core, cache) = core();
    core.start(regulated(), 0);
    warm_up(&mut core, &cache);

    let mut next = regulated();
    next.pids[0].setpoint = 22.0;
    let plan = core.reload(next, ReloadScope::All, 1_000);

    assert_eq!(plan.stopped, vec![TaskId::Pid(1)]);
    assert_eq!(plan.started, vec![TaskId::Pid(1)]);
    assert_eq!(core.pid(1).unwrap().controller().integral(), 0.0);
    assert_eq!(core.arbitrator().state(1), Some(RelayState::Off));
    let off = core.sink().transitions_of(1).pop().unwrap();
    assert_eq!((off.state, off.requester), (Switch::Off, Requester::Pid(1)));
}

#[test]
fn removed_timer_releases_its_relay() {
    let (mut core, _) = core();
    core.start(regulated(), 0);
    core.poll_task(TaskId::Timer(1), 0);
    assert_eq!(core.arbitrator().state(3), Some(RelayState::On));

    let mut next = regulated();
    next.timers.clear();
    let plan = core.reload(next, ReloadScope::All, 2_000);
    assert_eq!(plan.stopped, vec![TaskId::Timer(1)]);
    assert!(core.timer(1).is_none());
    assert_eq!(core.arbitrator().state(3), Some(RelayState::Off));
}

#[test]
fn timer_running_flag_wakes_task() {
    let mut snap = regulated();
    snap.timers[0].running = false;
    let (mut core, _) = core();
    core.start(snap, 0);

    let plan = core.reload(regulated(), ReloadScope::All, 1_000);
    assert_eq!(plan.wake, vec![TaskId::Timer(1)]);
    assert!(plan.started.is_empty());
    assert!(core.timer(1).unwrap().is_running());
}

#[test]
fn rewired_relay_moves_to_new_pin() {
    let (mut core, _) = core();
    core.start(regulated(), 0);
    core.request_relay(4, Switch::On, 0.0, 0).unwrap();
    let old_pin = core.snapshot().relay(4).unwrap().pin;

    let mut next = regulated();
    next.relays[3].pin = 20;
    core.reload(next, ReloadScope::All, 1_000);

    let pins = core.arbitrator().pins();
    assert_eq!(pins.level(old_pin), Some(false));
    assert!(pins.released.contains(&old_pin));
    assert_eq!(pins.level(20), Some(false));
    assert_eq!(core.arbitrator().state(4), Some(RelayState::Off));
}

#[test]
fn removed_relay_is_switched_off_and_forgotten() {
    let (mut core, _) = core();
    core.start(regulated(), 0);
    core.request_relay(4, Switch::On, 0.0, 0).unwrap();

    let mut next = regulated();
    next.relays.retain(|r| r.id != 4);
    core.reload(next, ReloadScope::All, 1_000);
    assert_eq!(core.arbitrator().state(4), None);
    assert_eq!(core.census().relays, 3);
}

#[test]
fn added_startup_relay_switches_on() {
    let (mut core, _) = core();
    core.start(regulated(), 0);

    let mut next = regulated();
    let mut fan = relay(5, 30, 1.0);
    fan.startup = Switch::On;
    next.relays.push(fan);
    core.reload(next, ReloadScope::All, 1_000);
    assert_eq!(core.arbitrator().state(5), Some(RelayState::On));
}

#[test]
fn relay_scoped_reload_touches_only_that_relay() {
    let (mut core, _) = core();
    core.start(regulated(), 0);

    let mut next = regulated();
    next.pids[0].setpoint = 18.0;
    next.relays[1].amps = 4.0;
    let plan = core.reload(next, ReloadScope::from_relay_id(2), 1_000);

    assert!(plan.started.is_empty() && plan.stopped.is_empty());
    assert_eq!(core.pid(1).unwrap().config().setpoint, 25.0);
    assert_eq!(core.snapshot().relay(2).unwrap().amps, 4.0);
    assert_eq!(core.arbitrator().table().get(2).unwrap().actuator.amps, 4.0);
}

#[test]
fn invalid_entities_are_skipped_not_fatal() {
    let mut snap = regulated();
    snap.timers.push(timer(2, 99, 10, 10));
    let mut broken = pid(2, 1, 20.0, Direction::Both);
    broken.up = Some(bounds(1, 10.0, 5.0));
    broken.down = Some(bounds(2, 0.0, 5.0));
    snap.pids.push(broken);

    let (mut core, _) = core();
    let plan = core.start(snap, 0);

    assert!(plan.started.contains(&TaskId::Pid(1)));
    assert!(plan.started.contains(&TaskId::Timer(1)));
    assert!(core.pid(2).is_none());
    assert!(core.timer(2).is_none());

    let rejected: Vec<ConfigInvalid> = core
        .sink()
        .events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::ConfigRejected(c) => Some(*c),
            _ => None,
        })
        .collect();
    assert_eq!(rejected.len(), 2);
    assert!(rejected.iter().any(|c| c.kind == EntityKind::Timer && c.id == 2));
    assert!(rejected.iter().any(|c| c.kind == EntityKind::Pid && c.id == 2));
}

#[test]
fn removed_zone_forgets_readings() {
    let mut snap = regulated();
    snap.zones.push(zone(2, 10.0));
    let (mut core, cache) = core();
    core.start(snap, 0);
    cache.push(2, Variable::Humidity, 70.0, 0);

    core.reload(regulated(), ReloadScope::All, 1_000);
    assert!(cache.latest(2, Variable::Humidity).is_none());
}

#[test]
fn up_only_teardown_leaves_configured_down_relay_alone() {
    let mut snap = regulated();
    snap.pids[0].down = Some(bounds(2, 0.0, 60.0));
    let (mut core, cache) = core();
    core.start(snap.clone(), 0);
    warm_up(&mut core, &cache);
    core.request_relay(2, Switch::On, 0.0, 500).unwrap();

    let mut next = snap;
    next.pids[0].setpoint = 22.0;
    let plan = core.reload(next, ReloadScope::All, 1_000);

    assert_eq!(plan.stopped, vec![TaskId::Pid(1)]);
    assert_eq!(core.arbitrator().state(1), Some(RelayState::Off));
    assert_eq!(core.arbitrator().state(2), Some(RelayState::On));
    assert!(core
        .sink()
        .transitions_of(2)
        .iter()
        .all(|t| t.requester != Requester::Pid(1)));
}

#[test]
fn raised_amps_on_a_running_relay_respect_the_budget() {
    let mut snap = regulated();
    snap.budget.max_amps = 5.0;
    let (mut core, _) = core();
    core.start(snap.clone(), 0);
    core.request_relay(1, Switch::On, 0.0, 0).unwrap();
    core.request_relay(2, Switch::On, 0.0, 0).unwrap();

    let mut next = snap;
    next.relays[0].amps = 4.0;
    core.reload(next, ReloadScope::All, 1_000);

    assert!(core.arbitrator().load_amps() <= 5.0);
    assert_eq!(core.arbitrator().state(1), Some(RelayState::Off));
    assert_eq!(core.arbitrator().state(2), Some(RelayState::On));
    let off = core.sink().transitions_of(1).pop().unwrap();
    assert_eq!((off.state, off.requester), (Switch::Off, Requester::Lifecycle));
}
