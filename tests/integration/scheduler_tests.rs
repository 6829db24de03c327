//! Duty-cycle timers through the control core.

use growctl::app::events::CoreEvent;
use growctl::app::service::{TaskId, TaskPoll};
use growctl::relay::{RelayState, Requester};
use growctl::scheduler::Phase;
use growctl::snapshot::Switch;

use crate::mock_hw::*;

fn with_timer(on_secs: u32, off_secs: u32) -> (TestCore, growctl::cache::ReadingCache) {
    let mut snap = base_snapshot();
    snap.timers.push(timer(1, 3, on_secs, off_secs));
    let (mut core, cache) = core();
    let plan = core.start(snap, 0);
    assert_eq!(plan.started, vec![TaskId::Timer(1)]);
    (core, cache)
}

/// Deadlines first, then the timer, as the runtime does on a shared tick.
fn tick(core: &mut TestCore, now: u64) -> TaskPoll {
    core.poll_deadlines(now);
    core.poll_task(TaskId::Timer(1), now)
}

#[test]
fn oscillates_on_and_off() {
    let (mut core, _) = with_timer(10, 20);

    assert_eq!(tick(&mut core, 0), TaskPoll::Next(10_000));
    assert_eq!(core.arbitrator().state(3), Some(RelayState::On));

    assert_eq!(tick(&mut core, 10_000), TaskPoll::Next(30_000));
    assert_eq!(core.arbitrator().state(3), Some(RelayState::Off));

    assert_eq!(tick(&mut core, 30_000), TaskPoll::Next(40_000));
    assert_eq!(core.arbitrator().state(3), Some(RelayState::On));
    assert_eq!(core.timer(1).unwrap().cycles(), 2);

    let on: Vec<_> = core
        .sink()
        .transitions_of(3)
        .into_iter()
        .filter(|t| t.state == Switch::On)
        .collect();
    assert_eq!(on.len(), 2);
    assert!(on.iter().all(|t| t.requester == Requester::Timer(1) && t.duration_ms == 10_000));
}

#[test]
fn early_poll_keeps_phase() {
    let (mut core, _) = with_timer(10, 20);
    tick(&mut core, 0);
    assert_eq!(tick(&mut core, 4_000), TaskPoll::Next(10_000));
    assert_eq!(core.timer(1).unwrap().phase(), Phase::On { until_ms: 10_000 });
}

#[test]
fn stop_switches_relay_off_immediately() {
    let (mut core, _) = with_timer(60, 60);
    tick(&mut core, 0);
    assert_eq!(core.arbitrator().state(3), Some(RelayState::On));

    assert_eq!(core.set_timer_running(1, false, 5_000).unwrap(), None);
    assert_eq!(core.arbitrator().state(3), Some(RelayState::Off));
    assert_eq!(core.timer(1).unwrap().phase(), Phase::Stopped);
    assert_eq!(tick(&mut core, 6_000), TaskPoll::Idle);

    let last_off = core
        .sink()
        .transitions_of(3)
        .into_iter()
        .rev()
        .find(|t| t.state == Switch::Off)
        .unwrap();
    assert_eq!(last_off.at_ms, 5_000);
    assert_eq!(last_off.requester, Requester::Timer(1));
    assert!(core.sink().events.iter().any(|e| matches!(
        e,
        CoreEvent::TimerPhase {
            timer: 1,
            phase: Phase::Stopped
        }
    )));
}

#[test]
fn restart_begins_new_on_phase() {
    let (mut core, _) = with_timer(5, 5);
    tick(&mut core, 0);
    core.set_timer_running(1, false, 1_000).unwrap();

    assert_eq!(
        core.set_timer_running(1, true, 2_000).unwrap(),
        Some(TaskId::Timer(1))
    );
    assert_eq!(tick(&mut core, 2_000), TaskPoll::Next(7_000));
    assert_eq!(core.arbitrator().state(3), Some(RelayState::On));
}

#[test]
fn zero_off_duration_latches_on() {
    let (mut core, _) = with_timer(30, 0);
    assert_eq!(tick(&mut core, 0), TaskPoll::Idle);
    assert_eq!(core.timer(1).unwrap().phase(), Phase::Latched);

    assert_eq!(core.poll_deadlines(3_600_000), None);
    assert_eq!(core.arbitrator().state(3), Some(RelayState::On));
}

#[test]
fn configured_stopped_timer_stays_idle() {
    let mut snap = base_snapshot();
    let mut t = timer(1, 3, 10, 10);
    t.running = false;
    snap.timers.push(t);
    let (mut core, _) = core();
    core.start(snap, 0);

    assert_eq!(core.poll_task(TaskId::Timer(1), 0), TaskPoll::Idle);
    assert_eq!(core.arbitrator().state(3), Some(RelayState::Off));
}

#[test]
fn budget_refusal_keeps_oscillating() {
    let mut snap = base_snapshot();
    snap.relays[2].amps = 25.0;
    snap.timers.push(timer(1, 3, 10, 10));
    let (mut core, _) = core();
    core.start(snap, 0);

    assert_eq!(tick(&mut core, 0), TaskPoll::Next(10_000));
    assert_eq!(core.arbitrator().state(3), Some(RelayState::Off));
    assert_eq!(tick(&mut core, 10_000), TaskPoll::Next(20_000));
}
