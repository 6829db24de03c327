//! Conditional rules: threshold ticks, relay-transition matching, ordered
//! actions, notification throttling and cascades.

use growctl::app::events::CoreEvent;
use growctl::app::service::{ControlCore, CoreSettings, TaskId, TaskPoll};
use growctl::cache::ReadingCache;
use growctl::relay::{RelayState, Requester};
use growctl::snapshot::{Action, Comparison, SafetyBudget, Switch, Variable};

use crate::mock_hw::*;

fn notify(to: &str) -> Action {
    Action::Notify {
        recipients: vec![to.to_owned()],
    }
}

fn command(cmd: &str) -> Action {
    Action::Command {
        command: cmd.to_owned(),
    }
}

// ── Threshold rules ───────────────────────────────────────────

#[test]
fn threshold_above_fires_every_tick_while_true() {
    let mut snap = base_snapshot();
    snap.rules.push(threshold_rule(
        1,
        1,
        Comparison::Above,
        80.0,
        vec![command("fan-boost")],
    ));
    let (mut core, cache) = core();
    let plan = core.start(snap, 0);
    assert_eq!(plan.started, vec![TaskId::Rule(1)]);

    cache.push(1, Variable::Temperature, 81.0, 0);
    for tick in 0..5 {
        let now = tick * 30_000;
        assert_eq!(core.poll_task(TaskId::Rule(1), now), TaskPoll::Next(now + 30_000));
    }
    assert_eq!(core.sink().fired(1), 5);
    assert_eq!(core.rule(1).unwrap().fired_count(), 5);

    cache.push(1, Variable::Temperature, 79.0, 150_000);
    for tick in 5..10 {
        core.poll_task(TaskId::Rule(1), tick * 30_000);
    }
    assert_eq!(core.sink().fired(1), 5, "79 never fires an above-80 rule");
    assert_eq!(core.commands().started.len(), 5);
}

#[test]
fn threshold_below_and_missing_reading() {
    let mut snap = base_snapshot();
    snap.rules.push(threshold_rule(2, 1, Comparison::Below, 10.0, vec![]));
    let (mut core, cache) = core();
    core.start(snap, 0);

    core.poll_task(TaskId::Rule(2), 0);
    assert_eq!(core.sink().fired(2), 0);

    cache.push(1, Variable::Temperature, 9.5, 1);
    core.poll_task(TaskId::Rule(2), 30_000);
    assert_eq!(core.sink().fired(2), 1, "a rule without actions still fires");
}

#[test]
fn deactivated_zone_trips_no_threshold() {
    let mut snap = base_snapshot();
    snap.zones[0].activated = false;
    snap.rules
        .push(threshold_rule(1, 1, Comparison::Above, 80.0, vec![]));
    let (mut core, cache) = core();
    core.start(snap, 0);
    cache.push(1, Variable::Temperature, 90.0, 0);

    assert_eq!(core.poll_task(TaskId::Rule(1), 0), TaskPoll::Next(30_000));
    assert_eq!(core.sink().fired(1), 0);
}

#[test]
fn disabled_rule_stops_evaluating() {
    let mut snap = base_snapshot();
    snap.rules
        .push(threshold_rule(1, 1, Comparison::Above, 80.0, vec![]));
    let (mut core, cache) = core();
    core.start(snap, 0);
    cache.push(1, Variable::Temperature, 90.0, 0);

    core.poll_task(TaskId::Rule(1), 0);
    core.set_rule_enabled(1, false).unwrap();
    core.poll_task(TaskId::Rule(1), 30_000);
    core.poll_task(TaskId::Rule(1), 60_000);
    assert_eq!(core.sink().fired(1), 1);

    core.set_rule_enabled(1, true).unwrap();
    core.poll_task(TaskId::Rule(1), 90_000);
    assert_eq!(core.sink().fired(1), 2);
}

// ── Relay-transition rules ────────────────────────────────────

fn on_duration_rule() -> growctl::snapshot::Snapshot {
    let mut snap = base_snapshot();
    snap.rules.push(transition_rule(
        1,
        1,
        Switch::Off,
        10,
        vec![command("log-cycle {relay} {duration}")],
    ));
    snap
}

fn pulse(core: &mut TestCore, secs: f32, start: u64) {
    core.request_relay(1, Switch::On, secs, start).unwrap();
    core.poll_deadlines(start + (secs * 1000.0) as u64);
}

#[test]
fn seven_second_cycle_does_not_match_ten() {
    let (mut core, _) = core();
    core.start(on_duration_rule(), 0);
    pulse(&mut core, 7.0, 0);
    assert_eq!(core.sink().fired(1), 0);
}

#[test]
fn ten_second_cycle_matches_ten() {
    let (mut core, _) = core();
    core.start(on_duration_rule(), 0);
    pulse(&mut core, 10.0, 0);
    assert_eq!(core.sink().fired(1), 1);
    assert_eq!(core.commands().started, vec!["log-cycle 1 10".to_owned()]);
}

#[test]
fn on_duration_tolerance_is_inclusive() {
    let (mut core, _) = core();
    core.start(on_duration_rule(), 0);
    pulse(&mut core, 10.5, 0);
    assert_eq!(core.sink().fired(1), 1);
    pulse(&mut core, 10.6, 100_000);
    assert_eq!(core.sink().fired(1), 1);
    pulse(&mut core, 9.5, 200_000);
    assert_eq!(core.sink().fired(1), 2);
}

#[test]
fn on_edge_with_any_duration() {
    let mut snap = base_snapshot();
    snap.rules.push(transition_rule(
        3,
        2,
        Switch::On,
        0,
        vec![relay_action(3, Switch::On, 30.0)],
    ));
    let (mut core, _) = core();
    core.start(snap, 0);

    core.request_relay(2, Switch::On, 0.0, 0).unwrap();
    assert_eq!(core.sink().fired(3), 1);
    assert_eq!(core.arbitrator().state(3), Some(RelayState::On));
    let t = core.sink().transitions_of(3);
    assert_eq!(t[0].requester, Requester::Rule(3));
    assert_eq!(t[0].duration_ms, 30_000);

    // Off edge of relay 2 is ignored.
    core.request_relay(2, Switch::Off, 0.0, 1_000).unwrap();
    assert_eq!(core.sink().fired(3), 1);
}

// ── Actions ───────────────────────────────────────────────────

#[test]
fn rejected_relay_action_does_not_abort_the_rest() {
    let mut snap = base_snapshot();
    snap.relays[3].amps = 50.0;
    snap.budget = SafetyBudget {
        max_amps: 10.0,
        enabled: true,
    };
    snap.rules.push(threshold_rule(
        1,
        1,
        Comparison::Above,
        30.0,
        vec![
            relay_action(4, Switch::On, 0.0),
            relay_action(2, Switch::On, 60.0),
            command("alarm {value}"),
            notify("grower@example.org"),
        ],
    ));
    let (mut core, cache) = core();
    core.start(snap, 0);
    cache.push(1, Variable::Temperature, 35.0, 0);
    core.poll_task(TaskId::Rule(1), 0);

    let report = core
        .sink()
        .events
        .iter()
        .find_map(|e| match e {
            CoreEvent::RuleFired { report, .. } => Some(*report),
            _ => None,
        })
        .unwrap();
    assert_eq!(report.relays_rejected, 1);
    assert_eq!(report.relays_granted, 1);
    assert_eq!(report.commands_started, 1);
    assert_eq!(report.notified, 1);

    assert_eq!(core.arbitrator().state(4), Some(RelayState::Off));
    assert_eq!(core.arbitrator().state(2), Some(RelayState::On));
    assert_eq!(core.commands().started, vec!["alarm 35".to_owned()]);

    let sent = &core.notifier().sent[0];
    assert_eq!(sent.recipients, vec!["grower@example.org".to_owned()]);
    assert_eq!(sent.subject, "growctl: rule 1 rule-1");
    assert!(sent.body.contains("zone 1 temperature is 35.00"));
    assert!(sent.body.contains("Relay 4 on rejected"));
    assert!(sent.body.contains("Relay 2 on."));
    assert!(sent.body.contains("Execute 'alarm 35'."));
}

#[test]
fn failing_collaborators_are_logged_not_fatal() {
    let mut snap = base_snapshot();
    snap.rules.push(threshold_rule(
        1,
        1,
        Comparison::Above,
        30.0,
        vec![
            command("will-fail"),
            notify("ops@example.org"),
            relay_action(1, Switch::On, 5.0),
        ],
    ));
    let cache = ReadingCache::new();
    let mut core = ControlCore::new(
        MockPins::new(),
        MockCommands {
            fail: true,
            ..Default::default()
        },
        MockNotifier {
            fail: true,
            ..Default::default()
        },
        RecordingSink::default(),
        cache.clone(),
        CoreSettings::default(),
    );
    core.start(snap, 0);
    cache.push(1, Variable::Temperature, 31.0, 0);
    core.poll_task(TaskId::Rule(1), 0);

    match core.sink().events.iter().find(|e| matches!(e, CoreEvent::RuleFired { .. })) {
        Some(CoreEvent::RuleFired { report, .. }) => {
            assert_eq!(report.commands_failed, 1);
            assert_eq!(report.notify_failed, 1);
            assert_eq!(report.relays_granted, 1);
        }
        other => panic!("no firing: {:?}", other),
    }
    assert_eq!(core.arbitrator().state(1), Some(RelayState::On));
}

#[test]
fn notifications_respect_rule_wait() {
    let mut snap = base_snapshot();
    let mut rule = threshold_rule(1, 1, Comparison::Above, 30.0, vec![notify("a@example.org")]);
    rule.notify_wait_secs = 600;
    snap.rules.push(rule);
    let (mut core, cache) = core();
    core.start(snap, 0);
    cache.push(1, Variable::Temperature, 40.0, 0);

    for tick in 0..=20 {
        core.poll_task(TaskId::Rule(1), tick * 30_000);
    }
    // Ticks at 0 and 600 s notify; the rest are throttled.
    assert_eq!(core.sink().fired(1), 21);
    assert_eq!(core.notifier().sent.len(), 2);
}

#[test]
fn hourly_cap_is_shared_across_rules() {
    let mut snap = base_snapshot();
    for id in 1..=3 {
        let mut rule =
            threshold_rule(id, 1, Comparison::Above, 30.0, vec![notify("a@example.org")]);
        rule.notify_wait_secs = 0;
        snap.rules.push(rule);
    }
    let (mut core, cache) = core_with(CoreSettings {
        notify_max_per_hour: 2,
        ..CoreSettings::default()
    });
    core.start(snap, 0);
    cache.push(1, Variable::Temperature, 40.0, 0);

    for id in 1..=3 {
        core.poll_task(TaskId::Rule(id), 1_000);
    }
    assert_eq!(core.notifier().sent.len(), 2);

    // A minute on, the bucket has not refilled a whole token.
    core.poll_task(TaskId::Rule(3), 61_000);
    assert_eq!(core.notifier().sent.len(), 2);

    // An hour later it has.
    core.poll_task(TaskId::Rule(3), 3_661_000);
    assert_eq!(core.notifier().sent.len(), 3);
}

// ── Cascades ──────────────────────────────────────────────────

#[test]
fn transition_cascade_is_capped() {
    let mut snap = base_snapshot();
    snap.rules.push(transition_rule(
        1,
        1,
        Switch::On,
        0,
        vec![relay_action(1, Switch::Off, 0.0)],
    ));
    snap.rules.push(transition_rule(
        2,
        1,
        Switch::Off,
        0,
        vec![relay_action(1, Switch::On, 0.0)],
    ));
    let (mut core, _) = core_with(CoreSettings {
        max_cascade_depth: 3,
        ..CoreSettings::default()
    });
    core.start(snap, 0);

    core.request_relay(1, Switch::On, 0.0, 0).unwrap();

    assert_eq!(core.sink().fired(1), 2);
    assert_eq!(core.sink().fired(2), 1);
    assert_eq!(
        core.sink()
            .count(|e| matches!(e, CoreEvent::CascadeDropped { relay: 1, depth: 3 })),
        1
    );
    assert_eq!(core.arbitrator().state(1), Some(RelayState::Off));
}

#[test]
fn shutdown_stops_rule_reactions() {
    let mut snap = base_snapshot();
    snap.rules.push(transition_rule(
        1,
        1,
        Switch::Off,
        0,
        vec![relay_action(2, Switch::On, 0.0)],
    ));
    let (mut core, _) = core();
    core.start(snap, 0);
    core.request_relay(1, Switch::On, 0.0, 0).unwrap();

    core.shutdown(1_000);
    assert!(core.is_shut_down());
    assert_eq!(core.sink().fired(1), 0);
    assert_eq!(core.arbitrator().state(1), Some(RelayState::Off));
    assert_eq!(core.arbitrator().state(2), Some(RelayState::Off));
    assert_eq!(core.sink().events.last(), Some(&CoreEvent::ShutDown));
}
