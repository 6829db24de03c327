//! The async runtime on a real clock: tasks, deadline service, commands
//! from another thread, reload and shutdown.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use growctl::adapters::control_socket::ControlServer;
use growctl::adapters::time::MonotonicClock;
use growctl::app::commands::ControlCommand;
use growctl::app::events::CoreEvent;
use growctl::app::service::CoreSettings;
use growctl::control::CycleOutcome;
use growctl::relay::{RelayState, Requester};
use growctl::runtime::Runtime;
use growctl::snapshot::{Direction, Snapshot, Switch, Variable};

use crate::mock_hw::*;

type TestRuntime = Runtime<MockPins, MockCommands, MockNotifier, RecordingSink, MonotonicClock, MockStore>;

fn runtime(store: MockStore) -> (TestRuntime, growctl::cache::ReadingCache) {
    let (core, cache) = core_with(CoreSettings::default());
    let rt = Runtime::new(core, MonotonicClock::new(), store, Duration::from_millis(10));
    (rt, cache)
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn manual_pulse_is_ended_by_deadline_service() {
    let snap = base_snapshot();
    let (rt, _) = runtime(MockStore::new(snap.clone()));
    let handle = rt.handle();
    let core = rt.core();

    let script = thread::spawn(move || {
        handle
            .send(ControlCommand::SetRelay {
                relay: 1,
                state: Switch::On,
                duration_secs: 0.1,
            })
            .unwrap();
        thread::sleep(ms(500));
        handle.send(ControlCommand::Shutdown).unwrap();
    });
    rt.run(snap);
    script.join().unwrap();

    let core = core.borrow();
    let t = core.sink().transitions_of(1);
    assert_eq!(t[0].state, Switch::On);
    assert_eq!(t[0].requester, Requester::Manual);
    assert_eq!(t[1].state, Switch::Off);
    assert_eq!(t[1].requester, Requester::Deadline);
    assert!(t[1].duration_ms >= 100);
    assert!(core.is_shut_down());
}

#[test]
fn pid_task_runs_every_period() {
    let mut snap = base_snapshot();
    let mut ctl = pid(1, 1, 25.0, Direction::Up);
    ctl.period_secs = 0.05;
    ctl.up = Some(bounds(1, 0.0, 1.0));
    snap.pids.push(ctl);

    let (rt, cache) = runtime(MockStore::new(snap.clone()));
    cache.push(1, Variable::Temperature, 20.0, 0);
    let handle = rt.handle();
    let core = rt.core();

    let script = thread::spawn(move || {
        thread::sleep(ms(400));
        handle.send(ControlCommand::Shutdown).unwrap();
    });
    rt.run(snap);
    script.join().unwrap();

    let core = core.borrow();
    let actuated = core.sink().count(|e| {
        matches!(
            e,
            CoreEvent::PidCycle {
                pid: 1,
                outcome: CycleOutcome::Actuated { .. }
            }
        )
    });
    assert!(actuated >= 3, "only {} cycles actuated", actuated);
    assert_eq!(core.arbitrator().state(1), Some(RelayState::Off));
}

#[test]
fn reload_converges_running_tasks() {
    let mut snap = base_snapshot();
    snap.timers.push(timer(1, 2, 60, 60));
    let store = MockStore::new(snap.clone());
    let (rt, _) = runtime(store.clone());
    let handle = rt.handle();
    let core = rt.core();

    let script = thread::spawn(move || {
        thread::sleep(ms(100));
        let mut next: Snapshot = store.snapshot.lock().unwrap().clone();
        next.timers.clear();
        store.replace(next);
        handle.send(ControlCommand::Reload { relay: 0 }).unwrap();
        thread::sleep(ms(100));
        handle.send(ControlCommand::Shutdown).unwrap();
    });
    rt.run(snap);
    script.join().unwrap();

    let core = core.borrow();
    assert_eq!(core.census().timers, 0);
    let relay2 = core.sink().transitions_of(2);
    assert_eq!(relay2[0].requester, Requester::Timer(1));
    assert_eq!(relay2[1].state, Switch::Off);
    assert!(core
        .sink()
        .events
        .iter()
        .any(|e| matches!(e, CoreEvent::Reloaded { stopped: 1, .. })));
}

#[test]
fn shutdown_switches_everything_off() {
    let mut snap = base_snapshot();
    snap.relays[0].startup = Switch::On;
    snap.timers.push(timer(1, 2, 30, 0));
    let (rt, _) = runtime(MockStore::new(snap.clone()));
    let handle = rt.handle();
    let core = rt.core();

    let script = thread::spawn(move || {
        thread::sleep(ms(100));
        handle.send(ControlCommand::Shutdown).unwrap();
    });
    rt.run(snap);
    script.join().unwrap();

    let core = core.borrow();
    for id in 1..=4 {
        assert_eq!(core.arbitrator().state(id), Some(RelayState::Off), "relay {}", id);
    }
    assert_eq!(core.sink().events.last(), Some(&CoreEvent::ShutDown));
}

#[test]
fn control_socket_drives_runtime() {
    let mut snap = base_snapshot();
    snap.rules.push(threshold_rule(
        1,
        1,
        growctl::snapshot::Comparison::Above,
        30.0,
        vec![relay_action(3, Switch::On, 0.0)],
    ));
    if let growctl::snapshot::Trigger::Threshold { period_secs, .. } = &mut snap.rules[0].trigger {
        *period_secs = 0.05;
    }

    let clock = MonotonicClock::new();
    let (core, cache) = core_with(CoreSettings::default());
    let rt = Runtime::new(core, clock, MockStore::new(snap.clone()), ms(10));
    let path = std::env::temp_dir().join(format!("growctl-rt-{}.sock", std::process::id()));
    ControlServer::bind(&path, cache, rt.handle(), clock)
        .unwrap()
        .spawn()
        .unwrap();
    let core = rt.core();

    let client_path = path.clone();
    let script = thread::spawn(move || {
        let mut stream = UnixStream::connect(&client_path).unwrap();
        let mut replies = BufReader::new(stream.try_clone().unwrap()).lines();
        for line in ["reading 1 temperature 35", "on 4", "bogus"] {
            writeln!(stream, "{}", line).unwrap();
        }
        let got: Vec<String> = (0..3).map(|_| replies.next().unwrap().unwrap()).collect();
        thread::sleep(ms(300));
        writeln!(stream, "shutdown").unwrap();
        let _ = replies.next();
        got
    });
    rt.run(snap);
    let replies = script.join().unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(replies, vec!["ok", "ok", "err unknown command"]);
    let core = core.borrow();
    assert!(core.sink().fired(1) >= 1);
    assert!(core
        .sink()
        .transitions_of(4)
        .iter()
        .any(|t| t.state == Switch::On && t.requester == Requester::Manual));
    assert!(core
        .sink()
        .transitions_of(3)
        .iter()
        .any(|t| t.state == Switch::On && t.requester == Requester::Rule(1)));
}
