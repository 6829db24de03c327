//! Control core — the hexagonal centre.
//!
//! [`ControlCore`] owns the arbitrator, every PID loop, rule and timer,
//! and the notification throttle.  It exposes a clock-free API: every
//! operation takes `now_ms`, so the whole core can be driven from a test
//! with a manual clock.  All I/O flows through the port traits it is
//! generic over.
//!
//! ```text
//!  ReadingCache ──▶ ┌────────────────────────────┐ ──▶ EventSink
//!                   │        ControlCore         │
//!   PinDriver ◀──── │  Arbitrator · PID · Rules  │ ──▶ CommandRunner
//!                   │  Timers · Reload diff      │ ──▶ Notifier
//!                   └────────────────────────────┘
//! ```
//!
//! The runtime owns one task per PID loop, threshold rule and timer and
//! calls [`ControlCore::poll_task`] whenever a task is due.  After every
//! operation that may have touched a relay, the core drains the
//! arbitrator's transitions, feeds them to relay-transition rules
//! (cascading up to the configured depth) and forwards the audit trail to
//! the event sink.

use std::collections::{BTreeMap, VecDeque};

use core::time::Duration;

use log::{debug, info, warn};

use crate::cache::ReadingCache;
use crate::config::DaemonConfig;
use crate::control::{CycleOutcome, PidLoop};
use crate::error::{ArbitrationError, Error, Result};
use crate::relay::{Arbitrator, Granted, RelayRequest, RelayTransition, Requester};
use crate::rules::{fire, ActionContext, FiringCause, FiringReport, NotifyThrottle, RuleRunner};
use crate::safety::CurrentBudget;
use crate::scheduler::DutyTimer;
use crate::snapshot::{
    secs_to_ms, EntityKind, PidId, RelayActuator, RelayId, RuleId, Snapshot, Switch, TimerId,
    ZoneId,
};

use super::events::{Census, CoreEvent};
use super::ports::{CommandRunner, EventSink, Notifier, PinDriver};

// ───────────────────────────────────────────────────────────────
// Settings / task identifiers
// ───────────────────────────────────────────────────────────────

/// Daemon tunables the core needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreSettings {
    pub command_timeout: Duration,
    /// Readings older than zone period × this are logged as stale.
    pub stale_factor: u32,
    pub max_cascade_depth: u8,
    /// 0 = unlimited.
    pub notify_max_per_hour: u32,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self::from(&DaemonConfig::default())
    }
}

impl From<&DaemonConfig> for CoreSettings {
    fn from(cfg: &DaemonConfig) -> Self {
        Self {
            command_timeout: Duration::from_secs(cfg.command_timeout_secs),
            stale_factor: cfg.stale_factor,
            max_cascade_depth: cfg.max_cascade_depth,
            notify_max_per_hour: cfg.notify_max_per_hour,
        }
    }
}

/// A periodic unit of work owned by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    Pid(PidId),
    /// Threshold rules only; relay-transition rules are event driven.
    Rule(RuleId),
    Timer(TimerId),
}

/// What a task should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPoll {
    /// Poll again at this absolute time.
    Next(u64),
    /// Nothing scheduled; sleep until woken.
    Idle,
    /// The entity is gone; the task ends.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadScope {
    All,
    Relay(RelayId),
}

impl ReloadScope {
    /// Protocol convention: relay id 0 means everything.
    pub fn from_relay_id(relay: RelayId) -> Self {
        if relay == 0 { Self::All } else { Self::Relay(relay) }
    }
}

/// Task changes the runtime must apply after a start or reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadPlan {
    pub started: Vec<TaskId>,
    pub stopped: Vec<TaskId>,
    /// Tasks that were idle and now have work (e.g. a timer restarted).
    pub wake: Vec<TaskId>,
}

// ───────────────────────────────────────────────────────────────
// ControlCore
// ───────────────────────────────────────────────────────────────

pub struct ControlCore<P, C, N, E>
where
    P: PinDriver,
    C: CommandRunner,
    N: Notifier,
    E: EventSink,
{
    arbitrator: Arbitrator<P>,
    cache: ReadingCache,
    commands: C,
    notifier: N,
    sink: E,
    settings: CoreSettings,
    throttle: NotifyThrottle,
    snapshot: Snapshot,
    pids: BTreeMap<PidId, PidLoop>,
    rules: BTreeMap<RuleId, RuleRunner>,
    timers: BTreeMap<TimerId, DutyTimer>,
    started: bool,
    shut_down: bool,
}

impl<P, C, N, E> ControlCore<P, C, N, E>
where
    P: PinDriver,
    C: CommandRunner,
    N: Notifier,
    E: EventSink,
{
    /// Construct the core.  Nothing is driven until [`start`](Self::start).
    pub fn new(
        pins: P,
        commands: C,
        notifier: N,
        sink: E,
        cache: ReadingCache,
        settings: CoreSettings,
    ) -> Self {
        Self {
            arbitrator: Arbitrator::new(pins, CurrentBudget::unlimited()),
            cache,
            commands,
            notifier,
            sink,
            throttle: NotifyThrottle::new(settings.notify_max_per_hour),
            settings,
            snapshot: Snapshot::default(),
            pids: BTreeMap::new(),
            rules: BTreeMap::new(),
            timers: BTreeMap::new(),
            started: false,
            shut_down: false,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Apply the first snapshot: every actuator is driven off, startup-on
    /// actuators are switched on, and every entity gets a task.
    pub fn start(&mut self, snapshot: Snapshot, now_ms: u64) -> ReloadPlan {
        if self.started {
            return self.reload(snapshot, ReloadScope::All, now_ms);
        }
        let snapshot = self.sanitize(snapshot);
        self.arbitrator.set_budget(snapshot.budget);
        for relay in &snapshot.relays {
            self.arbitrator.add_actuator(relay.clone(), now_ms);
        }
        self.arbitrator.initialize(now_ms);

        let mut plan = ReloadPlan::default();
        self.snapshot = snapshot;
        self.build_entities(&mut plan);
        self.started = true;
        self.dispatch(now_ms);

        let census = self.census();
        info!(
            "ControlCore started: {} relays, {} PID, {} rules, {} timers",
            census.relays, census.pids, census.rules, census.timers
        );
        self.sink.emit(&CoreEvent::Started(census));
        plan
    }

    /// Converge running state on `snapshot`.
    ///
    /// Unchanged entities keep their task and controller memory.  Flag-only
    /// changes (enabled / running) are applied in place.  Anything else
    /// changed or removed is torn down, with a final off for the relays it
    /// owns, before its replacement starts.
    pub fn reload(&mut self, snapshot: Snapshot, scope: ReloadScope, now_ms: u64) -> ReloadPlan {
        if !self.started {
            return self.start(snapshot, now_ms);
        }
        let snapshot = self.sanitize(snapshot);
        let mut plan = ReloadPlan::default();

        match scope {
            ReloadScope::Relay(id) => self.reload_relay(id, &snapshot, now_ms),
            ReloadScope::All => {
                self.arbitrator.set_budget(snapshot.budget);
                self.diff_pids(&snapshot, &mut plan, now_ms);
                self.diff_rules(&snapshot, &mut plan);
                self.diff_timers(&snapshot, &mut plan, now_ms);
                self.diff_relays(&snapshot, now_ms);
                self.forget_removed_zones(&snapshot);
                self.snapshot = snapshot;
                self.build_entities(&mut plan);
            }
        }
        self.dispatch(now_ms);

        let census = self.census();
        info!(
            "ControlCore reloaded ({:?}): {} tasks started, {} stopped",
            scope,
            plan.started.len(),
            plan.stopped.len()
        );
        self.sink.emit(&CoreEvent::Reloaded {
            census,
            started: plan.started.len(),
            stopped: plan.stopped.len(),
        });
        plan
    }

    /// Switch every relay off.  Rules no longer react afterwards.
    pub fn shutdown(&mut self, now_ms: u64) {
        if self.shut_down {
            return;
        }
        info!("ControlCore shutting down, switching all relays off");
        self.shut_down = true;
        self.arbitrator.all_off(Requester::Lifecycle, now_ms);
        self.dispatch(now_ms);
        self.sink.emit(&CoreEvent::ShutDown);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn sanitize(&mut self, snapshot: Snapshot) -> Snapshot {
        let (clean, rejected) = snapshot.sanitize();
        for err in rejected {
            self.sink.emit(&CoreEvent::ConfigRejected(err));
        }
        clean
    }

    /// Create loops for every snapshot entity not already running.
    fn build_entities(&mut self, plan: &mut ReloadPlan) {
        for cfg in &self.snapshot.pids {
            if self.pids.contains_key(&cfg.id) {
                continue;
            }
            let zone_period = self.snapshot.zone(cfg.zone).map(|z| secs_to_ms(z.period_secs));
            self.pids.insert(
                cfg.id,
                PidLoop::new(cfg.clone(), zone_period, self.settings.stale_factor),
            );
            plan.started.push(TaskId::Pid(cfg.id));
        }
        for cfg in &self.snapshot.rules {
            if self.rules.contains_key(&cfg.id) {
                continue;
            }
            let rule = RuleRunner::new(cfg.clone());
            if rule.period_ms().is_some() {
                plan.started.push(TaskId::Rule(cfg.id));
            }
            self.rules.insert(cfg.id, rule);
        }
        for cfg in &self.snapshot.timers {
            if self.timers.contains_key(&cfg.id) {
                continue;
            }
            self.timers.insert(cfg.id, DutyTimer::new(cfg.clone()));
            plan.started.push(TaskId::Timer(cfg.id));
        }
    }

    fn diff_pids(&mut self, next: &Snapshot, plan: &mut ReloadPlan, now_ms: u64) {
        let ids: Vec<PidId> = self.pids.keys().copied().collect();
        for id in ids {
            let Some(running) = self.pids.get_mut(&id) else {
                continue;
            };
            match next.pids.iter().find(|p| p.id == id) {
                Some(cfg) if running.config().same_tunables(cfg) => {
                    if running.config().enabled != cfg.enabled {
                        running.set_enabled(cfg.enabled, &self.cache);
                    }
                }
                _ => {
                    debug!("ControlCore: tearing down PID {}", id);
                    running.release(&mut self.arbitrator, now_ms);
                    self.pids.remove(&id);
                    plan.stopped.push(TaskId::Pid(id));
                }
            }
        }
    }

    fn diff_rules(&mut self, next: &Snapshot, plan: &mut ReloadPlan) {
        let ids: Vec<RuleId> = self.rules.keys().copied().collect();
        for id in ids {
            let Some(running) = self.rules.get_mut(&id) else {
                continue;
            };
            match next.rules.iter().find(|r| r.id == id) {
                Some(cfg) if running.config().same_definition(cfg) => {
                    running.set_enabled(cfg.enabled);
                }
                _ => {
                    if running.period_ms().is_some() {
                        plan.stopped.push(TaskId::Rule(id));
                    }
                    self.rules.remove(&id);
                }
            }
        }
    }

    fn diff_timers(&mut self, next: &Snapshot, plan: &mut ReloadPlan, now_ms: u64) {
        let ids: Vec<TimerId> = self.timers.keys().copied().collect();
        for id in ids {
            let Some(running) = self.timers.get_mut(&id) else {
                continue;
            };
            match next.timers.iter().find(|t| t.id == id) {
                Some(cfg) if running.config().same_cycle(cfg) => {
                    match (running.config().running, cfg.running) {
                        (true, false) => running.stop(&mut self.arbitrator, now_ms),
                        (false, true) => {
                            running.start();
                            plan.wake.push(TaskId::Timer(id));
                        }
                        _ => {}
                    }
                }
                _ => {
                    running.stop(&mut self.arbitrator, now_ms);
                    self.timers.remove(&id);
                    plan.stopped.push(TaskId::Timer(id));
                }
            }
        }
    }

    fn diff_relays(&mut self, next: &Snapshot, now_ms: u64) {
        for old in &self.snapshot.relays {
            if next.relay(old.id).is_none() {
                self.arbitrator.remove_actuator(old.id, now_ms);
            }
        }
        for relay in &next.relays {
            match self.snapshot.relay(relay.id) {
                Some(old) if old == relay => {}
                Some(_) => self.arbitrator.replace_actuator(relay.clone(), now_ms),
                None => self.add_relay(relay.clone(), now_ms),
            }
        }
    }

    fn add_relay(&mut self, relay: RelayActuator, now_ms: u64) {
        let id = relay.id;
        let startup_on = relay.startup.is_on();
        self.arbitrator.add_actuator(relay, now_ms);
        if startup_on {
            let req = RelayRequest::on(id, 0, Requester::Lifecycle);
            if let Err(e) = self.arbitrator.request(req, now_ms) {
                warn!("ControlCore: startup-on relay {} refused: {}", id, e);
            }
        }
    }

    fn reload_relay(&mut self, id: RelayId, next: &Snapshot, now_ms: u64) {
        match next.relay(id) {
            Some(relay) => {
                if self.arbitrator.state(id).is_some() {
                    self.arbitrator.replace_actuator(relay.clone(), now_ms);
                } else {
                    self.add_relay(relay.clone(), now_ms);
                }
                match self.snapshot.relays.iter_mut().find(|r| r.id == id) {
                    Some(slot) => *slot = relay.clone(),
                    None => self.snapshot.relays.push(relay.clone()),
                }
            }
            None => {
                self.arbitrator.remove_actuator(id, now_ms);
                self.snapshot.relays.retain(|r| r.id != id);
            }
        }
    }

    fn forget_removed_zones(&mut self, next: &Snapshot) {
        for zone in &self.snapshot.zones {
            if next.zone(zone.id).is_none() {
                self.cache.forget_zone(zone.id);
            }
        }
    }

    // ── Task polling ──────────────────────────────────────────

    /// Run one period of a task.
    pub fn poll_task(&mut self, task: TaskId, now_ms: u64) -> TaskPoll {
        if self.shut_down {
            return TaskPoll::Finished;
        }
        let poll = match task {
            TaskId::Pid(id) => {
                let Some(pid) = self.pids.get_mut(&id) else {
                    return TaskPoll::Finished;
                };
                let outcome = if self.snapshot.zone_active(pid.config().zone) {
                    pid.run_cycle(&self.cache, &mut self.arbitrator, now_ms)
                } else {
                    CycleOutcome::ZoneInactive
                };
                let next = now_ms + pid.period_ms();
                self.sink.emit(&CoreEvent::PidCycle { pid: id, outcome });
                TaskPoll::Next(next)
            }
            TaskId::Rule(id) => {
                let Some(rule) = self.rules.get(&id) else {
                    return TaskPoll::Finished;
                };
                let Some(period) = rule.period_ms() else {
                    return TaskPoll::Finished;
                };
                let cause = match rule.threshold_zone() {
                    Some(zone) if !self.snapshot.zone_active(zone) => None,
                    _ => rule.evaluate_threshold(&self.cache),
                };
                if let Some(cause) = cause {
                    self.fire_rule(id, &cause, now_ms);
                }
                TaskPoll::Next(now_ms + period)
            }
            TaskId::Timer(id) => {
                let Some(timer) = self.timers.get_mut(&id) else {
                    return TaskPoll::Finished;
                };
                let before = timer.phase();
                let next = timer.poll(&mut self.arbitrator, now_ms);
                let after = timer.phase();
                if after != before {
                    self.sink.emit(&CoreEvent::TimerPhase {
                        timer: id,
                        phase: after,
                    });
                }
                next.map_or(TaskPoll::Idle, TaskPoll::Next)
            }
        };
        self.dispatch(now_ms);
        poll
    }

    /// Service expired auto-off deadlines.  Returns the next pending one.
    pub fn poll_deadlines(&mut self, now_ms: u64) -> Option<u64> {
        if self.arbitrator.service_deadlines(now_ms) > 0 {
            self.dispatch(now_ms);
        }
        self.arbitrator.next_deadline()
    }

    /// Every task that should currently exist.
    pub fn tasks(&self) -> Vec<TaskId> {
        let pids = self.pids.keys().map(|id| TaskId::Pid(*id));
        let rules = self
            .rules
            .values()
            .filter(|r| r.period_ms().is_some())
            .map(|r| TaskId::Rule(r.id()));
        let timers = self.timers.keys().map(|id| TaskId::Timer(*id));
        pids.chain(rules).chain(timers).collect()
    }

    // ── Commands ──────────────────────────────────────────────

    /// Manual relay request.  `duration_secs == 0` = indefinite.
    pub fn request_relay(
        &mut self,
        relay: RelayId,
        state: Switch,
        duration_secs: f32,
        now_ms: u64,
    ) -> Result<Granted> {
        let req = match state {
            Switch::On => RelayRequest::on(relay, secs_to_ms(duration_secs), Requester::Manual),
            Switch::Off => RelayRequest::off(relay, Requester::Manual),
        };
        let granted = self.arbitrator.request(req, now_ms);
        self.dispatch(now_ms);
        Ok(granted?)
    }

    pub fn set_pid_enabled(&mut self, id: PidId, enabled: bool) -> Result<()> {
        let pid = self.pids.get_mut(&id).ok_or(Error::UnknownEntity {
            kind: EntityKind::Pid,
            id,
        })?;
        pid.set_enabled(enabled, &self.cache);
        Ok(())
    }

    pub fn set_rule_enabled(&mut self, id: RuleId, enabled: bool) -> Result<()> {
        let rule = self.rules.get_mut(&id).ok_or(Error::UnknownEntity {
            kind: EntityKind::Rule,
            id,
        })?;
        rule.set_enabled(enabled);
        info!("Rule {}: {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Start or stop a timer.  Starting returns the task to wake.
    pub fn set_timer_running(
        &mut self,
        id: TimerId,
        running: bool,
        now_ms: u64,
    ) -> Result<Option<TaskId>> {
        let timer = self.timers.get_mut(&id).ok_or(Error::UnknownEntity {
            kind: EntityKind::Timer,
            id,
        })?;
        let wake = if running {
            timer.start();
            Some(TaskId::Timer(id))
        } else {
            timer.stop(&mut self.arbitrator, now_ms);
            None
        };
        let phase = timer.phase();
        self.sink.emit(&CoreEvent::TimerPhase { timer: id, phase });
        self.dispatch(now_ms);
        Ok(wake)
    }

    /// Pulse a zone's pre-measurement relay.  Returns how long the caller
    /// should wait before sampling (0 when the zone has none).
    pub fn pre_measurement(&mut self, zone: ZoneId, now_ms: u64) -> Result<u64> {
        let cfg = self.snapshot.zone(zone).ok_or(Error::UnknownEntity {
            kind: EntityKind::Zone,
            id: zone,
        })?;
        let duration_ms = secs_to_ms(cfg.pre_duration_secs);
        let Some(relay) = cfg.pre_relay.filter(|_| duration_ms > 0) else {
            return Ok(0);
        };
        let req = RelayRequest::on(relay, duration_ms, Requester::Lifecycle);
        let result = self.arbitrator.request(req, now_ms);
        self.dispatch(now_ms);
        match result {
            Ok(_) => Ok(duration_ms),
            Err(ArbitrationError::AlreadyInState(_)) => Ok(duration_ms),
            Err(e) => Err(e.into()),
        }
    }

    // ── Transition dispatch ───────────────────────────────────

    fn fire_rule(&mut self, id: RuleId, cause: &FiringCause, now_ms: u64) -> Option<FiringReport> {
        let rule = self.rules.get_mut(&id)?;
        let mut ctx = ActionContext {
            arbitrator: &mut self.arbitrator,
            commands: &mut self.commands,
            notifier: &mut self.notifier,
            throttle: &mut self.throttle,
            command_timeout: self.settings.command_timeout,
            now_ms,
        };
        let report = fire(rule, cause, &mut ctx);
        self.sink.emit(&CoreEvent::RuleFired {
            rule: id,
            cause: *cause,
            report,
        });
        Some(report)
    }

    /// Drain transitions, feed relay-transition rules, forward audit records.
    fn dispatch(&mut self, now_ms: u64) {
        let mut queue: VecDeque<(RelayTransition, u8)> = self
            .arbitrator
            .drain_transitions()
            .into_iter()
            .map(|t| (t, 0))
            .collect();
        self.flush_audit();

        while let Some((transition, depth)) = queue.pop_front() {
            self.sink.emit(&CoreEvent::Transition(transition));
            if self.shut_down {
                continue;
            }
            let matching: Vec<RuleId> = self
                .rules
                .values()
                .filter(|r| r.matches_transition(&transition))
                .map(RuleRunner::id)
                .collect();
            if matching.is_empty() {
                continue;
            }
            if depth >= self.settings.max_cascade_depth {
                warn!(
                    "ControlCore: relay {} transition dropped at cascade depth {}",
                    transition.relay, depth
                );
                self.sink.emit(&CoreEvent::CascadeDropped {
                    relay: transition.relay,
                    depth,
                });
                continue;
            }
            for id in matching {
                self.fire_rule(id, &FiringCause::Transition(transition), now_ms);
                queue.extend(
                    self.arbitrator
                        .drain_transitions()
                        .into_iter()
                        .map(|t| (t, depth + 1)),
                );
                self.flush_audit();
            }
        }
    }

    fn flush_audit(&mut self) {
        for record in self.arbitrator.drain_audit() {
            self.sink.emit(&CoreEvent::Audit(record));
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn census(&self) -> Census {
        Census {
            relays: self.arbitrator.table().len(),
            pids: self.pids.len(),
            rules: self.rules.len(),
            timers: self.timers.len(),
        }
    }

    pub fn arbitrator(&self) -> &Arbitrator<P> {
        &self.arbitrator
    }

    /// Direct access to the pin driver (diagnostics, tests).
    pub fn pins_mut(&mut self) -> &mut P {
        self.arbitrator.pins_mut()
    }

    pub fn cache(&self) -> &ReadingCache {
        &self.cache
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    pub fn pid(&self, id: PidId) -> Option<&PidLoop> {
        self.pids.get(&id)
    }

    pub fn rule(&self, id: RuleId) -> Option<&RuleRunner> {
        self.rules.get(&id)
    }

    pub fn timer(&self, id: TimerId) -> Option<&DutyTimer> {
        self.timers.get(&id)
    }

    pub fn sink(&self) -> &E {
        &self.sink
    }

    pub fn commands(&self) -> &C {
        &self.commands
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }
}
