//! Task runtime: one thread, one executor, one task per entity.
//!
//! Uses `edge-executor` for cooperative multi-task scheduling and
//! `async-io-mini` for reactor-driven timers (no busy-spinning).
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │  Control thread                                            │
//!  │  ┌──────────────────────────────────────────────────────┐  │
//!  │  │  futures_lite::block_on                              │  │
//!  │  │  ┌──────────────────────────────────────────────────┐│  │
//!  │  │  │  edge_executor::LocalExecutor                    ││  │
//!  │  │  │                                                  ││  │
//!  │  │  │  ┌──────────┐ ┌──────────┐ ┌───────┐ ┌────────┐  ││  │
//!  │  │  │  │ PID × n  │ │ Rule × n │ │ Timer │ │Deadline│  ││  │
//!  │  │  │  │ period ⏱ │ │ period ⏱ │ │ phase │ │ 100ms ⏱│  ││  │
//!  │  │  │  └──────────┘ └──────────┘ └───────┘ └────────┘  ││  │
//!  │  │  │         command loop (CMD channel, wake-on-send) ││  │
//!  │  │  └──────────────────────────────────────────────────┘│  │
//!  │  └──────────────────────────────────────────────────────┘  │
//!  │          Rc<RefCell<ControlCore>>  (never held across .await)│
//!  └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Other threads (control socket, acquisition) talk to the runtime through
//! a [`ControlHandle`]; readings bypass it and go straight to the
//! [`ReadingCache`](crate::cache::ReadingCache).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use core::time::Duration;

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, NoopRawMutex};
use embassy_sync::channel::{Channel, TrySendError};
use embassy_sync::signal::Signal;
use log::{debug, error, info, warn};

use crate::app::commands::ControlCommand;
use crate::app::ports::{Clock, CommandRunner, ConfigPort, EventSink, Notifier, PinDriver};
use crate::app::service::{ControlCore, ReloadPlan, ReloadScope, TaskId, TaskPoll};
use crate::error::Error;
use crate::snapshot::Snapshot;

/// Queued commands before `try_send` starts failing.
pub const COMMAND_DEPTH: usize = 16;

/// Upper bound on tasks the executor schedules at once.
const EXECUTOR_SLOTS: usize = 64;

pub type CommandChannel = Channel<CriticalSectionRawMutex, ControlCommand, COMMAND_DEPTH>;

pub type SharedCore<P, C, N, E> = Rc<RefCell<ControlCore<P, C, N, E>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskSignal {
    /// Poll now (the entity has new work).
    Wake,
    /// Exit without polling again.
    Stop,
}

type TaskSignalRef = Rc<Signal<NoopRawMutex, TaskSignal>>;

// ── Handle ───────────────────────────────────────────────────

/// Cloneable, `Send` sender for [`ControlCommand`]s.
#[derive(Clone)]
pub struct ControlHandle {
    channel: Arc<CommandChannel>,
}

impl ControlHandle {
    /// A handle on a fresh channel that no runtime drains.
    pub fn detached() -> Self {
        Self {
            channel: Arc::new(Channel::new()),
        }
    }

    /// Commands queued and not yet received.
    pub fn pending(&self) -> usize {
        self.channel.len()
    }

    /// Queue a command.  Returns it back when the queue is full.
    pub fn send(&self, cmd: ControlCommand) -> Result<(), ControlCommand> {
        self.channel.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(cmd) => cmd,
        })
    }
}

// ── Runtime ──────────────────────────────────────────────────

pub struct Runtime<P, C, N, E, K, S>
where
    P: PinDriver + 'static,
    C: CommandRunner + 'static,
    N: Notifier + 'static,
    E: EventSink + 'static,
    K: Clock + 'static,
    S: ConfigPort + 'static,
{
    core: SharedCore<P, C, N, E>,
    clock: Rc<K>,
    store: S,
    channel: Arc<CommandChannel>,
    deadline_resolution: Duration,
}

impl<P, C, N, E, K, S> Runtime<P, C, N, E, K, S>
where
    P: PinDriver + 'static,
    C: CommandRunner + 'static,
    N: Notifier + 'static,
    E: EventSink + 'static,
    K: Clock + 'static,
    S: ConfigPort + 'static,
{
    pub fn new(
        core: ControlCore<P, C, N, E>,
        clock: K,
        store: S,
        deadline_resolution: Duration,
    ) -> Self {
        Self {
            core: Rc::new(RefCell::new(core)),
            clock: Rc::new(clock),
            store,
            channel: Arc::new(Channel::new()),
            deadline_resolution: deadline_resolution.max(Duration::from_millis(1)),
        }
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            channel: self.channel.clone(),
        }
    }

    /// Shared access to the core, for inspection after `run` returns.
    pub fn core(&self) -> SharedCore<P, C, N, E> {
        self.core.clone()
    }

    /// Start the core on `snapshot` and drive every task until a
    /// [`ControlCommand::Shutdown`] arrives.
    pub fn run(self, snapshot: Snapshot) {
        let executor: Rc<edge_executor::LocalExecutor<'static, EXECUTOR_SLOTS>> =
            Rc::new(edge_executor::LocalExecutor::new());

        let plan = self
            .core
            .borrow_mut()
            .start(snapshot, self.clock.now_ms());

        executor
            .spawn(deadline_loop(
                self.core.clone(),
                self.clock.clone(),
                self.deadline_resolution,
            ))
            .detach();

        info!(
            "Runtime started ({} tasks, deadline resolution {} ms)",
            plan.started.len(),
            self.deadline_resolution.as_millis()
        );

        let mut supervisor = Supervisor {
            core: self.core,
            clock: self.clock,
            store: self.store,
            channel: self.channel,
            executor: executor.clone(),
            tasks: HashMap::new(),
        };
        supervisor.apply_plan(plan);

        futures_lite::future::block_on(executor.run(supervisor.command_loop()));

        info!("Runtime stopped");
    }
}

// ── Supervisor ───────────────────────────────────────────────

/// Owns the task table and serves the command channel.
struct Supervisor<P, C, N, E, K, S>
where
    P: PinDriver + 'static,
    C: CommandRunner + 'static,
    N: Notifier + 'static,
    E: EventSink + 'static,
    K: Clock + 'static,
    S: ConfigPort + 'static,
{
    core: SharedCore<P, C, N, E>,
    clock: Rc<K>,
    store: S,
    channel: Arc<CommandChannel>,
    executor: Rc<edge_executor::LocalExecutor<'static, EXECUTOR_SLOTS>>,
    tasks: HashMap<TaskId, TaskSignalRef>,
}

impl<P, C, N, E, K, S> Supervisor<P, C, N, E, K, S>
where
    P: PinDriver + 'static,
    C: CommandRunner + 'static,
    N: Notifier + 'static,
    E: EventSink + 'static,
    K: Clock + 'static,
    S: ConfigPort + 'static,
{
    async fn command_loop(mut self) {
        loop {
            let cmd = self.channel.receive().await;
            let now = self.clock.now_ms();
            debug!("Runtime: {:?}", cmd);
            match cmd {
                ControlCommand::Reload { relay } => match self.store.load() {
                    Ok(snapshot) => {
                        let plan = self.core.borrow_mut().reload(
                            snapshot,
                            ReloadScope::from_relay_id(relay),
                            now,
                        );
                        self.apply_plan(plan);
                    }
                    Err(e) => error!("Runtime: reload failed, keeping current state: {}", e),
                },
                ControlCommand::SetRelay {
                    relay,
                    state,
                    duration_secs,
                } => {
                    let result =
                        self.core
                            .borrow_mut()
                            .request_relay(relay, state, duration_secs, now);
                    match result {
                        Ok(granted) => debug!("Runtime: relay {} {:?}", relay, granted),
                        Err(Error::Arbitration(e)) if e.is_noop() => {
                            debug!("Runtime: relay {} already {}", relay, state);
                        }
                        Err(e) => warn!("Runtime: manual request refused: {}", e),
                    }
                }
                ControlCommand::SetPidEnabled { pid, enabled } => {
                    if let Err(e) = self.core.borrow_mut().set_pid_enabled(pid, enabled) {
                        warn!("Runtime: {}", e);
                    }
                }
                ControlCommand::SetRuleEnabled { rule, enabled } => {
                    if let Err(e) = self.core.borrow_mut().set_rule_enabled(rule, enabled) {
                        warn!("Runtime: {}", e);
                    }
                }
                ControlCommand::SetTimerRunning { timer, running } => {
                    let result = self
                        .core
                        .borrow_mut()
                        .set_timer_running(timer, running, now);
                    match result {
                        Ok(Some(task)) => self.wake(task),
                        Ok(None) => {}
                        Err(e) => warn!("Runtime: {}", e),
                    }
                }
                ControlCommand::PreMeasure { zone } => {
                    let result = self.core.borrow_mut().pre_measurement(zone, now);
                    match result {
                        Ok(ms) => debug!("Runtime: zone {} pre-measurement {} ms", zone, ms),
                        Err(e) => warn!("Runtime: pre-measurement refused: {}", e),
                    }
                }
                ControlCommand::Shutdown => {
                    self.core.borrow_mut().shutdown(now);
                    for (_, signal) in self.tasks.drain() {
                        signal.signal(TaskSignal::Stop);
                    }
                    return;
                }
            }
        }
    }

    fn apply_plan(&mut self, plan: ReloadPlan) {
        for id in plan.stopped {
            if let Some(signal) = self.tasks.remove(&id) {
                debug!("Runtime: stopping {:?}", id);
                signal.signal(TaskSignal::Stop);
            }
        }
        for id in plan.started {
            if let Some(old) = self.tasks.remove(&id) {
                old.signal(TaskSignal::Stop);
            }
            let signal: TaskSignalRef = Rc::new(Signal::new());
            self.executor
                .spawn(entity_loop(
                    self.core.clone(),
                    self.clock.clone(),
                    id,
                    signal.clone(),
                ))
                .detach();
            self.tasks.insert(id, signal);
        }
        for id in plan.wake {
            self.wake(id);
        }
    }

    fn wake(&self, id: TaskId) {
        if let Some(signal) = self.tasks.get(&id) {
            signal.signal(TaskSignal::Wake);
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────

/// Poll one entity at the times the core asks for, until stopped or the
/// entity disappears.
async fn entity_loop<P, C, N, E, K>(
    core: SharedCore<P, C, N, E>,
    clock: Rc<K>,
    id: TaskId,
    signal: TaskSignalRef,
) where
    P: PinDriver,
    C: CommandRunner,
    N: Notifier,
    E: EventSink,
    K: Clock,
{
    let mut next = Some(clock.now_ms());
    loop {
        let woke = match next {
            Some(at) => {
                let wait = Duration::from_millis(at.saturating_sub(clock.now_ms()));
                futures_lite::future::or(
                    async {
                        async_io_mini::Timer::after(wait).await;
                        None
                    },
                    async { Some(signal.wait().await) },
                )
                .await
            }
            None => Some(signal.wait().await),
        };
        if woke == Some(TaskSignal::Stop) || signal.try_take() == Some(TaskSignal::Stop) {
            debug!("Runtime: {:?} stopped", id);
            return;
        }

        let poll = core.borrow_mut().poll_task(id, clock.now_ms());
        match poll {
            TaskPoll::Next(at) => next = Some(at),
            TaskPoll::Idle => next = None,
            TaskPoll::Finished => {
                debug!("Runtime: {:?} finished", id);
                return;
            }
        }
    }
}

/// Service auto-off deadlines at a fixed resolution.
async fn deadline_loop<P, C, N, E, K>(
    core: SharedCore<P, C, N, E>,
    clock: Rc<K>,
    resolution: Duration,
) where
    P: PinDriver,
    C: CommandRunner,
    N: Notifier,
    E: EventSink,
    K: Clock,
{
    loop {
        async_io_mini::Timer::after(resolution).await;
        let mut guard = core.borrow_mut();
        if guard.is_shut_down() {
            return;
        }
        guard.poll_deadlines(clock.now_ms());
    }
}
