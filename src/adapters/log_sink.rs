//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing structured core events to the
//! process logger (`env_logger` → stderr / journald in production).
//! A history store or dashboard feed would implement the same trait.

use log::{debug, info, warn};

use crate::app::events::CoreEvent;
use crate::app::ports::EventSink;
use crate::control::CycleOutcome;

/// Adapter that logs every [`CoreEvent`].
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::Started(c) => {
                info!(
                    "START | relays={} pids={} rules={} timers={}",
                    c.relays, c.pids, c.rules, c.timers
                );
            }
            CoreEvent::Reloaded {
                census,
                started,
                stopped,
            } => {
                info!(
                    "RELOAD | relays={} pids={} rules={} timers={} | +{} -{} tasks",
                    census.relays, census.pids, census.rules, census.timers, started, stopped
                );
            }
            CoreEvent::ConfigRejected(err) => warn!("CONFIG | skipped: {}", err),
            CoreEvent::Transition(t) => {
                info!(
                    "RELAY | {} -> {} | duration={}ms by {}",
                    t.relay, t.state, t.duration_ms, t.requester
                );
            }
            CoreEvent::Audit(a) => {
                debug!(
                    "AUDIT | t={} relay={} {} requested={}ms completed={:?} by {}",
                    a.timestamp_ms,
                    a.relay,
                    a.state,
                    a.requested_ms,
                    a.completed_on_ms,
                    a.requester
                );
            }
            CoreEvent::PidCycle { pid, outcome } => match outcome {
                CycleOutcome::Actuated {
                    side,
                    relay,
                    duration_ms,
                    output,
                } => {
                    info!(
                        "PID | {} {:?} output={:.2} -> relay {} for {}ms",
                        pid, side, output, relay, duration_ms
                    );
                }
                CycleOutcome::Stale(s) => warn!("PID | {} {}", pid, s),
                CycleOutcome::Rejected { relay, error, .. } => {
                    warn!("PID | {} relay {} refused: {}", pid, relay, error);
                }
                other => debug!("PID | {} {:?}", pid, other),
            },
            CoreEvent::RuleFired {
                rule,
                cause,
                report,
            } => {
                info!(
                    "RULE | {} fired on {} | relays ok={} refused={} | cmds={} failed={} | \
                     notify sent={} throttled={} failed={}",
                    rule,
                    cause,
                    report.relays_granted,
                    report.relays_rejected,
                    report.commands_started,
                    report.commands_failed,
                    report.notified,
                    report.notify_throttled,
                    report.notify_failed,
                );
            }
            CoreEvent::CascadeDropped { relay, depth } => {
                warn!("RULE | relay {} transition dropped at depth {}", relay, depth);
            }
            CoreEvent::TimerPhase { timer, phase } => info!("TIMER | {} {:?}", timer, phase),
            CoreEvent::ShutDown => info!("STOP | all relays off"),
        }
    }
}
