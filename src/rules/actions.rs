//! Rule actions and the notification throttle.
//!
//! Actions run in declared order and never short-circuit: a rejected relay
//! request or a failed command is logged and the next action still runs.
//!
//! Command strings may reference the firing cause:
//!
//! | Placeholder  | Value                                         |
//! |--------------|-----------------------------------------------|
//! | `{rule}`     | rule id                                       |
//! | `{relay}`    | relay id of the transition (empty otherwise)  |
//! | `{state}`    | `on` / `off` of the transition                |
//! | `{duration}` | transition duration in seconds                |
//! | `{value}`    | reading that tripped a threshold              |
//!
//! Notifications are limited twice: per rule by `notify_wait_secs`, and
//! globally by an hourly token bucket shared by every rule.

use core::cell::Cell;
use core::fmt::Write as _;
use core::time::Duration;
use std::rc::Rc;

use burster::Limiter;
use log::{debug, info, warn};

use super::{FiringCause, RuleRunner};
use crate::app::ports::{CommandRunner, Notifier, PinDriver};
use crate::relay::{Arbitrator, RelayRequest, Requester};
use crate::snapshot::{secs_to_ms, Action, Switch};

const HOUR_MS: u64 = 3_600_000;
/// Real milliseconds per bucket-clock millisecond.
const BUCKET_TIME_SCALE: u32 = 3_600;

// ═══════════════════════════════════════════════════════════════
//  Notification throttle
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttled {
    /// The rule notified less than `notify_wait_secs` ago.
    RuleWait { remaining_ms: u64 },
    /// The global hourly allowance is used up.
    HourlyCap { remaining_ms: u64 },
}

/// Time fed to the token bucket: one bucket second per real hour, so a
/// refill rate of `max_per_hour` tokens per second is the hourly cap.
type BucketClock = Box<dyn Fn() -> Duration>;

/// Global hourly notification allowance.
///
/// The cap is a token bucket holding `max_per_hour` tokens that refills
/// continuously, so no hour-long span ever carries more than the cap plus
/// what refilled inside it.
pub struct NotifyThrottle {
    /// 0 = unlimited.
    max_per_hour: u32,
    /// Latest `now_ms` seen by `acquire`, read by the bucket's time provider.
    now_ms: Rc<Cell<u64>>,
    bucket: Option<burster::TokenBucket<BucketClock>>,
}

impl NotifyThrottle {
    pub fn new(max_per_hour: u32) -> Self {
        let now_ms = Rc::new(Cell::new(0));
        let bucket = Self::bucket(max_per_hour, &now_ms);
        Self {
            max_per_hour,
            now_ms,
            bucket,
        }
    }

    fn bucket(
        max_per_hour: u32,
        now_ms: &Rc<Cell<u64>>,
    ) -> Option<burster::TokenBucket<BucketClock>> {
        if max_per_hour == 0 {
            return None;
        }
        let clock = Rc::clone(now_ms);
        let provider: BucketClock =
            Box::new(move || Duration::from_millis(clock.get()) / BUCKET_TIME_SCALE);
        Some(burster::TokenBucket::new_with_time_provider(
            u64::from(max_per_hour),
            u64::from(max_per_hour),
            provider,
        ))
    }

    /// Change the cap.  The bucket restarts full.
    pub fn set_max_per_hour(&mut self, max_per_hour: u32) {
        if max_per_hour != self.max_per_hour {
            self.max_per_hour = max_per_hour;
            self.bucket = Self::bucket(max_per_hour, &self.now_ms);
        }
    }

    /// Decide whether a rule may notify now.  On success the send is
    /// counted against both limits.
    pub fn acquire(
        &mut self,
        last_sent_ms: &mut Option<u64>,
        wait_ms: u64,
        now_ms: u64,
    ) -> Result<(), Throttled> {
        if let Some(last) = *last_sent_ms {
            let since = now_ms.saturating_sub(last);
            if since < wait_ms {
                return Err(Throttled::RuleWait {
                    remaining_ms: wait_ms - since,
                });
            }
        }

        // The bucket's clock must never run backwards.
        self.now_ms.set(self.now_ms.get().max(now_ms));
        if let Some(bucket) = self.bucket.as_mut() {
            if bucket.try_consume(1).is_err() {
                return Err(Throttled::HourlyCap {
                    remaining_ms: HOUR_MS / u64::from(self.max_per_hour),
                });
            }
        }

        *last_sent_ms = Some(now_ms);
        Ok(())
    }
}

impl core::fmt::Debug for NotifyThrottle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NotifyThrottle")
            .field("max_per_hour", &self.max_per_hour)
            .field("now_ms", &self.now_ms.get())
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Firing
// ═══════════════════════════════════════════════════════════════

/// Collaborators a firing may touch.
pub struct ActionContext<'a, P: PinDriver, C: CommandRunner, N: Notifier> {
    pub arbitrator: &'a mut Arbitrator<P>,
    pub commands: &'a mut C,
    pub notifier: &'a mut N,
    pub throttle: &'a mut NotifyThrottle,
    pub command_timeout: Duration,
    pub now_ms: u64,
}

/// Per-firing tally, mostly for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FiringReport {
    pub relays_granted: u32,
    pub relays_rejected: u32,
    pub commands_started: u32,
    pub commands_failed: u32,
    pub notified: u32,
    pub notify_throttled: u32,
    pub notify_failed: u32,
}

/// Run every action of `rule` for `cause`.
pub fn fire<P, C, N>(
    rule: &mut RuleRunner,
    cause: &FiringCause,
    ctx: &mut ActionContext<'_, P, C, N>,
) -> FiringReport
where
    P: PinDriver,
    C: CommandRunner,
    N: Notifier,
{
    let id = rule.config.id;
    let mut report = FiringReport::default();
    let mut message = format!(
        "Rule {} ({}) triggered: {}.\n",
        id,
        rule.config.name,
        cause
    );
    rule.fired += 1;
    info!("Rule {}: fired, {}", id, cause);

    for action in &rule.config.actions {
        match action {
            Action::Relay {
                relay,
                state,
                duration_secs,
            } => {
                let req = match state {
                    Switch::On => {
                        RelayRequest::on(*relay, secs_to_ms(*duration_secs), Requester::Rule(id))
                    }
                    Switch::Off => RelayRequest::off(*relay, Requester::Rule(id)),
                };
                match ctx.arbitrator.request(req, ctx.now_ms) {
                    Ok(_) => {
                        report.relays_granted += 1;
                        let _ = writeln!(message, "Relay {} {}.", relay, state);
                    }
                    Err(e) if e.is_noop() => {
                        debug!("Rule {}: relay {} already {}", id, relay, state);
                    }
                    Err(e) => {
                        report.relays_rejected += 1;
                        warn!("Rule {}: relay {} {} rejected: {}", id, relay, state, e);
                        let _ = writeln!(message, "Relay {} {} rejected: {}.", relay, state, e);
                    }
                }
            }
            Action::Command { command } => {
                let expanded = expand_command(command, id, cause);
                match ctx.commands.run(&expanded, ctx.command_timeout) {
                    Ok(()) => {
                        report.commands_started += 1;
                        let _ = writeln!(message, "Execute '{}'.", expanded);
                    }
                    Err(e) => {
                        report.commands_failed += 1;
                        warn!("Rule {}: command failed: {}", id, e);
                        let _ = writeln!(message, "Execute '{}': {}.", expanded, e);
                    }
                }
            }
            Action::Notify { recipients } => {
                let wait_ms = u64::from(rule.config.notify_wait_secs) * 1000;
                match ctx
                    .throttle
                    .acquire(&mut rule.last_notify_ms, wait_ms, ctx.now_ms)
                {
                    Ok(()) => {
                        let subject = format!("growctl: rule {} {}", id, rule.config.name);
                        match ctx.notifier.send(recipients, &subject, &message) {
                            Ok(()) => report.notified += 1,
                            Err(e) => {
                                report.notify_failed += 1;
                                warn!("Rule {}: notification failed: {}", id, e);
                            }
                        }
                    }
                    Err(t) => {
                        report.notify_throttled += 1;
                        debug!("Rule {}: notification throttled ({:?})", id, t);
                    }
                }
            }
        }
    }
    report
}

/// Substitute the firing cause into a command template.
pub fn expand_command(template: &str, rule: u32, cause: &FiringCause) -> String {
    let (relay, state, duration, value) = match cause {
        FiringCause::Transition(t) => (
            t.relay.to_string(),
            t.state.to_string(),
            format!("{}", t.duration_ms as f64 / 1000.0),
            String::new(),
        ),
        FiringCause::Threshold { value, .. } => {
            (String::new(), String::new(), String::new(), value.to_string())
        }
    };
    template
        .replace("{rule}", &rule.to_string())
        .replace("{relay}", &relay)
        .replace("{state}", &state)
        .replace("{duration}", &duration)
        .replace("{value}", &value)
}
