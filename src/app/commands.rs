//! Inbound commands to the control core.
//!
//! These represent actions requested by the outside world (control
//! socket, operator tooling) that the runtime forwards to the
//! [`ControlCore`](super::service::ControlCore).
//!
//! ## Line protocol
//!
//! ```text
//! reload <relay_id>             0 = everything
//! on <relay> [secs]             manual on, optional auto-off
//! off <relay>
//! pid <id> enable|disable
//! rule <id> enable|disable
//! timer <id> start|stop
//! premeasure <zone>
//! reading <zone> <variable> <value>
//! shutdown
//! ```

use core::fmt;
use core::str::FromStr;

use crate::snapshot::{PidId, RelayId, RuleId, Switch, TimerId, Variable, ZoneId};

/// Commands that external adapters can send into the control core.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Re-read the snapshot.  `relay == 0` reloads everything, otherwise
    /// only that actuator.
    Reload { relay: RelayId },

    /// Manual relay request.  `duration_secs == 0` = indefinite.
    SetRelay {
        relay: RelayId,
        state: Switch,
        duration_secs: f32,
    },

    SetPidEnabled { pid: PidId, enabled: bool },

    SetRuleEnabled { rule: RuleId, enabled: bool },

    SetTimerRunning { timer: TimerId, running: bool },

    /// Pulse the zone's pre-measurement relay.
    PreMeasure { zone: ZoneId },

    /// Switch everything off and stop the runtime.
    Shutdown,
}

/// One parsed protocol line.  Readings bypass the core and go straight to
/// the reading cache.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlLine {
    Command(ControlCommand),
    Reading {
        zone: ZoneId,
        variable: Variable,
        value: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError(pub &'static str);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for ParseError {}

fn id<T: FromStr>(word: Option<&str>) -> Result<T, ParseError> {
    word.ok_or(ParseError("missing id"))?
        .parse()
        .map_err(|_| ParseError("bad id"))
}

fn toggle(word: Option<&str>, yes: &str, no: &str) -> Result<bool, ParseError> {
    match word {
        Some(w) if w == yes => Ok(true),
        Some(w) if w == no => Ok(false),
        _ => Err(ParseError("expected enable/disable or start/stop")),
    }
}

impl FromStr for ControlLine {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ParseError("empty line"))?;
        let cmd = match verb {
            "reload" => ControlCommand::Reload {
                relay: match words.next() {
                    Some(w) => w.parse().map_err(|_| ParseError("bad id"))?,
                    None => 0,
                },
            },
            "on" => ControlCommand::SetRelay {
                relay: id(words.next())?,
                state: Switch::On,
                duration_secs: match words.next() {
                    Some(w) => w
                        .parse::<f32>()
                        .ok()
                        .filter(|d| d.is_finite() && *d >= 0.0)
                        .ok_or(ParseError("bad duration"))?,
                    None => 0.0,
                },
            },
            "off" => ControlCommand::SetRelay {
                relay: id(words.next())?,
                state: Switch::Off,
                duration_secs: 0.0,
            },
            "pid" => ControlCommand::SetPidEnabled {
                pid: id(words.next())?,
                enabled: toggle(words.next(), "enable", "disable")?,
            },
            "rule" => ControlCommand::SetRuleEnabled {
                rule: id(words.next())?,
                enabled: toggle(words.next(), "enable", "disable")?,
            },
            "timer" => ControlCommand::SetTimerRunning {
                timer: id(words.next())?,
                running: toggle(words.next(), "start", "stop")?,
            },
            "premeasure" => ControlCommand::PreMeasure {
                zone: id(words.next())?,
            },
            "shutdown" => ControlCommand::Shutdown,
            "reading" => {
                let zone = id(words.next())?;
                let variable = words
                    .next()
                    .and_then(|w| w.parse().ok())
                    .ok_or(ParseError("unknown variable"))?;
                let value = words
                    .next()
                    .and_then(|w| w.parse::<f32>().ok())
                    .filter(|v| v.is_finite())
                    .ok_or(ParseError("bad value"))?;
                return Ok(Self::Reading {
                    zone,
                    variable,
                    value,
                });
            }
            _ => return Err(ParseError("unknown command")),
        };
        Ok(Self::Command(cmd))
    }
}
