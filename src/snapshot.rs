//! Configuration snapshot: every entity the core regulates.
//!
//! The external configuration store hands the core one [`Snapshot`] at
//! startup and another on every reload.  [`Snapshot::sanitize`] drops
//! malformed entities (logging each with its id) so one bad row never
//! prevents the rest of the system from running.

use std::collections::BTreeSet;
use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigInvalid;

pub type RelayId = u32;
pub type ZoneId = u32;
pub type PidId = u32;
pub type RuleId = u32;
pub type TimerId = u32;

/// Seconds (as configured) to whole milliseconds.  Negative and NaN map to 0.
pub fn secs_to_ms(secs: f32) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (f64::from(secs) * 1000.0).round() as u64
    } else {
        0
    }
}

// ═══════════════════════════════════════════════════════════════
//  Shared enums
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    Temperature,
    Humidity,
    Co2,
    Pressure,
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Co2 => "co2",
            Self::Pressure => "pressure",
        })
    }
}

impl std::str::FromStr for Variable {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" | "temp" => Ok(Self::Temperature),
            "humidity" | "hum" => Ok(Self::Humidity),
            "co2" => Ok(Self::Co2),
            "pressure" | "press" => Ok(Self::Pressure),
            _ => Err(()),
        }
    }
}

/// Logical relay command (and edge, for relay-transition triggers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_on() { "on" } else { "off" })
    }
}

/// Which physical level energises the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// Physical pin level for a logical state.
    pub fn level(self, on: bool) -> bool {
        match self {
            Self::ActiveHigh => on,
            Self::ActiveLow => !on,
        }
    }
}

/// Which side(s) of the setpoint a PID controller may push toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[serde(alias = "raise")]
    Up,
    #[serde(alias = "lower")]
    Down,
    Both,
}

impl Direction {
    pub fn allows_up(self) -> bool {
        matches!(self, Self::Up | Self::Both)
    }

    pub fn allows_down(self) -> bool {
        matches!(self, Self::Down | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    Below,
}

/// Entity discriminant used in logs and validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Relay,
    Zone,
    Pid,
    Rule,
    Timer,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Relay => "relay",
            Self::Zone => "zone",
            Self::Pid => "pid",
            Self::Rule => "rule",
            Self::Timer => "timer",
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Entities
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorZone {
    pub id: ZoneId,
    #[serde(default)]
    pub name: String,
    pub variables: Vec<Variable>,
    pub period_secs: f32,
    /// A deactivated zone drives no PID and trips no threshold rule.
    #[serde(default = "default_true")]
    pub activated: bool,
    /// Actuator pulsed before each measurement (e.g. an air pump).
    #[serde(default)]
    pub pre_relay: Option<RelayId>,
    #[serde(default)]
    pub pre_duration_secs: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayActuator {
    pub id: RelayId,
    #[serde(default)]
    pub name: String,
    pub pin: u8,
    #[serde(default = "default_polarity")]
    pub polarity: Polarity,
    /// State applied when the core starts.
    #[serde(default = "default_off")]
    pub startup: Switch,
    /// Rated current draw in amps.
    #[serde(default)]
    pub amps: f32,
}

/// Output side of a PID controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputBounds {
    pub relay: RelayId,
    #[serde(default)]
    pub min_secs: f32,
    pub max_secs: f32,
    /// The relay must have been off this long before it may turn on again.
    #[serde(default)]
    pub min_off_secs: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    pub id: PidId,
    pub zone: ZoneId,
    pub variable: Variable,
    /// `false` = override: the controller stops actuating but keeps its tunables.
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub setpoint: f32,
    pub direction: Direction,
    pub period_secs: f32,
    #[serde(default)]
    pub up: Option<OutputBounds>,
    #[serde(default)]
    pub down: Option<OutputBounds>,
    pub kp: f32,
    #[serde(default)]
    pub ki: f32,
    #[serde(default)]
    pub kd: f32,
    /// Hysteresis half-width around the setpoint; 0 disables the band.
    #[serde(default)]
    pub band: f32,
    #[serde(default = "default_integrator_min")]
    pub integrator_min: f32,
    #[serde(default = "default_integrator_max")]
    pub integrator_max: f32,
    /// Seconds of actuation per unit of controller output.
    #[serde(default = "default_output_scale")]
    pub output_scale: f32,
    /// Skip the cycle when the latest reading is older than this.
    #[serde(default)]
    pub max_measure_age_secs: Option<f32>,
}

impl PidConfig {
    /// Equal apart from the override flag.
    pub fn same_tunables(&self, other: &Self) -> bool {
        let mut a = self.clone();
        a.enabled = other.enabled;
        a == *other
    }

    /// Relays this controller may drive.  A side configured for a
    /// direction that excludes it is not one of them.
    pub fn relays(&self) -> impl Iterator<Item = RelayId> + '_ {
        let up = self.up.filter(|_| self.direction.allows_up());
        let down = self.down.filter(|_| self.direction.allows_down());
        up.into_iter().chain(down).map(|b| b.relay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    RelayTransition {
        relay: RelayId,
        edge: Switch,
        /// 0 = any duration.
        #[serde(default)]
        on_duration_secs: u32,
    },
    Threshold {
        zone: ZoneId,
        variable: Variable,
        comparison: Comparison,
        setpoint: f32,
        period_secs: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Relay {
        relay: RelayId,
        state: Switch,
        /// 0 = indefinite.
        #[serde(default)]
        duration_secs: f32,
    },
    Command {
        command: String,
    },
    Notify {
        recipients: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: RuleId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub trigger: Trigger,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Minimum seconds between two notifications from this rule.
    #[serde(default = "default_notify_wait")]
    pub notify_wait_secs: u32,
}

impl RuleConfig {
    pub fn same_definition(&self, other: &Self) -> bool {
        let mut a = self.clone();
        a.enabled = other.enabled;
        a == *other
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    pub id: TimerId,
    pub relay: RelayId,
    pub on_secs: u32,
    /// 0 = stay on once triggered.
    #[serde(default)]
    pub off_secs: u32,
    #[serde(default = "default_true")]
    pub running: bool,
}

impl TimerConfig {
    pub fn same_cycle(&self, other: &Self) -> bool {
        self.relay == other.relay && self.on_secs == other.on_secs && self.off_secs == other.off_secs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyBudget {
    pub max_amps: f32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SafetyBudget {
    fn default() -> Self {
        Self {
            max_amps: 15.0,
            enabled: true,
        }
    }
}

/// Everything the core runs, as loaded from the configuration store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub relays: Vec<RelayActuator>,
    #[serde(default)]
    pub zones: Vec<SensorZone>,
    #[serde(default)]
    pub pids: Vec<PidConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub timers: Vec<TimerConfig>,
    #[serde(default)]
    pub budget: SafetyBudget,
}

fn default_true() -> bool {
    true
}
fn default_off() -> Switch {
    Switch::Off
}
fn default_polarity() -> Polarity {
    Polarity::ActiveHigh
}
fn default_integrator_min() -> f32 {
    -500.0
}
fn default_integrator_max() -> f32 {
    500.0
}
fn default_output_scale() -> f32 {
    1.0
}
fn default_notify_wait() -> u32 {
    3600
}

// ═══════════════════════════════════════════════════════════════
//  Validation
// ═══════════════════════════════════════════════════════════════

impl Snapshot {
    pub fn relay(&self, id: RelayId) -> Option<&RelayActuator> {
        self.relays.iter().find(|r| r.id == id)
    }

    pub fn zone(&self, id: ZoneId) -> Option<&SensorZone> {
        self.zones.iter().find(|z| z.id == id)
    }

    /// False only for a known zone whose `activated` flag is off.
    pub fn zone_active(&self, id: ZoneId) -> bool {
        self.zone(id).is_none_or(|z| z.activated)
    }

    /// Drop every malformed entity and return the rejections.
    ///
    /// Relays and zones are checked first so later entities are validated
    /// against the surviving set: a PID pointing at a rejected relay is
    /// itself rejected.
    pub fn sanitize(mut self) -> (Self, Vec<ConfigInvalid>) {
        let mut rejected = Vec::new();

        let mut seen = BTreeSet::new();
        self.relays.retain(|r| {
            keep(&mut rejected, EntityKind::Relay, r.id, check_relay(r, &mut seen))
        });
        let relays: BTreeSet<RelayId> = self.relays.iter().map(|r| r.id).collect();

        let mut seen = BTreeSet::new();
        self.zones.retain(|z| {
            keep(&mut rejected, EntityKind::Zone, z.id, check_zone(z, &relays, &mut seen))
        });
        let zones: BTreeSet<ZoneId> = self.zones.iter().map(|z| z.id).collect();

        let mut seen = BTreeSet::new();
        self.pids.retain(|p| {
            keep(&mut rejected, EntityKind::Pid, p.id, check_pid(p, &relays, &zones, &mut seen))
        });

        let mut seen = BTreeSet::new();
        self.rules.retain(|r| {
            keep(&mut rejected, EntityKind::Rule, r.id, check_rule(r, &relays, &zones, &mut seen))
        });

        let mut seen = BTreeSet::new();
        self.timers.retain(|t| {
            keep(&mut rejected, EntityKind::Timer, t.id, check_timer(t, &relays, &mut seen))
        });

        if !self.budget.max_amps.is_finite() || self.budget.max_amps < 0.0 {
            warn!("Snapshot: invalid budget ceiling {}, disabling budget", self.budget.max_amps);
            self.budget.enabled = false;
        }

        (self, rejected)
    }
}

type Check = Result<(), &'static str>;

fn keep(rejected: &mut Vec<ConfigInvalid>, kind: EntityKind, id: u32, check: Check) -> bool {
    match check {
        Ok(()) => true,
        Err(reason) => {
            let err = ConfigInvalid { kind, id, reason };
            warn!("Snapshot: skipping {}", err);
            rejected.push(err);
            false
        }
    }
}

fn positive(v: f32) -> bool {
    v.is_finite() && v > 0.0
}

fn non_negative(v: f32) -> bool {
    v.is_finite() && v >= 0.0
}

fn check_relay(r: &RelayActuator, seen: &mut BTreeSet<u32>) -> Check {
    if !seen.insert(r.id) {
        return Err("duplicate id");
    }
    if !non_negative(r.amps) {
        return Err("amps must be >= 0");
    }
    Ok(())
}

fn check_zone(z: &SensorZone, relays: &BTreeSet<RelayId>, seen: &mut BTreeSet<u32>) -> Check {
    if !seen.insert(z.id) {
        return Err("duplicate id");
    }
    if !positive(z.period_secs) {
        return Err("period must be > 0");
    }
    if !non_negative(z.pre_duration_secs) {
        return Err("pre-measurement duration must be >= 0");
    }
    if z.pre_relay.is_some_and(|r| !relays.contains(&r)) {
        return Err("pre-measurement relay does not exist");
    }
    Ok(())
}

fn check_bounds(b: &OutputBounds, relays: &BTreeSet<RelayId>) -> Check {
    if !relays.contains(&b.relay) {
        return Err("output relay does not exist");
    }
    if !non_negative(b.min_secs) || !non_negative(b.max_secs) || !non_negative(b.min_off_secs) {
        return Err("output durations must be >= 0");
    }
    if b.min_secs > b.max_secs {
        return Err("output min exceeds max");
    }
    Ok(())
}

fn check_pid(
    p: &PidConfig,
    relays: &BTreeSet<RelayId>,
    zones: &BTreeSet<ZoneId>,
    seen: &mut BTreeSet<u32>,
) -> Check {
    if !seen.insert(p.id) {
        return Err("duplicate id");
    }
    if !zones.contains(&p.zone) {
        return Err("zone does not exist");
    }
    if !positive(p.period_secs) {
        return Err("period must be > 0");
    }
    if ![p.setpoint, p.kp, p.ki, p.kd].iter().all(|v| v.is_finite()) {
        return Err("setpoint and gains must be finite");
    }
    if !non_negative(p.band) {
        return Err("band must be >= 0");
    }
    if !(p.integrator_min <= p.integrator_max) {
        return Err("integrator min exceeds max");
    }
    if !positive(p.output_scale) {
        return Err("output scale must be > 0");
    }
    if p.max_measure_age_secs.is_some_and(|a| !positive(a)) {
        return Err("max measurement age must be > 0");
    }
    match (p.direction.allows_up(), &p.up) {
        (true, None) => return Err("direction requires an up output"),
        (_, Some(b)) => check_bounds(b, relays)?,
        _ => {}
    }
    match (p.direction.allows_down(), &p.down) {
        (true, None) => return Err("direction requires a down output"),
        (_, Some(b)) => check_bounds(b, relays)?,
        _ => {}
    }
    if let (Direction::Both, Some(up), Some(down)) = (p.direction, &p.up, &p.down) {
        if up.relay == down.relay {
            return Err("up and down outputs share a relay");
        }
    }
    Ok(())
}

fn check_rule(
    r: &RuleConfig,
    relays: &BTreeSet<RelayId>,
    zones: &BTreeSet<ZoneId>,
    seen: &mut BTreeSet<u32>,
) -> Check {
    if !seen.insert(r.id) {
        return Err("duplicate id");
    }
    match &r.trigger {
        Trigger::RelayTransition { relay, .. } => {
            if !relays.contains(relay) {
                return Err("watched relay does not exist");
            }
        }
        Trigger::Threshold {
            zone,
            setpoint,
            period_secs,
            ..
        } => {
            if !zones.contains(zone) {
                return Err("watched zone does not exist");
            }
            if !setpoint.is_finite() {
                return Err("setpoint must be finite");
            }
            if !positive(*period_secs) {
                return Err("period must be > 0");
            }
        }
    }
    for action in &r.actions {
        match action {
            Action::Relay {
                relay,
                duration_secs,
                ..
            } => {
                if !relays.contains(relay) {
                    return Err("action relay does not exist");
                }
                if !non_negative(*duration_secs) {
                    return Err("action duration must be >= 0");
                }
            }
            Action::Command { command } if command.trim().is_empty() => {
                return Err("empty command");
            }
            Action::Notify { recipients } if recipients.is_empty() => {
                return Err("notification without recipients");
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_timer(t: &TimerConfig, relays: &BTreeSet<RelayId>, seen: &mut BTreeSet<u32>) -> Check {
    if !seen.insert(t.id) {
        return Err("duplicate id");
    }
    if !relays.contains(&t.relay) {
        return Err("relay does not exist");
    }
    if t.on_secs == 0 {
        return Err("on duration must be >= 1 s");
    }
    Ok(())
}
