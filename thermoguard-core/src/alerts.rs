//! Alert State Machine
//!
//! ## Overview
//!
//! One finite state machine per (entity, alert kind). Observations carry a
//! metric (temperature, anomaly score or matcher confidence); the machine
//! turns the stream of metrics into debounced level changes.
//!
//! ```text
//!            breach ≥ warning_dwell          breach ≥ critical_dwell
//!   Normal ─────────────────────────→ Warning ─────────────────────────→ Critical
//!     ▲                                 │  ▲                                │
//!     │   clear ≥ recovery_dwell        │  │ below critical - hyst          │
//!     └──────────── Resolved ───────────┘  └────── ≥ recovery_dwell ────────┘
//!     ▲                                                                     │
//!     └──────────────────────── clear ≥ recovery_dwell ─────────────────────┘
//! ```
//!
//! "clear" means the metric is past the warning threshold by at least the
//! hysteresis band, so a value sitting exactly on the threshold neither
//! raises nor resolves.
//!
//! ## Rules
//!
//! - At most one level step per observation.
//! - Every transition moves the state and updates the active-alert gauges.
//! - An upward transition into Warning or Critical within `cooldown_ms` of
//!   the last notification for that level is not notified.
//! - A step down is not notified when the step up it undoes was suppressed,
//!   so observers always see raise/resolve and escalate/downgrade pairs.
//!
//! Machines are independent and sharded by key; evaluating one entity never
//! waits on another shard.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{AlertConfig, AlertRule, Direction};
use crate::events::{Entity, Severity};
use crate::metrics::PipelineMetrics;
use crate::shard::Sharded;
use crate::time::Timestamp;

/// Alert level of one machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Normal,
    Warning,
    Critical,
}

impl AlertLevel {
    pub const fn severity(&self) -> Severity {
        match self {
            AlertLevel::Normal => Severity::Info,
            AlertLevel::Warning => Severity::Warning,
            AlertLevel::Critical => Severity::Critical,
        }
    }
}

/// What an alert is raised on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertKind {
    HighTemperature,
    LowTemperature,
    AnomalyScore,
    Oscillation,
    GradualRise,
    Correlation,
}

impl AlertKind {
    pub const ALL: [AlertKind; 6] = [
        AlertKind::HighTemperature,
        AlertKind::LowTemperature,
        AlertKind::AnomalyScore,
        AlertKind::Oscillation,
        AlertKind::GradualRise,
        AlertKind::Correlation,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            AlertKind::HighTemperature => "high_temperature",
            AlertKind::LowTemperature => "low_temperature",
            AlertKind::AnomalyScore => "anomaly_score",
            AlertKind::Oscillation => "oscillation",
            AlertKind::GradualRise => "gradual_rise",
            AlertKind::Correlation => "correlation",
        }
    }

    fn rule<'a>(&self, config: &'a AlertConfig) -> &'a AlertRule {
        match self {
            AlertKind::HighTemperature => &config.high_temperature,
            AlertKind::LowTemperature => &config.low_temperature,
            AlertKind::AnomalyScore => &config.anomaly_score,
            AlertKind::Oscillation => &config.oscillation,
            AlertKind::GradualRise => &config.gradual_rise,
            AlertKind::Correlation => &config.correlation,
        }
    }
}

/// One metric sample for one machine
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub entity: Entity,
    pub kind: AlertKind,
    pub metric: f64,
    pub timestamp: Timestamp,
}

impl Observation {
    pub fn new(entity: Entity, kind: AlertKind, metric: f64, timestamp: Timestamp) -> Self {
        Self {
            entity,
            kind,
            metric,
            timestamp,
        }
    }
}

/// How the level moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Transition {
    /// Normal → Warning
    Raised,
    /// Warning → Critical
    Escalated,
    /// Critical → Warning
    Downgraded,
    /// Back to Normal
    Resolved,
}

/// Notification of a level change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub entity: Entity,
    pub kind: AlertKind,
    pub transition: Transition,
    pub level: AlertLevel,
    pub previous: AlertLevel,
    /// Metric of the observation that caused the transition
    pub metric: f64,
    pub timestamp: Timestamp,
}

impl AlertEvent {
    /// Severity of the higher of the two levels
    ///
    /// A step down (`Downgraded`, `Resolved`) carries the severity of the
    /// level it leaves, so a subscriber gated on a minimum severity receives
    /// the close of every episode it saw open.
    pub fn severity(&self) -> Severity {
        match self.transition {
            Transition::Raised | Transition::Escalated => self.level.severity(),
            Transition::Downgraded | Transition::Resolved => self.previous.severity(),
        }
    }
}

/// Public view of one machine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertState {
    pub entity: Entity,
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub entered_at: Timestamp,
    /// End of the notification cooldown for the current level
    pub cooldown_until: Option<Timestamp>,
    pub last_metric: f64,
}

type MachineKey = (Entity, AlertKind);

#[derive(Debug, Clone)]
struct Machine {
    level: AlertLevel,
    entered_at: Timestamp,
    last_metric: f64,

    /// Warning condition continuously held since
    warning_since: Option<Timestamp>,
    /// Critical condition continuously held since
    critical_since: Option<Timestamp>,
    /// Metric clear of warning minus hysteresis since
    clear_since: Option<Timestamp>,
    /// Metric clear of critical minus hysteresis since
    below_critical_since: Option<Timestamp>,

    /// Last notification per level: [warning, critical]
    last_notified: [Option<Timestamp>; 2],

    /// The raise that opened the current episode was not notified
    episode_suppressed: bool,
    /// The last escalation to Critical was not notified
    escalation_suppressed: bool,
}

impl Machine {
    fn new(now: Timestamp) -> Self {
        Self {
            level: AlertLevel::Normal,
            entered_at: now,
            last_metric: 0.0,
            warning_since: None,
            critical_since: None,
            clear_since: None,
            below_critical_since: None,
            last_notified: [None, None],
            episode_suppressed: false,
            escalation_suppressed: false,
        }
    }

    fn notified_slot(level: AlertLevel) -> Option<usize> {
        match level {
            AlertLevel::Normal => None,
            AlertLevel::Warning => Some(0),
            AlertLevel::Critical => Some(1),
        }
    }

    fn cooldown_until(&self, rule: &AlertRule) -> Option<Timestamp> {
        Self::notified_slot(self.level)
            .and_then(|slot| self.last_notified[slot])
            .map(|t| t + rule.cooldown_ms)
    }

    fn track(&mut self, rule: &AlertRule, metric: f64, now: Timestamp) {
        fn hold(flag: bool, since: Option<Timestamp>, now: Timestamp) -> Option<Timestamp> {
            if flag {
                since.or(Some(now))
            } else {
                None
            }
        }

        self.warning_since = hold(breaches(rule, metric, rule.warning), self.warning_since, now);
        self.critical_since = hold(breaches(rule, metric, rule.critical), self.critical_since, now);
        self.clear_since = hold(clear_of(rule, metric, rule.warning), self.clear_since, now);
        self.below_critical_since = hold(
            clear_of(rule, metric, rule.critical),
            self.below_critical_since,
            now,
        );
        self.last_metric = metric;
    }

    /// Level this machine should step to, if any
    fn next_level(&self, rule: &AlertRule, now: Timestamp) -> Option<AlertLevel> {
        let held = |since: Option<Timestamp>, dwell: i64| since.map_or(false, |s| now - s >= dwell);

        match self.level {
            AlertLevel::Normal => {
                held(self.warning_since, rule.warning_dwell_ms).then_some(AlertLevel::Warning)
            }
            AlertLevel::Warning => {
                if held(self.critical_since, rule.critical_dwell_ms) {
                    Some(AlertLevel::Critical)
                } else if held(self.clear_since, rule.recovery_dwell_ms) {
                    Some(AlertLevel::Normal)
                } else {
                    None
                }
            }
            AlertLevel::Critical => {
                if held(self.clear_since, rule.recovery_dwell_ms) {
                    Some(AlertLevel::Normal)
                } else if held(self.below_critical_since, rule.recovery_dwell_ms) {
                    Some(AlertLevel::Warning)
                } else {
                    None
                }
            }
        }
    }
}

/// Condition holds for `threshold`
fn breaches(rule: &AlertRule, metric: f64, threshold: f64) -> bool {
    match rule.direction {
        Direction::Above => metric >= threshold,
        Direction::Below => metric <= threshold,
    }
}

/// Metric is past `threshold` by the hysteresis band on the safe side
fn clear_of(rule: &AlertRule, metric: f64, threshold: f64) -> bool {
    match rule.direction {
        Direction::Above => metric < threshold - rule.hysteresis,
        Direction::Below => metric > threshold + rule.hysteresis,
    }
}

/// Sharded set of alert state machines
#[derive(Debug)]
pub struct AlertEngine {
    config: AlertConfig,
    machines: Sharded<MachineKey, Machine>,
    metrics: Arc<PipelineMetrics>,
}

impl AlertEngine {
    pub fn new(config: &AlertConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            config: config.clone(),
            machines: Sharded::new(config.shards.max(1) * 4),
            metrics,
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Feed one observation; returns the notification to publish, if any
    pub fn evaluate(&self, observation: &Observation) -> Option<AlertEvent> {
        let rule = observation.kind.rule(&self.config);
        if !rule.enabled || !observation.metric.is_finite() {
            return None;
        }
        let now = observation.timestamp;
        let key = (observation.entity.clone(), observation.kind);

        let mut shard = self.machines.lock_for(&key);
        let machine = shard.entry(key).or_insert_with(|| Machine::new(now));

        machine.track(rule, observation.metric, now);
        let next = machine.next_level(rule, now)?;
        let previous = machine.level;

        let transition = match (previous, next) {
            (AlertLevel::Normal, _) => Transition::Raised,
            (AlertLevel::Warning, AlertLevel::Critical) => Transition::Escalated,
            (AlertLevel::Critical, AlertLevel::Warning) => Transition::Downgraded,
            (_, _) => Transition::Resolved,
        };

        machine.level = next;
        machine.entered_at = now;
        self.metrics.record_level_change(previous, next);

        let notify = match transition {
            Transition::Raised | Transition::Escalated => {
                let slot = if transition == Transition::Raised { 0 } else { 1 };
                let cooling = machine.last_notified[slot].map_or(false, |t| now < t + rule.cooldown_ms);
                if !cooling {
                    machine.last_notified[slot] = Some(now);
                }
                if transition == Transition::Raised {
                    machine.episode_suppressed = cooling;
                } else {
                    machine.escalation_suppressed = cooling;
                }
                !cooling
            }
            Transition::Downgraded => !std::mem::take(&mut machine.escalation_suppressed),
            Transition::Resolved => {
                machine.escalation_suppressed = false;
                !std::mem::take(&mut machine.episode_suppressed)
            }
        };
        drop(shard);

        log::debug!(
            "Alert {} {} {:?} → {:?}{}",
            observation.entity,
            observation.kind.name(),
            previous,
            next,
            if notify { "" } else { " (suppressed)" }
        );

        if !notify {
            self.metrics.record_suppressed_notification();
            return None;
        }

        self.metrics.record_alert_event();
        if next != AlertLevel::Normal {
            log::warn!(
                "{} alert {} on {} at {}",
                next.severity(),
                observation.kind.name(),
                observation.entity,
                observation.metric
            );
        } else {
            log::info!("Alert {} on {} resolved", observation.kind.name(), observation.entity);
        }

        Some(AlertEvent {
            entity: observation.entity.clone(),
            kind: observation.kind,
            transition,
            level: next,
            previous,
            metric: observation.metric,
            timestamp: now,
        })
    }

    /// Evaluate a batch, keeping only the notifications
    pub fn evaluate_all<'a, I>(&self, observations: I) -> Vec<AlertEvent>
    where
        I: IntoIterator<Item = &'a Observation>,
    {
        observations
            .into_iter()
            .filter_map(|o| self.evaluate(o))
            .collect()
    }

    pub fn state(&self, entity: &Entity, kind: AlertKind) -> Option<AlertState> {
        let key = (entity.clone(), kind);
        let rule = kind.rule(&self.config);
        self.machines
            .lock_for(&key)
            .get(&key)
            .map(|m| snapshot(&key, m, rule))
    }

    /// Every machine currently above Normal, most severe first
    pub fn active_alerts(&self) -> Vec<AlertState> {
        let mut out = Vec::new();
        self.machines.for_each_shard(|shard| {
            out.extend(
                shard
                    .iter()
                    .filter(|(_, m)| m.level != AlertLevel::Normal)
                    .map(|(key, m)| snapshot(key, m, key.1.rule(&self.config))),
            );
        });
        out.sort_by(|a, b| {
            b.level
                .cmp(&a.level)
                .then_with(|| a.entered_at.cmp(&b.entered_at))
                .then_with(|| a.entity.cmp(&b.entity))
        });
        out
    }
}

fn snapshot(key: &MachineKey, machine: &Machine, rule: &AlertRule) -> AlertState {
    AlertState {
        entity: key.0.clone(),
        kind: key.1,
        level: machine.level,
        entered_at: machine.entered_at,
        cooldown_until: machine.cooldown_until(rule),
        last_metric: machine.last_metric,
    }
}
