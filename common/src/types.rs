use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TargetSpec {
    Temperature(f32),
    ForcedOn,
    Preheat,
}

impl TargetSpec {
    pub fn temperature(self) -> Option<f32> {
        match self {
            Self::Temperature(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_temperature(self) -> bool {
        matches!(self, Self::Temperature(_))
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperature(value) => write!(f, "{value}"),
            Self::ForcedOn => f.write_str("On"),
            Self::Preheat => f.write_str("Preheat"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub target: TargetSpec,
}

impl Event {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, target: TargetSpec) -> Self {
        Self { start, end, target }
    }

    /// True when `now` falls inside `[start, end)`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Heating,
    Preheat,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Heating, Channel::Preheat];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "heating",
            Self::Preheat => "preheat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concerns that can hold a deferred re-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TriggerKind {
    Heating,
    Preheat,
    Event,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "heating_trigger",
            Self::Preheat => "preheat_trigger",
            Self::Event => "event_trigger",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeatingStatus {
    #[serde(rename = "currentTemp")]
    pub current_temp: Option<f32>,
    #[serde(rename = "desiredTemp")]
    pub desired_temp: String,
    #[serde(rename = "proportionalMinutes")]
    pub proportional_minutes: u32,
    #[serde(rename = "heatingOn")]
    pub heating_on: bool,
    #[serde(rename = "preheatOn")]
    pub preheat_on: bool,
    #[serde(rename = "timeOn")]
    pub time_on: Option<String>,
    #[serde(rename = "timeOff")]
    pub time_off: Option<String>,
    pub events: Vec<Event>,
    #[serde(rename = "outsideTemp")]
    pub outside_temp: Option<f32>,
    pub timezone: String,
}
