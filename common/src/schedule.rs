use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Event, TargetSpec};

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("'{0}' is not a temperature, 'on' or 'preheat'")]
    UnknownSummary(String),
    #[error("event ends at {end} before it starts at {start}")]
    InvertedWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// One raw calendar item as delivered by the calendar adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub summary: String,
}

impl CalendarEntry {
    pub fn to_event(&self) -> Result<Event, ScheduleError> {
        if self.end < self.start {
            return Err(ScheduleError::InvertedWindow {
                start: self.start,
                end: self.end,
            });
        }
        let target = parse_target(&self.summary)?;
        Ok(Event::new(self.start, self.end, target))
    }
}

pub fn parse_target(summary: &str) -> Result<TargetSpec, ScheduleError> {
    let trimmed = summary.trim();
    if trimmed.eq_ignore_ascii_case("on") {
        return Ok(TargetSpec::ForcedOn);
    }
    if trimmed.eq_ignore_ascii_case("preheat") {
        return Ok(TargetSpec::Preheat);
    }
    match trimmed.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(TargetSpec::Temperature(value)),
        _ => Err(ScheduleError::UnknownSummary(summary.to_string())),
    }
}

/// Upcoming events in start order, truncated to the configured head length.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Schedule {
    events: Vec<Event>,
}

impl Schedule {
    pub fn new(mut events: Vec<Event>, max_events: usize) -> Self {
        events.sort_by_key(|event| (event.start, event.end));
        events.truncate(max_events);
        Self { events }
    }

    /// Builds a schedule from calendar entries, dropping anything that does not
    /// parse or that has already ended.
    pub fn from_entries(entries: &[CalendarEntry], now: DateTime<Utc>, max_events: usize) -> Self {
        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.to_event() {
                Ok(event) if event.end <= now => {
                    debug!("skipping elapsed event ending {}", event.end);
                }
                Ok(event) => events.push(event),
                Err(err) => warn!("dropping calendar event: {err}"),
            }
        }
        Self::new(events, max_events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn head(&self) -> Option<&Event> {
        self.events.first()
    }

    pub fn active_preheat(&self, now: DateTime<Utc>) -> Option<&Event> {
        self.events
            .iter()
            .find(|event| event.target == TargetSpec::Preheat && event.is_active(now))
    }

    pub fn active_forced_on(&self, now: DateTime<Utc>) -> Option<&Event> {
        self.events
            .iter()
            .find(|event| event.target == TargetSpec::ForcedOn && event.is_active(now))
    }

    /// First event carrying a temperature target.
    pub fn first_temperature(&self) -> Option<&Event> {
        self.events.iter().find(|event| event.target.is_temperature())
    }

    pub fn temperature_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|event| event.target.is_temperature())
    }

    /// Earliest start or end of the head event strictly after `now`.
    pub fn next_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let head = self.head()?;
        [head.start, head.end].into_iter().find(|at| *at > now)
    }
}
