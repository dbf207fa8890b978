use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use heating_common::{config::CalendarConfig, CalendarEntry};
use serde::Deserialize;
use tracing::debug;

/// Export written by the calendar bridge: one list of items per calendar id.
#[derive(Debug, Default, Deserialize)]
struct CalendarExport {
    #[serde(default)]
    calendars: std::collections::HashMap<String, Vec<CalendarEntry>>,
}

/// Reads upcoming events from the bridge's JSON export.
#[derive(Debug, Clone)]
pub struct FileCalendar {
    path: PathBuf,
    calendar_id: String,
    timeout: Duration,
}

impl FileCalendar {
    pub fn new(data_dir: &std::path::Path, config: &CalendarConfig) -> Self {
        Self {
            path: data_dir.join(&config.events_path),
            calendar_id: config.calendar_id.clone(),
            timeout: Duration::from_secs(config.fetch_timeout_seconds),
        }
    }

    /// Entries that have not ended by `now`, earliest first, at most `max`.
    pub async fn fetch_upcoming_events(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> anyhow::Result<Vec<CalendarEntry>> {
        let raw = tokio::time::timeout(self.timeout, tokio::fs::read(&self.path))
            .await
            .with_context(|| format!("timed out reading {}", self.path.display()))?
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut export: CalendarExport =
            serde_json::from_slice(&raw).context("malformed calendar export")?;

        let mut entries = export
            .calendars
            .remove(&self.calendar_id)
            .with_context(|| format!("calendar '{}' not in export", self.calendar_id))?;
        entries.retain(|entry| entry.end > now);
        entries.sort_by_key(|entry| entry.start);
        entries.truncate(max);

        debug!(
            "fetched {} upcoming events from calendar {}",
            entries.len(),
            self.calendar_id
        );
        Ok(entries)
    }
}
