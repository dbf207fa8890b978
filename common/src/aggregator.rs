use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("could not get temperature from {0}")]
    NoTemperature(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AggregatorError {
    #[error("no temperature sensors found")]
    NoSensors,
    #[error("no temperature sensors are reporting")]
    AllSensorsLost,
}

/// A source of ambient temperature readings.
pub trait TemperatureSensor: Send + Sync {
    fn id(&self) -> &str;
    fn read_ambient_temperature(&self) -> Result<f32, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still inside the retry budget; the last reading stays in the pool.
    Retained { failures: u32 },
    /// Removed from the pool. `alert` is set once per disconnect episode.
    Dropped { alert: bool },
}

#[derive(Debug, Clone, Default)]
struct SensorSlot {
    last_reading: Option<f32>,
    consecutive_failures: u32,
    dropped: bool,
    alert_sent: bool,
}

/// Folds per-sensor readings into one inside temperature: the coldest valid one.
#[derive(Debug, Clone)]
pub struct TemperatureAggregator {
    sensors: BTreeMap<String, SensorSlot>,
    max_failures: u32,
}

impl TemperatureAggregator {
    pub fn new<I, S>(sensor_ids: I, max_failures: u32) -> Result<Self, AggregatorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sensors: BTreeMap<String, SensorSlot> = sensor_ids
            .into_iter()
            .map(|id| (id.into(), SensorSlot::default()))
            .collect();
        if sensors.is_empty() {
            return Err(AggregatorError::NoSensors);
        }

        Ok(Self {
            sensors,
            max_failures: max_failures.max(1),
        })
    }

    /// Records a good reading. Returns false when the value is not usable.
    pub fn update(&mut self, sensor_id: &str, reading: f32) -> bool {
        if !reading.is_finite() {
            return false;
        }
        let slot = self.sensors.entry(sensor_id.to_string()).or_default();
        slot.last_reading = Some(reading);
        slot.consecutive_failures = 0;
        slot.dropped = false;
        slot.alert_sent = false;
        true
    }

    pub fn record_failure(&mut self, sensor_id: &str) -> FailureOutcome {
        let max_failures = self.max_failures;
        let slot = self.sensors.entry(sensor_id.to_string()).or_default();
        slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);

        if slot.consecutive_failures < max_failures {
            return FailureOutcome::Retained {
                failures: slot.consecutive_failures,
            };
        }

        slot.dropped = true;
        slot.last_reading = None;
        let alert = !slot.alert_sent;
        slot.alert_sent = true;
        FailureOutcome::Dropped { alert }
    }

    pub fn current(&self) -> Option<f32> {
        self.sensors
            .values()
            .filter(|slot| !slot.dropped)
            .filter_map(|slot| slot.last_reading)
            .reduce(f32::min)
    }

    pub fn reading(&self, sensor_id: &str) -> Option<f32> {
        self.sensors
            .get(sensor_id)
            .filter(|slot| !slot.dropped)
            .and_then(|slot| slot.last_reading)
    }

    pub fn active_sensors(&self) -> usize {
        self.sensors.values().filter(|slot| !slot.dropped).count()
    }

    /// Fails once every known sensor has been dropped.
    pub fn ensure_available(&self) -> Result<(), AggregatorError> {
        if self.active_sensors() == 0 {
            Err(AggregatorError::AllSensorsLost)
        } else {
            Ok(())
        }
    }
}
