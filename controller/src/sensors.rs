use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use heating_common::{
    config::SensorConfig, sensor_id_from_topic, AggregatorError, FailureOutcome, SensorError,
    TemperatureAggregator, TemperatureSensor, TOPIC_OUTSIDE_TEMP,
};
use tokio::time::Instant;
use tracing::{debug, error, warn};

const MAX_MQTT_PAYLOAD_BYTES: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Reading {
    value: f32,
    received: Instant,
}

#[derive(Debug, Default)]
struct Readings {
    sensors: HashMap<String, Reading>,
    outside: Option<Reading>,
}

/// Latest readings pushed by the sensor nodes over MQTT.
#[derive(Debug, Clone)]
pub struct SensorHub {
    readings: Arc<Mutex<Readings>>,
    stale_after: Duration,
}

impl SensorHub {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            readings: Arc::new(Mutex::new(Readings::default())),
            stale_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Readings> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh(&self, reading: Option<Reading>) -> Option<f32> {
        reading
            .filter(|reading| reading.received.elapsed() <= self.stale_after)
            .map(|reading| reading.value)
    }

    pub fn record(&self, sensor_id: &str, value: f32) {
        let reading = Reading {
            value,
            received: Instant::now(),
        };
        self.lock().sensors.insert(sensor_id.to_string(), reading);
    }

    pub fn record_outside(&self, value: f32) {
        self.lock().outside = Some(Reading {
            value,
            received: Instant::now(),
        });
    }

    pub fn latest(&self, sensor_id: &str) -> Option<f32> {
        let reading = self.lock().sensors.get(sensor_id).copied();
        self.fresh(reading)
    }

    pub fn outside(&self) -> Option<f32> {
        let reading = self.lock().outside;
        self.fresh(reading)
    }

    /// Applies one MQTT publish. Unrelated topics are ignored.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
            warn!(
                "dropping oversized MQTT payload on topic {topic} ({} bytes)",
                payload.len()
            );
            return Ok(());
        }

        let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;
        let value = message
            .trim()
            .parse::<f32>()
            .with_context(|| format!("invalid temperature '{message}' on {topic}"))?;
        if !value.is_finite() || !(-50.0..=100.0).contains(&value) {
            warn!("ignoring out of range temperature {value} on {topic}");
            return Ok(());
        }

        if topic == TOPIC_OUTSIDE_TEMP {
            self.record_outside(value);
        } else if let Some(sensor_id) = sensor_id_from_topic(topic) {
            self.record(sensor_id, value);
        }
        Ok(())
    }
}

/// One configured inside sensor, read through the hub.
#[derive(Debug, Clone)]
pub struct MqttSensor {
    id: String,
    hub: SensorHub,
}

impl MqttSensor {
    pub fn new(id: impl Into<String>, hub: SensorHub) -> Self {
        Self { id: id.into(), hub }
    }
}

impl TemperatureSensor for MqttSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn read_ambient_temperature(&self) -> Result<f32, SensorError> {
        self.hub
            .latest(&self.id)
            .ok_or_else(|| SensorError::NoTemperature(self.id.clone()))
    }
}

pub fn find_sensors(
    config: &SensorConfig,
    hub: &SensorHub,
) -> Result<Vec<MqttSensor>, AggregatorError> {
    if config.ids.is_empty() {
        return Err(AggregatorError::NoSensors);
    }
    Ok(config
        .ids
        .iter()
        .map(|id| MqttSensor::new(id.as_str(), hub.clone()))
        .collect())
}

/// Reads with up to `attempts` tries, sleeping `retry_delay` between them.
pub async fn read_with_retries<S: TemperatureSensor + ?Sized>(
    sensor: &S,
    attempts: u32,
    retry_delay: Duration,
) -> Result<f32, SensorError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match sensor.read_ambient_temperature() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                debug!("{err}, attempt {attempt} of {attempts}");
                attempt += 1;
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Polls every sensor once and folds the results into the aggregator.
///
/// Returns the new inside temperature, or an error once no sensor is left.
pub async fn poll_sensors<S: TemperatureSensor>(
    sensors: &[S],
    config: &SensorConfig,
    aggregator: &mut TemperatureAggregator,
) -> Result<Option<f32>, AggregatorError> {
    let retry_delay = Duration::from_millis(config.retry_delay_ms);
    for sensor in sensors {
        match read_with_retries(sensor, config.read_attempts, retry_delay).await {
            Ok(value) => {
                aggregator.update(sensor.id(), value);
            }
            Err(err) => match aggregator.record_failure(sensor.id()) {
                FailureOutcome::Retained { failures } => {
                    warn!("{err} ({failures} consecutive failures)");
                }
                FailureOutcome::Dropped { alert: true } => {
                    error!(alert = true, "sensor {} disconnected", sensor.id());
                }
                FailureOutcome::Dropped { alert: false } => {
                    debug!("sensor {} still disconnected", sensor.id());
                }
            },
        }
    }

    aggregator.ensure_available()?;
    Ok(aggregator.current())
}
