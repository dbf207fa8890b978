use serde::{Deserialize, Serialize};

/// Constants consumed by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatingConfig {
    pub minimum_temperature: f32,
    pub proportional_heating_interval_minutes: u32,
    pub minimum_active_period_minutes: u32,
    pub minutes_per_degree: f32,
    pub effect_delay_minutes: f32,
    /// Deficit-to-duty divisor: `duty = deficit * interval / divisor`.
    pub proportional_divisor: f32,
    /// Warm-up deficits above this run at full duty.
    pub warmup_full_duty_threshold: f32,
    pub max_events: usize,
}

impl Default for HeatingConfig {
    fn default() -> Self {
        Self {
            minimum_temperature: 9.0,
            proportional_heating_interval_minutes: 20,
            minimum_active_period_minutes: 8,
            minutes_per_degree: 25.0,
            effect_delay_minutes: 20.0,
            proportional_divisor: 2.0,
            warmup_full_duty_threshold: 0.3,
            max_events: 3,
        }
    }
}

impl HeatingConfig {
    pub fn sanitize(&mut self) {
        self.proportional_heating_interval_minutes =
            self.proportional_heating_interval_minutes.clamp(1, 240);
        self.minimum_active_period_minutes = self
            .minimum_active_period_minutes
            .min(self.proportional_heating_interval_minutes);

        if !self.minimum_temperature.is_finite() {
            self.minimum_temperature = 9.0;
        }
        if !self.minutes_per_degree.is_finite() || self.minutes_per_degree < 0.0 {
            self.minutes_per_degree = 0.0;
        }
        if !self.effect_delay_minutes.is_finite() || self.effect_delay_minutes < 0.0 {
            self.effect_delay_minutes = 0.0;
        }
        if !self.proportional_divisor.is_finite() || self.proportional_divisor <= 0.0 {
            self.proportional_divisor = 2.0;
        }
        if !self.warmup_full_duty_threshold.is_finite() {
            self.warmup_full_duty_threshold = 0.3;
        }
        self.max_events = self.max_events.clamp(1, 10);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub ids: Vec<String>,
    pub read_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_failures: u32,
    pub stale_seconds: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            read_attempts: 4,
            retry_delay_ms: 1_000,
            max_failures: 3,
            stale_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Candidate hidraw nodes; exactly one must be present.
    pub devices: Vec<String>,
    pub heating_channel: u8,
    pub preheat_channel: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            devices: vec!["/dev/hidraw0".to_string()],
            heating_channel: 1,
            preheat_channel: 2,
        }
    }
}

impl RelayConfig {
    pub fn sanitize(&mut self) {
        if !(1..=8).contains(&self.heating_channel) {
            self.heating_channel = 1;
        }
        if !(1..=8).contains(&self.preheat_channel) || self.preheat_channel == self.heating_channel
        {
            self.preheat_channel = if self.heating_channel == 2 { 1 } else { 2 };
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub calendar_id: String,
    pub events_path: String,
    pub webhook_channel_id: String,
    pub fetch_timeout_seconds: u64,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            calendar_id: "primary".to_string(),
            events_path: "events.json".to_string(),
            webhook_channel_id: String::new(),
            fetch_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub heating: HeatingConfig,
    pub update_temperature_interval_seconds: u64,
    pub update_calendar_interval_seconds: u64,
    pub process_interval_seconds: u64,
    pub sensors: SensorConfig,
    pub relay: RelayConfig,
    pub calendar: CalendarConfig,
    pub network: NetworkConfig,
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heating: HeatingConfig::default(),
            update_temperature_interval_seconds: 60,
            update_calendar_interval_seconds: 30,
            process_interval_seconds: 60,
            sensors: SensorConfig::default(),
            relay: RelayConfig::default(),
            calendar: CalendarConfig::default(),
            network: NetworkConfig::default(),
            timezone: "Europe/London".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.heating.sanitize();
        self.relay.sanitize();
        self.update_temperature_interval_seconds =
            self.update_temperature_interval_seconds.clamp(5, 3_600);
        self.update_calendar_interval_seconds =
            self.update_calendar_interval_seconds.clamp(5, 3_600);
        self.process_interval_seconds = self.process_interval_seconds.clamp(5, 3_600);
        self.sensors.read_attempts = self.sensors.read_attempts.max(1);
        self.sensors.max_failures = self.sensors.max_failures.max(1);
        self.calendar.fetch_timeout_seconds = self.calendar.fetch_timeout_seconds.clamp(1, 120);
    }
}
