pub mod aggregator;
pub mod config;
pub mod engine;
pub mod relay;
pub mod schedule;
pub mod topics;
pub mod triggers;
pub mod types;

pub use aggregator::{
    AggregatorError, FailureOutcome, SensorError, TemperatureAggregator, TemperatureSensor,
};
pub use config::{HeatingConfig, RuntimeConfig};
pub use engine::{Decision, HeatingEngine, HeatingState};
pub use relay::{RelayDriver, RelayError, RelayOutput};
pub use schedule::{parse_target, CalendarEntry, Schedule, ScheduleError};
pub use topics::*;
pub use triggers::TriggerSink;
pub use types::{Channel, Event, HeatingStatus, TargetSpec, TriggerKind};
