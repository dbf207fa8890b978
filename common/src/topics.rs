pub const TOPIC_SENSOR_PREFIX: &str = "heating/sensor/";
pub const TOPIC_SENSOR_SUFFIX: &str = "/temperature";
pub const TOPIC_SENSOR_WILDCARD: &str = "heating/sensor/+/temperature";
pub const TOPIC_OUTSIDE_TEMP: &str = "heating/outside/temperature";

/// Extracts the sensor id from `heating/sensor/<id>/temperature`.
pub fn sensor_id_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_SENSOR_PREFIX)?
        .strip_suffix(TOPIC_SENSOR_SUFFIX)
        .filter(|id| !id.is_empty() && !id.contains('/'))
}
