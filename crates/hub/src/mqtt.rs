use serde::Deserialize;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Boot event published by a controller on `<topic>/startup`.
#[derive(Debug, Deserialize)]
pub(crate) struct StartupMsg {
    #[serde(rename = "IP")]
    pub(crate) ip: String,
    /// Optional override of the topic root derived from the message topic.
    pub(crate) topic: Option<String>,
    /// Uptime in seconds since the controller booted.
    #[serde(default)]
    pub(crate) online: Option<i64>,
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Reserved suffix for time queries.
pub(crate) const GETTIME_SUFFIX: &str = "/gettime";
/// Reserved suffix for boot events.
pub(crate) const STARTUP_SUFFIX: &str = "/startup";

/// Controller identity is the first three non-empty topic segments,
/// "flat/room/controller".
pub(crate) fn root_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|part| !part.is_empty())
        .take(3)
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn is_time_query(topic: &str) -> bool {
    topic.ends_with(GETTIME_SUFFIX)
}

pub(crate) fn is_startup(topic: &str) -> bool {
    topic.ends_with(STARTUP_SUFFIX)
}

/// Parse a telemetry payload into a JSON object. Anything that is not
/// valid JSON or not a key/value structure is rejected.
pub(crate) fn parse_object(
    payload: &[u8],
) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("payload is not a JSON object: {other}")),
        Err(e) => Err(format!("payload is not valid JSON: {e}")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
