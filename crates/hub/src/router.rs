//! Pure dispatch over incoming bus messages. Reserved suffixes win
//! over payload inspection; everything else must be a JSON object to
//! reach the reconciler.

use crate::mqtt;

#[derive(Debug)]
pub(crate) enum Route {
    /// `.../gettime` — reply with a localized timestamp.
    TimeQuery,
    /// `.../startup` — provisioning handshake entry point.
    Startup,
    /// Free-form telemetry keyed by device name.
    Telemetry(serde_json::Map<String, serde_json::Value>),
    /// Not routable; the reason is logged by the caller.
    Discard(String),
}

pub(crate) fn route(topic: &str, payload: &[u8]) -> Route {
    if mqtt::is_time_query(topic) {
        return Route::TimeQuery;
    }
    if mqtt::is_startup(topic) {
        return Route::Startup;
    }
    match mqtt::parse_object(payload) {
        Ok(map) => Route::Telemetry(map),
        Err(reason) => Route::Discard(reason),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
