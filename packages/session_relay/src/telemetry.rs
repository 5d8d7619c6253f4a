use async_trait::async_trait;
use serde_json::Value;

/// Source of telemetry payloads for the telemetry stream.
///
/// Both lookups may return nothing; the stream treats that as "no update".
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    /// Latest data for a session, optionally narrowed to one driver.
    async fn fetch_live(&self, session_id: &str, driver_id: Option<&str>) -> Option<Value>;

    /// Previously cached data, delivered once when a stream opens.
    async fn fetch_cached(&self, session_id: &str, driver_id: Option<&str>) -> Option<Value>;
}
