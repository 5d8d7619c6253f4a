//! Telemetry source for the telemetry stream.
//!
//! Reads `telemetry:{session}[:{driver}]` from Redis. When nothing is cached
//! and simulation is on, a synthetic payload is generated and written back
//! with the configured TTL, so every stream on the session sees the same data
//! until it expires.
//!
//! All streams share one Redis connection manager, opened on first use and
//! reconnected by the manager itself.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::seq::IndexedRandom;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult};
use serde_json::{Value, json};
use session_relay::TelemetryProvider;
use session_relay::message::format_timestamp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::config::TelemetryConfig;

const SIMULATED_POINTS: i64 = 10;
const SIMULATED_LAPS: i64 = 50;
const TIRE_COMPOUNDS: [&str; 3] = ["soft", "medium", "hard"];

pub fn cache_key(session_id: &str, driver_id: Option<&str>) -> String {
    match driver_id {
        Some(driver) => format!("telemetry:{session_id}:{driver}"),
        None => format!("telemetry:{session_id}"),
    }
}

pub struct TelemetryService {
    redis: Option<Client>,
    manager: OnceCell<ConnectionManager>,
    /// Cleared on the first Redis failure so repeats log at debug
    redis_healthy: AtomicBool,
    cache_ttl: Duration,
    simulate: bool,
}

impl TelemetryService {
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let redis = config
            .redis_url
            .as_deref()
            .map(|url| Client::open(url).with_context(|| format!("Invalid redis url: {url}")))
            .transpose()?;
        Ok(Self {
            redis,
            manager: OnceCell::new(),
            redis_healthy: AtomicBool::new(true),
            cache_ttl: config.cache_ttl,
            simulate: config.simulate,
        })
    }

    /// Read a cached payload. Redis failures are logged and read as a miss.
    pub async fn cached(&self, session_id: &str, driver_id: Option<&str>) -> Option<Value> {
        let client = self.redis.as_ref()?;
        let key = cache_key(session_id, driver_id);

        let result: RedisResult<Option<String>> = async {
            let mut conn = self.connection(client).await?;
            conn.get(&key).await
        }
        .await;
        self.record_redis(&key, "getting cached telemetry", &result);

        match result {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!(key = %key, "Cached telemetry is not valid JSON: {}", e);
                    None
                }
            },
            Ok(None) | Err(_) => None,
        }
    }

    /// Write a payload with the configured TTL. Returns false when nothing was stored.
    pub async fn cache(&self, session_id: &str, driver_id: Option<&str>, payload: &Value) -> bool {
        let Some(client) = self.redis.as_ref() else {
            return false;
        };
        let key = cache_key(session_id, driver_id);
        let ttl = self.cache_ttl.as_secs().max(1);

        let result: RedisResult<()> = async {
            let mut conn = self.connection(client).await?;
            conn.set_ex(&key, payload.to_string(), ttl).await
        }
        .await;
        self.record_redis(&key, "caching telemetry", &result);

        if result.is_ok() {
            debug!(key = %key, ttl_seconds = ttl, "Telemetry cached");
        }
        result.is_ok()
    }

    /// The shared connection manager. A failed first connect is retried on the next call.
    async fn connection(&self, client: &Client) -> RedisResult<ConnectionManager> {
        self.manager
            .get_or_try_init(|| ConnectionManager::new(client.clone()))
            .await
            .cloned()
    }

    fn record_redis<T>(&self, key: &str, action: &str, result: &RedisResult<T>) {
        match result {
            Ok(_) => {
                if !self.redis_healthy.swap(true, Ordering::Relaxed) {
                    info!("Redis reachable again");
                }
            }
            Err(e) => {
                if self.redis_healthy.swap(false, Ordering::Relaxed) {
                    error!(key = %key, "Redis error when {}: {}", action, e);
                } else {
                    debug!(key = %key, "Redis still failing when {}: {}", action, e);
                }
            }
        }
    }
}

#[async_trait]
impl TelemetryProvider for TelemetryService {
    async fn fetch_live(&self, session_id: &str, driver_id: Option<&str>) -> Option<Value> {
        if let Some(cached) = self.cached(session_id, driver_id).await {
            return Some(cached);
        }
        if !self.simulate {
            return None;
        }
        let payload = simulate_telemetry(session_id, driver_id);
        self.cache(session_id, driver_id, &payload).await;
        Some(payload)
    }

    async fn fetch_cached(&self, session_id: &str, driver_id: Option<&str>) -> Option<Value> {
        self.cached(session_id, driver_id).await
    }
}

/// A synthetic telemetry payload: the last ten one-second samples of a car.
pub fn simulate_telemetry(session_id: &str, driver_id: Option<&str>) -> Value {
    let mut rng = rand::rng();
    let now = Utc::now();

    let points: Vec<Value> = (0..SIMULATED_POINTS)
        .map(|i| {
            let braking = rng.random_bool(0.3);
            json!({
                "timestamp": format_timestamp(now - chrono::Duration::seconds(i)),
                "speed": rng.random_range(80.0..320.0),
                "throttle": rng.random_range(0.0..100.0),
                "brake": if braking { rng.random_range(0.0..100.0) } else { 0.0 },
                "gear": rng.random_range(1..=8),
                "rpm": rng.random_range(5000.0..12000.0),
                "drs": u8::from(rng.random_bool(0.2)),
                "position_x": rng.random_range(0.0..1000.0),
                "position_y": rng.random_range(0.0..1000.0),
                "position_z": rng.random_range(-10.0..10.0),
                "tire_compound": TIRE_COMPOUNDS.choose(&mut rng).copied().unwrap_or("medium"),
                "tire_life": rng.random_range(30.0..100.0),
                "sector": rng.random_range(1..=3),
                "lap": rng.random_range(1..=SIMULATED_LAPS),
            })
        })
        .collect();

    json!({
        "session_id": session_id,
        "driver_id": driver_id,
        "data": points,
        "lap_count": SIMULATED_LAPS,
        "current_lap": rng.random_range(1..=SIMULATED_LAPS),
        "last_update": format_timestamp(now),
    })
}
