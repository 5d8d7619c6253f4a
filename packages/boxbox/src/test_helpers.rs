use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use session_relay::{Relay, SessionRegistry};

use crate::AppState;
use crate::auth::{AuthState, create_access_token};
use crate::config::{
    AuthConfig, BoxboxConfig, ServerConfig, ServerFileConfig, Settings, TelemetryConfig,
};
use crate::db::{Database, NewUser, User};
use crate::metrics::ServerMetrics;
use crate::telemetry::TelemetryService;

pub const TEST_SECRET: &str = "test-secret-key-that-is-long-enough!";

/// Build a fully-wired `AppState` backed by an in-memory SQLite database.
///
/// Telemetry is simulated without Redis and polled every 20ms. Callers
/// must hold the returned `TempDir` for the lifetime of the test.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let layout = BoxboxConfig::new(Some(tmp.path().to_path_buf())).expect("layout");

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    crate::db::run_migrations(&pool).await.expect("migrations");
    let db = Arc::new(Database { pool });

    let settings = Settings {
        server: ServerConfig::from_file(&ServerFileConfig::default()),
        auth: AuthConfig {
            secret_key: TEST_SECRET.to_string(),
            access_token_ttl: Duration::from_secs(1800),
        },
        telemetry: TelemetryConfig {
            poll_interval: Duration::from_millis(20),
            simulate: true,
            send_queue_capacity: 64,
            redis_url: None,
            cache_ttl: Duration::from_secs(3600),
        },
        database_url: layout.db_url(),
    };

    let telemetry = Arc::new(TelemetryService::new(&settings.telemetry).expect("telemetry"));
    let auth = AuthState {
        db: db.clone(),
        auth_config: Arc::new(settings.auth.clone()),
    };

    let state = AppState {
        settings: Arc::new(settings),
        metrics: Arc::new(ServerMetrics::new()),
        db,
        relay: Arc::new(Relay::new(Arc::new(SessionRegistry::new()))),
        telemetry,
        auth,
    };

    (state, tmp)
}

pub async fn create_user(state: &AppState, username: &str) -> User {
    state
        .db
        .create_user(&NewUser::active(username, format!("{username}@example.com")))
        .await
        .expect("create user")
}

pub fn token_for(auth: &AuthState, user_id: i64) -> String {
    create_access_token(
        user_id,
        &auth.auth_config.secret_key,
        auth.auth_config.access_token_ttl,
    )
    .expect("token")
}

pub async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&body).expect("json body")
}

/// Serve the full router on an ephemeral port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = crate::build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}
