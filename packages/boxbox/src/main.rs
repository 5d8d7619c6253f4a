use anyhow::{Context, Result};
use axum::{
    Router,
    extract::FromRef,
    http::HeaderValue,
    routing::get,
};
use clap::{Parser, Subcommand};
use session_relay::{ALL_SESSIONS, Relay, SessionRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod config;
mod db;
mod handlers;
mod metrics;
mod telemetry;
#[cfg(test)]
mod test_helpers;

use crate::auth::AuthState;
use crate::config::{AuthConfig, BoxboxConfig, FileConfig, Settings, load_config};
use crate::db::{Database, NewUser};
use crate::metrics::ServerMetrics;
use crate::telemetry::TelemetryService;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "boxbox")]
#[command(about = "Live F1 telemetry and session broadcast server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.boxbox)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server in the foreground (default)
    Server(ServerArgs),

    /// Mint an access token for a user, signed with the configured secret
    Token(TokenArgs),

    /// Add a user to the directory
    CreateUser(CreateUserArgs),
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Host to bind to (overrides server.host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the web server (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Human-readable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Config file (defaults to <data-dir>/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Parser)]
struct TokenArgs {
    /// User id to put in the token subject
    #[arg(long)]
    user_id: i64,

    /// Lifetime in minutes (defaults to auth.access_token_expire_minutes)
    #[arg(long)]
    minutes: Option<u64>,

    /// Config file (defaults to <data-dir>/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Parser)]
struct CreateUserArgs {
    #[arg(long)]
    username: String,

    #[arg(long)]
    email: String,

    /// Grant superuser rights
    #[arg(long)]
    superuser: bool,

    /// Config file (defaults to <data-dir>/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Validated runtime configuration
    pub settings: Arc<Settings>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
    pub relay: Arc<Relay>,
    pub telemetry: Arc<TelemetryService>,
    pub auth: AuthState,
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let layout = BoxboxConfig::new(cli.data_dir)?;

    match cli.command {
        None => run_server(ServerArgs::default(), layout).await,
        Some(Commands::Server(args)) => run_server(args, layout).await,
        Some(Commands::Token(args)) => mint_token(args, &layout),
        Some(Commands::CreateUser(args)) => add_user(args, &layout).await,
    }
}

fn load_file_config(layout: &BoxboxConfig, config_file: Option<&Path>) -> Result<FileConfig> {
    load_config(&layout.data_dir, config_file)
        .extract()
        .context("Invalid configuration")
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "boxbox=debug,session_relay=debug,tower_http=debug,info"
    } else {
        "boxbox=info,session_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    let registry = tracing_subscriber::registry().with(env_filter);
    if debug {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}

pub(crate) fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.server.cors_origins);

    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/protected", get(handlers::protected_handler))
        // Streaming routes
        .route(
            "/api/v1/ws/telemetry/{session_id}",
            get(handlers::telemetry_websocket_handler),
        )
        .route(
            "/api/v1/ws/broadcast/{session_id}",
            get(handlers::broadcast_websocket_handler).post(handlers::broadcast_handler),
        )
        .route("/api/v1/ws/sessions", get(handlers::list_sessions_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(cors)
        .with_state(state)
}

async fn run_server(args: ServerArgs, layout: BoxboxConfig) -> Result<()> {
    let mut file_config = load_file_config(&layout, args.config.as_deref())?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    file_config.server.debug |= args.debug;

    let settings = Arc::new(Settings::from_file(&file_config, &layout)?);

    init_logging(settings.server.debug);
    info!("Starting BoxBoxBox telemetry server");
    info!(
        "Config file: {}",
        args.config
            .unwrap_or_else(|| layout.config_toml_path())
            .display()
    );
    info!(
        "Telemetry: poll every {}ms, simulate={}, cache={}",
        settings.telemetry.poll_interval.as_millis(),
        settings.telemetry.simulate,
        if settings.telemetry.redis_url.is_some() {
            "redis"
        } else {
            "disabled"
        }
    );

    let db = Arc::new(Database::connect(&settings.database_url).await?);
    let telemetry = Arc::new(TelemetryService::new(&settings.telemetry)?);
    let relay = Arc::new(Relay::new(Arc::new(SessionRegistry::new())));

    let auth = AuthState {
        db: db.clone(),
        auth_config: Arc::new(settings.auth.clone()),
    };

    let app_state = AppState {
        settings: settings.clone(),
        metrics: Arc::new(ServerMetrics::new()),
        db,
        relay: relay.clone(),
        telemetry,
        auth,
    };

    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(settings.server.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.bind_addr()))?;
    let actual_addr = listener.local_addr()?;

    info!("BoxBoxBox listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/v1/ws/telemetry/{{session_id}}  - Telemetry stream (WebSocket)");
    info!("  GET    /api/v1/ws/broadcast/{{session_id}}  - Broadcast channel (WebSocket)");
    info!("  POST   /api/v1/ws/broadcast/{{session_id}}  - Broadcast to a session");
    info!("  GET    /api/v1/ws/sessions                - Live sessions");

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, closing live connections...");
        let live = relay.registry().members(ALL_SESSIONS).await;
        for conn in &live {
            conn.close();
        }
        info!("Closed {} connections", live.len());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}

fn mint_token(args: TokenArgs, layout: &BoxboxConfig) -> Result<()> {
    let file_config = load_file_config(layout, args.config.as_deref())?;
    let auth = AuthConfig::from_file(&file_config.auth)?;
    let ttl = args
        .minutes
        .map(|m| Duration::from_secs(m * 60))
        .unwrap_or(auth.access_token_ttl);

    let token = auth::create_access_token(args.user_id, &auth.secret_key, ttl)?;
    println!("{token}");
    Ok(())
}

async fn add_user(args: CreateUserArgs, layout: &BoxboxConfig) -> Result<()> {
    let file_config = load_file_config(layout, args.config.as_deref())?;
    let database_url = file_config
        .database
        .url
        .clone()
        .unwrap_or_else(|| layout.db_url());
    let db = Database::connect(&database_url).await?;

    let user = db
        .create_user(&NewUser {
            is_superuser: args.superuser,
            ..NewUser::active(args.username, args.email)
        })
        .await?;
    println!("Created user {} (id {})", user.username, user.id);
    Ok(())
}
