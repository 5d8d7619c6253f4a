pub mod broadcast;
pub mod health;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use broadcast::{broadcast_handler, list_sessions_handler};
pub use health::{
    health_handler, health_live_handler, health_ready_handler, metrics_handler,
    protected_handler, root_handler,
};
pub use websocket::{broadcast_websocket_handler, telemetry_websocket_handler};
