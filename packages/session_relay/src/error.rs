use crate::connection::ConnectionId;

/// Why a frame could not be handed to a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The connection is not open (still connecting, closing or closed).
    #[error("connection {0} is not open")]
    Closed(ConnectionId),
    /// The outbound queue is full; the frame was dropped.
    #[error("send queue full for connection {0}")]
    Lagging(ConnectionId),
    /// The transport writer is gone. The connection has been moved to `Closing`.
    #[error("transport for connection {0} has gone away")]
    Transport(ConnectionId),
}

/// Errors raised while building or parsing JSON messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("message is missing a string \"type\" field")]
    MissingType,
}
