use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("not authenticated")]
    Unauthenticated,

    #[error("socket is not connected")]
    NotConnected,

    #[error("message {client_id} was not delivered: {reason}")]
    SendFailed { client_id: Uuid, reason: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("local store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Failures of the link itself, which the channel retries on its own.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::WebSocket(_) | Self::Protocol(_) | Self::NotConnected
        )
    }
}
