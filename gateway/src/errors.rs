use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Transport(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(String),

    #[error("Timed out after {0}s waiting for the broker to accept the connection")]
    ConnectTimeout(u64),

    #[error("Station link is not connected")]
    NotConnected,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    /// Failures on the wire, as opposed to caller mistakes.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Connection(_) | Error::ConnectTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
