use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("setpoint storage unavailable: {0}")]
    Unavailable(String),
    #[error("setpoint storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("persisted setpoint record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote backend is not authenticated or not ready")]
    NotReady,
    #[error("failed to encode remote payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid payload on {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },
    #[error("remote transport error: {0}")]
    Transport(String),
}
