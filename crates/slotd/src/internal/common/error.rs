use thiserror::Error;

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for SlotError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<String> for SlotError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for SlotError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
