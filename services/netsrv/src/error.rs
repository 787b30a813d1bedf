use thiserror::Error;

/// Result type for netsrv
pub type Result<T> = std::result::Result<T, NetsrvError>;

/// Errors that can occur in netsrv
#[derive(Error, Debug)]
pub enum NetsrvError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown serializer: {0}")]
    UnknownSerializer(String),

    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error("Format error: {0}")]
    FormatError(String),

    #[error("Invalid input: {0}")]
    InputError(String),

    #[error(transparent)]
    Buffer(#[from] voltage_buffer::BufferError),
}

impl From<voltage_buffer::ConfigError> for NetsrvError {
    fn from(err: voltage_buffer::ConfigError) -> Self {
        NetsrvError::Buffer(err.into())
    }
}

impl From<serde_json::Error> for NetsrvError {
    fn from(err: serde_json::Error) -> Self {
        NetsrvError::FormatError(err.to_string())
    }
}
