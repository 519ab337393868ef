/*!
Common error types for the SEM acquisition components.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, SharedError>;

/// Comprehensive error type for all shared operations
#[derive(Error, Debug)]
pub enum SharedError {
    /// Wire message decoding errors
    #[error("Wire error: {0}")]
    Wire(#[from] crate::message::WireError),

    /// Stereo combination errors
    #[error("Stereo error: {0}")]
    Stereo(#[from] crate::stereo::StereoError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Invalid session geometry or state
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// Stored image does not match the session it is loaded into
    #[error("Invalid stored image: {0}")]
    InvalidStoredImage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SharedError {
    /// Create a new invalid session error
    pub fn invalid_session(msg: impl Into<String>) -> Self {
        Self::InvalidSession(msg.into())
    }

    /// Create a new invalid stored image error
    pub fn invalid_stored_image(msg: impl Into<String>) -> Self {
        Self::InvalidStoredImage(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
