//! Engine error types

use thiserror::Error;

/// Errors that can occur while building or running a chainsetup
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad configuration: missing endpoint, dangling chain reference, ...
    /// Surfaced synchronously from connect; never reaches the audio path.
    #[error("chainsetup error: {0}")]
    Setup(String),

    /// A device or file endpoint failed to open, start, read or write
    #[error("device error on '{label}': {message}")]
    Device { label: String, message: String },

    /// An engine invariant was violated at runtime (e.g. negative
    /// multitrack sync); the engine aborts and tears down
    #[error("runtime error: {0}")]
    Runtime(String),

    /// External cancellation (signal watchdog or quit command)
    #[error("interrupted")]
    Interrupted,

    /// A proxy ring had no data when a block was due; never fatal
    #[error("disk stream underrun on '{0}'")]
    Underrun(String),

    /// The callback server went away or changed sample rate
    #[error("audio server shut down: {0}")]
    ServerShutdown(String),
}

impl EngineError {
    /// Shorthand for device failures
    pub fn device(label: impl Into<String>, message: impl std::fmt::Display) -> Self {
        EngineError::Device {
            label: label.into(),
            message: message.to_string(),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
