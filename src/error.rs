//! Error types for the fusion network crate.
//!
//! All fallible public APIs use the [`Result`] alias wrapping [`FusionError`].
//! Configuration problems are detected at construction time and surface as
//! [`FusionError::ConfigError`]; tensor shape mismatches during a forward
//! call are raised by libtorch itself and are fatal for that call.

use thiserror::Error;

/// Errors that can occur when configuring or assembling the network.
///
/// # Error Categories
///
/// - **Configuration errors** ([`ConfigError`]): invalid construction-time
///   parameters (user error, fixable). Raised by [`crate::FusionConfig::validate`]
///   and by module constructors before any variables are registered.
/// - **I/O errors** ([`IoError`]): reading a configuration file failed.
/// - **Parse errors** ([`ParseError`]): a configuration file is not valid JSON
///   or does not match the expected schema.
///
/// [`ConfigError`]: FusionError::ConfigError
/// [`IoError`]: FusionError::IoError
/// [`ParseError`]: FusionError::ParseError
#[derive(Error, Debug)]
pub enum FusionError {
    /// Invalid construction-time configuration
    ///
    /// Common causes:
    /// - embedding dimension not divisible by the head count
    /// - per-stage vector length not matching the stage count
    /// - dropout probability outside `[0, 1)`
    #[error("invalid configuration: {reason}")]
    ConfigError {
        /// Description of what is invalid in the configuration
        reason: String,
    },

    /// Reading a configuration file failed
    #[error("config file error: {0}")]
    IoError(#[from] std::io::Error),

    /// Deserializing a configuration failed
    #[error("config parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl FusionError {
    /// Shorthand for a [`FusionError::ConfigError`].
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Returns true if this error is a configuration error (user-fixable).
    #[inline]
    #[must_use = "this method returns a boolean, not modifying the error"]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError { .. })
    }
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = FusionError::config("embed_dim 65 not divisible by 8 heads");
        assert_eq!(
            err.to_string(),
            "invalid configuration: embed_dim 65 not divisible by 8 heads"
        );
        assert!(err.is_config_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: FusionError = io.into();
        assert!(!err.is_config_error());
        assert!(err.to_string().contains("no such file"));
    }
}
