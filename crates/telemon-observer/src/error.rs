/// Errors raised by observers while discovering endpoints.
///
/// These never reach the reconciler: the feed logs them and retries the
/// observer with backoff, keeping the last known endpoint set.
///
/// # Examples
///
/// ```rust
/// use telemon_observer::error::ObserverError;
///
/// let err = ObserverError::InvalidConfig("static endpoint without host".to_string());
/// assert!(err.to_string().contains("without host"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// Reading the discovery source failed.
    #[error("Observer: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The discovery source returned data that could not be decoded.
    #[error("Observer: failed to parse {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    /// Observer configuration is missing a required field or holds an invalid value.
    #[error("Observer: invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience `Result` alias for observer operations.
pub type Result<T> = std::result::Result<T, ObserverError>;
