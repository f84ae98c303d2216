/// Errors raised while generating, writing or reloading the collectd
/// configuration, or while serving the ingest listener.
///
/// # Examples
///
/// ```rust
/// use telemon_collectd::error::CollectdError;
///
/// let err = CollectdError::InvalidRule("empty metric name".to_string());
/// assert!(err.to_string().contains("empty metric name"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CollectdError {
    /// Reading or writing the generated configuration failed.
    #[error("Collectd: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Renaming the temporary file over the live configuration failed.
    #[error("Collectd: failed to replace config file: {0}")]
    Persist(#[from] tempfile::PersistError),

    /// The reload hook reported a failure.
    #[error("Collectd: reload failed: {0}")]
    Reload(String),

    /// An allow-list entry could not be turned into a match rule.
    #[error("Collectd: invalid filter rule: {0}")]
    InvalidRule(String),

    /// The configuration manager task is no longer running.
    #[error("Collectd: config manager stopped")]
    ManagerStopped,
}

/// Convenience `Result` alias for collectd operations.
pub type Result<T> = std::result::Result<T, CollectdError>;
