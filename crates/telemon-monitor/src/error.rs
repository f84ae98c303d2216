/// Errors raised by the monitor registry.
///
/// # Examples
///
/// ```rust
/// use telemon_monitor::error::RegistryError;
///
/// let err = RegistryError::NotFound("nonexistent".to_string());
/// assert!(err.to_string().contains("nonexistent"));
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    /// Two monitor types were registered under the same name. This is a
    /// build defect and aborts startup.
    #[error("Registry: monitor type '{0}' registered twice")]
    Duplicate(String),

    /// No monitor type is registered under this name.
    #[error("Registry: unknown monitor type '{0}'")]
    NotFound(String),
}

/// Errors raised while splitting a raw monitor entry into its common and
/// type-specific parts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The entry is not a table/object.
    #[error("Config: monitor entry must be a table")]
    NotATable,

    /// The `type` key is missing or not a string.
    #[error("Config: monitor entry has no 'type'")]
    MissingType,

    /// A common key has the wrong shape.
    #[error("Config: invalid common field: {0}")]
    InvalidCommon(#[from] serde_json::Error),

    #[error("Config: {0}")]
    Invalid(String),
}

/// Errors contained at the boundary of a single monitor instance.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The merged configuration was rejected by the monitor type.
    #[error("Monitor: invalid config for '{monitor_type}': {message}")]
    Validation {
        monitor_type: String,
        message: String,
    },

    /// The instance's `configure` call failed.
    #[error("Monitor: '{monitor_type}' failed to start: {reason:#}")]
    Configure {
        monitor_type: String,
        reason: anyhow::Error,
    },
}

/// Convenience `Result` alias for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
