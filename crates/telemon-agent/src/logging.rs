use anyhow::Context;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogConfig {
    /// Level for the agent's own targets (trace, debug, info, warn, error).
    /// `RUST_LOG` still controls everything else.
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit one JSON object per line instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

impl LogConfig {
    fn filter(&self) -> anyhow::Result<EnvFilter> {
        let level: LevelFilter = self
            .level
            .parse()
            .with_context(|| format!("invalid log level {:?}", self.level))?;
        let directive = format!("telemon={level}").parse()?;
        Ok(EnvFilter::from_default_env().add_directive(directive))
    }
}

/// Installs the global subscriber. Call once, before anything logs.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = config.filter()?;
    let layer = if config.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    tracing_subscriber::registry().with(filter).with(layer).init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_level() {
        let config = LogConfig {
            level: "loud".into(),
            json: false,
        };
        assert!(config.filter().is_err());
        assert!(LogConfig::default().filter().is_ok());
    }
}
