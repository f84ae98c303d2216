use crate::error::{CollectdError, Result};
use async_trait::async_trait;
use std::path::Path;

/// Tells the collectd process to pick up a rewritten config file.
///
/// Process supervision itself lives outside the agent; a hook only has to
/// trigger it and report whether that worked.
#[async_trait]
pub trait ReloadHook: Send + Sync {
    async fn reload(&self, config_path: &Path) -> Result<()>;
}

/// Does nothing. Used when collectd watches its own config or when no
/// collectd-backed monitor is configured.
pub struct NoopReload;

#[async_trait]
impl ReloadHook for NoopReload {
    async fn reload(&self, _config_path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Runs a shell command, exposing the config path as
/// `TELEMON_COLLECTD_CONFIG`.
pub struct CommandReload {
    command: String,
}

impl CommandReload {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ReloadHook for CommandReload {
    async fn reload(&self, config_path: &Path) -> Result<()> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("TELEMON_COLLECTD_CONFIG", config_path)
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CollectdError::Reload(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Picks the hook matching the configured reload command.
pub fn build_reload_hook(command: Option<&str>) -> Box<dyn ReloadHook> {
    match command {
        Some(cmd) if !cmd.trim().is_empty() => Box::new(CommandReload::new(cmd)),
        _ => Box::new(NoopReload),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_reload_sees_config_path() -> anyhow::Result<()> {
        let hook = CommandReload::new("test \"$TELEMON_COLLECTD_CONFIG\" = /tmp/collectd.conf");
        hook.reload(Path::new("/tmp/collectd.conf")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn failing_command_is_reported() {
        let hook = CommandReload::new("echo boom >&2; exit 3");
        let err = hook.reload(Path::new("/tmp/x")).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
