//! Reconciliation core of the agent.
//!
//! Monitor entries ([`config::MonitorConfig`]) and discovered endpoints are
//! merged ([`merge`]) into effective configs, each of which becomes one
//! [`Monitor`] instance created through the [`registry::MonitorRegistry`].
//! The [`reconciler::Reconciler`] keeps the running set equal to the
//! desired set; instances report through an [`output::Output`].

pub mod config;
pub mod error;
pub mod merge;
pub mod output;
pub mod reconciler;
pub mod registry;


use async_trait::async_trait;
use config::EffectiveConfig;

/// A running collection unit bound to one effective config.
#[async_trait]
pub trait Monitor: Send {
    /// Called exactly once, before the instance is considered running. An
    /// error discards the instance without calling [`Monitor::shutdown`].
    async fn configure(&mut self, config: &EffectiveConfig) -> anyhow::Result<()>;

    /// Releases every task, timer and connection the instance owns. Called
    /// at most once and must not block.
    fn shutdown(&mut self) {}
}
