//! Generated configuration for a collectd subprocess shared by every
//! collectd-backed monitor instance.
//!
//! Each instance contributes a plugin block plus a [`rules::FilterChain`].
//! The [`manager::CollectdManager`] renders them into one file, rewrites it
//! atomically when it changes and runs the reload hook; [`ingest`] receives
//! the data collectd posts back and routes it by the `monitorID` tag.

pub mod config;
pub mod error;
pub mod ingest;
pub mod manager;
pub mod reload;
pub mod rules;

pub use config::{CollectdSettings, ManagedInstance};
pub use manager::{CollectdHandle, CollectdManager, DatapointRoute};
