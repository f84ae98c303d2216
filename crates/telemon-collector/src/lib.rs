//! Monitor types linked into the agent.
//!
//! Host-wide collectors (CPU, memory, disk, network, load) implement
//! [`Collector`] and are driven by [`host::IntervalMonitor`]. Endpoint
//! monitors either measure directly ([`tcp`]) or hand collection to the shared
//! collectd process ([`collectd`]).

pub mod collectd;
pub mod cpu;
pub mod disk;
pub mod host;
pub mod load;
pub mod memory;
pub mod network;
pub mod tcp;

use anyhow::Result;
use serde::de::DeserializeOwned;
use telemon_common::types::Datapoint;
use telemon_monitor::error::RegistryError;
use telemon_monitor::registry::MonitorRegistry;

/// A host metric source polled at the monitor's interval.
pub trait Collector: Send {
    /// Returns the collector name (e.g., `"cpu"`, `"disk"`), used for logging.
    fn name(&self) -> &str;

    /// Collects current metric values.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system API call fails.
    fn collect(&mut self) -> Result<Vec<Datapoint>>;
}

/// A [`Collector`] that can be configured from a monitor entry.
pub trait HostCollector: Collector + Sized + 'static {
    const MONITOR_TYPE: &'static str;
    type Config: DeserializeOwned + Send;

    fn new(config: Self::Config) -> Self;
}

/// Registers every built-in monitor type.
///
/// # Examples
///
/// ```
/// use telemon_monitor::registry::MonitorRegistry;
///
/// let mut registry = MonitorRegistry::new();
/// telemon_collector::register_builtin(&mut registry).unwrap();
/// assert!(registry.has_type("cpu"));
/// assert!(registry.has_type("collectd/redis"));
/// assert!(telemon_collector::register_builtin(&mut registry).is_err());
/// ```
pub fn register_builtin(registry: &mut MonitorRegistry) -> std::result::Result<(), RegistryError> {
    registry.register(Box::new(host::HostPlugin::<cpu::CpuCollector>::new()))?;
    registry.register(Box::new(host::HostPlugin::<memory::MemoryCollector>::new()))?;
    registry.register(Box::new(host::HostPlugin::<disk::DiskCollector>::new()))?;
    registry.register(Box::new(host::HostPlugin::<network::NetworkCollector>::new()))?;
    registry.register(Box::new(host::HostPlugin::<load::LoadCollector>::new()))?;
    registry.register(Box::new(tcp::TcpPlugin))?;
    registry.register(Box::new(collectd::CollectdPlugin::redis()))?;
    registry.register(Box::new(collectd::CollectdPlugin::memcached()))?;
    registry.register(Box::new(collectd::CollectdPlugin::apache()))?;
    Ok(())
}
