//! Built-in plugins shipped with the framework.

mod app_services;
mod env_var;
mod gpu;
mod ion_memory;
mod local_time;
mod logging;
mod multicast_sockets;
mod storage;

pub use app_services::AppServicesPlugin;
pub use env_var::EnvVarPlugin;
pub use gpu::GpuPlugin;
pub use ion_memory::IonMemoryPlugin;
pub use local_time::LocalTimePlugin;
pub use logging::LoggingPlugin;
pub use multicast_sockets::MulticastSocketsPlugin;
pub use storage::StoragePlugin;

use crate::registry::PluginRegistry;
use anyhow::Result;

/// Register every built-in plugin. The registration order is the tie-break
/// order for dependency-free plugins at dispatch time.
pub fn register_builtins(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(LoggingPlugin::NAME, LoggingPlugin::construct)?;
    registry.register(EnvVarPlugin::NAME, EnvVarPlugin::construct)?;
    registry.register(LocalTimePlugin::NAME, LocalTimePlugin::construct)?;
    registry.register(GpuPlugin::NAME, GpuPlugin::construct)?;
    registry.register(IonMemoryPlugin::NAME, IonMemoryPlugin::construct)?;
    registry.register(StoragePlugin::NAME, StoragePlugin::construct)?;
    registry.register(MulticastSocketsPlugin::NAME, MulticastSocketsPlugin::construct)?;
    registry.register(AppServicesPlugin::NAME, AppServicesPlugin::construct)?;
    Ok(())
}
