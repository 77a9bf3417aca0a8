//! GPU memory limits via the `gpu` cgroup controller.

use crate::{
    cgroup::CgroupService,
    hooks::HookMask,
    registry::HookPlugin,
    utils::{NamespaceKind, PluginUtils},
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use std::sync::Arc;

const CONTROLLER: &str = "gpu";
const LIMIT_FILE: &str = "gpu.limit_in_bytes";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpuData {
    /// GPU memory limit in bytes.
    memory: u64,
}

/// Creates a per-container sub-cgroup on the gpu controller at createRuntime,
/// applies the configured memory limit and overlays the container's view of
/// the controller. Removes the sub-cgroup at postHalt.
pub struct GpuPlugin {
    dependencies: Vec<String>,
    cgroups: CgroupService,
}

impl GpuPlugin {
    pub const NAME: &'static str = "gpu";

    pub fn construct(utils: &Arc<PluginUtils>) -> Box<dyn HookPlugin> {
        Box::new(Self {
            dependencies: utils.plugin_dependencies(Self::NAME),
            cgroups: CgroupService::default(),
        })
    }
}

#[async_trait]
impl HookPlugin for GpuPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hook_mask(&self) -> HookMask {
        HookMask::CREATE_RUNTIME | HookMask::POST_HALT
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn create_runtime(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        let data: GpuData = utils
            .plugin_data(Self::NAME)?
            .context("gpu plugin requires a data section")?;
        if data.memory == 0 {
            bail!("gpu memory limit must be > 0");
        }

        let pid = utils.container_pid()?;
        let sub_cgroup = self.cgroups.setup(
            CONTROLLER,
            utils.container_id(),
            pid,
            &[(LIMIT_FILE.into(), data.memory)],
        )?;

        // make the container see its own cgroup as the controller root
        let mount_point = self.cgroups.controller_mount(CONTROLLER)?;
        utils.call_in_namespace(pid, NamespaceKind::Mnt, move || {
            CgroupService::overlay_container_view(&sub_cgroup, &mount_point)
        })
    }

    async fn post_halt(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        if let Err(e) = self.cgroups.teardown(CONTROLLER, utils.container_id()) {
            // the kernel collects the cgroup once its last process exits
            warn!(
                "gpu cgroup cleanup for container {} incomplete: {:#}",
                utils.container_id(),
                e
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ContainerConfig, PluginSpec};
    use std::path::Path;

    fn utils_with_memory(memory: u64) -> Arc<PluginUtils> {
        let mut config = ContainerConfig::default();
        config.hostname = "c1".into();
        config.rdk_plugins.insert(
            GpuPlugin::NAME.into(),
            PluginSpec {
                required: true,
                depends_on: vec![],
                data: serde_json::json!({ "memory": memory }),
            },
        );
        Arc::new(PluginUtils::new(config, None, Path::new("/tmp")))
    }

    #[tokio::test]
    async fn zero_limit_rejected() {
        let utils = utils_with_memory(0);
        let plugin = GpuPlugin::construct(&utils);
        assert!(plugin.create_runtime(&utils).await.is_err());
    }

    #[tokio::test]
    async fn missing_data_rejected() {
        let mut config = ContainerConfig::default();
        config.hostname = "c1".into();
        let utils = Arc::new(PluginUtils::new(config, None, Path::new("/tmp")));

        let plugin = GpuPlugin::construct(&utils);
        assert!(plugin.create_runtime(&utils).await.is_err());
    }

    #[tokio::test]
    async fn post_halt_tolerates_missing_controller() {
        // no gpu controller in the mount table: cleanup logs and succeeds
        let utils = utils_with_memory(1);
        let plugin = GpuPlugin::construct(&utils);
        assert!(plugin.post_halt(&utils).await.is_ok());
    }
}
