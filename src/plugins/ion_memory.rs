//! Per-heap ION memory limits via the `ion` cgroup controller.

use crate::{
    cgroup::CgroupService,
    hooks::HookMask,
    registry::HookPlugin,
    utils::PluginUtils,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use std::sync::Arc;

const CONTROLLER: &str = "ion";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IonMemoryData {
    /// Limit applied to heaps without an explicit entry.
    #[serde(default)]
    default_limit: Option<u64>,

    #[serde(default)]
    heaps: Vec<HeapLimit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeapLimit {
    name: String,
    limit: u64,
}

/// Applies `ion.<heap>.limit_in_bytes` limits in a per-container sub-cgroup
/// at createRuntime and removes the sub-cgroup at postHalt.
pub struct IonMemoryPlugin {
    dependencies: Vec<String>,
    cgroups: CgroupService,
}

impl IonMemoryPlugin {
    pub const NAME: &'static str = "ionmemory";

    pub fn construct(utils: &Arc<PluginUtils>) -> Box<dyn HookPlugin> {
        Box::new(Self {
            dependencies: utils.plugin_dependencies(Self::NAME),
            cgroups: CgroupService::default(),
        })
    }

    fn limit_files(data: &IonMemoryData) -> Vec<(String, u64)> {
        let mut limits: Vec<(String, u64)> = data
            .heaps
            .iter()
            .map(|heap| (format!("ion.{}.limit_in_bytes", heap.name), heap.limit))
            .collect();

        if let Some(default_limit) = data.default_limit {
            limits.push(("ion.limit_in_bytes".into(), default_limit));
        }

        limits
    }
}

#[async_trait]
impl HookPlugin for IonMemoryPlugin {
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
        let data: IonMemoryData = utils
            .plugin_data(Self::NAME)?
            .context("ionmemory plugin requires a data section")?;

        let pid = utils.container_pid()?;
        self.cgroups.setup(
            CONTROLLER,
            utils.container_id(),
            pid,
            &Self::limit_files(&data),
        )?;
        Ok(())
    }

    async fn post_halt(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        if let Err(e) = self.cgroups.teardown(CONTROLLER, utils.container_id()) {
            warn!(
                "ion cgroup cleanup for container {} incomplete: {:#}",
                utils.container_id(),
                e
            );
        }
        Ok(())
    }
}
