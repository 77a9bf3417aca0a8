//! Private loop-mounted data images for containers.

use crate::{
    hooks::HookMask,
    loopdev::LoopMount,
    registry::HookPlugin,
    utils::PluginUtils,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use nix::mount::MsFlags;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

const DEFAULT_FS_TYPE: &str = "ext4";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StorageData {
    loopback: Vec<LoopbackMount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoopbackMount {
    /// Image file on the host; created on first use.
    source: PathBuf,

    /// Mount destination inside the container.
    destination: PathBuf,

    #[serde(default = "default_img_size")]
    img_size: u64,

    #[serde(default = "default_fs_type")]
    fstype: String,

    /// Persistent images survive the container; transient ones are deleted
    /// at teardown.
    #[serde(default = "default_persistent")]
    persistent: bool,

    /// Where matching artifacts are copied before a transient image is torn
    /// down.
    #[serde(default)]
    copy_out_dir: Option<PathBuf>,
}

fn default_img_size() -> u64 {
    12 * 1024 * 1024
}

fn default_fs_type() -> String {
    DEFAULT_FS_TYPE.into()
}

fn default_persistent() -> bool {
    true
}

impl LoopbackMount {
    fn destination_in(&self, rootfs: &Path) -> PathBuf {
        match self.destination.strip_prefix("/") {
            Ok(relative) => rootfs.join(relative),
            Err(_) => rootfs.join(&self.destination),
        }
    }
}

/// Attaches per-container data images to loop devices and mounts them into
/// the rootfs at preCreation. Teardown happens in reverse mount order:
/// transient images at postHalt (with artifact copy-out first), persistent
/// ones at postStop.
pub struct StoragePlugin {
    dependencies: Vec<String>,
    mounter: LoopMount,
}

impl StoragePlugin {
    pub const NAME: &'static str = "storage";

    pub fn construct(utils: &Arc<PluginUtils>) -> Box<dyn HookPlugin> {
        Box::new(Self {
            dependencies: utils.plugin_dependencies(Self::NAME),
            mounter: LoopMount::default(),
        })
    }

    fn data(utils: &Arc<PluginUtils>) -> Result<StorageData> {
        Ok(utils.plugin_data(Self::NAME)?.unwrap_or_default())
    }

    fn unmount_set(&self, utils: &Arc<PluginUtils>, persistent: bool) -> Result<()> {
        let data = Self::data(utils)?;
        let rootfs = utils.rootfs_path();

        // reverse of the mount order so nested destinations unwind cleanly
        for entry in data
            .loopback
            .iter()
            .rev()
            .filter(|e| e.persistent == persistent)
        {
            let destination = entry.destination_in(rootfs);

            if !entry.persistent {
                if let Some(copy_out_dir) = &entry.copy_out_dir {
                    match self.mounter.copy_out_artifacts(&destination, copy_out_dir) {
                        Ok(copied) if copied > 0 => {
                            debug!("copied {} artifacts from {}", copied, destination.display())
                        }
                        Ok(_) => {}
                        Err(e) => warn!(
                            "artifact copy-out from {} failed: {:#}",
                            destination.display(),
                            e
                        ),
                    }
                }
            }

            if let Err(e) = self.mounter.unmount(&destination) {
                warn!("unmount of {} failed: {:#}", destination.display(), e);
            }

            if !entry.persistent {
                if let Err(e) = std::fs::remove_file(&entry.source) {
                    warn!(
                        "failed to delete transient image {}: {}",
                        entry.source.display(),
                        e
                    );
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl HookPlugin for StoragePlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hook_mask(&self) -> HookMask {
        HookMask::PRE_CREATION | HookMask::POST_HALT | HookMask::POST_STOP
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn pre_creation(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        let data = Self::data(utils)?;
        let rootfs = utils.rootfs_path();

        let owner = utils.with_config(|c| (c.process.user.uid, c.process.user.gid));
        let owner = (utils.mapped_uid(owner.0), utils.mapped_gid(owner.1));

        for entry in &data.loopback {
            self.mounter
                .ensure_image(&entry.source, entry.img_size, &entry.fstype)
                .await
                .with_context(|| format!("prepare image {}", entry.source.display()))?;

            let device = self
                .mounter
                .attach(&entry.source)
                .with_context(|| format!("attach image {}", entry.source.display()))?;

            self.mounter.mount_device(
                &device,
                &entry.destination_in(rootfs),
                &entry.fstype,
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some(owner),
            )?;
        }

        Ok(())
    }

    async fn post_halt(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        self.unmount_set(utils, false)
    }

    async fn post_stop(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        self.unmount_set(utils, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_defaults() {
        let data: StorageData = serde_json::from_value(serde_json::json!({
            "loopback": [{
                "source": "/var/data/c1.img",
                "destination": "/home/private"
            }]
        }))
        .unwrap();

        let entry = &data.loopback[0];
        assert_eq!(entry.img_size, 12 * 1024 * 1024);
        assert_eq!(entry.fstype, "ext4");
        assert!(entry.persistent);
        assert!(entry.copy_out_dir.is_none());
    }

    #[test]
    fn destination_is_rooted_in_rootfs() {
        let entry: LoopbackMount = serde_json::from_value(serde_json::json!({
            "source": "/var/data/c1.img",
            "destination": "/home/private"
        }))
        .unwrap();

        assert_eq!(
            entry.destination_in(Path::new("/run/bundle/rootfs")),
            PathBuf::from("/run/bundle/rootfs/home/private")
        );
    }

    #[test]
    fn transient_entries_parse() {
        let data: StorageData = serde_json::from_value(serde_json::json!({
            "loopback": [{
                "source": "/var/data/dumps.img",
                "destination": "/opt/dumps",
                "imgSize": 1048576,
                "fstype": "vfat",
                "persistent": false,
                "copyOutDir": "/var/crash"
            }]
        }))
        .unwrap();

        let entry = &data.loopback[0];
        assert!(!entry.persistent);
        assert_eq!(entry.fstype, "vfat");
        assert_eq!(entry.copy_out_dir.as_deref(), Some(Path::new("/var/crash")));
    }
}
