//! Recreates the host timezone link inside the container rootfs.

use crate::{
    error::ErrorKind,
    hooks::HookMask,
    registry::HookPlugin,
    utils::PluginUtils,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use std::{path::Path, sync::Arc};

const LOCALTIME: &str = "/etc/localtime";

/// At postInstallation, symlinks `<rootfs>/etc/localtime` to the same
/// zoneinfo target the host uses, so the container shares the host timezone.
pub struct LocalTimePlugin {
    dependencies: Vec<String>,
}

impl LocalTimePlugin {
    pub const NAME: &'static str = "localtime";

    pub fn construct(utils: &Arc<PluginUtils>) -> Box<dyn HookPlugin> {
        Box::new(Self {
            dependencies: utils.plugin_dependencies(Self::NAME),
        })
    }

    fn link_into(rootfs: &Path, target: &Path) -> Result<()> {
        let link = rootfs.join("etc/localtime");

        match std::fs::read_link(&link) {
            // idempotent on a retry
            Ok(existing) if existing == target => {
                debug!("{} already points at {}", link.display(), target.display());
                return Ok(());
            }
            Ok(_) => {
                std::fs::remove_file(&link)
                    .with_context(|| format!("replace stale link {}", link.display()))
                    .context(ErrorKind::IoFailed.to_string())?;
            }
            Err(_) => {}
        }

        if let Some(parent) = link.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))
                .context(ErrorKind::IoFailed.to_string())?;
        }

        std::os::unix::fs::symlink(target, &link)
            .with_context(|| format!("symlink {} -> {}", link.display(), target.display()))
            .context(ErrorKind::SyscallFailed.to_string())
    }
}

#[async_trait]
impl HookPlugin for LocalTimePlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hook_mask(&self) -> HookMask {
        HookMask::POST_INSTALLATION
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn post_installation(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        let target = std::fs::read_link(LOCALTIME)
            .with_context(|| format!("readlink {}", LOCALTIME))
            .context(ErrorKind::ResourceUnavailable.to_string())?;

        Self::link_into(utils.rootfs_path(), &target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn creates_and_replaces_link() -> Result<()> {
        let rootfs = TempDir::new()?;
        let target = PathBuf::from("/usr/share/zoneinfo/Europe/London");

        LocalTimePlugin::link_into(rootfs.path(), &target)?;
        assert_eq!(
            std::fs::read_link(rootfs.path().join("etc/localtime"))?,
            target
        );

        // identical link is tolerated
        LocalTimePlugin::link_into(rootfs.path(), &target)?;

        // differing link is replaced
        let other = PathBuf::from("/usr/share/zoneinfo/UTC");
        LocalTimePlugin::link_into(rootfs.path(), &other)?;
        assert_eq!(
            std::fs::read_link(rootfs.path().join("etc/localtime"))?,
            other
        );
        Ok(())
    }
}
