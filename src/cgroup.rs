//! Cgroup-v1 controller discovery and per-container sub-cgroup management.

use crate::error::ErrorKind;
use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::Getters;
use log::{debug, info, warn};
use nix::mount::{mount, MsFlags};
use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

/// The file a pid is written to in order to join a cgroup.
const CGROUP_PROCS: &str = "cgroup.procs";

#[derive(Builder, Debug, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// Locates controllers and manages `<mount>/<container-id>` sub-cgroups.
pub struct CgroupService {
    #[get = "pub"]
    /// The mount table consulted for controller discovery.
    mounts_file: PathBuf,
}

impl Default for CgroupService {
    fn default() -> Self {
        Self {
            mounts_file: PathBuf::from("/proc/mounts"),
        }
    }
}

impl CgroupService {
    /// Find the mount point of a named cgroup-v1 controller by scanning the
    /// mount table for a `cgroup`-type entry whose options list the
    /// controller.
    pub fn controller_mount(&self, controller: &str) -> Result<PathBuf> {
        let mounts = std::fs::read_to_string(&self.mounts_file)
            .with_context(|| format!("read {}", self.mounts_file.display()))
            .context(ErrorKind::IoFailed.to_string())?;

        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let _device = fields.next();
            let mount_point = fields.next();
            let fs_type = fields.next();
            let options = fields.next();

            if let (Some(mount_point), Some("cgroup"), Some(options)) =
                (mount_point, fs_type, options)
            {
                if options.split(',').any(|o| o == controller) {
                    debug!("found {} cgroup mounted at {}", controller, mount_point);
                    return Ok(PathBuf::from(mount_point));
                }
            }
        }

        anyhow::bail!(
            "{}: no mounted cgroup controller named {}",
            ErrorKind::ResourceUnavailable,
            controller
        )
    }

    /// Create the container's sub-cgroup, move the pid into it and write the
    /// requested limit files. Returns the sub-cgroup path.
    ///
    /// A limit value of `u64::MAX` means "no limit" and is logged but not
    /// written.
    pub fn setup(
        &self,
        controller: &str,
        container_id: &str,
        pid: i32,
        limits: &[(String, u64)],
    ) -> Result<PathBuf> {
        let mount_point = self.controller_mount(controller)?;
        let sub_cgroup = mount_point.join(container_id);

        match std::fs::create_dir(&sub_cgroup) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("create sub-cgroup {}", sub_cgroup.display()))
                    .context(ErrorKind::SyscallFailed.to_string()))
            }
        }

        Self::write_value(&sub_cgroup.join(CGROUP_PROCS), &pid.to_string())
            .context("attach pid to sub-cgroup")?;

        for (file, value) in limits {
            if *value == u64::MAX {
                info!(
                    "limit {} for container {} is unlimited, not writing",
                    file, container_id
                );
                continue;
            }

            Self::write_value(&sub_cgroup.join(file), &value.to_string())
                .with_context(|| format!("write limit {}", file))?;
        }

        Ok(sub_cgroup)
    }

    /// Bind-mount the sub-cgroup over the controller mount point so
    /// in-container readers see their own cgroup as the controller root.
    /// Must run inside the container's mount namespace.
    pub fn overlay_container_view(sub_cgroup: &Path, mount_point: &Path) -> Result<()> {
        mount(
            Some(sub_cgroup),
            mount_point,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .with_context(|| {
            format!(
                "bind mount {} over {}",
                sub_cgroup.display(),
                mount_point.display()
            )
        })
        .context(ErrorKind::SyscallFailed.to_string())
    }

    /// Remove the container's sub-cgroup. A sub-cgroup that is already gone
    /// is not an error; the kernel collects a populated one once its last
    /// process exits.
    pub fn teardown(&self, controller: &str, container_id: &str) -> Result<()> {
        let mount_point = self.controller_mount(controller)?;
        let sub_cgroup = mount_point.join(container_id);

        match std::fs::remove_dir(&sub_cgroup) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("sub-cgroup {} already removed", sub_cgroup.display());
                Ok(())
            }
            Err(e) => {
                warn!("failed to remove {}: {}", sub_cgroup.display(), e);
                Err(anyhow::Error::new(e)
                    .context(format!("remove sub-cgroup {}", sub_cgroup.display()))
                    .context(ErrorKind::SyscallFailed.to_string()))
            }
        }
    }

    fn write_value(path: &Path, value: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))
            .context(ErrorKind::IoFailed.to_string())?;

        file.write_all(value.as_bytes())
            .with_context(|| format!("write {}", path.display()))
            .context(ErrorKind::IoFailed.to_string())
    }
}
