//! Loop-device attach and image mount management.

use crate::error::ErrorKind;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{CopyGetters, Getters};
use log::{debug, trace, warn};
use nix::{
    errno::Errno,
    fcntl::{self, OFlag},
    mount::{mount, umount2, MntFlags, MsFlags},
    sys::stat::{makedev, mknod, Mode, SFlag},
    unistd,
};
use std::{
    fs::File,
    io::Read,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    process::Output,
};
use tokio::process::Command;

const LOOP_CONTROL: &str = "/dev/loop-control";
const LOOP_MAJOR: u64 = 7;

// loop ioctl request numbers, from <linux/loop.h>
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LO_FLAGS_AUTOCLEAR: u32 = 4;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// Files beginning with this magic are copied out of a data image before it
/// is torn down (minidump format).
pub const COPY_OUT_MAGIC: &[u8; 4] = b"MDMP";

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        // all-zero apart from the fixed-size name buffers
        unsafe { std::mem::zeroed() }
    }
}

#[derive(Clone, Debug, CopyGetters, Getters)]
/// A loop device attached to a backing image.
pub struct LoopDevice {
    #[get = "pub"]
    /// The device node path, `/dev/loopN`.
    path: PathBuf,

    #[get_copy = "pub"]
    /// The kernel-assigned device number.
    number: u32,
}

#[derive(Builder, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Attaches image files to loop devices and mounts them into a rootfs.
pub struct LoopMount {
    #[getset(get)]
    #[builder(private, default = "Box::new(DefaultExecCommand)")]
    /// Internal command executor for the mkfs spawn.
    exec_command: Box<dyn ExecCommand>,
}

#[async_trait]
trait ExecCommand: DynClone + Send + Sync {
    async fn output(&self, command: &mut Command) -> Result<Output> {
        command.output().await.context("run command")
    }
}

clone_trait_object!(ExecCommand);

#[derive(Clone, Default)]
struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

impl Default for LoopMount {
    fn default() -> Self {
        LoopMountBuilder::default()
            .build()
            .expect("all fields carry defaults")
    }
}

impl LoopMount {
    /// Make sure the backing image exists: a missing file is preallocated to
    /// `size` bytes and formatted with `mkfs.<fs_type>`.
    pub async fn ensure_image(&self, image: &Path, size: u64, fs_type: &str) -> Result<()> {
        if image.exists() {
            trace!("image {} already present", image.display());
            return Ok(());
        }

        if let Some(parent) = image.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create image directory {}", parent.display()))
                .context(ErrorKind::IoFailed.to_string())?;
        }

        let fd = fcntl::open(
            image,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o644),
        )
        .with_context(|| format!("create image {}", image.display()))
        .context(ErrorKind::IoFailed.to_string())?;

        let alloc = fcntl::posix_fallocate(fd, 0, size as libc::off_t)
            .with_context(|| format!("preallocate {} bytes", size))
            .context(ErrorKind::SyscallFailed.to_string());
        if let Err(e) = unistd::close(fd) {
            warn!("failed to close image fd: {}", e);
        }
        alloc?;

        self.format_image(image, fs_type).await
    }

    /// Format the image with the filesystem-specific mkfs tool.
    async fn format_image(&self, image: &Path, fs_type: &str) -> Result<()> {
        let binary = format!("mkfs.{}", fs_type);

        let output = self
            .exec_command()
            .output(Command::new(&binary).arg("-F").arg(image))
            .await
            .context("run mkfs")
            .context(ErrorKind::ResourceUnavailable.to_string())?;

        if !output.status.success() {
            bail!(
                "{}: mkfs.{} on {} failed: {}",
                ErrorKind::SyscallFailed,
                fs_type,
                image.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }

    /// Attach the image to a free loop device with autoclear set, so the
    /// device detaches once the last mount goes away.
    pub fn attach(&self, image: &Path) -> Result<LoopDevice> {
        let control = fcntl::open(
            LOOP_CONTROL,
            OFlag::O_RDWR | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .context("open /dev/loop-control")
        .context(ErrorKind::ResourceUnavailable.to_string())?;

        let image_fd = fcntl::open(image, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
            .with_context(|| format!("open image {}", image.display()))
            .context(ErrorKind::IoFailed.to_string());
        let image_fd = match image_fd {
            Ok(fd) => fd,
            Err(e) => {
                let _ = unistd::close(control);
                return Err(e);
            }
        };

        let result = self.attach_free_device(control, image_fd);

        if let Err(e) = unistd::close(image_fd) {
            warn!("failed to close image fd: {}", e);
        }
        if let Err(e) = unistd::close(control) {
            warn!("failed to close loop-control fd: {}", e);
        }

        result
    }

    fn attach_free_device(&self, control: RawFd, image_fd: RawFd) -> Result<LoopDevice> {
        // another process can grab the device between GET_FREE and SET_FD,
        // so loop until the attach sticks
        loop {
            let number = unsafe { libc::ioctl(control, LOOP_CTL_GET_FREE) };
            if number < 0 {
                return Err(anyhow::Error::new(std::io::Error::last_os_error())
                    .context("request free loop device")
                    .context(ErrorKind::ResourceUnavailable.to_string()));
            }
            let number = number as u32;
            let path = PathBuf::from(format!("/dev/loop{}", number));

            // udev may not have created the node yet
            match mknod(
                &path,
                SFlag::S_IFBLK,
                Mode::from_bits_truncate(0o660),
                makedev(LOOP_MAJOR, number as u64),
            ) {
                Ok(()) | Err(nix::Error::Sys(Errno::EEXIST)) => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("mknod {}", path.display()))
                        .context(ErrorKind::SyscallFailed.to_string()))
                }
            }

            let device_fd = fcntl::open(&path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
                .with_context(|| format!("open {}", path.display()))
                .context(ErrorKind::SyscallFailed.to_string())?;

            let rc = unsafe { libc::ioctl(device_fd, LOOP_SET_FD, image_fd) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                let _ = unistd::close(device_fd);
                if err.raw_os_error() == Some(libc::EBUSY) {
                    debug!("loop device {} raced away, retrying", path.display());
                    continue;
                }
                return Err(anyhow::Error::new(err)
                    .context(format!("bind image to {}", path.display()))
                    .context(ErrorKind::SyscallFailed.to_string()));
            }

            let mut info = LoopInfo64::default();
            info.lo_flags = LO_FLAGS_AUTOCLEAR;
            let rc = unsafe { libc::ioctl(device_fd, LOOP_SET_STATUS64, &info) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                unsafe { libc::ioctl(device_fd, LOOP_CLR_FD, 0) };
                let _ = unistd::close(device_fd);
                return Err(anyhow::Error::new(err)
                    .context(format!("set autoclear on {}", path.display()))
                    .context(ErrorKind::SyscallFailed.to_string()));
            }

            if let Err(e) = unistd::close(device_fd) {
                warn!("failed to close {}: {}", path.display(), e);
            }

            debug!("attached image to {}", path.display());
            return Ok(LoopDevice { path, number });
        }
    }

    /// Mount the attached device at the destination, creating the mount point
    /// first, and hand the mount root to the container-mapped owner.
    pub fn mount_device(
        &self,
        device: &LoopDevice,
        destination: &Path,
        fs_type: &str,
        flags: MsFlags,
        owner: Option<(u32, u32)>,
    ) -> Result<()> {
        std::fs::create_dir_all(destination)
            .with_context(|| format!("create mount point {}", destination.display()))
            .context(ErrorKind::IoFailed.to_string())?;

        mount(
            Some(device.path()),
            destination,
            Some(fs_type),
            flags,
            None::<&str>,
        )
        .with_context(|| {
            format!(
                "mount {} at {}",
                device.path().display(),
                destination.display()
            )
        })
        .context(ErrorKind::SyscallFailed.to_string())?;

        if let Some((uid, gid)) = owner {
            unistd::chown(
                destination,
                Some(unistd::Uid::from_raw(uid)),
                Some(unistd::Gid::from_raw(gid)),
            )
            .with_context(|| format!("chown {}", destination.display()))
            .context(ErrorKind::SyscallFailed.to_string())?;
        }

        Ok(())
    }

    /// Unmount a destination; the autoclear flag then releases the loop
    /// device. A lazy detach keeps teardown from hanging on busy mounts.
    pub fn unmount(&self, destination: &Path) -> Result<()> {
        umount2(destination, MntFlags::MNT_DETACH)
            .with_context(|| format!("unmount {}", destination.display()))
            .context(ErrorKind::SyscallFailed.to_string())
    }

    /// Detach a loop device explicitly, for kernels where autoclear is not
    /// honored. A device that is already free is not an error.
    pub fn detach(&self, device: &LoopDevice) -> Result<()> {
        let fd = match fcntl::open(
            device.path(),
            OFlag::O_RDWR | OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(nix::Error::Sys(Errno::ENOENT)) => return Ok(()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("open {}", device.path().display()))
                    .context(ErrorKind::SyscallFailed.to_string()))
            }
        };

        let rc = unsafe { libc::ioctl(fd, LOOP_CLR_FD, 0) };
        let err = std::io::Error::last_os_error();
        let _ = unistd::close(fd);

        // ENXIO means no image is bound, which is what autoclear gives us
        if rc < 0 && err.raw_os_error() != Some(libc::ENXIO) {
            return Err(anyhow::Error::new(err)
                .context(format!("detach {}", device.path().display()))
                .context(ErrorKind::SyscallFailed.to_string()));
        }

        Ok(())
    }

    /// Walk the mounted image for files carrying the copy-out magic and copy
    /// them into the destination directory before teardown.
    pub fn copy_out_artifacts(&self, mount_root: &Path, destination: &Path) -> Result<usize> {
        std::fs::create_dir_all(destination)
            .with_context(|| format!("create {}", destination.display()))
            .context(ErrorKind::IoFailed.to_string())?;

        let mut copied = 0;
        let mut stack = vec![mount_root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("cannot read {}: {}", dir.display(), e);
                    continue;
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }

                if !Self::has_copy_out_magic(&path) {
                    continue;
                }

                let file_name = match path.file_name() {
                    Some(name) => name,
                    None => continue,
                };
                let target = destination.join(file_name);
                match std::fs::copy(&path, &target) {
                    Ok(_) => {
                        debug!("copied artifact {} to {}", path.display(), target.display());
                        copied += 1;
                    }
                    Err(e) => warn!("failed to copy {}: {}", path.display(), e),
                }
            }
        }

        Ok(copied)
    }

    fn has_copy_out_magic(path: &Path) -> bool {
        let mut magic = [0u8; 4];
        match File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
            Ok(()) => &magic == COPY_OUT_MAGIC,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct ExecCommandMock {
        calls: Arc<Mutex<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl ExecCommand for ExecCommandMock {
        async fn output(&self, _: &mut Command) -> Result<Output> {
            use std::os::unix::process::ExitStatusExt;
            *self.calls.lock().unwrap() += 1;
            Ok(Output {
                status: std::process::ExitStatus::from_raw(if self.fail { 1 << 8 } else { 0 }),
                stdout: vec![],
                stderr: vec![],
            })
        }
    }

    fn mount_with_mock(mock: ExecCommandMock) -> Result<LoopMount> {
        let mut service = LoopMountBuilder::default().build()?;
        service.exec_command = Box::new(mock);
        Ok(service)
    }

    #[tokio::test]
    async fn ensure_image_creates_and_formats() -> Result<()> {
        let dir = TempDir::new()?;
        let image = dir.path().join("data/private.img");

        let mock = ExecCommandMock::default();
        let service = mount_with_mock(mock.clone())?;
        service.ensure_image(&image, 4096, "ext4").await?;

        assert_eq!(std::fs::metadata(&image)?.len(), 4096);
        assert_eq!(*mock.calls.lock().unwrap(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn ensure_image_skips_existing() -> Result<()> {
        let dir = TempDir::new()?;
        let image = dir.path().join("private.img");
        std::fs::write(&image, "already here")?;

        let mock = ExecCommandMock::default();
        let service = mount_with_mock(mock.clone())?;
        service.ensure_image(&image, 4096, "ext4").await?;

        assert_eq!(std::fs::read_to_string(&image)?, "already here");
        assert_eq!(*mock.calls.lock().unwrap(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn ensure_image_failure_mkfs() -> Result<()> {
        let dir = TempDir::new()?;
        let image = dir.path().join("private.img");

        let service = mount_with_mock(ExecCommandMock {
            fail: true,
            ..Default::default()
        })?;
        assert!(service.ensure_image(&image, 4096, "ext4").await.is_err());
        Ok(())
    }

    #[test]
    fn copy_out_matches_magic_only() -> Result<()> {
        let dir = TempDir::new()?;
        let mount_root = dir.path().join("mnt");
        let out = dir.path().join("out");
        std::fs::create_dir_all(mount_root.join("nested"))?;

        std::fs::write(mount_root.join("core.dmp"), b"MDMP-rest-of-dump")?;
        std::fs::write(mount_root.join("nested/later.dmp"), b"MDMPxxxx")?;
        std::fs::write(mount_root.join("app.log"), b"just a log")?;
        std::fs::write(mount_root.join("tiny"), b"MD")?;

        let service = LoopMount::default();
        let copied = service.copy_out_artifacts(&mount_root, &out)?;

        assert_eq!(copied, 2);
        assert!(out.join("core.dmp").exists());
        assert!(out.join("later.dmp").exists());
        assert!(!out.join("app.log").exists());
        Ok(())
    }

    #[test]
    fn copy_out_empty_tree() -> Result<()> {
        let dir = TempDir::new()?;
        let mount_root = dir.path().join("mnt");
        std::fs::create_dir(&mount_root)?;

        let service = LoopMount::default();
        assert_eq!(service.copy_out_artifacts(&mount_root, &dir.path().join("out"))?, 0);
        Ok(())
    }
}
