//! The configuration-mutation surface handed to every plugin callback, plus
//! the small host-side helpers (file IO, namespace entry) most plugins share.

use crate::{
    bundle::{ContainerConfig, IdMapping, Mount, RuntimeState},
    error::ErrorKind,
};
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use nix::{
    fcntl::{self, FcntlArg, FdFlag, OFlag},
    sched::CloneFlags,
    sys::stat::{fchmodat, FchmodatFlags, Mode},
    unistd,
};
use serde::de::DeserializeOwned;
use std::{
    net::Ipv4Addr,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
};
use strum::Display;

/// Name of the per-container address file inside the rootfs, written by the
/// network layer and consumed here. The format is kept bit-exact for external
/// readers: `"<ipv4 as host-order decimal>/<veth name>"`.
pub const ADDRESS_FILE_NAME: &str = "dobbyaddress";

/// Default directory in which per-container address files are recorded on the
/// host, used to enumerate veth devices already in use.
pub const DEFAULT_ADDRESS_DIR: &str = "/var/run/hookrs";

/// The first fd number the container sees for preserved descriptors; 0-2 are
/// its stdio.
const FIRST_PRESERVED_FD: i32 = 3;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
/// Namespaces a plugin may enter via `call_in_namespace`. PID, user and UTS
/// namespaces have special restrictions and are rejected.
pub enum NamespaceKind {
    Ipc,
    Net,
    Mnt,
}

impl NamespaceKind {
    fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceKind::Net => CloneFlags::CLONE_NEWNET,
            NamespaceKind::Mnt => CloneFlags::CLONE_NEWNS,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
/// Veth name and IP address assigned to a container by the network layer.
pub struct ContainerNetworkInfo {
    pub container_id: String,
    /// The address exactly as stored in the address file (host byte order).
    pub ip_address_raw: u32,
    pub ip_address: Ipv4Addr,
    pub veth_name: String,
}

#[derive(Debug)]
struct PreservedFd {
    plugin: String,
    fd: RawFd,
}

#[derive(Debug)]
/// Thread-safe mutators over the parsed container config, owned by a single
/// hook invocation. The internal lock only guards against callback-spawned
/// threads; concurrent hook invocations never share an instance.
pub struct PluginUtils {
    config: Mutex<ContainerConfig>,
    state: Option<RuntimeState>,
    container_id: String,
    bundle: PathBuf,
    rootfs: PathBuf,
    address_dir: PathBuf,
    preserved: Mutex<Vec<PreservedFd>>,
}

impl PluginUtils {
    /// Build the utils over a loaded bundle config. The runtime state is
    /// present when the runtime (rather than the framework) is the invoker.
    pub fn new(config: ContainerConfig, state: Option<RuntimeState>, bundle: &Path) -> Self {
        let container_id = config.hostname.clone();
        Self {
            config: Mutex::new(config),
            state,
            container_id,
            bundle: bundle.to_path_buf(),
            rootfs: ContainerConfig::rootfs(bundle),
            address_dir: PathBuf::from(DEFAULT_ADDRESS_DIR),
            preserved: Mutex::new(Vec::new()),
        }
    }

    /// Override the host address-file directory (used by tests).
    pub fn set_address_dir(&mut self, dir: &Path) {
        self.address_dir = dir.to_path_buf();
    }

    /// The container id (the config's hostname field).
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// The bundle directory of the current invocation.
    pub fn bundle_path(&self) -> &Path {
        &self.bundle
    }

    /// The container rootfs directory on the host.
    pub fn rootfs_path(&self) -> &Path {
        &self.rootfs
    }

    /// The container init pid from the runtime state blob. Only valid once
    /// the runtime has created the container.
    pub fn container_pid(&self) -> Result<i32> {
        let state = self
            .state
            .as_ref()
            .with_context(|| format!("{}: no runtime state on this hook", ErrorKind::ConfigInvalid))?;
        state
            .pid
            .with_context(|| format!("{}: pid not yet assigned", ErrorKind::ConfigInvalid))
    }

    /// Run a closure with shared access to the config.
    pub fn with_config<R>(&self, f: impl FnOnce(&ContainerConfig) -> R) -> R {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        f(&config)
    }

    /// Deserialize the named plugin's data subtree, if the bundle carries one.
    pub fn plugin_data<T: DeserializeOwned>(&self, plugin: &str) -> Result<Option<T>> {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        match config.rdk_plugins.get(plugin) {
            None => Ok(None),
            Some(spec) if spec.data.is_null() => Ok(None),
            Some(spec) => Ok(Some(
                serde_json::from_value(spec.data.clone())
                    .with_context(|| format!("parse data for plugin {}", plugin))
                    .context(ErrorKind::ConfigInvalid.to_string())?,
            )),
        }
    }

    /// The dependency names the bundle declares for a plugin.
    pub fn plugin_dependencies(&self, plugin: &str) -> Vec<String> {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config
            .rdk_plugins
            .get(plugin)
            .map(|spec| spec.depends_on.clone())
            .unwrap_or_default()
    }

    /// Consume the utils and hand back the (possibly mutated) config.
    pub fn into_config(self) -> ContainerConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Persist the current config state back into the bundle directory.
    pub fn persist_config(&self) -> Result<()> {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config.persist(&self.bundle)
    }

    /// Append a mount entry. No de-duplication, order is preserved.
    pub fn add_mount(&self, source: &str, destination: &str, kind: &str, options: &[&str]) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config.mounts.push(Mount {
            destination: destination.into(),
            kind: kind.into(),
            source: source.into(),
            options: options.iter().map(ToString::to_string).collect(),
        });
    }

    /// Add a `K=V` environment variable. An existing variable with the same
    /// key is replaced in place; an exact-match duplicate is a no-op.
    pub fn add_environment_var(&self, var: &str) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());

        let key = var.split('=').next().unwrap_or(var);
        for existing in config.process.env.iter_mut() {
            if existing == var {
                debug!("{} exactly matches an existing env var, not adding", var);
                return;
            }

            if existing.split('=').next().unwrap_or(existing) == key {
                debug!("replacing env var {} with {}", existing, var);
                *existing = var.into();
                return;
            }
        }

        config.process.env.push(var.into());
    }

    /// Force the container to run with (or without) a controlling terminal.
    /// The logging layer needs a ptty to pump.
    pub fn set_process_terminal(&self, terminal: bool) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config.process.terminal = terminal;
    }

    /// Set an annotation, replacing any previous value for the key.
    pub fn add_annotation(&self, key: &str, value: &str) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config.annotations.insert(key.into(), value.into());
    }

    /// Remove an annotation; absent keys are tolerated.
    pub fn remove_annotation(&self, key: &str) {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config.annotations.remove(key);
    }

    /// Resolve a container-side uid to its host-side value through the
    /// configured mappings.
    pub fn mapped_uid(&self, uid: u32) -> u32 {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        map_id(uid, &config.linux.uid_mappings)
    }

    /// Resolve a container-side gid to its host-side value through the
    /// configured mappings.
    pub fn mapped_gid(&self, gid: u32) -> u32 {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        map_id(gid, &config.linux.gid_mappings)
    }

    /// Duplicate `fd` into the set of descriptors the runtime preserves into
    /// the container and return the fd number the container will see.
    ///
    /// The caller keeps ownership of the original and should close it after
    /// this returns; the duplicate lives until the runtime inherits it. To
    /// catch leaks early, descriptors without `FD_CLOEXEC` are rejected.
    pub fn add_file_descriptor(&self, plugin: &str, fd: RawFd) -> Result<i32> {
        let flags = fcntl::fcntl(fd, FcntlArg::F_GETFD)
            .context("read descriptor flags")
            .context(ErrorKind::SyscallFailed.to_string())?;
        if !FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC) {
            bail!(
                "{}: fd {} from plugin {} has no FD_CLOEXEC bit set",
                ErrorKind::ConfigInvalid,
                fd,
                plugin
            );
        }

        let duplicate = fcntl::fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(3))
            .context("duplicate descriptor")
            .context(ErrorKind::SyscallFailed.to_string())?;

        let mut preserved = self.preserved.lock().unwrap_or_else(|e| e.into_inner());
        preserved.push(PreservedFd {
            plugin: plugin.into(),
            fd: duplicate,
        });

        Ok(FIRST_PRESERVED_FD + (preserved.len() as i32) - 1)
    }

    /// All preserved descriptors, in registration order.
    pub fn files(&self) -> Vec<RawFd> {
        let preserved = self.preserved.lock().unwrap_or_else(|e| e.into_inner());
        preserved.iter().map(|p| p.fd).collect()
    }

    /// The preserved descriptors registered by one plugin.
    pub fn files_for(&self, plugin: &str) -> Vec<RawFd> {
        let preserved = self.preserved.lock().unwrap_or_else(|e| e.into_inner());
        preserved
            .iter()
            .filter(|p| p.plugin == plugin)
            .map(|p| p.fd)
            .collect()
    }

    /// Read and parse the address file the network layer wrote into the
    /// container rootfs.
    pub fn container_network_info(&self) -> Result<ContainerNetworkInfo> {
        let path = self.rootfs.join(ADDRESS_FILE_NAME);
        let content = self.read_text_file(&path)?;
        parse_network_info(&self.container_id, content.trim())
            .with_context(|| format!("parse address file {}", path.display()))
    }

    /// Enumerate the veth names recorded in the host address-file directory.
    /// Malformed entries are skipped with a log line.
    pub fn taken_veths(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.address_dir)
            .with_context(|| format!("open address directory {}", self.address_dir.display()))
            .context(ErrorKind::IoFailed.to_string())?;

        let mut veths = vec![];
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                debug!("skipping {} as it is not a file", path.display());
                continue;
            }

            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("failed to read address file {}: {}", path.display(), e);
                    continue;
                }
            };

            match content.trim().split_once('/') {
                Some((_, veth)) if !veth.is_empty() => veths.push(veth.into()),
                _ => warn!("failed to get veth name from {}", path.display()),
            }
        }

        Ok(veths)
    }

    /// Write a string to a file. `flags` are OR'd with `O_WRONLY | O_CLOEXEC`;
    /// `mode` applies when `O_CREAT` is part of the flags.
    pub fn write_text_file(&self, path: &Path, content: &str, flags: OFlag, mode: Mode) -> Result<()> {
        let fd = fcntl::open(path, OFlag::O_WRONLY | OFlag::O_CLOEXEC | flags, mode)
            .with_context(|| format!("open {}", path.display()))
            .context(ErrorKind::IoFailed.to_string())?;

        let mut remaining = content.as_bytes();
        let result = loop {
            if remaining.is_empty() {
                break Ok(());
            }
            match unistd::write(fd, remaining) {
                Ok(0) => break Ok(()),
                Ok(written) => remaining = &remaining[written..],
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => {
                    break Err(anyhow::Error::new(e)
                        .context(format!("write to {}", path.display()))
                        .context(ErrorKind::IoFailed.to_string()))
                }
            }
        };

        if let Err(e) = unistd::close(fd) {
            warn!("failed to close {}: {}", path.display(), e);
        }

        result
    }

    /// Read a file into a string.
    pub fn read_text_file(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))
            .context(ErrorKind::IoFailed.to_string())
    }

    /// Make a directory and all parents, `mkdir -p` style. Each created
    /// segment additionally gets an explicit chmod so the requested mode
    /// survives the process umask.
    pub fn mkdir_recursive(&self, path: &Path, mode: Mode) -> Result<()> {
        if path.as_os_str().is_empty() {
            bail!("{}: empty path supplied", ErrorKind::ConfigInvalid);
        }

        let mut partial = PathBuf::new();
        for component in path.components() {
            partial.push(component);
            if partial.as_os_str() == "/" {
                continue;
            }

            match unistd::mkdir(&partial, mode) {
                Ok(()) => {}
                Err(nix::Error::Sys(nix::errno::Errno::EEXIST)) => continue,
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("create dir {}", partial.display()))
                        .context(ErrorKind::SyscallFailed.to_string()))
                }
            }

            fchmodat(None, &partial, mode, FchmodatFlags::FollowSymlink)
                .with_context(|| format!("set dir {} permissions", partial.display()))
                .context(ErrorKind::SyscallFailed.to_string())?;
        }

        Ok(())
    }

    /// Enter one namespace of the target process, run the closure there and
    /// return its result.
    ///
    /// The namespace switch happens on a dedicated short-lived thread which is
    /// joined before returning, so the change can never leak into the caller.
    pub fn call_in_namespace<F, T>(&self, pid: i32, ns: NamespaceKind, func: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ns_path = format!("/proc/{}/ns/{}", pid, ns);
        let ns_fd = fcntl::open(
            ns_path.as_str(),
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("open namespace {}", ns_path))
        .context(ErrorKind::SyscallFailed.to_string())?;

        debug!("about to change namespace to {}", ns_path);

        let flag = ns.clone_flag();
        let worker = thread::Builder::new()
            .name("ns-entry".into())
            .spawn(move || -> Result<T> {
                nix::sched::setns(ns_fd, flag)
                    .context("switch into namespace")
                    .context(ErrorKind::SyscallFailed.to_string())?;
                func()
            })
            .context("spawn namespace thread")?;

        let result = worker
            .join()
            .map_err(|_| anyhow::anyhow!("namespace thread panicked"))?;

        if let Err(e) = unistd::close(ns_fd) {
            warn!("failed to close namespace fd: {}", e);
        }

        result
    }
}

impl Drop for PluginUtils {
    fn drop(&mut self) {
        let preserved = self.preserved.lock().unwrap_or_else(|e| e.into_inner());
        for p in preserved.iter() {
            if let Err(e) = unistd::close(p.fd) {
                warn!("failed to close preserved fd {}: {}", p.fd, e);
            }
        }
    }
}

/// Resolve an id through a mapping table; ids outside every mapping pass
/// through unchanged with a warning.
pub fn map_id(id: u32, mappings: &[IdMapping]) -> u32 {
    for mapping in mappings {
        if id >= mapping.container_id && id - mapping.container_id < mapping.size {
            return mapping.host_id + (id - mapping.container_id);
        }
    }

    warn!("no id mapping covers {}, using it unmapped", id);
    id
}

fn parse_network_info(container_id: &str, content: &str) -> Result<ContainerNetworkInfo> {
    let (ip, veth) = content
        .split_once('/')
        .context("no separator in address file")?;
    if veth.is_empty() {
        bail!("no veth name in address file");
    }

    let raw: u32 = ip.parse().context("invalid address value")?;

    Ok(ContainerNetworkInfo {
        container_id: container_id.into(),
        ip_address_raw: raw,
        ip_address: Ipv4Addr::from(raw),
        veth_name: veth.into(),
    })
}
