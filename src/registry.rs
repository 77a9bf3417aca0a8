//! Plugin model and registry: built-in plugins registered at construction,
//! dynamic plugin modules discovered on a search path.

use crate::{
    bundle::PluginSpec,
    error::ErrorKind,
    hooks::{HookMask, HookPoint},
    logging::PollLoop,
    utils::PluginUtils,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use libloading::{Library, Symbol};
use log::{debug, warn};
use std::{
    collections::HashMap,
    os::unix::io::RawFd,
    path::Path,
    sync::Arc,
};

/// The symbol a dynamic plugin module must export. It returns a heap-allocated
/// [`PluginEntry`] the registry takes ownership of.
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"hook_plugin_entry\0";

/// Constructor for a plugin instance; called once per hook invocation with
/// the invocation's utils so the plugin can capture its config data.
pub type PluginConstructor = fn(&Arc<PluginUtils>) -> Box<dyn HookPlugin>;

/// What a dynamic module hands to the registry.
pub struct PluginEntry {
    pub name: &'static str,
    pub construct: PluginConstructor,
}

type PluginEntryFn = unsafe extern "C" fn() -> *mut PluginEntry;

#[async_trait]
/// A named unit implementing one or more hook callbacks. Implementations
/// override only the callbacks their mask declares; everything else defaults
/// to success.
///
/// Callbacks must be idempotent at a given hook point: a retry after a
/// failure elsewhere re-invokes them, and external state is expected to be
/// tagged with the container id and checked for presence.
pub trait HookPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn hook_mask(&self) -> HookMask;

    /// Names of plugins that must run before this one at every hook point
    /// this plugin participates in.
    fn dependencies(&self) -> Vec<String> {
        vec![]
    }

    async fn post_installation(&self, _utils: &Arc<PluginUtils>) -> Result<()> {
        Ok(())
    }

    async fn pre_creation(&self, _utils: &Arc<PluginUtils>) -> Result<()> {
        Ok(())
    }

    async fn create_runtime(&self, _utils: &Arc<PluginUtils>) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, _utils: &Arc<PluginUtils>) -> Result<()> {
        Ok(())
    }

    async fn start_container(&self, _utils: &Arc<PluginUtils>) -> Result<()> {
        Ok(())
    }

    async fn post_start(&self, _utils: &Arc<PluginUtils>) -> Result<()> {
        Ok(())
    }

    async fn post_halt(&self, _utils: &Arc<PluginUtils>) -> Result<()> {
        Ok(())
    }

    async fn post_stop(&self, _utils: &Arc<PluginUtils>) -> Result<()> {
        Ok(())
    }

    /// Invoke the callback for one hook point.
    async fn dispatch(&self, hook: HookPoint, utils: &Arc<PluginUtils>) -> Result<()> {
        match hook {
            HookPoint::PostInstallation => self.post_installation(utils).await,
            HookPoint::PreCreation => self.pre_creation(utils).await,
            HookPoint::CreateRuntime => self.create_runtime(utils).await,
            HookPoint::CreateContainer => self.create_container(utils).await,
            HookPoint::StartContainer => self.start_container(utils).await,
            HookPoint::PostStart => self.post_start(utils).await,
            HookPoint::PostHalt => self.post_halt(utils).await,
            HookPoint::PostStop => self.post_stop(utils).await,
        }
    }
}

/// The specialization for logging plugins: besides its hook callbacks it can
/// bind the container's stdio to the daemon's poll loop and flush buffered
/// output on demand. At most one logging plugin is active per container.
pub trait LoggingHookPlugin: HookPlugin {
    /// Register the container ptty on the daemon poll loop.
    fn register_poll_sources(&self, ptty_fd: RawFd, poll_loop: &PollLoop) -> Result<()>;

    /// Synchronously drain the given fd into the configured sink.
    fn dump_to_log(&self, fd: RawFd);
}

struct Registration {
    name: String,
    construct: PluginConstructor,
}

struct LoadedModule {
    // dropped together with the registration; unloading the library while the
    // constructor is reachable would leave dangling code pointers
    _library: Library,
    registration: Registration,
}

#[derive(Default)]
/// Holds every known plugin in registration order. Instantiation happens per
/// hook invocation and only for plugins the bundle names.
pub struct PluginRegistry {
    builtins: Vec<Registration>,
    modules: Vec<LoadedModule>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in plugin. Duplicate names are rejected.
    pub fn register(&mut self, name: &str, construct: PluginConstructor) -> Result<()> {
        if self.contains(name) {
            bail!(
                "{}: plugin {} already registered",
                ErrorKind::ConfigInvalid,
                name
            );
        }

        self.builtins.push(Registration {
            name: name.into(),
            construct,
        });
        Ok(())
    }

    /// Scan a directory for plugin modules and load every `.so` that exports
    /// the entry symbol. Returns the number of plugins loaded.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            debug!("plugin directory {} not present", dir.display());
            return Ok(0);
        }

        let mut loaded = 0;
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("read plugin directory {}", dir.display()))
            .context(ErrorKind::IoFailed.to_string())?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "so"))
            .collect();
        entries.sort();

        for path in entries {
            match self.load_module(&path) {
                Ok(name) => {
                    debug!("loaded plugin {} from {}", name, path.display());
                    loaded += 1;
                }
                Err(e) => warn!(
                    "skipping plugin module {}: {}",
                    path.display(),
                    crate::error::chain(e)
                ),
            }
        }

        Ok(loaded)
    }

    fn load_module(&mut self, path: &Path) -> Result<String> {
        let library = unsafe { Library::new(path) }.context("open plugin module")?;

        let entry = unsafe {
            let entry_fn: Symbol<PluginEntryFn> = library
                .get(PLUGIN_ENTRY_SYMBOL)
                .context("missing plugin entry symbol")?;
            Box::from_raw(entry_fn())
        };

        if self.contains(entry.name) {
            bail!(
                "{}: plugin {} already registered",
                ErrorKind::ConfigInvalid,
                entry.name
            );
        }

        let name = entry.name.to_string();
        self.modules.push(LoadedModule {
            _library: library,
            registration: Registration {
                name: name.clone(),
                construct: entry.construct,
            },
        });
        Ok(name)
    }

    fn contains(&self, name: &str) -> bool {
        self.registrations().any(|r| r.name == name)
    }

    fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.builtins
            .iter()
            .chain(self.modules.iter().map(|m| &m.registration))
    }

    /// Names of all registered plugins in registration order.
    pub fn names(&self) -> Vec<String> {
        self.registrations().map(|r| r.name.clone()).collect()
    }

    /// Instantiate the plugins the bundle names, preserving registration
    /// order. A required plugin with no implementation fails the invocation;
    /// an optional one is skipped with a log line.
    pub fn instantiate(
        &self,
        requested: &HashMap<String, PluginSpec>,
        utils: &Arc<PluginUtils>,
    ) -> Result<Vec<Box<dyn HookPlugin>>> {
        for (name, spec) in requested {
            if spec.required && !self.contains(name) {
                bail!(
                    "{}: required plugin {} has no implementation",
                    ErrorKind::PluginNotFound,
                    name
                );
            }
        }

        let mut instances = vec![];
        for registration in self.registrations() {
            match requested.get(&registration.name) {
                Some(_) => instances.push((registration.construct)(utils)),
                None => continue,
            }
        }

        for name in requested.keys() {
            if !self.contains(name) {
                debug!("optional plugin {} has no implementation, skipping", name);
            }
        }

        Ok(instances)
    }
}
