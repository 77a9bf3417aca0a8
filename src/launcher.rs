//! The hook entry point: parses the runtime state from stdin, loads the
//! bundle, dispatches the requested hook over the plugin pipeline and
//! persists the mutated config.

use crate::{
    bundle::{ContainerConfig, RuntimeState},
    config::Config,
    dispatcher::Dispatcher,
    error::ErrorKind,
    hooks::HookPoint,
    plugins,
    registry::PluginRegistry,
    utils::PluginUtils,
};
use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use std::{io::Read, path::PathBuf, sync::Arc};

/// Drives one hook invocation end to end.
pub struct Launcher {
    config: Config,
}

impl Launcher {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the launcher with its default values, reading the runtime state
    /// blob from stdin. The process exit code is the aggregate hook result.
    pub async fn start(self) -> Result<()> {
        self.init_logging();

        let hook = HookPoint::parse(self.config.hook()).with_context(|| {
            format!(
                "{}: unknown hook name '{}'",
                ErrorKind::ConfigInvalid,
                self.config.hook()
            )
        })?;

        let stdin = std::io::stdin();
        let state = Self::read_state(stdin.lock())?;
        self.run_hook(hook, state).await
    }

    /// Parse the state document the runtime provides on stdin. No input at
    /// all is fine: the framework itself invokes some hooks without a state
    /// blob.
    fn read_state<R: Read>(mut reader: R) -> Result<Option<RuntimeState>> {
        let mut raw = String::new();
        reader
            .read_to_string(&mut raw)
            .context("read runtime state from stdin")
            .context(ErrorKind::IoFailed.to_string())?;

        if raw.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(RuntimeState::from_reader(raw.as_bytes())?))
    }

    /// Execute one hook point against the bundle.
    pub async fn run_hook(&self, hook: HookPoint, state: Option<RuntimeState>) -> Result<()> {
        let bundle = self.bundle_dir(&state)?;
        let container_config = ContainerConfig::load(&bundle)?;
        debug!(
            "dispatching {} for container {} in bundle {}",
            hook,
            container_config.hostname,
            bundle.display()
        );

        let utils = Arc::new(PluginUtils::new(container_config, state, &bundle));

        let mut registry = PluginRegistry::new();
        plugins::register_builtins(&mut registry)?;
        registry.load_dir(self.config.plugin_dir())?;

        let requested = utils.with_config(|c| c.rdk_plugins.clone());
        let instances = registry.instantiate(&requested, &utils)?;

        let outcome = Dispatcher::run(hook, &instances, &utils).await;

        match outcome {
            Ok(()) => {
                utils.persist_config()?;
                info!("hook {} for container {} done", hook, utils.container_id());
                Ok(())
            }
            Err(e) if !hook.fail_fast() => {
                // teardown is expected to always "succeed"; the failures have
                // been logged with full context already
                error!("hook {} finished with failures: {:#}", hook, e);
                utils.persist_config()?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn bundle_dir(&self, state: &Option<RuntimeState>) -> Result<PathBuf> {
        if let Some(bundle) = self.config.bundle() {
            return Ok(bundle.clone());
        }
        if let Some(state) = state {
            if !state.bundle.as_os_str().is_empty() {
                return Ok(state.bundle.clone());
            }
        }
        bail!(
            "{}: no bundle directory given and none in the runtime state",
            ErrorKind::ConfigInvalid
        )
    }

    fn init_logging(&self) {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(self.config.log_level());
        // a second init in the same process is fine, keep the first one
        let _ = builder.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use anyhow::Result;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_bundle(dir: &TempDir, rdk_plugins: serde_json::Value) -> Result<()> {
        let config = json!({
            "ociVersion": "1.0.2",
            "hostname": "c1",
            "process": {
                "terminal": false,
                "user": {"uid": 0, "gid": 0},
                "args": ["/init"],
                "env": ["PATH=/bin"]
            },
            "linux": {},
            "rdkPlugins": rdk_plugins
        });
        std::fs::create_dir_all(dir.path().join("rootfs"))?;
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::to_vec_pretty(&config)?,
        )?;
        Ok(())
    }

    fn launcher(dir: &TempDir, hook: &str) -> Result<Launcher> {
        Ok(Launcher::new(
            ConfigBuilder::default()
                .hook(hook)
                .bundle(Some(dir.path().to_path_buf()))
                .plugin_dir("/no/such/plugin/dir")
                .build()?,
        ))
    }

    #[tokio::test]
    async fn hook_runs_builtin_plugins_and_persists() -> Result<()> {
        std::env::set_var("LAUNCHER_TEST_VAR", "42");

        let dir = TempDir::new()?;
        write_bundle(
            &dir,
            json!({
                "envvar": {
                    "required": true,
                    "data": {"variables": ["LAUNCHER_TEST_VAR"]}
                }
            }),
        )?;

        launcher(&dir, "preCreation")?
            .run_hook(HookPoint::PreCreation, None)
            .await?;

        let reloaded = ContainerConfig::load(dir.path())?;
        assert!(reloaded
            .process
            .env
            .contains(&"LAUNCHER_TEST_VAR=42".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn logging_plugin_forces_terminal_through_full_pass() -> Result<()> {
        let dir = TempDir::new()?;
        write_bundle(
            &dir,
            json!({
                "logging": {"required": true, "data": {"sink": "devnull"}}
            }),
        )?;

        launcher(&dir, "postInstallation")?
            .run_hook(HookPoint::PostInstallation, None)
            .await?;

        let reloaded = ContainerConfig::load(dir.path())?;
        assert!(reloaded.process.terminal);
        Ok(())
    }

    #[tokio::test]
    async fn missing_required_plugin_fails_the_hook() -> Result<()> {
        let dir = TempDir::new()?;
        write_bundle(&dir, json!({"ghost": {"required": true}}))?;

        let result = launcher(&dir, "preCreation")?
            .run_hook(HookPoint::PreCreation, None)
            .await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn teardown_failures_do_not_fail_the_process() -> Result<()> {
        let dir = TempDir::new()?;
        // gpu teardown logs and succeeds even with no controller mounted
        write_bundle(
            &dir,
            json!({"gpu": {"required": true, "data": {"memory": 1024}}}),
        )?;

        launcher(&dir, "postHalt")?
            .run_hook(HookPoint::PostHalt, None)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_bundle_dir_is_config_invalid() -> Result<()> {
        let launcher = Launcher::new(
            ConfigBuilder::default()
                .hook("preCreation")
                .bundle(None::<PathBuf>)
                .plugin_dir("/no/such/dir")
                .build()?,
        );

        let err = launcher
            .run_hook(HookPoint::PreCreation, None)
            .await
            .unwrap_err();
        assert!(crate::error::chain(err).contains("config-invalid"));
        Ok(())
    }

    #[test]
    fn state_blob_parsing() -> Result<()> {
        let state = Launcher::read_state("".as_bytes())?;
        assert!(state.is_none());

        let state =
            Launcher::read_state(r#"{"id": "c1", "pid": 42, "bundle": "/b"}"#.as_bytes())?
                .expect("state present");
        assert_eq!(state.pid, Some(42));
        Ok(())
    }
}
