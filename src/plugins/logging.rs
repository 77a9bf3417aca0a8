//! Routes container stdout/stderr to a configured sink.

use crate::{
    hooks::HookMask,
    logging::{LoggingPump, PollLoop, SinkSpec},
    registry::{HookPlugin, LoggingHookPlugin},
    utils::PluginUtils,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::{
    os::unix::io::RawFd,
    sync::{Arc, Mutex},
};

/// Owns the sink selection for one container and, on the daemon side, the
/// pump feeding it. Only one logging plugin is active per container.
pub struct LoggingPlugin {
    dependencies: Vec<String>,
    container_id: String,
    spec: Option<SinkSpec>,
    pump: Mutex<Option<Arc<LoggingPump>>>,
}

impl LoggingPlugin {
    pub const NAME: &'static str = "logging";

    pub fn construct(utils: &Arc<PluginUtils>) -> Box<dyn HookPlugin> {
        let spec = match utils.plugin_data::<SinkSpec>(Self::NAME) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("invalid logging sink configuration: {:#}", e);
                None
            }
        };

        Box::new(Self {
            dependencies: utils.plugin_dependencies(Self::NAME),
            container_id: utils.container_id().to_string(),
            spec,
            pump: Mutex::new(None),
        })
    }

    fn effective_spec(&self) -> SinkSpec {
        self.spec.clone().unwrap_or(SinkSpec::Devnull)
    }
}

#[async_trait]
impl HookPlugin for LoggingPlugin {
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
        // stdio can only be pumped through a controlling terminal
        utils.set_process_terminal(true);
        debug!(
            "container {} logging sink: {:?}",
            utils.container_id(),
            self.effective_spec()
        );
        Ok(())
    }
}

impl LoggingHookPlugin for LoggingPlugin {
    fn register_poll_sources(&self, ptty_fd: RawFd, poll_loop: &PollLoop) -> Result<()> {
        let sink = self
            .effective_spec()
            .create_sink(&self.container_id)
            .context("create logging sink")?;

        let pump = Arc::new(LoggingPump::new(&self.container_id, ptty_fd, None, sink)?);
        poll_loop.add_source(ptty_fd, LoggingPump::poll_events(), pump.clone())?;

        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
        Ok(())
    }

    fn dump_to_log(&self, fd: RawFd) {
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match pump {
            Some(pump) => pump.dump_to_log(fd),
            None => {
                // no pump yet: drain through a one-off sink
                match self.effective_spec().create_sink(&self.container_id) {
                    Ok(mut sink) => {
                        LoggingPump::drain_into(fd, sink.as_mut(), &self.container_id)
                    }
                    Err(e) => warn!("cannot create sink for log dump: {:#}", e),
                }
            }
        }
    }
}
