//! Copies selected host environment variables into the container.

use crate::{
    hooks::HookMask,
    registry::HookPlugin,
    utils::PluginUtils,
};
use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EnvVarData {
    /// Names of host environment variables to forward into the container.
    variables: Vec<String>,
}

/// Forwards host environment variables named in the bundle into the
/// container's environment at preCreation. Variables unset on the host are
/// skipped.
pub struct EnvVarPlugin {
    dependencies: Vec<String>,
}

impl EnvVarPlugin {
    pub const NAME: &'static str = "envvar";

    pub fn construct(utils: &Arc<PluginUtils>) -> Box<dyn HookPlugin> {
        Box::new(Self {
            dependencies: utils.plugin_dependencies(Self::NAME),
        })
    }
}

#[async_trait]
impl HookPlugin for EnvVarPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hook_mask(&self) -> HookMask {
        HookMask::PRE_CREATION
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn pre_creation(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        let data: EnvVarData = utils.plugin_data(Self::NAME)?.unwrap_or_default();

        for name in &data.variables {
            match std::env::var(name) {
                Ok(value) => {
                    debug!("forwarding env var {} into the container", name);
                    utils.add_environment_var(&format!("{}={}", name, value));
                }
                Err(_) => debug!("env var {} not set on the host, skipping", name),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ContainerConfig, PluginSpec};
    use std::path::Path;

    fn utils_with_data(data: serde_json::Value) -> Arc<PluginUtils> {
        let mut config = ContainerConfig::default();
        config.hostname = "c1".into();
        config.rdk_plugins.insert(
            EnvVarPlugin::NAME.into(),
            PluginSpec {
                required: false,
                depends_on: vec!["logging".into()],
                data,
            },
        );
        Arc::new(PluginUtils::new(config, None, Path::new("/tmp")))
    }

    #[tokio::test]
    async fn forwards_set_variables_only() -> Result<()> {
        std::env::set_var("HOOK_ENV_TEST_SET", "forwarded");
        std::env::remove_var("HOOK_ENV_TEST_UNSET");

        let utils = utils_with_data(serde_json::json!({
            "variables": ["HOOK_ENV_TEST_SET", "HOOK_ENV_TEST_UNSET"]
        }));
        let plugin = EnvVarPlugin::construct(&utils);
        plugin.pre_creation(&utils).await?;

        let env = utils.with_config(|c| c.process.env.clone());
        assert!(env.contains(&"HOOK_ENV_TEST_SET=forwarded".to_string()));
        assert!(!env.iter().any(|e| e.starts_with("HOOK_ENV_TEST_UNSET")));
        Ok(())
    }

    #[tokio::test]
    async fn missing_data_is_a_noop() -> Result<()> {
        let utils = utils_with_data(serde_json::Value::Null);
        let plugin = EnvVarPlugin::construct(&utils);
        plugin.pre_creation(&utils).await?;
        assert!(utils.with_config(|c| c.process.env.is_empty()));
        Ok(())
    }

    #[test]
    fn dependencies_come_from_the_bundle() {
        let utils = utils_with_data(serde_json::Value::Null);
        let plugin = EnvVarPlugin::construct(&utils);
        assert_eq!(plugin.dependencies(), vec!["logging"]);
    }
}
