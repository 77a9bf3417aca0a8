//! Configuration related structures
use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Builder, Parser, CopyGetters, Getters, Deserialize, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
#[clap(about = "OCI container hook entry point, invoked once per hook point")]
/// The command line surface the runtime (or the framework) invokes per hook.
pub struct Config {
    #[get_copy = "pub"]
    #[clap(
        default_value("info"),
        env("HOOKRS_LOG_LEVEL"),
        long("log-level"),
        possible_values(&["trace", "debug", "info", "warn", "error", "off"]),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the application
    log_level: LevelFilter,

    #[get = "pub"]
    #[clap(default_value(""), long("hook"), value_name("HOOK"))]
    /// The hook point to execute, as named in the bundle's hooks array
    hook: String,

    #[get = "pub"]
    #[clap(env("HOOKRS_BUNDLE"), long("bundle"), value_name("DIR"))]
    /// The bundle directory; defaults to the one in the runtime state blob
    bundle: Option<PathBuf>,

    #[get = "pub"]
    #[clap(
        default_value("/usr/lib/hookrs/plugins"),
        env("HOOKRS_PLUGIN_DIR"),
        long("plugin-dir"),
        value_name("DIR")
    )]
    /// Search path for dynamically loaded plugin modules
    plugin_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn default_config() {
        let c = Config::default();
        assert_eq!(c.log_level(), LevelFilter::Info);
        assert!(c.hook().is_empty());
    }

    #[test]
    fn build_config() -> Result<()> {
        let c = ConfigBuilder::default()
            .hook("createRuntime")
            .log_level(LevelFilter::Warn)
            .bundle(Some(PathBuf::from("/run/bundle")))
            .plugin_dir("/some/path")
            .build()?;

        assert_eq!(c.log_level(), LevelFilter::Warn);
        assert_eq!(c.hook(), "createRuntime");
        assert_eq!(&c.plugin_dir().display().to_string(), "/some/path");

        Ok(())
    }
}
