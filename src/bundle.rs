//! The in-memory representation of the bundle's `config.json` together with
//! the runtime state blob passed on the hook's stdin.
//!
//! Only the fields the framework and its plugins touch are modeled; everything
//! else is carried through a flattened extras map so a load/persist round-trip
//! does not drop data the runtime cares about.

use crate::error::ErrorKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

/// File name of the OCI config inside a bundle.
pub const CONFIG_JSON: &str = "config.json";

/// Directory name of the container root filesystem inside a bundle.
pub const ROOTFS_DIR: &str = "rootfs";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
/// The authoritative in-memory representation of the bundle's config.
pub struct ContainerConfig {
    /// Used as the container id for external resources.
    pub hostname: String,

    pub process: Process,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,

    pub linux: Linux,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    /// Per-plugin data subtrees keyed by plugin name.
    pub rdk_plugins: HashMap<String, PluginSpec>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Process {
    pub terminal: bool,
    pub user: User,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    pub uid: u32,
    pub gid: u32,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rlimit {
    #[serde(rename = "type")]
    pub kind: String,
    pub hard: u64,
    pub soft: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Mount {
    pub destination: String,

    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Linux {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,

    pub resources: Resources,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// A single uid/gid mapping triple.
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    pub path: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub major: i64,
    pub minor: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resources {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    /// Cgroup device allow-list entries.
    pub devices: Vec<DeviceCgroup>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceCgroup {
    pub allow: bool,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
/// One entry of the bundle's `rdkPlugins` extension object.
pub struct PluginSpec {
    /// When set, a missing implementation fails the hook instead of being
    /// skipped.
    pub required: bool,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    /// Plugins that must run before this one, resolved by name at dispatch.
    pub depends_on: Vec<String>,

    /// Plugin-specific data subtree, interpreted by the plugin itself.
    pub data: Value,
}

impl ContainerConfig {
    /// Load the config from `<bundle>/config.json`.
    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join(CONFIG_JSON);
        let file = File::open(&path)
            .with_context(|| format!("open {}", path.display()))
            .context(ErrorKind::IoFailed.to_string())?;

        let config: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parse {}", path.display()))
            .context(ErrorKind::ConfigInvalid.to_string())?;

        if config.hostname.is_empty() {
            anyhow::bail!(
                "{}: bundle config has no hostname",
                ErrorKind::ConfigInvalid
            );
        }

        Ok(config)
    }

    /// Persist the (possibly mutated) config back to `<bundle>/config.json`.
    pub fn persist(&self, bundle: &Path) -> Result<()> {
        let path = bundle.join(CONFIG_JSON);
        let json = serde_json::to_vec_pretty(self).context("serialize bundle config")?;

        std::fs::write(&path, json)
            .with_context(|| format!("write {}", path.display()))
            .context(ErrorKind::IoFailed.to_string())
    }

    /// The container rootfs directory for the given bundle.
    pub fn rootfs(bundle: &Path) -> PathBuf {
        bundle.join(ROOTFS_DIR)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
/// The state document the runtime passes on the hook's stdin.
pub struct RuntimeState {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,

    pub bundle: PathBuf,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,

    #[serde(flatten)]
    pub(crate) extra: Map<String, Value>,
}

impl RuntimeState {
    /// Parse the state blob from the given reader (usually stdin).
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        serde_json::from_reader(reader)
            .context("parse runtime state blob")
            .context(ErrorKind::ConfigInvalid.to_string())
    }
}
