//! Pre-opens multicast UDP sockets on the host and hands them into the
//! container as preserved file descriptors.

use crate::{
    error::ErrorKind,
    hooks::HookMask,
    registry::HookPlugin,
    utils::PluginUtils,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::warn;
use nix::{
    sys::socket::{
        bind, setsockopt, socket, sockopt, AddressFamily, InetAddr, IpAddr, SockAddr, SockFlag,
        SockType,
    },
    unistd,
};
use serde::Deserialize;
use std::{net::Ipv4Addr, os::unix::io::RawFd, sync::Arc};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MulticastData {
    server_sockets: Vec<ServerSocket>,
    client_sockets: Vec<ClientSocket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerSocket {
    name: String,
    ip: Ipv4Addr,
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientSocket {
    name: String,
}

/// Creates bound server sockets and plain client sockets before the
/// container exists, registers them as preserved fds and exports
/// `MCAST_SERVER_SOCKET_<name>_FD` / `MCAST_CLIENT_SOCKET_<name>_FD`
/// variables carrying the in-container fd numbers.
pub struct MulticastSocketsPlugin {
    dependencies: Vec<String>,
}

impl MulticastSocketsPlugin {
    pub const NAME: &'static str = "multicastsockets";

    pub fn construct(utils: &Arc<PluginUtils>) -> Box<dyn HookPlugin> {
        Box::new(Self {
            dependencies: utils.plugin_dependencies(Self::NAME),
        })
    }

    fn create_server_socket(ip: Ipv4Addr, port: u16) -> Result<RawFd> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("create server socket")
        .context(ErrorKind::SyscallFailed.to_string())?;

        let result = setsockopt(fd, sockopt::ReuseAddr, &true)
            .context("set SO_REUSEADDR")
            .and_then(|_| {
                bind(
                    fd,
                    &SockAddr::new_inet(InetAddr::new(IpAddr::from_std(&ip.into()), port)),
                )
                .with_context(|| format!("bind {}:{}", ip, port))
            })
            .context(ErrorKind::SyscallFailed.to_string());

        if let Err(e) = result {
            let _ = unistd::close(fd);
            return Err(e);
        }
        Ok(fd)
    }

    fn create_client_socket() -> Result<RawFd> {
        socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("create client socket")
        .context(ErrorKind::SyscallFailed.to_string())
    }

    fn register(utils: &Arc<PluginUtils>, fd: RawFd, env_prefix: &str, name: &str) -> Result<()> {
        let container_fd = utils.add_file_descriptor(Self::NAME, fd);
        if let Err(e) = unistd::close(fd) {
            warn!("failed to close original socket fd {}: {}", fd, e);
        }

        utils.add_environment_var(&format!("{}_{}_FD={}", env_prefix, name, container_fd?));
        Ok(())
    }
}

#[async_trait]
impl HookPlugin for MulticastSocketsPlugin {
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
        let data: MulticastData = utils.plugin_data(Self::NAME)?.unwrap_or_default();

        for server in &data.server_sockets {
            let fd = Self::create_server_socket(server.ip, server.port)?;
            Self::register(utils, fd, "MCAST_SERVER_SOCKET", &server.name)?;
        }

        for client in &data.client_sockets {
            let fd = Self::create_client_socket()?;
            Self::register(utils, fd, "MCAST_CLIENT_SOCKET", &client.name)?;
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
            MulticastSocketsPlugin::NAME.into(),
            PluginSpec {
                required: false,
                depends_on: vec![],
                data,
            },
        );
        Arc::new(PluginUtils::new(config, None, Path::new("/tmp")))
    }

    #[tokio::test]
    async fn sockets_become_preserved_fds_with_env() -> Result<()> {
        let utils = utils_with_data(serde_json::json!({
            "serverSockets": [
                {"name": "AS", "ip": "127.0.0.1", "port": 0}
            ],
            "clientSockets": [
                {"name": "AS"}
            ]
        }));

        let plugin = MulticastSocketsPlugin::construct(&utils);
        plugin.pre_creation(&utils).await?;

        assert_eq!(utils.files_for(MulticastSocketsPlugin::NAME).len(), 2);

        let env = utils.with_config(|c| c.process.env.clone());
        assert!(env.contains(&"MCAST_SERVER_SOCKET_AS_FD=3".to_string()));
        assert!(env.contains(&"MCAST_CLIENT_SOCKET_AS_FD=4".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn no_data_is_a_noop() -> Result<()> {
        let utils = utils_with_data(serde_json::Value::Null);
        let plugin = MulticastSocketsPlugin::construct(&utils);
        plugin.pre_creation(&utils).await?;
        assert!(utils.files().is_empty());
        Ok(())
    }
}
