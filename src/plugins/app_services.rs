//! Punches firewall holes so the container can reach host-side application
//! services through the bridge.

use crate::{
    hooks::HookMask,
    netfilter::{comment_tag, IpFamily, Netfilter, NetfilterBuilder, Operation, RuleSet, TableKind,
        INPUT_CHAIN_NAME},
    registry::HookPlugin,
    utils::PluginUtils,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use std::{net::Ipv4Addr, sync::Arc};

/// The host end of the container bridge.
const BRIDGE_INTERFACE: &str = "dobby0";
const BRIDGE_ADDRESS: Ipv4Addr = Ipv4Addr::new(100, 64, 11, 1);

/// Tag attached to every rule this plugin installs, so teardown deletes
/// exactly its own rules.
const RULE_TAG_PLUGIN: &str = "asplugin";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AppServicesData {
    /// Local host ports the container may connect to.
    ports: Vec<u16>,
}

/// Installs per-port ACCEPT and DNAT rules at createRuntime, tagged with the
/// container id, and deletes the same rules symmetrically at postHalt.
pub struct AppServicesPlugin {
    dependencies: Vec<String>,
    netfilter: Netfilter,
}

impl AppServicesPlugin {
    pub const NAME: &'static str = "appservices";

    pub fn construct(utils: &Arc<PluginUtils>) -> Box<dyn HookPlugin> {
        Box::new(Self {
            dependencies: utils.plugin_dependencies(Self::NAME),
            netfilter: NetfilterBuilder::default()
                .build()
                .expect("netfilter defaults are complete"),
        })
    }

    /// Build the rule set for the container: one ACCEPT on the framework's
    /// input chain and one PREROUTING DNAT per configured port.
    fn construct_rules(container_ip: Ipv4Addr, container_id: &str, ports: &[u16]) -> RuleSet {
        let source = Ipv4Network::new(container_ip, 32).expect("/32 is always valid");
        let tag = comment_tag(RULE_TAG_PLUGIN, container_id);

        let mut accept_rules = vec![];
        let mut nat_rules = vec![];
        for port in ports {
            accept_rules.push(format!(
                "{} -s {} -d 127.0.0.1/32 -i {} -p tcp -m tcp --dport {} \
                 -m comment --comment {} -j ACCEPT",
                INPUT_CHAIN_NAME, source, BRIDGE_INTERFACE, port, tag
            ));
            nat_rules.push(format!(
                "PREROUTING -s {} -d {}/32 -i {} -p tcp -m tcp --dport {} \
                 -m comment --comment {} -j DNAT --to-destination 127.0.0.1:{}",
                source, BRIDGE_ADDRESS, BRIDGE_INTERFACE, port, tag, port
            ));
        }

        let mut ruleset = RuleSet::new();
        ruleset.insert(TableKind::Filter, accept_rules);
        ruleset.insert(TableKind::Nat, nat_rules);
        ruleset
    }

    async fn container_rules(&self, utils: &Arc<PluginUtils>) -> Result<RuleSet> {
        let data: AppServicesData = utils.plugin_data(Self::NAME)?.unwrap_or_default();
        let info = utils
            .container_network_info()
            .context("appservices needs the container address")?;

        Ok(Self::construct_rules(
            info.ip_address,
            utils.container_id(),
            &data.ports,
        ))
    }
}

#[async_trait]
impl HookPlugin for AppServicesPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hook_mask(&self) -> HookMask {
        HookMask::CREATE_RUNTIME | HookMask::POST_HALT
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn create_runtime(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        let ruleset = self.container_rules(utils).await?;

        self.netfilter.ensure_input_chain(IpFamily::V4).await?;
        self.netfilter
            .add_rules(&ruleset, IpFamily::V4, Operation::Insert)
            .await?;
        self.netfilter.apply_rules(IpFamily::V4).await
    }

    async fn post_halt(&self, utils: &Arc<PluginUtils>) -> Result<()> {
        let ruleset = self.container_rules(utils).await?;

        self.netfilter
            .add_rules(&ruleset, IpFamily::V4, Operation::Delete)
            .await?;
        self.netfilter.apply_rules(IpFamily::V4).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_match_expected_wire_format() {
        let ruleset = AppServicesPlugin::construct_rules(
            Ipv4Addr::new(100, 64, 11, 2),
            "c1",
            &[9001],
        );

        assert_eq!(
            ruleset[&TableKind::Filter],
            vec![
                "DobbyInputChain -s 100.64.11.2/32 -d 127.0.0.1/32 -i dobby0 -p tcp -m tcp \
                 --dport 9001 -m comment --comment asplugin:c1 -j ACCEPT"
            ]
        );
        assert_eq!(
            ruleset[&TableKind::Nat],
            vec![
                "PREROUTING -s 100.64.11.2/32 -d 100.64.11.1/32 -i dobby0 -p tcp -m tcp \
                 --dport 9001 -m comment --comment asplugin:c1 -j DNAT \
                 --to-destination 127.0.0.1:9001"
            ]
        );
    }

    #[test]
    fn one_rule_pair_per_port() {
        let ruleset = AppServicesPlugin::construct_rules(
            Ipv4Addr::new(100, 64, 11, 7),
            "c2",
            &[80, 443, 9001],
        );

        assert_eq!(ruleset[&TableKind::Filter].len(), 3);
        assert_eq!(ruleset[&TableKind::Nat].len(), 3);
        for rule in &ruleset[&TableKind::Filter] {
            assert!(rule.contains("asplugin:c2"));
            assert!(rule.starts_with(INPUT_CHAIN_NAME));
        }
    }

    #[test]
    fn no_ports_no_rules() {
        let ruleset =
            AppServicesPlugin::construct_rules(Ipv4Addr::new(100, 64, 11, 2), "c1", &[]);
        assert!(ruleset[&TableKind::Filter].is_empty());
        assert!(ruleset[&TableKind::Nat].is_empty());
    }
}
