//! Linux netfilter rule-set manager: accumulate pending rules, apply them
//! atomically through the restore binaries, remove them symmetrically.

use crate::error::ErrorKind;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{Getters, Setters};
use log::{debug, trace, warn};
use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    path::PathBuf,
    process::{Output, Stdio},
    sync::{Arc, Mutex},
};
use strum::{AsRefStr, Display};
use tokio::{io::AsyncWriteExt, process::Command};

/// The custom chain the framework owns in the filter table. Created on demand
/// when a rule set references it.
pub const INPUT_CHAIN_NAME: &str = "DobbyInputChain";

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
/// IP family a rule set applies to.
pub enum IpFamily {
    V4,
    V6,
}

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
#[strum(serialize_all = "lowercase")]
/// The kernel tables rules can target.
pub enum TableKind {
    Raw,
    Mangle,
    Nat,
    Filter,
    Security,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// How staged rules are materialized.
pub enum Operation {
    /// Prepend to the chain.
    Insert,
    /// Append to the chain.
    Append,
    /// Remove a previously applied rule; the kernel matches by full text.
    Delete,
}

impl Operation {
    fn restore_flag(self) -> &'static str {
        match self {
            Operation::Insert => "-I",
            Operation::Append => "-A",
            Operation::Delete => "-D",
        }
    }
}

/// Ordered rule strings per table. Each rule starts with the chain name and
/// must carry a `-m comment --comment <plugin>:<container-id>` field so a
/// later teardown can delete it unambiguously.
pub type RuleSet = BTreeMap<TableKind, Vec<String>>;

/// Build the canonical (unquoted) ownership tag for rule comments.
pub fn comment_tag(plugin: &str, container_id: &str) -> String {
    format!("{}:{}", plugin, container_id)
}

#[derive(Clone, Debug)]
struct PendingRule {
    table: TableKind,
    operation: Operation,
    rule: String,
}

#[derive(Debug, Default)]
struct Pending {
    v4: Vec<PendingRule>,
    v6: Vec<PendingRule>,
}

impl Pending {
    fn family(&mut self, family: IpFamily) -> &mut Vec<PendingRule> {
        match family {
            IpFamily::V4 => &mut self.v4,
            IpFamily::V6 => &mut self.v6,
        }
    }
}

#[derive(Builder, Getters, Setters)]
#[builder(pattern = "owned", setter(into))]
/// The main interface to the kernel netfilter tables.
pub struct Netfilter {
    #[get]
    #[builder(default = "default_binary(\"iptables\")")]
    /// Path to the `iptables` binary.
    iptables_binary: PathBuf,

    #[get]
    #[builder(default = "default_binary(\"ip6tables\")")]
    /// Path to the `ip6tables` binary.
    ip6tables_binary: PathBuf,

    #[get]
    #[builder(default = "default_binary(\"iptables-restore\")")]
    /// Path to the `iptables-restore` binary.
    iptables_restore_binary: PathBuf,

    #[get]
    #[builder(default = "default_binary(\"ip6tables-restore\")")]
    /// Path to the `ip6tables-restore` binary.
    ip6tables_restore_binary: PathBuf,

    #[getset(set, get)]
    #[builder(private, default = "Box::new(DefaultExecCommand)")]
    /// Internal command executor to be used.
    exec_command: Box<dyn ExecCommand>,

    #[builder(private, default)]
    pending: Arc<Mutex<Pending>>,
}

fn default_binary(name: &str) -> PathBuf {
    which::which(name).unwrap_or_else(|_| PathBuf::from(format!("/usr/sbin/{}", name)))
}

impl Debug for Netfilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Netfilter")
            .field("iptables_binary", self.iptables_binary())
            .field("ip6tables_binary", self.ip6tables_binary())
            .field("iptables_restore_binary", self.iptables_restore_binary())
            .field("ip6tables_restore_binary", self.ip6tables_restore_binary())
            .finish()
    }
}

#[async_trait]
trait ExecCommand: DynClone + Send + Sync {
    async fn output(&self, command: &mut Command) -> Result<Output> {
        command.output().await.context("run command")
    }

    async fn output_with_input(&self, command: &mut Command, input: &str) -> Result<Output> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn command")?;

        let mut stdin = child.stdin.take().context("no stdin handle")?;
        stdin
            .write_all(input.as_bytes())
            .await
            .context("write command input")?;
        drop(stdin);

        child.wait_with_output().await.context("wait for command")
    }
}

clone_trait_object!(ExecCommand);

#[derive(Clone, Default)]
/// DefaultExecCommand is a wrapper which can be used to execute the netfilter
/// binaries in a standard way.
struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

impl Netfilter {
    /// Stage the rules of `ruleset` for the given family and operation. The
    /// rules are not touched in the kernel until `apply_rules` runs.
    ///
    /// Insert and append rules are validated with an `iptables --check`
    /// dry-run where feasible; a check that cannot run (missing binary,
    /// unknown chain) accepts the rule blindly.
    pub async fn add_rules(
        &self,
        ruleset: &RuleSet,
        family: IpFamily,
        operation: Operation,
    ) -> Result<()> {
        for (table, rules) in ruleset {
            for rule in rules {
                if operation != Operation::Delete {
                    self.check_rule(family, *table, rule).await?;
                }

                trace!("staging {:?} rule [{}] {}", operation, table, rule);
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.family(family).push(PendingRule {
                    table: *table,
                    operation,
                    rule: rule.clone(),
                });
            }
        }

        Ok(())
    }

    /// Number of rules currently staged for the family.
    pub fn pending_rules(&self, family: IpFamily) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.family(family).len()
    }

    /// Materialize all pending rules for the family in one restore
    /// transaction. Partial failure leaves the kernel tables unchanged and
    /// the staging buffer intact so the caller may retry or roll back.
    pub async fn apply_rules(&self, family: IpFamily) -> Result<()> {
        let staged = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.family(family).clone()
        };
        if staged.is_empty() {
            debug!("no pending {} rules to apply", family);
            return Ok(());
        }

        let payload = Self::restore_payload(&staged);
        trace!("applying {} rules:\n{}", family, payload);

        let binary = match family {
            IpFamily::V4 => self.iptables_restore_binary(),
            IpFamily::V6 => self.ip6tables_restore_binary(),
        };

        let output = self
            .exec_command()
            .output_with_input(
                Command::new(binary).arg("--noflush").arg("--verbose"),
                &payload,
            )
            .await
            .context("run restore binary")
            .context(ErrorKind::ResourceUnavailable.to_string())?;

        if !output.status.success() {
            bail!(
                "{}: {} failed: {}",
                ErrorKind::SyscallFailed,
                binary.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.family(family).clear();
        Ok(())
    }

    /// Drop all staged rules for the family without touching the kernel.
    pub fn discard_rules(&self, family: IpFamily) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.family(family).clear();
    }

    /// Create the framework's custom input chain in the filter table when it
    /// does not exist yet. An already existing chain is not an error.
    pub async fn ensure_input_chain(&self, family: IpFamily) -> Result<()> {
        let binary = match family {
            IpFamily::V4 => self.iptables_binary(),
            IpFamily::V6 => self.ip6tables_binary(),
        };

        let output = self
            .exec_command()
            .output(
                Command::new(binary)
                    .arg("--wait")
                    .args(&["-t", TableKind::Filter.as_ref(), "-N", INPUT_CHAIN_NAME]),
            )
            .await
            .context("run iptables")
            .context(ErrorKind::ResourceUnavailable.to_string())?;

        if !output.status.success() {
            debug!(
                "chain {} already present or not creatable: {}",
                INPUT_CHAIN_NAME,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }

    /// Dry-run a rule against the kernel. Only a definite usage error
    /// (exit code 2) rejects the rule; everything else accepts it, since the
    /// rule may legitimately not be installed yet.
    async fn check_rule(&self, family: IpFamily, table: TableKind, rule: &str) -> Result<()> {
        let binary = match family {
            IpFamily::V4 => self.iptables_binary(),
            IpFamily::V6 => self.ip6tables_binary(),
        };

        let mut args = vec!["--wait", "-t", table.as_ref(), "--check"];
        args.extend(rule.split_whitespace());

        let output = match self
            .exec_command()
            .output(Command::new(binary).args(&args))
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!("rule validation unavailable, accepting blindly: {}", e);
                return Ok(());
            }
        };

        if output.status.code() == Some(2) {
            bail!(
                "{}: malformed rule [{}] {}: {}",
                ErrorKind::ConfigInvalid,
                table,
                rule,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }

    /// Serialize staged rules into restore input. Tables appear in a fixed
    /// order; rules within a table keep their staging order.
    fn restore_payload(staged: &[PendingRule]) -> String {
        let mut by_table: BTreeMap<TableKind, Vec<&PendingRule>> = BTreeMap::new();
        for rule in staged {
            by_table.entry(rule.table).or_default().push(rule);
        }

        let mut payload = String::new();
        for (table, rules) in by_table {
            payload.push_str(&format!("*{}\n", table));
            for rule in rules {
                payload.push_str(&format!(
                    "{} {}\n",
                    rule.operation.restore_flag(),
                    rule.rule
                ));
            }
            payload.push_str("COMMIT\n");
        }
        payload
    }
}
