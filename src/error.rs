//! Error handling helpers and primitives.

use anyhow::Error;
use strum::{AsRefStr, Display};

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "kebab_case")]
/// The error classes surfaced by the framework. Attached to anyhow chains so
/// callers can correlate a failure with the hook policy table.
pub enum ErrorKind {
    /// Parsed bundle config missing or malformed required fields.
    ConfigInvalid,

    /// A name in dependencies or config has no implementation.
    PluginNotFound,

    /// The plugin dependency graph has a cycle.
    PluginCycle,

    /// A plugin callback returned an error.
    PluginFailure,

    /// Loop device, cgroup controller, iptables binary or similar absent.
    ResourceUnavailable,

    /// A syscall (mount, setns, open) returned an error.
    SyscallFailed,

    /// Read/write on bundle files failed.
    IoFailed,
}

/// Chain creates a string from an error stack.
pub fn chain(res: Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[derive(Debug, Default)]
/// Collects the failures of a continue-on-error hook so the aggregate result
/// can name every plugin that failed without stopping the pass.
pub struct MultiError {
    failures: Vec<(String, String)>,
}

impl MultiError {
    /// Record a failure for the named plugin.
    pub fn push(&mut self, plugin: &str, err: Error) {
        self.failures.push((plugin.into(), chain(err)));
    }

    /// True when no failure has been recorded.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Convert into a single error listing every failure, or `Ok(())` when
    /// nothing was recorded.
    pub fn into_result(self) -> anyhow::Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }

        let summary = self
            .failures
            .iter()
            .map(|(plugin, err)| format!("{}: {}", plugin, err))
            .collect::<Vec<_>>()
            .join("; ");

        Err(anyhow::anyhow!("{}", summary).context(ErrorKind::PluginFailure.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chain() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn kind_display() {
        assert_eq!(ErrorKind::ConfigInvalid.to_string(), "config-invalid");
        assert_eq!(ErrorKind::PluginCycle.to_string(), "plugin-cycle");
        assert_eq!(
            ErrorKind::ResourceUnavailable.to_string(),
            "resource-unavailable"
        );
    }

    #[test]
    fn multi_error_empty() {
        assert!(MultiError::default().into_result().is_ok());
    }

    #[test]
    fn multi_error_collects_all() {
        let mut multi = MultiError::default();
        multi.push("gpu", anyhow!("no controller"));
        multi.push("logging", anyhow!("no sink"));

        let err = multi.into_result().unwrap_err();
        let flat = super::chain(err);
        assert!(flat.contains("gpu: no controller"));
        assert!(flat.contains("logging: no sink"));
    }
}
