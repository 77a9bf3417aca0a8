//! Dependency-ordered plugin execution at a single hook point.

use crate::{
    error::{ErrorKind, MultiError},
    hooks::HookPoint,
    registry::HookPlugin,
    utils::PluginUtils,
};
use anyhow::{bail, Context, Result};
use log::{debug, error, warn};
use std::sync::Arc;

/// Drives one hook point over an instantiated plugin set.
pub struct Dispatcher;

impl Dispatcher {
    /// Compute the execution order for a hook point: the plugins whose mask
    /// contains the hook, topologically sorted by their declared
    /// dependencies. Ties are broken by registration order, so identical
    /// inputs always produce identical plans. Teardown hooks get the exact
    /// reverse of the forward plan.
    ///
    /// A dependency naming no known plugin is an error; one naming a plugin
    /// that simply does not participate in this hook is ignored.
    pub fn plan(plugins: &[Box<dyn HookPlugin>], hook: HookPoint) -> Result<Vec<usize>> {
        let known = |name: &str| plugins.iter().any(|p| p.name() == name);

        let selected: Vec<usize> = plugins
            .iter()
            .enumerate()
            .filter(|(_, p)| p.hook_mask().contains(hook.flag()))
            .map(|(i, _)| i)
            .collect();

        // edges: dependency -> dependent, within the selected subset
        let mut indegree = vec![0usize; plugins.len()];
        let mut dependents: Vec<Vec<usize>> = vec![vec![]; plugins.len()];
        for &index in &selected {
            for dependency in plugins[index].dependencies() {
                if !known(&dependency) {
                    bail!(
                        "{}: plugin {} depends on unknown plugin {}",
                        ErrorKind::PluginNotFound,
                        plugins[index].name(),
                        dependency
                    );
                }

                if let Some(&dep_index) = selected
                    .iter()
                    .find(|&&i| plugins[i].name() == dependency)
                {
                    dependents[dep_index].push(index);
                    indegree[index] += 1;
                }
            }
        }

        // Kahn's algorithm; always take the first ready vertex in selection
        // order so ties stay stable
        let mut order = Vec::with_capacity(selected.len());
        let mut placed = vec![false; plugins.len()];
        loop {
            let next = selected
                .iter()
                .copied()
                .find(|&i| !placed[i] && indegree[i] == 0);

            let index = match next {
                Some(index) => index,
                None => break,
            };

            placed[index] = true;
            order.push(index);
            for &dependent in &dependents[index] {
                indegree[dependent] -= 1;
            }
        }

        if order.len() != selected.len() {
            let cycle: Vec<&str> = selected
                .iter()
                .filter(|&&i| !placed[i])
                .map(|&i| plugins[i].name())
                .collect();
            bail!(
                "{}: dependency cycle between plugins [{}]",
                ErrorKind::PluginCycle,
                cycle.join(", ")
            );
        }

        if hook.is_teardown() {
            order.reverse();
        }

        Ok(order)
    }

    /// Invoke every selected plugin's callback in plan order with the shared
    /// config access.
    ///
    /// Fail-fast hooks stop at the first failure and return it; the runtime
    /// then tears the container down through the teardown hooks.
    /// Continue-on-error hooks invoke everything and aggregate the failures.
    pub async fn run(
        hook: HookPoint,
        plugins: &[Box<dyn HookPlugin>],
        utils: &Arc<PluginUtils>,
    ) -> Result<()> {
        let order = Self::plan(plugins, hook)?;
        debug!(
            "running {} plugins for hook {} on container {}",
            order.len(),
            hook,
            utils.container_id()
        );

        let mut failures = MultiError::default();
        for index in order {
            let plugin = &plugins[index];
            debug!("invoking plugin {} at {}", plugin.name(), hook);

            match plugin.dispatch(hook, utils).await {
                Ok(()) => {}
                Err(e) if hook.fail_fast() => {
                    return Err(e.context(format!(
                        "plugin {} failed at {} for container {}",
                        plugin.name(),
                        hook,
                        utils.container_id()
                    )));
                }
                Err(e) => {
                    error!(
                        "plugin {} failed at {} for container {}: {:#}",
                        plugin.name(),
                        hook,
                        utils.container_id(),
                        e
                    );
                    failures.push(plugin.name(), e);
                }
            }
        }

        if !failures.is_empty() {
            warn!(
                "hook {} for container {} finished with failures",
                hook,
                utils.container_id()
            );
        }

        failures
            .into_result()
            .with_context(|| format!("hook {} aggregate", hook))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bundle::ContainerConfig,
        error::chain,
        hooks::HookMask,
        registry::HookPlugin,
    };
    use async_trait::async_trait;
    use std::{
        path::Path,
        sync::{Arc, Mutex},
    };

    struct TestPlugin {
        name: &'static str,
        mask: HookMask,
        deps: Vec<&'static str>,
        fail_at: Option<HookPoint>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl HookPlugin for TestPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn hook_mask(&self) -> HookMask {
            self.mask
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.iter().map(ToString::to_string).collect()
        }

        async fn dispatch(&self, hook: HookPoint, _: &Arc<PluginUtils>) -> Result<()> {
            self.log.lock().unwrap().push(self.name.into());
            if self.fail_at == Some(hook) {
                anyhow::bail!("{} deliberately failed", self.name);
            }
            Ok(())
        }
    }

    fn plugin(
        name: &'static str,
        deps: Vec<&'static str>,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Box<dyn HookPlugin> {
        Box::new(TestPlugin {
            name,
            mask: HookMask::CREATE_RUNTIME | HookMask::POST_STOP,
            deps,
            fail_at: None,
            log: Arc::clone(log),
        })
    }

    fn utils() -> Arc<PluginUtils> {
        let mut config = ContainerConfig::default();
        config.hostname = "c1".into();
        Arc::new(PluginUtils::new(config, None, Path::new("/tmp")))
    }

    fn names(plugins: &[Box<dyn HookPlugin>], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| plugins[i].name().into()).collect()
    }

    #[test]
    fn plan_respects_dependencies() {
        let log = Arc::new(Mutex::new(vec![]));
        let plugins = vec![
            plugin("A", vec!["B"], &log),
            plugin("B", vec![], &log),
            plugin("C", vec!["A", "B"], &log),
        ];

        let order = Dispatcher::plan(&plugins, HookPoint::CreateRuntime).unwrap();
        assert_eq!(names(&plugins, &order), vec!["B", "A", "C"]);

        let reversed = Dispatcher::plan(&plugins, HookPoint::PostStop).unwrap();
        assert_eq!(names(&plugins, &reversed), vec!["C", "A", "B"]);
    }

    #[test]
    fn plan_is_stable_on_ties() {
        let log = Arc::new(Mutex::new(vec![]));
        let plugins = vec![
            plugin("z", vec![], &log),
            plugin("m", vec![], &log),
            plugin("a", vec![], &log),
        ];

        // no dependencies: registration order wins, not names
        let order = Dispatcher::plan(&plugins, HookPoint::CreateRuntime).unwrap();
        assert_eq!(names(&plugins, &order), vec!["z", "m", "a"]);

        let again = Dispatcher::plan(&plugins, HookPoint::CreateRuntime).unwrap();
        assert_eq!(order, again);
    }

    #[test]
    fn plan_selects_by_mask() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut plugins = vec![plugin("A", vec![], &log)];
        plugins.push(Box::new(TestPlugin {
            name: "halt-only",
            mask: HookMask::POST_HALT,
            deps: vec![],
            fail_at: None,
            log: Arc::clone(&log),
        }));

        let order = Dispatcher::plan(&plugins, HookPoint::CreateRuntime).unwrap();
        assert_eq!(names(&plugins, &order), vec!["A"]);

        let halt = Dispatcher::plan(&plugins, HookPoint::PostHalt).unwrap();
        assert_eq!(names(&plugins, &halt), vec!["halt-only"]);
    }

    #[test]
    fn dependency_outside_hook_subset_is_ignored() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut plugins = vec![plugin("A", vec!["halt-only"], &log)];
        plugins.push(Box::new(TestPlugin {
            name: "halt-only",
            mask: HookMask::POST_HALT,
            deps: vec![],
            fail_at: None,
            log: Arc::clone(&log),
        }));

        let order = Dispatcher::plan(&plugins, HookPoint::CreateRuntime).unwrap();
        assert_eq!(names(&plugins, &order), vec!["A"]);
    }

    #[test]
    fn unknown_dependency_is_an_error() {
        let log = Arc::new(Mutex::new(vec![]));
        let plugins = vec![plugin("A", vec!["ghost"], &log)];

        let err = Dispatcher::plan(&plugins, HookPoint::CreateRuntime).unwrap_err();
        assert!(chain(err).contains("plugin-not-found"));
    }

    #[test]
    fn cycle_names_its_members() {
        let log = Arc::new(Mutex::new(vec![]));
        let plugins = vec![
            plugin("A", vec!["B"], &log),
            plugin("B", vec!["A"], &log),
            plugin("C", vec![], &log),
        ];

        let err = Dispatcher::plan(&plugins, HookPoint::CreateRuntime).unwrap_err();
        let flat = chain(err);
        assert!(flat.contains("plugin-cycle"));
        assert!(flat.contains("A"));
        assert!(flat.contains("B"));
        assert!(!flat.contains("C,"));
    }

    #[tokio::test]
    async fn fail_fast_stops_at_first_failure() {
        let log = Arc::new(Mutex::new(vec![]));
        let plugins: Vec<Box<dyn HookPlugin>> = vec![
            Box::new(TestPlugin {
                name: "first",
                mask: HookMask::CREATE_RUNTIME,
                deps: vec![],
                fail_at: Some(HookPoint::CreateRuntime),
                log: Arc::clone(&log),
            }),
            plugin("second", vec![], &log),
        ];

        let err = Dispatcher::run(HookPoint::CreateRuntime, &plugins, &utils())
            .await
            .unwrap_err();
        assert!(chain(err).contains("first"));

        // the second plugin never ran
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn continue_on_error_runs_everything() {
        let log = Arc::new(Mutex::new(vec![]));
        let plugins: Vec<Box<dyn HookPlugin>> = vec![
            Box::new(TestPlugin {
                name: "first",
                mask: HookMask::POST_STOP,
                deps: vec![],
                fail_at: Some(HookPoint::PostStop),
                log: Arc::clone(&log),
            }),
            Box::new(TestPlugin {
                name: "second",
                mask: HookMask::POST_STOP,
                deps: vec![],
                fail_at: Some(HookPoint::PostStop),
                log: Arc::clone(&log),
            }),
            Box::new(TestPlugin {
                name: "third",
                mask: HookMask::POST_STOP,
                deps: vec![],
                fail_at: None,
                log: Arc::clone(&log),
            }),
        ];

        let err = Dispatcher::run(HookPoint::PostStop, &plugins, &utils())
            .await
            .unwrap_err();
        let flat = chain(err);
        assert!(flat.contains("first"));
        assert!(flat.contains("second"));

        // teardown order is reversed, and every plugin ran despite failures
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn run_success_in_order() {
        let log = Arc::new(Mutex::new(vec![]));
        let plugins = vec![
            plugin("A", vec!["B"], &log),
            plugin("B", vec![], &log),
            plugin("C", vec!["A", "B"], &log),
        ];

        Dispatcher::run(HookPoint::CreateRuntime, &plugins, &utils())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["B", "A", "C"]);
    }
}
