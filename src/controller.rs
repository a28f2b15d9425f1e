//! Controller: owns one [`Drone`] per host, the plugin stack, and the
//! shared [`Config`], and drives the five `init` sub-phases followed by the
//! marker-DAG deployment loop and cleanup.

use crate::config::Config;
use crate::drone::Drone;
use crate::error::Error;
use crate::logcheck::LogChecker;
use crate::manifest::{DataFileLibrary, ManifestLibrary};
use crate::plan::Plan;
use crate::plan::PlanBuilder;
use crate::plugin::{Plugin, Step};
use crate::rsh::RemoteShell;
use crate::status::{NullCallback, StatusCallback, StatusEvent, UnitKind, UnitStatus};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

const DEFAULT_INSTALL_COMMANDS: &[&str] = &[
    "test -x /usr/bin/puppet",
    "yum install -y puppet",
    "apt-get install -y puppet",
];
const DEFAULT_FACT_COMMAND: &str = "facter -p";
const DEFAULT_AGENT_CONFIG_PATH: &str = "/etc/puppet/puppet.conf";
const DEFAULT_AGENT_CONFIG_TEMPLATE: &str = "[main]\ncertname={host}\n";

fn config_single<'a>(config: &'a Config, key: &str, default: &'a str) -> &'a str {
    config
        .get(key)
        .and_then(|v| v.as_single())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

fn config_multi(config: &Config, key: &str, default: &[&str]) -> Vec<String> {
    match config.get(key).and_then(|v| v.as_multi()) {
        Some(items) if !items.is_empty() => items.to_vec(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Orchestrates a fleet of [`Drone`]s against a fixed plugin stack.
pub struct Controller {
    config: Arc<Config>,
    plugins: Vec<Plugin>,
    drones: IndexMap<String, Arc<AsyncMutex<Drone>>>,
    status: Arc<dyn StatusCallback>,
    manifest_library: ManifestLibrary,
    data_files: DataFileLibrary,
    plan: Option<Plan>,
    messages: Arc<Mutex<Vec<String>>>,
}

impl Controller {
    /// Builds one drone per distinct host named in `config`, registering
    /// every plugin's modules and resources against each.
    pub fn new(
        plugins: Vec<Plugin>,
        config: Config,
        shell_factory: impl Fn(&str) -> Arc<dyn RemoteShell>,
        local_tmpdir: &Path,
        remote_tmpdir: &str,
    ) -> Result<Self, Error> {
        let mut hosts: Vec<String> = config.hosts().into_iter().collect();
        hosts.sort();

        let mut drones = IndexMap::new();
        for host in hosts {
            let shell = shell_factory(&host);
            let mut drone = Drone::new(host.clone(), shell, local_tmpdir, remote_tmpdir);
            for plugin in &plugins {
                for module in &plugin.modules {
                    drone.add_module(module)?;
                }
                for resource in &plugin.resources {
                    drone.add_resource(resource)?;
                }
            }
            drones.insert(host, Arc::new(AsyncMutex::new(drone)));
        }

        Ok(Controller {
            config: Arc::new(config),
            plugins,
            drones,
            status: Arc::new(NullCallback),
            manifest_library: ManifestLibrary::new(),
            data_files: DataFileLibrary::new(),
            plan: None,
            messages: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn set_status_callback(&mut self, callback: Arc<dyn StatusCallback>) {
        self.status = callback;
    }

    pub fn manifest_library_mut(&mut self) -> &mut ManifestLibrary {
        &mut self.manifest_library
    }

    pub fn data_files_mut(&mut self) -> &mut DataFileLibrary {
        &mut self.data_files
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    async fn emit(&self, kind: UnitKind, name: &str, status: UnitStatus) {
        self.emit_with(kind, name, status, vec![]).await;
    }

    async fn emit_with(&self, kind: UnitKind, name: &str, status: UnitStatus, messages: Vec<String>) {
        self.status
            .on_event(StatusEvent {
                kind,
                name: name.to_string(),
                status,
                messages,
            })
            .await;
    }

    /// Runs a list of phase steps: every step in declaration order, each
    /// applied concurrently (one task per drone), with a barrier between
    /// steps so step N+1 never starts before every drone finishes step N.
    async fn run_phase_steps(&self, phase: &str, steps: &[Arc<dyn Step>]) -> Result<(), Error> {
        self.emit(UnitKind::Phase, phase, UnitStatus::Start).await;
        for (idx, step) in steps.iter().enumerate() {
            let step_name = format!("{phase}/{idx}");
            self.emit(UnitKind::Step, &step_name, UnitStatus::Start).await;

            let mut set: JoinSet<Result<(), (String, Error)>> = JoinSet::new();
            for (host, drone) in &self.drones {
                let step = Arc::clone(step);
                let drone = Arc::clone(drone);
                let config = Arc::clone(&self.config);
                let messages = Arc::clone(&self.messages);
                let host = host.clone();
                set.spawn(async move {
                    let (shell, facts) = {
                        let d = drone.lock().await;
                        (d.shell_handle(), d.facts.clone())
                    };
                    step.run(shell, config, facts, messages).await.map_err(|e| (host, e))
                });
            }

            let mut failure: Option<(String, Error)> = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(pair)) => {
                        failure.get_or_insert(pair);
                    }
                    Err(join_err) => {
                        failure.get_or_insert(("<unknown>".to_string(), Error::structure("task", join_err)));
                    }
                }
            }
            let step_messages = self.messages.lock().unwrap().clone();
            self.emit_with(UnitKind::Step, &step_name, UnitStatus::End { ok: failure.is_none() }, step_messages).await;
            if let Some((host, e)) = failure {
                self.emit(UnitKind::Phase, phase, UnitStatus::End { ok: false }).await;
                return Err(Error::Transport {
                    host,
                    attempts: 1,
                    source: anyhow::anyhow!(e.to_string()),
                });
            }
        }
        self.emit(UnitKind::Phase, phase, UnitStatus::End { ok: true }).await;
        Ok(())
    }

    /// Phase 2: per-drone sequential `init_host` -> `discover` -> `configure`,
    /// run concurrently across drones with a single barrier at the end.
    async fn provision_hosts(&self) -> Result<(), Error> {
        self.emit(UnitKind::Phase, "provision", UnitStatus::Start).await;
        let install_commands = config_multi(&self.config, "core/install_commands", DEFAULT_INSTALL_COMMANDS);
        let fact_command = config_single(&self.config, "core/fact_command", DEFAULT_FACT_COMMAND).to_string();
        let agent_template =
            config_single(&self.config, "core/agent_config_template", DEFAULT_AGENT_CONFIG_TEMPLATE).to_string();
        let agent_path = config_single(&self.config, "core/agent_config_path", DEFAULT_AGENT_CONFIG_PATH).to_string();

        let mut set: JoinSet<Result<(), Error>> = JoinSet::new();
        for drone in self.drones.values() {
            let drone = Arc::clone(drone);
            let config = Arc::clone(&self.config);
            let install_commands = install_commands.clone();
            let fact_command = fact_command.clone();
            let agent_template = agent_template.clone();
            let agent_path = agent_path.clone();
            set.spawn(async move {
                let mut d = drone.lock().await;
                d.init_host(&install_commands).await?;
                d.discover(&fact_command).await?;
                d.configure(&agent_path, &agent_template, &config).await?;
                Ok(())
            });
        }

        let mut failure: Option<Error> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(join_err) => {
                    failure.get_or_insert(Error::structure("task", join_err));
                }
            }
        }
        self.emit(UnitKind::Phase, "provision", UnitStatus::End { ok: failure.is_none() }).await;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Phase 4: plan steps, run strictly in declaration order (each may
    /// consult state left by an earlier one), building the deployment
    /// [`Plan`].
    async fn run_plan_steps(&mut self) -> Result<(), Error> {
        self.emit(UnitKind::Phase, "plan", UnitStatus::Start).await;
        let mut info: IndexMap<String, IndexMap<String, String>> = IndexMap::new();
        for (host, drone) in &self.drones {
            let d = drone.lock().await;
            info.insert(host.clone(), d.facts.clone());
        }
        let info = Arc::new(info);

        let mut builder = PlanBuilder::new();
        let plugins = std::mem::take(&mut self.plugins);
        for plugin in &plugins {
            for step in &plugin.plan_steps {
                let records = step.run(Arc::clone(&self.config), Arc::clone(&info)).await;
                for record in records {
                    if let Some(drone) = self.drones.get(&record.host) {
                        let mut d = drone.lock().await;
                        d.add_manifest(&record.manifest, &self.manifest_library, &self.config, &mut self.data_files)?;
                    }
                    builder.add_record(record.host, record.manifest, record.marker, record.prerequisites);
                }
            }
        }
        self.plugins = plugins;

        let plan = builder.build()?;
        self.plan = Some(plan);
        self.emit(UnitKind::Phase, "plan", UnitStatus::End { ok: true }).await;
        Ok(())
    }

    /// Phase 5: assembles and transfers every drone's build tree
    /// concurrently, with a single barrier.
    async fn make_builds(&self) -> Result<(), Error> {
        self.emit(UnitKind::Phase, "build", UnitStatus::Start).await;
        let mut set: JoinSet<Result<(), (String, Error)>> = JoinSet::new();
        for (host, drone) in &self.drones {
            let drone = Arc::clone(drone);
            let host = host.clone();
            set.spawn(async move {
                let d = drone.lock().await;
                d.make_build().await.map_err(|e| (host, e))
            });
        }
        let mut failure: Option<(String, Error)> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(pair)) => {
                    failure.get_or_insert(pair);
                }
                Err(join_err) => {
                    failure.get_or_insert(("<unknown>".to_string(), Error::structure("task", join_err)));
                }
            }
        }
        self.emit(UnitKind::Phase, "build", UnitStatus::End { ok: failure.is_none() }).await;
        if let Some((host, e)) = failure {
            return Err(Error::Transport {
                host,
                attempts: 1,
                source: anyhow::anyhow!(e.to_string()),
            });
        }
        Ok(())
    }

    /// Runs all five `init` sub-phases in order: init steps, host
    /// provisioning, prep steps, plan steps, and build assembly.
    pub async fn run_init(&mut self) -> Result<(), Error> {
        let init_steps: Vec<_> = self.plugins.iter().flat_map(|p| p.init_steps.iter().cloned()).collect();
        self.run_phase_steps("init", &init_steps).await?;

        self.provision_hosts().await?;

        let prep_steps: Vec<_> = self.plugins.iter().flat_map(|p| p.prep_steps.iter().cloned()).collect();
        self.run_phase_steps("prep", &prep_steps).await?;

        self.run_plan_steps().await?;
        self.make_builds().await?;
        Ok(())
    }

    /// Drives the marker DAG to completion: unblocked markers are started
    /// together, each spawning one deploy task per (host, manifest) pair;
    /// a marker finishes once every one of its tasks has. With
    /// `finish_on_error = false` the first failure aborts every
    /// in-flight task and returns immediately; with `true`, every
    /// scheduled task runs to completion and failures are collected into
    /// [`Error::Aggregate`].
    pub async fn run_deployment(
        &mut self,
        log_checker: Arc<LogChecker>,
        apply_template: &str,
        timeout: Option<Duration>,
        finish_on_error: bool,
    ) -> Result<(), Error> {
        let mut plan = self
            .plan
            .take()
            .ok_or_else(|| Error::config("plan", "run_init has not produced a plan"))?;

        let mut set: JoinSet<(String, String, String, Result<(), Error>)> = JoinSet::new();
        let mut remaining: HashMap<String, usize> = HashMap::new();
        let aborted = Arc::new(AtomicBool::new(false));
        let mut failures: Vec<(String, String, Error)> = Vec::new();
        let apply_template = apply_template.to_string();
        let data_files = Arc::new(self.data_files.clone());

        loop {
            for marker in plan.unblocked() {
                plan.start(&marker);
                let targets = plan.manifests.get(&marker).cloned().unwrap_or_default();
                remaining.insert(marker.clone(), targets.len());
                self.emit(UnitKind::Marker, &marker, UnitStatus::Start).await;
                for (host, manifest) in targets {
                    let Some(drone) = self.drones.get(&host).cloned() else {
                        continue;
                    };
                    let log_checker = Arc::clone(&log_checker);
                    let marker = marker.clone();
                    let aborted = Arc::clone(&aborted);
                    let apply_template = apply_template.clone();
                    let data_files = Arc::clone(&data_files);
                    let status = Arc::clone(&self.status);
                    set.spawn(async move {
                        if aborted.load(Ordering::SeqCst) {
                            return (marker, host, manifest, Ok(()));
                        }
                        let mut d = drone.lock().await;
                        let result = d
                            .deploy(&manifest, &apply_template, &log_checker, timeout, data_files.as_ref(), status.as_ref())
                            .await;
                        (marker, host, manifest, result)
                    });
                }
            }

            if plan.is_complete() {
                break;
            }
            let Some(joined) = set.join_next().await else {
                break;
            };
            let (marker, host, manifest, result) = joined.map_err(|e| Error::structure("task", e))?;
            if let Err(e) = result {
                if finish_on_error {
                    failures.push((host, manifest, e));
                } else {
                    aborted.store(true, Ordering::SeqCst);
                    while set.join_next().await.is_some() {}
                    self.emit(UnitKind::Marker, &marker, UnitStatus::End { ok: false }).await;
                    return Err(e);
                }
            }
            if let Some(count) = remaining.get_mut(&marker) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    plan.finish(&marker);
                    self.emit(UnitKind::Marker, &marker, UnitStatus::End { ok: true }).await;
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(failures))
        }
    }

    /// Runs every plugin's `clean` steps, then each drone's own cleanup,
    /// both concurrently per drone.
    pub async fn run_cleanup(&self) -> Result<(), Error> {
        let clean_steps: Vec<_> = self.plugins.iter().flat_map(|p| p.clean_steps.iter().cloned()).collect();
        self.run_phase_steps("clean_steps", &clean_steps).await?;

        self.emit(UnitKind::Phase, "clean", UnitStatus::Start).await;
        let mut set: JoinSet<Result<(), Error>> = JoinSet::new();
        for drone in self.drones.values() {
            let drone = Arc::clone(drone);
            set.spawn(async move {
                let d = drone.lock().await;
                d.clean().await
            });
        }
        while set.join_next().await.is_some() {}
        self.emit(UnitKind::Phase, "clean", UnitStatus::End { ok: true }).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamSpec;
    use crate::rsh::fake::FakeShell;
    use async_trait::async_trait;
    use std::collections::HashSet as StdHashSet;
    use std::sync::Mutex;

    fn single_host_config(host: &str) -> Config {
        let mut meta = IndexMap::new();
        meta.insert("core/host".to_string(), ParamSpec::new("core/host", ""));
        let mut config = Config::new(meta);
        config.set("core/host", host).unwrap();
        config
    }

    fn two_host_config(a: &str, b: &str) -> Config {
        let mut meta = IndexMap::new();
        meta.insert(
            "core/hosts".to_string(),
            ParamSpec::new("core/hosts", "").multi(vec![]),
        );
        let mut config = Config::new(meta);
        config.set("core/hosts", &format!("{a},{b}")).unwrap();
        config
    }

    struct RecordingStep {
        label: String,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Step for RecordingStep {
        async fn run(
            &self,
            shell: Arc<dyn RemoteShell>,
            _config: Arc<Config>,
            _facts: IndexMap<String, String>,
            _messages: Arc<Mutex<Vec<String>>>,
        ) -> Result<(), Error> {
            self.order.lock().unwrap().push(format!("{}:{}", self.label, shell.host()));
            Ok(())
        }
    }

    struct FailingStep;

    #[async_trait]
    impl Step for FailingStep {
        async fn run(
            &self,
            shell: Arc<dyn RemoteShell>,
            _config: Arc<Config>,
            _facts: IndexMap<String, String>,
            _messages: Arc<Mutex<Vec<String>>>,
        ) -> Result<(), Error> {
            Err(Error::config(shell.host(), "boom"))
        }
    }

    mod construction {
        use super::*;

        #[test]
        fn builds_one_drone_per_distinct_host() {
            let config = two_host_config("h1", "h2");
            let dir = tempfile::tempdir().unwrap();
            let controller = Controller::new(vec![], config, |h| Arc::new(FakeShell::new(h)) as Arc<dyn RemoteShell>, dir.path(), "/tmp/remote").unwrap();
            assert_eq!(controller.drones.len(), 2);
        }

        #[test]
        fn rejects_plugin_module_missing_known_subdirs() {
            let config = single_host_config("h1");
            let dir = tempfile::tempdir().unwrap();
            let empty_module = dir.path().join("bad_module");
            std::fs::create_dir_all(&empty_module).unwrap();

            let mut plugin = Plugin::new("p");
            plugin.modules.push(empty_module);
            let result = Controller::new(vec![plugin], config, |h| Arc::new(FakeShell::new(h)) as Arc<dyn RemoteShell>, dir.path(), "/tmp/remote");
            assert!(result.is_err());
        }
    }

    mod run_phase_steps {
        use super::*;

        #[tokio::test]
        async fn steps_run_in_order_with_a_barrier_between_them() {
            let config = two_host_config("h1", "h2");
            let dir = tempfile::tempdir().unwrap();
            let controller = Controller::new(vec![], config, |h| Arc::new(FakeShell::new(h)) as Arc<dyn RemoteShell>, dir.path(), "/tmp/remote").unwrap();

            let order = Arc::new(Mutex::new(Vec::new()));
            let steps: Vec<Arc<dyn Step>> = vec![
                Arc::new(RecordingStep { label: "first".to_string(), order: Arc::clone(&order) }),
                Arc::new(RecordingStep { label: "second".to_string(), order: Arc::clone(&order) }),
            ];

            controller.run_phase_steps("test", &steps).await.unwrap();

            let recorded = order.lock().unwrap();
            let firsts: StdHashSet<&String> = recorded.iter().filter(|s| s.starts_with("first")).collect();
            let seconds_start = recorded.iter().position(|s| s.starts_with("second")).unwrap();
            let firsts_end = recorded.iter().rposition(|s| s.starts_with("first")).unwrap();
            assert_eq!(firsts.len(), 2);
            assert!(firsts_end < seconds_start);
        }

        #[tokio::test]
        async fn a_failing_step_fails_the_whole_phase() {
            let config = single_host_config("h1");
            let dir = tempfile::tempdir().unwrap();
            let controller = Controller::new(vec![], config, |h| Arc::new(FakeShell::new(h)) as Arc<dyn RemoteShell>, dir.path(), "/tmp/remote").unwrap();

            let steps: Vec<Arc<dyn Step>> = vec![Arc::new(FailingStep)];
            let result = controller.run_phase_steps("test", &steps).await;
            assert!(result.is_err());
        }
    }
}
