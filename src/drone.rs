//! Drone: the per-host worker owning an RSH, a local+remote staging area,
//! build assembly, and manifest execution with log tailing.

use crate::config::Config;
use crate::error::Error;
use crate::logcheck::LogChecker;
use crate::manifest::{DataFileLibrary, ManifestLibrary};
use crate::rsh::RemoteShell;
use crate::status::{StatusCallback, StatusEvent, UnitKind, UnitStatus};
use crate::tt::TarballTransfer;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Subdirectories every build tree carries, each created at mode 0700.
const BUILD_SUBDIRS: &[&str] = &["manifests", "modules", "resources", "logs", "hieradata"];

/// Subdirectories that make a path a recognisable module directory.
const MODULE_SUBDIRS: &[&str] = &["manifests", "files", "templates", "lib"];

/// Per-manifest application state, named the way spec §4.5 names it:
/// `queued -> spawned -> polling (repeatable) -> logged -> validated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    Queued,
    Spawned,
    Polling,
    Logged,
    Validated,
}

/// Owns the lifecycle of a single host: its shell, discovered facts,
/// registered modules/resources, rendered manifests/data files, and local
/// and remote build directories.
pub struct Drone {
    host: String,
    shell: Arc<dyn RemoteShell>,
    pub facts: IndexMap<String, String>,
    modules: Vec<PathBuf>,
    resources: Vec<PathBuf>,
    manifests: Vec<String>,
    data_files: Vec<String>,
    local_build_dir: PathBuf,
    remote_build_dir: String,
    build_id: String,
}

impl Drone {
    pub fn new(
        host: impl Into<String>,
        shell: Arc<dyn RemoteShell>,
        local_tmpdir: &Path,
        remote_tmpdir: &str,
    ) -> Self {
        let host = host.into();
        let build_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Drone {
            local_build_dir: local_tmpdir.join(format!("build-{build_id}")),
            remote_build_dir: format!("{remote_tmpdir}/build-{build_id}"),
            host,
            shell,
            facts: IndexMap::new(),
            modules: Vec::new(),
            resources: Vec::new(),
            manifests: Vec::new(),
            data_files: Vec::new(),
            build_id,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn remote_build_dir(&self) -> &str {
        &self.remote_build_dir
    }

    pub fn local_build_dir(&self) -> &Path {
        &self.local_build_dir
    }

    /// Clones the shared handle to this drone's connection, for callers
    /// that need to hand it to a spawned task.
    pub fn shell_handle(&self) -> Arc<dyn RemoteShell> {
        Arc::clone(&self.shell)
    }

    /// Tries each candidate install command with `can_fail=false`; the first
    /// zero-exit wins. Exhaustion is an install-error.
    pub async fn init_host(&self, candidates: &[String]) -> Result<(), Error> {
        for cmd in candidates {
            let result = self.shell.execute(cmd, false, &[]).await?;
            if result.exit_code == 0 {
                return Ok(());
            }
        }
        Err(Error::Install {
            host: self.host.clone(),
            candidates: candidates.to_vec(),
        })
    }

    /// Executes the host-fact tool, parsing `key => value` output line-wise
    /// and skipping non-conforming lines.
    pub async fn discover(&mut self, fact_command: &str) -> Result<(), Error> {
        let output = self.shell.execute(fact_command, true, &[]).await?;
        for line in output.stdout.lines() {
            if let Some((key, value)) = line.split_once("=>") {
                self.facts
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(())
    }

    /// Formats `template` from a context of host identity, facts,
    /// configuration, and the remote build dir, and writes it remotely via
    /// `cat > path <<'EOF' ... EOF`. Written together with the matching
    /// data file for the same manifest, per the resolved historical
    /// ambiguity.
    pub async fn configure(
        &self,
        remote_path: &str,
        template: &str,
        config: &Config,
    ) -> Result<(), Error> {
        let mut context = IndexMap::new();
        context.insert("host".to_string(), self.host.clone());
        context.insert("moduledir".to_string(), format!("{}/modules", self.remote_build_dir));
        context.insert("logdir".to_string(), format!("{}/logs", self.remote_build_dir));
        context.insert("datadir".to_string(), format!("{}/hieradata", self.remote_build_dir));
        context.insert(
            "hiera_config".to_string(),
            format!("{}/hiera.yaml", self.remote_build_dir),
        );
        for (k, v) in &self.facts {
            context.insert(k.clone(), v.clone());
        }
        for key in config.keys() {
            if let Some(value) = config.get(key).and_then(|v| v.as_single()) {
                context.insert(key.to_string(), value.to_string());
            }
        }

        let rendered = format_template(template, &context);
        let heredoc = format!("cat > {remote_path} <<'KANZO_EOF'\n{rendered}\nKANZO_EOF");
        self.shell.execute(&heredoc, true, &[]).await?;
        Ok(())
    }

    /// `path` must exist locally and contain at least one recognised module
    /// subdirectory; otherwise structure-error.
    pub fn add_module(&mut self, path: &Path) -> Result<(), Error> {
        if !path.is_dir() {
            return Err(Error::structure(path.display().to_string(), "not a directory"));
        }
        let has_known_subdir = MODULE_SUBDIRS.iter().any(|d| path.join(d).exists());
        if !has_known_subdir {
            return Err(Error::structure(
                path.display().to_string(),
                "module directory has none of the recognised subdirectories",
            ));
        }
        self.modules.push(path.to_path_buf());
        Ok(())
    }

    pub fn add_resource(&mut self, path: &Path) -> Result<(), Error> {
        if !path.exists() {
            return Err(Error::structure(path.display().to_string(), "resource path does not exist"));
        }
        self.resources.push(path.to_path_buf());
        Ok(())
    }

    /// Rerenders `name` from the manifest library into this drone's local
    /// `manifests/` area and appends it to the drone's ordered manifest
    /// list.
    pub fn add_manifest(
        &mut self,
        name: &str,
        library: &ManifestLibrary,
        config: &Config,
        data_files: &mut DataFileLibrary,
    ) -> Result<(), Error> {
        library.render(name, &self.local_build_dir.join("manifests"), config, data_files)?;
        self.manifests.push(name.to_string());
        Ok(())
    }

    /// Rerenders a data-file library entry into this drone's local
    /// `hieradata/` area.
    pub fn add_data_file(&mut self, name: &str, library: &DataFileLibrary) -> Result<(), Error> {
        library.render(name, &self.local_build_dir.join("hieradata"))?;
        self.data_files.push(name.to_string());
        Ok(())
    }

    /// Creates the local build directory tree, copies in registered
    /// modules and resources, then transfers the whole tree remotely.
    /// Cooperatively yields once after tree creation so other drones'
    /// builds may interleave.
    pub async fn make_build(&self) -> Result<(), Error> {
        for sub in BUILD_SUBDIRS {
            let dir = self.local_build_dir.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| Error::structure(dir.display().to_string(), e))?;
            set_mode_0700(&dir)?;
        }

        #[cfg(feature = "openssh")]
        tokio::task::yield_now().await;

        for module in &self.modules {
            let name = module.file_name().unwrap_or_default();
            copy_dir(module, &self.local_build_dir.join("modules").join(name))?;
        }
        for resource in &self.resources {
            let name = resource.file_name().unwrap_or_default();
            let dest = self.local_build_dir.join("resources").join(name);
            if resource.is_dir() {
                copy_dir(resource, &dest)?;
            } else {
                std::fs::copy(resource, &dest).map_err(|e| Error::structure(dest.display().to_string(), e))?;
            }
        }

        self.shell
            .execute(&format!("mkdir -p -m 0700 {}", self.remote_build_dir), true, &[])
            .await?;
        let tt = TarballTransfer::new(
            self.shell.as_ref(),
            self.local_build_dir.join(".staging"),
            format!("{}-staging", self.remote_build_dir),
        );
        tt.send(&self.local_build_dir, &self.remote_build_dir).await
    }

    /// Constructs the apply command from `apply_template`, spawns it
    /// asynchronously on the host, and polls by `receive`-ing the expected
    /// `.log` path at a fixed cadence, yielding to the scheduler between
    /// polls. Runs the Log Checker on the fetched log and returns its
    /// verdict. Exceeding `timeout` raises timeout-error.
    pub async fn deploy(
        &mut self,
        name: &str,
        apply_template: &str,
        log_checker: &LogChecker,
        timeout: Option<Duration>,
        data_files: &DataFileLibrary,
        callback: &dyn StatusCallback,
    ) -> Result<(), Error> {
        callback
            .on_event(StatusEvent {
                kind: UnitKind::Marker,
                name: name.to_string(),
                status: UnitStatus::Start,
                messages: vec![],
            })
            .await;

        self.add_data_file(name, data_files)?;

        let log_path = format!("{}/logs/{name}.log", self.remote_build_dir);
        let apply_cmd = apply_template
            .replace("{manifest}", name)
            .replace("{log}", &log_path)
            .replace("{debug}", "");

        tracing::debug!(host = %self.host, manifest = name, state = ?DeployState::Queued, "deploy queued");
        self.shell.execute(&apply_cmd, true, &[]).await?;
        tracing::debug!(host = %self.host, manifest = name, state = ?DeployState::Spawned, "deploy spawned");

        let start = Instant::now();
        let poll_interval = Duration::from_secs(2);
        let local_log = self.local_build_dir.join("logs").join(format!("{name}.log"));
        let tt = TarballTransfer::new(self.shell.as_ref(), self.local_build_dir.join(".staging"), format!("{}-staging", self.remote_build_dir));

        loop {
            tracing::debug!(host = %self.host, manifest = name, state = ?DeployState::Polling, "polling for log");
            match tt.receive(&log_path, &local_log).await {
                Ok(()) => break,
                Err(Error::NotFound { .. }) => {
                    if let Some(budget) = timeout {
                        if start.elapsed() > budget {
                            let err = Error::Timeout {
                                host: self.host.clone(),
                                manifest: name.to_string(),
                                elapsed_secs: start.elapsed().as_secs(),
                                budget_secs: budget.as_secs(),
                            };
                            callback
                                .on_event(StatusEvent {
                                    kind: UnitKind::Marker,
                                    name: name.to_string(),
                                    status: UnitStatus::End { ok: false },
                                    messages: vec![],
                                })
                                .await;
                            return Err(err);
                        }
                    }
                    #[cfg(feature = "openssh")]
                    tokio::time::sleep(poll_interval).await;
                    #[cfg(not(feature = "openssh"))]
                    let _ = poll_interval;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(host = %self.host, manifest = name, state = ?DeployState::Logged, "log fetched");

        let text = std::fs::read_to_string(&local_log)
            .map_err(|e| Error::structure(local_log.display().to_string(), e))?;
        let verdict = log_checker.check(&self.host, name, &text);
        tracing::debug!(host = %self.host, manifest = name, state = ?DeployState::Validated, ok = verdict.is_ok(), "validated");

        callback
            .on_event(StatusEvent {
                kind: UnitKind::Marker,
                name: name.to_string(),
                status: UnitStatus::End { ok: verdict.is_ok() },
                messages: vec![],
            })
            .await;
        verdict
    }

    /// Best-effort removal of the remote and local build directories.
    pub async fn clean(&self) -> Result<(), Error> {
        let _ = self
            .shell
            .execute(&format!("rm -rf {}", self.remote_build_dir), false, &[])
            .await;
        let _ = std::fs::remove_dir_all(&self.local_build_dir);
        Ok(())
    }
}

fn format_template(template: &str, context: &IndexMap<String, String>) -> String {
    let mut out = template.to_string();
    for (k, v) in context {
        out = out.replace(&format!("{{{k}}}"), v);
    }
    out
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(dst).map_err(|e| Error::structure(dst.display().to_string(), e))?;
    for entry in std::fs::read_dir(src).map_err(|e| Error::structure(src.display().to_string(), e))? {
        let entry = entry.map_err(|e| Error::structure(src.display().to_string(), e))?;
        let dest = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest).map_err(|e| Error::structure(dest.display().to_string(), e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode_0700(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| Error::structure(path.display().to_string(), e))
}

#[cfg(not(unix))]
fn set_mode_0700(_path: &Path) -> Result<(), Error> {
    Ok(())
}
