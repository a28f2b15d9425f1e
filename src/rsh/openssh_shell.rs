//! Production [`RemoteShell`] backed by the `openssh` crate, gated behind
//! the `openssh` feature exactly as the teacher crate gates its SSH code.

use super::{script_trap_prologue, Output, RemoteShell, DEFAULT_RETRIES};
use crate::error::Error;
use crate::strings::mask;
use anyhow::Context;
use async_trait::async_trait;
use openssh::{KnownHosts, Session};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task;

fn pool() -> &'static Mutex<HashMap<String, Arc<Session>>> {
    static POOL: OnceLock<Mutex<HashMap<String, Arc<Session>>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

fn registered() -> &'static Mutex<HashSet<String>> {
    static REGISTERED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    REGISTERED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// An SSH-backed remote shell for one host. Sessions are pooled
/// process-wide by host identity; constructing a second `OpensshShell` for
/// an already-connected host reuses the pooled session rather than opening
/// a new one.
pub struct OpensshShell {
    host: String,
    user: String,
    port: u16,
    private_key: PathBuf,
    retries: u32,
}

impl OpensshShell {
    pub fn new(host: impl Into<String>, user: impl Into<String>, port: u16, private_key: PathBuf) -> Self {
        OpensshShell {
            host: host.into(),
            user: user.into(),
            port,
            private_key,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn public_key_path(&self) -> PathBuf {
        if self.private_key.extension().map(|e| e == "pub").unwrap_or(false) {
            self.private_key.clone()
        } else {
            let mut p = self.private_key.clone();
            let mut name = p.file_name().unwrap_or_default().to_os_string();
            name.push(".pub");
            p.set_file_name(name);
            p
        }
    }

    /// One-time public-key self-registration: appends the caller's public
    /// key to the remote `authorized_keys`, idempotently. Skipped if this
    /// host was already registered this process.
    async fn register(&self, session: &Session) -> Result<(), Error> {
        if registered().lock().unwrap().contains(&self.host) {
            tracing::debug!(host = %self.host, "skipping ssh-key register, already done this process");
            return Ok(());
        }
        let key_data = std::fs::read_to_string(self.public_key_path())
            .map_err(|e| Error::config(self.host.clone(), e))?;
        let key_data = key_data.trim();
        let script = vec![
            "mkdir -p ~/.ssh".to_string(),
            "chmod 500 ~/.ssh".to_string(),
            format!(
                "grep '{key_data}' ~/.ssh/authorized_keys > /dev/null 2>&1 || echo '{key_data}' >> ~/.ssh/authorized_keys"
            ),
            "chmod 400 ~/.ssh/authorized_keys".to_string(),
        ];
        let mut full = script_trap_prologue();
        full.extend(script);
        let joined = full.join("\n");
        let result = session
            .command("bash")
            .arg("-c")
            .raw_arg(&joined)
            .output()
            .await
            .map_err(|e| Error::Transport {
                host: self.host.clone(),
                attempts: 1,
                source: anyhow::anyhow!(e),
            })?;
        if !result.status.success() {
            return Err(Error::Exec {
                host: self.host.clone(),
                exit_code: result.status.code().unwrap_or(-1),
                masked_command: "ssh-key register".to_string(),
            });
        }
        registered().lock().unwrap().insert(self.host.clone());
        Ok(())
    }

    async fn connection(&self) -> Result<Arc<Session>, Error> {
        if let Some(session) = pool().lock().unwrap().get(&self.host).cloned() {
            return Ok(session);
        }
        let session = Session::connect_mux(
            format!("ssh://{}@{}:{}", self.user, self.host, self.port),
            KnownHosts::Add,
        )
        .await
        .map_err(|e| Error::Transport {
            host: self.host.clone(),
            attempts: 1,
            source: anyhow::anyhow!(e),
        })?;
        let session = Arc::new(session);
        pool().lock().unwrap().insert(self.host.clone(), session.clone());
        self.register(&session).await?;
        Ok(session)
    }

    fn evict(&self) {
        pool().lock().unwrap().remove(&self.host);
    }
}

#[async_trait]
impl RemoteShell for OpensshShell {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(
        &self,
        cmd: &str,
        can_fail: bool,
        mask_list: &[String],
    ) -> Result<Output, Error> {
        let masked = mask(cmd, mask_list);
        let mut last_err = None;
        for attempt in 1..=self.retries {
            let session = match self.connection().await {
                Ok(s) => s,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            match session.command("bash").arg("-c").raw_arg(cmd).output().await {
                Ok(result) => {
                    let output = Output {
                        exit_code: result.status.code().unwrap_or(-1),
                        stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                    };
                    tracing::info!(host = %self.host, command = %masked, exit_code = output.exit_code, "executed command");
                    if output.exit_code != 0 && can_fail {
                        return Err(Error::Exec {
                            host: self.host.clone(),
                            exit_code: output.exit_code,
                            masked_command: masked,
                        });
                    }
                    return Ok(output);
                }
                Err(e) => {
                    tracing::warn!(host = %self.host, attempt, "transport failure, will retry");
                    self.evict();
                    last_err = Some(Error::Transport {
                        host: self.host.clone(),
                        attempts: attempt,
                        source: anyhow::anyhow!(e),
                    });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Transport {
            host: self.host.clone(),
            attempts: self.retries,
            source: anyhow::anyhow!("exhausted retries"),
        }))
    }

    async fn run_script(
        &self,
        lines: &[String],
        can_fail: bool,
        mask_list: &[String],
    ) -> Result<Output, Error> {
        let mut full = script_trap_prologue();
        full.extend(lines.iter().cloned());
        self.execute(&full.join("\n"), can_fail, mask_list).await
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), Error> {
        let _ = self.connection().await?;
        let host = self.host.clone();
        let user = self.user.clone();
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let port = self.port.to_string();
        let key = self.private_key.clone();
        let output = task::block_in_place(move || {
            Command::new("scp")
                .arg("-P")
                .arg(&port)
                .arg("-i")
                .arg(&key)
                .arg(&local)
                .arg(format!("{user}@{host}:{remote}"))
                .output()
        })
        .with_context(|| format!("failed to invoke scp to upload {} to {}", local.display(), remote))
        .map_err(|e| Error::Transport {
            host: self.host.clone(),
            attempts: 1,
            source: e,
        })?;
        if !output.status.success() {
            return Err(Error::Exec {
                host: self.host.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                masked_command: "scp upload".to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), Error> {
        let _ = self.connection().await?;
        let host = self.host.clone();
        let user = self.user.clone();
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let port = self.port.to_string();
        let key = self.private_key.clone();
        let output = task::block_in_place(move || {
            Command::new("scp")
                .arg("-P")
                .arg(&port)
                .arg("-i")
                .arg(&key)
                .arg(format!("{user}@{host}:{remote}"))
                .arg(&local)
                .output()
        })
        .with_context(|| format!("failed to invoke scp to download {remote}"))
        .map_err(|e| Error::Transport {
            host: self.host.clone(),
            attempts: 1,
            source: e,
        })?;
        if !output.status.success() {
            return Err(Error::NotFound {
                host: self.host.clone(),
                path: remote.to_string(),
            });
        }
        Ok(())
    }
}
