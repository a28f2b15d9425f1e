//! An in-memory [`RemoteShell`] double for tests, mirroring the
//! dependency-injection split the teacher crate uses between
//! `ClientInterface` and its production `openssh`-backed implementation.

use super::{Output, RemoteShell};
use crate::error::Error;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

/// Queues canned [`Output`]s (or errors) to return for successive
/// `execute`/`run_script` calls, and records every command it was asked to
/// run for assertion.
pub struct FakeShell {
    host: String,
    responses: Mutex<VecDeque<Result<Output, Error>>>,
    gets: Mutex<VecDeque<Vec<u8>>>,
    pub log: Mutex<Vec<String>>,
}

impl FakeShell {
    pub fn new(host: impl Into<String>) -> Self {
        FakeShell {
            host: host.into(),
            responses: Mutex::new(VecDeque::new()),
            gets: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn push_ok(&self, output: Output) {
        self.responses.lock().unwrap().push_back(Ok(output));
    }

    pub fn push_err(&self, error: Error) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Queues the bytes the next `get()` call should write to its `local`
    /// path.
    pub fn push_get(&self, content: impl Into<Vec<u8>>) {
        self.gets.lock().unwrap().push_back(content.into());
    }

    fn next(&self, cmd: &str) -> Result<Output, Error> {
        self.log.lock().unwrap().push(cmd.to_string());
        self.responses.lock().unwrap().pop_front().unwrap_or(Ok(Output {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(
        &self,
        cmd: &str,
        can_fail: bool,
        _mask_list: &[String],
    ) -> Result<Output, Error> {
        let result = self.next(cmd)?;
        if result.exit_code != 0 && can_fail {
            return Err(Error::Exec {
                host: self.host.clone(),
                exit_code: result.exit_code,
                masked_command: cmd.to_string(),
            });
        }
        Ok(result)
    }

    async fn run_script(
        &self,
        lines: &[String],
        can_fail: bool,
        mask_list: &[String],
    ) -> Result<Output, Error> {
        self.execute(&lines.join("\n"), can_fail, mask_list).await
    }

    async fn put(&self, _local: &Path, remote: &str) -> Result<(), Error> {
        self.log
            .lock()
            .unwrap()
            .push(format!("put -> {remote}"));
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), Error> {
        self.log
            .lock()
            .unwrap()
            .push(format!("get <- {remote}"));
        let content = self.gets.lock().unwrap().pop_front().unwrap_or_default();
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::structure(local.display().to_string(), e))?;
        }
        std::fs::write(local, content).map_err(|e| Error::structure(local.display().to_string(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_canned_outputs_in_order() {
        let shell = FakeShell::new("h1");
        shell.push_ok(Output {
            exit_code: 0,
            stdout: "first".to_string(),
            stderr: String::new(),
        });
        shell.push_ok(Output {
            exit_code: 0,
            stdout: "second".to_string(),
            stderr: String::new(),
        });

        let first = shell.execute("cmd1", true, &[]).await.unwrap();
        let second = shell.execute("cmd2", true, &[]).await.unwrap();
        assert_eq!(first.stdout, "first");
        assert_eq!(second.stdout, "second");
        assert_eq!(shell.log.lock().unwrap().as_slice(), ["cmd1", "cmd2"]);
    }

    #[tokio::test]
    async fn can_fail_false_returns_nonzero_as_data() {
        let shell = FakeShell::new("h1");
        shell.push_ok(Output {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom".to_string(),
        });
        let out = shell.execute("cmd", false, &[]).await.unwrap();
        assert_eq!(out.exit_code, 1);
    }

    #[tokio::test]
    async fn can_fail_true_raises_exec_error() {
        let shell = FakeShell::new("h1");
        shell.push_ok(Output {
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
        });
        let result = shell.execute("cmd", true, &[]).await;
        assert!(matches!(result, Err(Error::Exec { .. })));
    }
}
