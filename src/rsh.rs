//! Remote Shell (RSH): authenticated remote command execution,
//! connection-pooled by host identity, with a file-transfer sub-capability.

pub mod fake;
#[cfg(feature = "openssh")]
pub mod openssh_shell;

use crate::error::Error;
use crate::strings::mask;
use async_trait::async_trait;
use std::path::Path;

/// Default retry bound for transport failures during [`RemoteShell::execute`].
pub const DEFAULT_RETRIES: u32 = 3;

/// The captured result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Per-host authenticated session capability. One implementation per
/// transport; `openssh_shell::OpensshShell` is the production transport.
///
/// Connections are pooled by host identity: constructing two `RemoteShell`
/// values for the same host within one process must reuse the same
/// underlying session rather than opening a second one.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// The host this shell is connected to.
    fn host(&self) -> &str;

    /// Runs `cmd` remotely. When `can_fail` is `false`, a non-zero exit is
    /// returned as data rather than raised as [`Error::Exec`]. `mask_list`
    /// entries are substituted with a fixed token in all log output this
    /// call produces, never in the command actually sent to the host.
    async fn execute(
        &self,
        cmd: &str,
        can_fail: bool,
        mask_list: &[String],
    ) -> Result<Output, Error>;

    /// Runs `lines` as a single script with a trap-on-error prologue: any
    /// failing line aborts the script with that line's exit code.
    async fn run_script(
        &self,
        lines: &[String],
        can_fail: bool,
        mask_list: &[String],
    ) -> Result<Output, Error>;

    /// Uploads `local` to `remote`.
    async fn put(&self, local: &Path, remote: &str) -> Result<(), Error>;

    /// Downloads `remote` to `local`.
    async fn get(&self, remote: &str, local: &Path) -> Result<(), Error>;
}

/// Builds the `bash -x` script-trap prologue that precedes every
/// `run_script` invocation, so the first failing line aborts the whole
/// script with its own exit code rather than continuing.
pub fn script_trap_prologue() -> Vec<String> {
    vec![
        "function script_trap(){ exit $? ; }".to_string(),
        "trap script_trap ERR".to_string(),
    ]
}

/// Formats the text that should be written to the log for an `execute`
/// call: the masked command, followed by masked stdout/stderr.
pub fn format_execute_log(host: &str, cmd: &str, mask_list: &[String], output: &Output) -> String {
    format!(
        "[{host}] Executing command: {}\n---- stdout ----\n{}\n---- stderr ----\n{}",
        mask(cmd, mask_list),
        mask(&output.stdout, mask_list),
        mask(&output.stderr, mask_list),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_trap_prologue_traps_on_err() {
        let prologue = script_trap_prologue();
        assert_eq!(prologue.len(), 2);
        assert!(prologue[1].contains("trap script_trap ERR"));
    }

    #[test]
    fn format_execute_log_masks_everything() {
        let output = Output {
            exit_code: 0,
            stdout: "token=secret123".to_string(),
            stderr: String::new(),
        };
        let log = format_execute_log(
            "h1",
            "echo secret123",
            &["secret123".to_string()],
            &output,
        );
        assert!(!log.contains("secret123"));
        assert!(log.contains("h1"));
    }
}
