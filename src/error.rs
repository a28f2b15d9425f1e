//! Error taxonomy shared by every component of the orchestrator.

use std::collections::HashSet;
use std::fmt;

/// The nine failure kinds named in the orchestrator's error handling design.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid metadata, duplicate key across plugins, or a value outside
    /// declared options.
    #[error("configuration error for key `{key}`: {message}")]
    Config { key: String, message: String },

    /// A module directory is missing required subdirectories, or a
    /// resource path is missing.
    #[error("structure error for path `{path}`: {message}")]
    Structure { path: String, message: String },

    /// Repeated SSH connect/exec failures after retries were exhausted.
    #[error("transport error on host `{host}` after {attempts} attempt(s): {source}")]
    Transport {
        host: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// A remote command returned non-zero when the caller demanded success.
    #[error("command failed on host `{host}` (exit {exit_code}): {masked_command}")]
    Exec {
        host: String,
        exit_code: i32,
        masked_command: String,
    },

    /// A remote path was absent during `receive`.
    #[error("remote path not found on host `{host}`: {path}")]
    NotFound { host: String, path: String },

    /// None of the candidate install commands succeeded.
    #[error("no install command succeeded on host `{host}`; tried: {}", .candidates.join(", "))]
    Install { host: String, candidates: Vec<String> },

    /// The Log Checker classified the log as failing.
    #[error("log check failed on host `{host}` for manifest `{manifest}`: {line}")]
    Log {
        host: String,
        manifest: String,
        line: String,
    },

    /// `deploy` exceeded its budget.
    #[error("deploy of `{manifest}` on host `{host}` timed out after {elapsed_secs}s (budget {budget_secs}s)")]
    Timeout {
        host: String,
        manifest: String,
        elapsed_secs: u64,
        budget_secs: u64,
    },

    /// The marker prerequisite graph is cyclic.
    #[error("plan is cyclic; involved markers: {}", .markers.iter().cloned().collect::<Vec<_>>().join(", "))]
    PlanCycle { markers: HashSet<String> },

    /// One or more per-(marker, host) failures collected under
    /// `finish-on-error = true`.
    #[error("deployment finished with {} failure(s)", .0.len())]
    Aggregate(Vec<(String, String, Error)>),
}

impl Error {
    pub fn config(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Config {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn structure(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Structure {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
