//! # Remote filesystem access
//!
//! Metadata operations (listing, mkdir, rmdir) against local paths and
//! `remote:path` locations. Every call is bounded by a deadline so a hung
//! backend cannot stall job planning.

use std::{collections::BTreeMap, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::EngineConfig;
use crate::error::{EngineError, truncate_tail};

/// One entry of an `lsjson` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteEntry {
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub mod_time: Option<String>,
}

/// Metadata operations the planner and cleanup path rely on.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Entries directly below `path`.
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, EngineError>;

    /// Create `path` and any missing parents.
    async fn mkdir(&self, path: &str) -> Result<(), EngineError>;

    /// Remove `path` if it is an empty directory.
    async fn rmdir(&self, path: &str) -> Result<(), EngineError>;
}

/// [`RemoteFs`] backed by the transfer tool's own sub-commands.
#[derive(Debug, Clone)]
pub struct RcloneCli {
    tool_path: String,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl RcloneCli {
    pub fn new(tool_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tool_path: tool_path.into(),
            env: BTreeMap::new(),
            timeout,
        }
    }

    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            tool_path: engine.tool_path.clone(),
            env: engine.tool_env(),
            timeout: engine.metadata_timeout(),
        }
    }

    async fn run(&self, subcommand: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        let mut command = Command::new(&self.tool_path);
        command
            .arg(subcommand)
            .arg(path)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Timeout {
                    what: format!("{subcommand} {path}"),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::ExternalToolError {
                exit_status: output.status.code().unwrap_or(-1),
                message: truncate_tail(stderr.trim(), 2000).to_string(),
            });
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl RemoteFs for RcloneCli {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, EngineError> {
        let stdout = self.run("lsjson", path).await?;
        serde_json::from_slice(&stdout).map_err(|err| EngineError::ExternalToolError {
            exit_status: 0,
            message: format!("unparseable lsjson output for {path}: {err}"),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<(), EngineError> {
        self.run("mkdir", path).await.map(|_| ())
    }

    async fn rmdir(&self, path: &str) -> Result<(), EngineError> {
        self.run("rmdir", path).await.map(|_| ())
    }
}
