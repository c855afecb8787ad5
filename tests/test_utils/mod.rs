//! Test utilities shared by the integration suites.
//!
//! Provides an in-memory SQLite store with migrations applied, a scripted
//! stand-in for the transfer tool and a [`FakeRemote`] that answers listings
//! from a fixed table.

#![allow(dead_code)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use tempfile::TempDir;
use transferd::config::EngineConfig;
use transferd::error::EngineError;
use transferd::remote::{RemoteEntry, RemoteFs};

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Writes an executable shell script into `dir` and returns its path.
pub fn write_tool(dir: &TempDir, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// A tool that records its argv to `argv.txt` next to itself, prints a
/// progress block and exits with `code`.
pub fn recording_tool(dir: &TempDir, code: i32) -> Result<PathBuf> {
    let argv = dir.path().join("argv.txt");
    write_tool(
        dir,
        "fake-rclone",
        &format!(
            r#"echo "$@" > "{argv}"
echo "Transferred:   	    5 MiB / 10 MiB, 50%, 1 MiB/s, ETA 5s"
echo "Transferred:            1 / 2, 50%"
echo "Transferred:   	   10 MiB / 10 MiB, 100%, 1 MiB/s, ETA 0s"
if [ {code} -ne 0 ]; then echo "2025/01/02 10:00:00 ERROR : b.txt: Failed to copy: quota exceeded" >&2; fi
exit {code}"#,
            argv = argv.display(),
        ),
    )
}

/// Arguments the recording tool was last invoked with.
pub fn recorded_argv(dir: &TempDir) -> Result<String> {
    Ok(std::fs::read_to_string(dir.path().join("argv.txt"))?
        .trim_end()
        .to_string())
}

/// Engine settings tuned for fast tests.
pub fn engine_config(tool: &Path) -> EngineConfig {
    EngineConfig {
        tool_path: tool.to_string_lossy().into_owned(),
        poll_interval_ms: 50,
        reader_drain_timeout_ms: 2_000,
        reconcile_interval_ms: 100,
        stop_grace_ms: 1_000,
        ..EngineConfig::default()
    }
}

/// In-memory [`RemoteFs`] keyed by parent directory.
#[derive(Default)]
pub struct FakeRemote {
    listings: Mutex<HashMap<String, Vec<RemoteEntry>>>,
    calls: Mutex<Vec<String>>,
    time_out: bool,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every listing exceeds its deadline.
    pub fn timing_out() -> Self {
        Self {
            time_out: true,
            ..Self::default()
        }
    }

    pub fn with_dir(self, parent: &str, name: &str) -> Self {
        self.add(parent, name, true);
        self
    }

    pub fn with_file(self, parent: &str, name: &str) -> Self {
        self.add(parent, name, false);
        self
    }

    fn add(&self, parent: &str, name: &str, is_dir: bool) {
        self.listings
            .lock()
            .unwrap()
            .entry(parent.to_string())
            .or_default()
            .push(RemoteEntry {
                name: name.to_string(),
                size: if is_dir { -1 } else { 42 },
                is_dir,
                mod_time: None,
            });
    }

    /// Recorded `mkdir`/`rmdir` calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteFs for FakeRemote {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, EngineError> {
        if self.time_out {
            return Err(EngineError::Timeout {
                what: format!("lsjson {path}"),
                timeout_ms: 10,
            });
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default())
    }

    async fn mkdir(&self, path: &str) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("mkdir {path}"));
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("rmdir {path}"));
        Ok(())
    }
}
