//! Invocation of the Cassandra `nodetool` executable.
//!
//! Only process handling lives here; the text produced by `nodetool ring`
//! is parsed by [`crate::ring::parse_ring_tokens`].

use crate::error::SnapshotError;
use crate::node_config::{find_in_search_paths, SEARCH_PATHS};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

/// Exit status `nodetool snapshot` uses when the tag is already taken.
const SNAPSHOT_EXISTS_STATUS: i32 = 2;

/// Operations the engine needs from the cluster management tool.
#[async_trait]
pub trait ClusterTool: Send + Sync {
    /// Takes a snapshot tagged `id`, optionally restricted to `keyspaces`.
    async fn snapshot(&self, id: &str, keyspaces: &[String]) -> Result<(), SnapshotError>;

    /// Returns the raw `nodetool ring` listing.
    async fn ring(&self) -> Result<String, SnapshotError>;
}

/// `nodetool` found on disk.
#[derive(Debug, Clone)]
pub struct Nodetool {
    path: PathBuf,
    host: Option<String>,
}

impl Nodetool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            host: None,
        }
    }

    /// Locates `nodetool` on the standard search paths.
    pub fn discover() -> Result<Self, SnapshotError> {
        find_in_search_paths("nodetool")
            .map(Self::new)
            .ok_or_else(|| SnapshotError::Config(format!("nodetool not found in {:?}", SEARCH_PATHS)))
    }

    /// Directs commands at a remote JMX host instead of the local node.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run(&self, args: &[&str]) -> Result<Output, SnapshotError> {
        let mut command = Command::new(&self.path);
        if let Some(host) = &self.host {
            command.arg("-h").arg(host);
        }
        command.args(args);
        debug!("running {} {:?}", self.path.display(), args);
        Ok(command.output().await?)
    }
}

fn tool_error(args: &str, output: &Output) -> SnapshotError {
    let status = output
        .status
        .code()
        .map_or_else(|| "terminated by signal".to_string(), |c| format!("Exit Status: {}", c));
    SnapshotError::Tool {
        tool: format!("nodetool {}", args),
        message: format!("{} {}", status, String::from_utf8_lossy(&output.stderr).trim()),
    }
}

#[async_trait]
impl ClusterTool for Nodetool {
    async fn snapshot(&self, id: &str, keyspaces: &[String]) -> Result<(), SnapshotError> {
        info!("creating a snapshot using id [{}]", id);
        let mut args = vec!["snapshot", "-t", id];
        args.extend(keyspaces.iter().map(String::as_str));

        let output = self.run(&args).await?;
        match output.status.code() {
            Some(0) => Ok(()),
            Some(SNAPSHOT_EXISTS_STATUS) => Err(SnapshotError::SnapshotExists(id.to_string())),
            _ => Err(tool_error("snapshot", &output)),
        }
    }

    async fn ring(&self) -> Result<String, SnapshotError> {
        let output = self.run(&["ring"]).await?;
        if !output.status.success() {
            return Err(tool_error("ring", &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_snapshot_exit_codes() {
        let dir = tempfile::tempdir().unwrap();

        let ok = Nodetool::new(script(dir.path(), "ok", "exit 0"));
        assert!(ok.snapshot("s1", &[]).await.is_ok());

        let exists = Nodetool::new(script(dir.path(), "exists", "exit 2"));
        assert!(matches!(
            exists.snapshot("s1", &[]).await,
            Err(SnapshotError::SnapshotExists(id)) if id == "s1"
        ));

        let broken = Nodetool::new(script(dir.path(), "broken", "echo nope >&2; exit 1"));
        let err = broken.snapshot("s1", &[]).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Tool { .. }));
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_ring_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Nodetool::new(script(dir.path(), "echo", "echo \"$@\""));
        assert_eq!(tool.ring().await.unwrap().trim(), "ring");

        let hosted = tool.with_host("10.0.0.9");
        assert_eq!(hosted.ring().await.unwrap().trim(), "-h 10.0.0.9 ring");
    }
}
