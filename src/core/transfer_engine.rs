//! Shipping the final artifact to a remote host and confirming it there.

mod rsync;
mod simulated;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::checksum::ChecksumRecord;
use crate::config::{RemoteDestination, ToolPaths};
use crate::error::ExportError;

pub use rsync::RsyncEngine;
pub use simulated::SimulatedEngine;

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub run_id: String,
    pub artifact: PathBuf,
    /// Record file and its parsed content, shipped alongside when present.
    pub checksum: Option<(PathBuf, ChecksumRecord)>,
    pub destination: RemoteDestination,
}

impl TransferRequest {
    /// Local files to send, artifact first.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.artifact.clone()];
        if let Some((path, _)) = &self.checksum {
            files.push(path.clone());
        }
        files
    }
}

/// Outcome of the remote-side digest recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteCheck {
    Verified,
    /// Reported as a warning; both copies are kept.
    Mismatch(String),
    /// The remote check could not run, so nothing was compared. Also a
    /// warning.
    Unverified(String),
    /// No record, or the record describes a different artifact form.
    NotApplicable,
}

#[derive(Debug)]
pub struct TransferResult {
    pub total_bytes: u64,
    pub duration: Duration,
    pub remote_check: RemoteCheck,
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Copy every file of `req` to the destination directory. Any failure is
    /// fatal for the run.
    async fn transfer(&self, req: &TransferRequest) -> Result<()>;

    /// Recompute `record` against the copy on the remote side. `Ok(false)` is
    /// a mismatch; `Err` means the check itself could not run.
    async fn verify_remote(&self, req: &TransferRequest, record: &ChecksumRecord) -> Result<bool>;

    /// External programs the engine runs, as (name, configured path).
    fn required_tools(&self) -> Vec<(&'static str, PathBuf)> {
        Vec::new()
    }
}

pub fn create_engine(tools: &ToolPaths) -> Arc<dyn TransferEngine> {
    Arc::new(RsyncEngine::new(tools.rsync.clone(), tools.ssh.clone()))
}

/// Transfer, then verify remotely when the record describes the shipped file.
pub async fn ship(engine: &dyn TransferEngine, req: &TransferRequest) -> Result<TransferResult> {
    let start = Instant::now();
    let total_bytes = req
        .files()
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum::<u64>();

    info!(
        run_id = %req.run_id,
        artifact = %req.artifact.display(),
        destination = %req.destination,
        total_bytes,
        "Starting transfer"
    );

    engine.transfer(req).await.map_err(|e| ExportError::TransferFailed {
        destination: req.destination.to_string(),
        reason: format!("{e:#}"),
    })?;

    let remote_check = match &req.checksum {
        Some((_, record)) if record.describes(&req.artifact) => {
            match engine.verify_remote(req, record).await {
                Ok(true) => {
                    info!(destination = %req.destination, "Remote checksum verified");
                    RemoteCheck::Verified
                }
                Ok(false) => {
                    warn!(
                        destination = %req.destination,
                        file = %record.file_name,
                        "Remote checksum MISMATCH, artifact kept on both ends"
                    );
                    RemoteCheck::Mismatch(format!("{} digest differs on remote", record.file_name))
                }
                Err(e) => {
                    warn!(destination = %req.destination, error = %e, "Remote checksum could not be verified");
                    RemoteCheck::Unverified(format!("{e:#}"))
                }
            }
        }
        Some((_, record)) => {
            info!(
                record = %record.file_name,
                artifact = %req.artifact.display(),
                "Checksum describes the raw image, remote verification not applicable"
            );
            RemoteCheck::NotApplicable
        }
        None => RemoteCheck::NotApplicable,
    };

    let duration = start.elapsed();
    info!(total_bytes, duration_secs = duration.as_secs(), "Transfer complete");

    Ok(TransferResult {
        total_bytes,
        duration,
        remote_check,
    })
}
