use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tracing::debug;

use super::{TransferEngine, TransferRequest};
use crate::config::RemoteDestination;
use crate::core::checksum::{ChecksumRecord, verify_file};

/// Stands in for a remote host with a local directory per `account@host`.
#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    root: PathBuf,
    reachable: bool,
    corrupt: bool,
    remote_shell: bool,
}

impl SimulatedEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reachable: true,
            corrupt: false,
            remote_shell: true,
        }
    }

    /// Every transfer fails as if the host refused the connection.
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Flip a byte of the artifact after it lands.
    pub fn corrupt_on_arrival(mut self) -> Self {
        self.corrupt = true;
        self
    }

    /// Copies land, but the remote checksum command cannot run (ssh exits
    /// 255).
    pub fn without_remote_shell(mut self) -> Self {
        self.remote_shell = false;
        self
    }

    pub fn remote_dir(&self, destination: &RemoteDestination) -> PathBuf {
        let host_dir = self.root.join(&destination.account_host);
        match &destination.path {
            Some(p) => host_dir.join(p.trim_start_matches('/')),
            None => host_dir,
        }
    }
}

#[async_trait]
impl TransferEngine for SimulatedEngine {
    async fn transfer(&self, req: &TransferRequest) -> Result<()> {
        if !self.reachable {
            bail!(
                "ssh: connect to host {} port 22: Connection refused",
                req.destination.account_host
            );
        }

        let dir = self.remote_dir(&req.destination);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        for file in req.files() {
            let target = dir.join(
                file.file_name()
                    .ok_or_else(|| anyhow!("{} has no file name", file.display()))?,
            );
            std::fs::copy(&file, &target)
                .with_context(|| format!("Failed to copy {}", file.display()))?;
            debug!(from = %file.display(), to = %target.display(), "Simulated copy");
        }

        if self.corrupt {
            corrupt(&dir.join(file_name_of(&req.artifact)))?;
        }
        Ok(())
    }

    async fn verify_remote(&self, req: &TransferRequest, record: &ChecksumRecord) -> Result<bool> {
        if !self.remote_shell {
            bail!(
                "ssh to {} failed (exit status: 255): Permission denied (publickey)",
                req.destination.account_host
            );
        }
        let dir = self.remote_dir(&req.destination);
        let remote_record_path = req
            .checksum
            .as_ref()
            .map(|(p, _)| dir.join(file_name_of(p)))
            .ok_or_else(|| anyhow!("no checksum file was shipped"))?;
        let remote_record = ChecksumRecord::read(&remote_record_path, record.algorithm)?;
        verify_file(&dir.join(&remote_record.file_name), &remote_record)
    }
}

fn file_name_of(path: &Path) -> &std::ffi::OsStr {
    path.file_name().unwrap_or(path.as_os_str())
}

fn corrupt(path: &Path) -> Result<()> {
    let mut bytes = std::fs::read(path)?;
    match bytes.first_mut() {
        Some(b) => *b ^= 0xFF,
        None => bytes.push(0xFF),
    }
    std::fs::write(path, bytes)?;
    Ok(())
}
