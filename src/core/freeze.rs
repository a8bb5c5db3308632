//! Filesystem write suspension around the capture window.
//!
//! `FreezeCoordinator::freeze` hands out a `FreezeGuard`. The guard thaws
//! every mount it froze when `thaw` is called or, failing that, when it is
//! dropped, so early returns, panics and cancelled futures all release the
//! mounts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use super::hardware::{BlockDevice, HardwareAdapter};
use super::mounts::{exclude_filesystem, mount_containing, mount_set};
use crate::error::ExportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeState {
    Unfrozen,
    Frozen,
    /// At least one mount could not be thawed and needs manual intervention.
    ThawFailed,
}

pub struct FreezeCoordinator {
    adapter: Arc<dyn HardwareAdapter>,
    writable: Option<PathBuf>,
}

impl FreezeCoordinator {
    pub fn new(adapter: Arc<dyn HardwareAdapter>) -> Self {
        Self {
            adapter,
            writable: None,
        }
    }

    /// Never freeze the filesystem holding `path`. The capture writes there,
    /// and a write to a frozen filesystem blocks until it is thawed.
    pub fn keep_writable(mut self, path: impl Into<PathBuf>) -> Self {
        self.writable = Some(path.into());
        self
    }

    /// Suspend writes on every mount backed by `device`.
    ///
    /// Missing freeze support or an empty MountSet is not an error: the guard
    /// comes back `Unfrozen` and the capture runs live. The first mount that
    /// refuses to freeze aborts the whole operation after the mounts frozen so
    /// far have been thawed again.
    pub fn freeze(&self, device: &BlockDevice, partitions: &[BlockDevice]) -> Result<FreezeGuard> {
        let mut guard = FreezeGuard {
            adapter: self.adapter.clone(),
            frozen: Vec::new(),
            state: FreezeState::Unfrozen,
        };

        if !self.adapter.supports_freeze() {
            warn!("Filesystem freeze is not supported here, capturing live");
            return Ok(guard);
        }

        let table = self.adapter.list_mounts()?;
        let mut mounts = mount_set(&table, device, partitions);
        if let Some(dir) = self.writable.as_deref() {
            if let Some(held) = mount_containing(&table, dir) {
                let (kept, excluded) = exclude_filesystem(mounts, held);
                for mount in &excluded {
                    warn!(
                        mount = %mount.target.display(),
                        output = %dir.display(),
                        "Output directory is on this filesystem, leaving it unfrozen"
                    );
                }
                mounts = kept;
            }
        }

        if mounts.is_empty() {
            warn!(
                device = %device.path.display(),
                "No freezable mounts on device, capturing live"
            );
            return Ok(guard);
        }

        for mount in mounts {
            match self.adapter.freeze(&mount.target) {
                Ok(()) => {
                    info!(mount = %mount.target.display(), source = %mount.source, "Froze filesystem");
                    guard.frozen.push(mount.target);
                    guard.state = FreezeState::Frozen;
                }
                Err(e) => {
                    error!(mount = %mount.target.display(), error = %e, "Freeze failed");
                    guard.thaw();
                    return Err(ExportError::FreezeFailed {
                        mount: mount.target,
                        reason: format!("{e:#}"),
                    }
                    .into());
                }
            }
        }

        Ok(guard)
    }
}

/// Scoped ownership of frozen mounts.
pub struct FreezeGuard {
    adapter: Arc<dyn HardwareAdapter>,
    frozen: Vec<PathBuf>,
    state: FreezeState,
}

impl FreezeGuard {
    pub fn state(&self) -> FreezeState {
        self.state
    }

    pub fn mounts(&self) -> &[PathBuf] {
        &self.frozen
    }

    /// Resume writes on every frozen mount. A failing mount does not stop the
    /// others from being thawed. No-op unless the state is `Frozen`.
    pub fn thaw(&mut self) -> FreezeState {
        if self.state != FreezeState::Frozen {
            return self.state;
        }

        let mut failed = Vec::new();
        for mount in &self.frozen {
            match self.adapter.thaw(mount) {
                Ok(()) => info!(mount = %mount.display(), "Thawed filesystem"),
                Err(e) => {
                    error!(
                        mount = %mount.display(),
                        error = %e,
                        "THAW FAILED: writes to this filesystem stay blocked until it is thawed manually (fsfreeze -u)"
                    );
                    failed.push(mount.clone());
                }
            }
        }

        self.state = if failed.is_empty() {
            FreezeState::Unfrozen
        } else {
            FreezeState::ThawFailed
        };
        self.state
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        if self.state == FreezeState::Frozen {
            warn!(mounts = self.frozen.len(), "Releasing frozen mounts on abnormal exit");
            self.thaw();
        }
    }
}
