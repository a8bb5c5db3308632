//! Fatal error taxonomy for an export run.
//!
//! Stage code propagates `anyhow::Error`; the variants below are wrapped into
//! it so callers (and tests) can recover the category with `downcast_ref`.
//! Verification mismatches and thaw failures are absent: they
//! are logged as warnings and never abort a run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("must run as root to read block devices and freeze filesystems")]
    NotPrivileged,

    #[error("required tool '{tool}' not found: {reason}")]
    MissingTool { tool: String, reason: String },

    #[error("invalid output format '{0}' (expected raw, qcow2, vmdk or vdi)")]
    InvalidFormat(String),

    #[error("invalid remote destination '{0}' (expected account@host)")]
    InvalidRemote(String),

    #[error("no suitable block device found")]
    NoDeviceFound,

    #[error("{} is not a block device", .0.display())]
    InvalidDevice(PathBuf),

    #[error("failed to freeze {}: {reason}", mount.display())]
    FreezeFailed { mount: PathBuf, reason: String },

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("raw artifact {} is missing", .0.display())]
    MissingRawArtifact(PathBuf),

    #[error("conversion to {format} failed: {reason}")]
    ConversionFailed { format: String, reason: String },

    #[error("transfer to {destination} failed: {reason}")]
    TransferFailed { destination: String, reason: String },

    #[error("interrupted by signal")]
    Interrupted,
}

impl ExportError {
    /// True for errors raised before anything on disk or on a mount was touched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotPrivileged
                | Self::MissingTool { .. }
                | Self::InvalidFormat(_)
                | Self::InvalidRemote(_)
                | Self::NoDeviceFound
                | Self::InvalidDevice(_)
        )
    }
}

/// Find the `ExportError` carried anywhere in an error chain.
pub fn export_error(err: &anyhow::Error) -> Option<&ExportError> {
    err.chain().find_map(|e| e.downcast_ref::<ExportError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn precondition_classification() {
        assert!(ExportError::NoDeviceFound.is_precondition());
        assert!(ExportError::InvalidRemote("x".into()).is_precondition());
        assert!(!ExportError::Interrupted.is_precondition());
        assert!(
            !ExportError::FreezeFailed {
                mount: PathBuf::from("/data"),
                reason: "EBUSY".into()
            }
            .is_precondition()
        );
    }

    #[test]
    fn export_error_found_through_context() {
        let err: anyhow::Error = Err::<(), _>(ExportError::NoDeviceFound)
            .context("resolving device")
            .unwrap_err();
        assert!(matches!(
            export_error(&err),
            Some(ExportError::NoDeviceFound)
        ));
    }
}
