//! Stage sequencing for one export run.
//!
//! The stages run strictly in order:
//!
//! `INIT → RESOLVE_DEVICE → RESOLVE_TARGET → PREPARE_OUTPUT → FREEZE →
//! CAPTURE → THAW → CONVERT → CLEANUP_RAW → TRANSFER → DONE`
//!
//! Any fatal error ends the run in `FAILED`. Once `FREEZE` produced a guard,
//! the thaw happens before the run returns on every path: explicitly after
//! the capture, or through the guard's `Drop` if the future unwinds earlier.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::artifact::{Artifact, ArtifactLayout};
use super::checksum::ChecksumRecord;
use super::converter::{self, CheckOutcome, ConvertRequest};
use super::freeze::{FreezeCoordinator, FreezeGuard, FreezeState};
use super::hardware::{BlockDevice, HardwareAdapter};
use super::imaging::{self, CaptureResult, CapturePlan, CaptureStrategy, CompressionPlan};
use super::resolver::{self, ImageTarget};
use super::transfer_engine::{self, RemoteCheck, TransferRequest};
use crate::config::{OutputFormat, RemoteDestination};
use crate::context::AppContext;
use crate::error::ExportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Init,
    ResolveDevice,
    ResolveTarget,
    PrepareOutput,
    Freeze,
    Capture,
    Thaw,
    Convert,
    CleanupRaw,
    Transfer,
    Done,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::ResolveDevice => "RESOLVE_DEVICE",
            Self::ResolveTarget => "RESOLVE_TARGET",
            Self::PrepareOutput => "PREPARE_OUTPUT",
            Self::Freeze => "FREEZE",
            Self::Capture => "CAPTURE",
            Self::Thaw => "THAW",
            Self::Convert => "CONVERT",
            Self::CleanupRaw => "CLEANUP_RAW",
            Self::Transfer => "TRANSFER",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a successful run, written as JSON to the success marker.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub device: PathBuf,
    pub target: ImageTarget,
    pub strategy: CaptureStrategy,
    pub compression: CompressionPlan,
    pub bytes_read: u64,
    pub artifact: Artifact,
    pub checksum: Option<ChecksumRecord>,
    pub container_check: Option<CheckOutcome>,
    pub remote: Option<String>,
    pub remote_check: Option<RemoteCheck>,
    /// Non-fatal findings about the output directory.
    pub advisories: Vec<Advisory>,
    /// A mount could not be thawed; the run still succeeded.
    pub thaw_failed: bool,
}

/// Warning raised while preparing the output directory. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Advisory {
    /// The output directory lives on the disk being captured.
    SameDisk { output: PathBuf },
    /// Less than a quarter of the device size is free at the output directory.
    LowSpace { available: u64, device_size: u64 },
}

/// Same-disk and free-space checks on `dir`. Lookups that fail are logged
/// at debug level and produce no advisory.
pub fn output_advisories(
    adapter: &dyn HardwareAdapter,
    dir: &Path,
    device: &BlockDevice,
    partitions: &[BlockDevice],
) -> Vec<Advisory> {
    let mut advisories = Vec::new();

    match adapter.device_of(dir) {
        Ok(Some(dev)) => {
            let same_disk = std::iter::once(device)
                .chain(partitions)
                .filter_map(|d| d.devnum)
                .any(|n| n == dev);
            if same_disk {
                advisories.push(Advisory::SameDisk {
                    output: dir.to_path_buf(),
                });
            }
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "Could not determine the output directory's device"),
    }

    match adapter.available_space(dir) {
        Ok(free) if free < device.size / 4 => advisories.push(Advisory::LowSpace {
            available: free,
            device_size: device.size,
        }),
        Ok(_) => {}
        Err(e) => debug!(error = %e, "Could not determine free space"),
    }

    advisories
}

/// Results of INIT that later stages depend on.
struct Preflight {
    format: OutputFormat,
    destination: Option<RemoteDestination>,
    /// Resolved `qemu-img`, only when a container format was requested.
    qemu_img: Option<PathBuf>,
}

pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Run the whole pipeline once.
    ///
    /// Runs against the same device must not overlap: a caller starts a
    /// second run only after observing the first one's outcome.
    pub async fn run(&self) -> Result<PipelineOutcome> {
        let run_id = Uuid::now_v7().to_string();
        let span = info_span!("export", run_id = %run_id);
        let mut stage = PipelineStage::Init;

        let result = self
            .run_stages(&run_id, &mut stage)
            .instrument(span.clone())
            .await;

        span.in_scope(|| match result {
            Ok(outcome) => {
                info!(
                    artifact = %outcome.artifact.path().display(),
                    marker = %self.ctx.config.marker_path.display(),
                    "Export complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(stage = %stage, error = %format!("{e:#}"), "Export FAILED");
                Err(e.context(format!("export failed during {stage}")))
            }
        })
    }

    async fn run_stages(&self, run_id: &str, stage: &mut PipelineStage) -> Result<PipelineOutcome> {
        let config = self.ctx.config.clone();
        let adapter = self.ctx.adapter.as_ref();
        let started_at = Utc::now();

        self.enter(stage, PipelineStage::Init)?;
        if remove_if_exists(&config.marker_path)? {
            info!(marker = %config.marker_path.display(), "Removed success marker of a previous run");
        }
        let preflight = self.preflight()?;

        self.enter(stage, PipelineStage::ResolveDevice)?;
        let device = resolver::resolve_device(adapter, config.device.as_deref())?;
        let partitions = resolver::partitions_of(adapter, &device)?;

        self.enter(stage, PipelineStage::ResolveTarget)?;
        let target = resolver::resolve_target(&device, &partitions);
        let strategy = CaptureStrategy::select(&target);
        let e2image = match strategy {
            CaptureStrategy::Sparse => require_tool("e2image", &config.tools.e2image)?,
            CaptureStrategy::FullCopy => config.tools.e2image.clone(),
        };
        info!(target = %target, strategy = ?strategy, "Target resolved");

        self.enter(stage, PipelineStage::PrepareOutput)?;
        let (layout, advisories) = self.prepare_output(&device, &partitions)?;

        self.enter(stage, PipelineStage::Freeze)?;
        let guard = self.freeze(&device, &partitions).await?;

        self.advance(stage, PipelineStage::Capture);
        let plan = CapturePlan::new(
            &target,
            &layout,
            preflight.format,
            config.compress,
            config.verify,
            e2image,
        );
        let compression = plan.compression;
        let captured = self.capture(plan).await;

        if captured.is_ok() {
            self.advance(stage, PipelineStage::Thaw);
        }
        let thaw_state = self.thaw(guard).await;
        let captured = captured?;

        self.enter(stage, PipelineStage::Convert)?;
        let (artifact, container_check) = match &preflight.qemu_img {
            None => (captured.artifact.clone(), None),
            Some(qemu_img) => {
                let req = ConvertRequest {
                    format: preflight.format,
                    compress: config.compress,
                    verify: config.verify,
                    qemu_img: qemu_img.clone(),
                };
                let converted = self
                    .cancellable(converter::convert(&captured.artifact, &layout, &req))
                    .await?;
                (converted.artifact, Some(converted.check))
            }
        };

        self.enter(stage, PipelineStage::CleanupRaw)?;
        if !preflight.format.is_raw() {
            for intermediate in [layout.raw(), layout.compressed()] {
                if remove_if_exists(&intermediate)? {
                    info!(path = %intermediate.display(), "Removed intermediate raw artifact");
                }
            }
        }

        self.enter(stage, PipelineStage::Transfer)?;
        let remote_check = match &preflight.destination {
            None => {
                debug!("No remote destination configured, transfer skipped");
                None
            }
            Some(destination) => Some(self.transfer(run_id, &layout, preflight.format, destination).await?),
        };

        self.enter(stage, PipelineStage::Done)?;
        let outcome = PipelineOutcome {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            device: device.path.clone(),
            target,
            strategy,
            compression,
            bytes_read: captured.bytes_read,
            artifact,
            checksum: captured.checksum,
            container_check,
            remote: preflight.destination.as_ref().map(|d| d.to_string()),
            remote_check,
            advisories,
            thaw_failed: thaw_state == FreezeState::ThawFailed,
        };
        write_marker(&config.marker_path, &outcome)?;
        Ok(outcome)
    }

    fn advance(&self, stage: &mut PipelineStage, next: PipelineStage) {
        *stage = next;
        info!(stage = %next, "Entering stage");
    }

    /// Advance, refusing to start the stage once a signal arrived.
    fn enter(&self, stage: &mut PipelineStage, next: PipelineStage) -> Result<()> {
        self.advance(stage, next);
        self.checkpoint()
    }

    fn checkpoint(&self) -> Result<()> {
        if self.ctx.cancel.is_cancelled() {
            return Err(ExportError::Interrupted.into());
        }
        Ok(())
    }

    /// Race `fut` against the shutdown signal. Child processes spawned with
    /// `kill_on_drop` die with the dropped future.
    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            result = fut => result,
            _ = self.ctx.cancel.cancelled() => Err(ExportError::Interrupted.into()),
        }
    }

    fn preflight(&self) -> Result<Preflight> {
        let config = &self.ctx.config;

        self.ctx.adapter.check_privileges()?;
        let format = config.output_format()?;
        let destination = config.remote_destination()?;

        let qemu_img = if format.is_raw() {
            None
        } else {
            Some(require_tool("qemu-img", &config.tools.qemu_img)?)
        };
        if destination.is_some() {
            for (name, path) in self.ctx.engine.required_tools() {
                require_tool(name, &path)?;
            }
        }

        info!(
            format = %format,
            compress = config.compress,
            verify = config.verify,
            remote = ?destination.as_ref().map(|d| d.to_string()),
            "Preconditions satisfied"
        );
        Ok(Preflight {
            format,
            destination,
            qemu_img,
        })
    }

    fn prepare_output(
        &self,
        device: &BlockDevice,
        partitions: &[BlockDevice],
    ) -> Result<(ArtifactLayout, Vec<Advisory>)> {
        let config = &self.ctx.config;
        let dir = &config.output_dir;

        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

        let layout = ArtifactLayout::new(dir.clone(), config.compression, config.checksum);
        let removed = layout.remove_stale()?;
        if !removed.is_empty() {
            info!(count = removed.len(), "Removed artifacts of a previous run");
        }

        let advisories = output_advisories(self.ctx.adapter.as_ref(), dir, device, partitions);
        for advisory in &advisories {
            match advisory {
                Advisory::SameDisk { output } => warn!(
                    output = %output.display(),
                    device = %device.path.display(),
                    "Output directory is on the disk being captured"
                ),
                Advisory::LowSpace {
                    available,
                    device_size,
                } => warn!(
                    available,
                    device_size,
                    output = %dir.display(),
                    "Less than a quarter of the device size is free at the output directory"
                ),
            }
        }

        Ok((layout, advisories))
    }

    async fn freeze(&self, device: &BlockDevice, partitions: &[BlockDevice]) -> Result<FreezeGuard> {
        let coordinator = FreezeCoordinator::new(self.ctx.adapter.clone())
            .keep_writable(self.ctx.config.output_dir.clone());
        let (device, partitions) = (device.clone(), partitions.to_vec());
        tokio::task::spawn_blocking(move || coordinator.freeze(&device, &partitions))
            .await
            .context("Freeze task panicked")?
    }

    async fn capture(&self, plan: CapturePlan) -> Result<CaptureResult> {
        self.checkpoint()?;
        imaging::capture(plan, self.ctx.cancel.clone()).await
    }

    async fn thaw(&self, mut guard: FreezeGuard) -> FreezeState {
        if guard.state() != FreezeState::Frozen {
            return guard.state();
        }
        match tokio::task::spawn_blocking(move || guard.thaw()).await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Thaw task panicked");
                FreezeState::ThawFailed
            }
        }
    }

    async fn transfer(
        &self,
        run_id: &str,
        layout: &ArtifactLayout,
        format: OutputFormat,
        destination: &RemoteDestination,
    ) -> Result<RemoteCheck> {
        let shipped = layout
            .locate(format)
            .ok_or_else(|| anyhow!("No artifact to transfer in {}", layout.dir().display()))?;

        let checksum_path = layout.checksum();
        let checksum = if checksum_path.is_file() {
            let record = ChecksumRecord::read(&checksum_path, layout.checksum_algorithm())?;
            Some((checksum_path, record))
        } else {
            None
        };

        let req = TransferRequest {
            run_id: run_id.to_string(),
            artifact: shipped.path().to_path_buf(),
            checksum,
            destination: destination.clone(),
        };
        let result = self
            .cancellable(transfer_engine::ship(self.ctx.engine.as_ref(), &req))
            .await?;
        Ok(result.remote_check)
    }
}

/// Resolve a configured tool name or path to an executable.
pub fn require_tool(name: &str, configured: &Path) -> Result<PathBuf> {
    which::which(configured).map_err(|e| {
        ExportError::MissingTool {
            tool: name.to_string(),
            reason: format!("{}: {e}", configured.display()),
        }
        .into()
    })
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Write-then-rename so a supervisor never sees a half-written marker.
fn write_marker(path: &Path, outcome: &PipelineOutcome) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(outcome).context("Failed to serialize outcome")?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move marker into place at {}", path.display()))?;
    info!(marker = %path.display(), "Success marker written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::export_error;
    use tempfile::tempdir;

    #[test]
    fn stages_are_ordered() {
        assert!(PipelineStage::Freeze < PipelineStage::Capture);
        assert!(PipelineStage::Capture < PipelineStage::Thaw);
        assert!(PipelineStage::Thaw < PipelineStage::Convert);
        assert_eq!(PipelineStage::CleanupRaw.to_string(), "CLEANUP_RAW");
        assert_eq!(
            serde_json::to_string(&PipelineStage::ResolveTarget).unwrap(),
            "\"RESOLVE_TARGET\""
        );
    }

    #[test]
    fn missing_tool_is_a_precondition_error() {
        let err = require_tool("qemu-img", Path::new("/nonexistent/qemu-img")).unwrap_err();
        let export = export_error(&err).unwrap();
        assert!(matches!(export, ExportError::MissingTool { tool, .. } if tool == "qemu-img"));
        assert!(export.is_precondition());
    }

    #[test]
    fn advisories_for_same_disk_and_low_space() {
        let adapter = crate::adapters::SimulatedAdapter::new()
            .with_disk("/dev/sda", 4096)
            .with_partition("/dev/sda1", "/dev/sda", 4096, Some("ext4"))
            .with_devnum("/dev/sda1", 2049);
        let devices = adapter.list_devices().unwrap();
        let (device, partitions) = (&devices[0], &devices[1..]);
        let out = Path::new("/out");

        let roomy = adapter.clone().with_available_space(1024);
        assert!(output_advisories(&roomy, out, device, partitions).is_empty());

        let cramped = adapter
            .clone()
            .with_destination_devnum(2049)
            .with_available_space(1023);
        assert_eq!(
            output_advisories(&cramped, out, device, partitions),
            vec![
                Advisory::SameDisk {
                    output: PathBuf::from("/out")
                },
                Advisory::LowSpace {
                    available: 1023,
                    device_size: 4096
                },
            ]
        );
    }

    #[test]
    fn remove_if_exists_tolerates_absence() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("export.ok");
        assert!(!remove_if_exists(&path).unwrap());
        std::fs::write(&path, b"{}").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn marker_is_json_and_creates_parent() {
        let temp = tempdir().unwrap();
        let marker = temp.path().join("state/export.ok");
        let outcome = PipelineOutcome {
            run_id: "0192".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            device: PathBuf::from("/dev/sda"),
            target: ImageTarget::Device {
                path: PathBuf::from("/dev/sda"),
                size: 1024,
            },
            strategy: CaptureStrategy::FullCopy,
            compression: CompressionPlan::None,
            bytes_read: 1024,
            artifact: Artifact::Raw {
                path: PathBuf::from("/tmp/diskport/disk.img"),
            },
            checksum: None,
            container_check: None,
            remote: None,
            remote_check: None,
            advisories: vec![Advisory::LowSpace {
                available: 1,
                device_size: 1024,
            }],
            thaw_failed: false,
        };

        write_marker(&marker, &outcome).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&marker).unwrap()).unwrap();
        assert_eq!(value["run_id"], "0192");
        assert_eq!(value["strategy"], "full-copy");
        assert_eq!(value["artifact"]["form"], "raw");
        assert_eq!(value["target"]["kind"], "device");
        assert_eq!(value["advisories"][0]["kind"], "low-space");
        assert!(!temp.path().join("state/export.tmp").exists());
    }
}
