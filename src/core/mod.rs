pub mod artifact;
pub mod checksum;
pub mod converter;
pub mod freeze;
pub mod hardware;
pub mod imaging;
pub mod mounts;
pub mod orchestrator;
pub mod resolver;
pub mod transfer_engine;

pub use artifact::{Artifact, ArtifactLayout};
pub use checksum::{ChecksumAlgorithm, ChecksumRecord};
pub use freeze::{FreezeCoordinator, FreezeGuard, FreezeState};
pub use hardware::{BlockDevice, DeviceKind, FilesystemKind, HardwareAdapter, MountEntry};
pub use imaging::{CaptureStrategy, CompressionPlan};
pub use orchestrator::{Advisory, Orchestrator, PipelineOutcome, PipelineStage};
pub use resolver::ImageTarget;
