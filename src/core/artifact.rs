//! Fixed artifact names and the artifact form current at each stage.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use super::checksum::ChecksumAlgorithm;
use crate::config::{CompressionCodec, OutputFormat};

const BASE_NAME: &str = "disk";
const RAW_EXTENSION: &str = "img";

const ALL_CODECS: [CompressionCodec; 2] = [CompressionCodec::Gzip, CompressionCodec::Zstd];
const ALL_CONTAINERS: [OutputFormat; 3] = [OutputFormat::Qcow2, OutputFormat::Vmdk, OutputFormat::Vdi];
const ALL_CHECKSUMS: [ChecksumAlgorithm; 2] = [ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Blake3];

/// The single artifact that is current at a given pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "form", rename_all = "lowercase")]
pub enum Artifact {
    Raw {
        path: PathBuf,
    },
    Compressed {
        path: PathBuf,
        codec: CompressionCodec,
    },
    Converted {
        path: PathBuf,
        #[serde(serialize_with = "serialize_display")]
        format: OutputFormat,
    },
}

impl Artifact {
    pub fn path(&self) -> &Path {
        match self {
            Self::Raw { path } | Self::Compressed { path, .. } | Self::Converted { path, .. } => {
                path
            }
        }
    }
}

fn serialize_display<T: std::fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Deterministic file names inside the output directory.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    dir: PathBuf,
    codec: CompressionCodec,
    checksum: ChecksumAlgorithm,
}

impl ArtifactLayout {
    pub fn new(dir: impl Into<PathBuf>, codec: CompressionCodec, checksum: ChecksumAlgorithm) -> Self {
        Self {
            dir: dir.into(),
            codec,
            checksum,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn raw(&self) -> PathBuf {
        self.dir.join(format!("{BASE_NAME}.{RAW_EXTENSION}"))
    }

    pub fn compressed(&self) -> PathBuf {
        self.compressed_with(self.codec)
    }

    fn compressed_with(&self, codec: CompressionCodec) -> PathBuf {
        self.dir
            .join(format!("{BASE_NAME}.{RAW_EXTENSION}.{}", codec.extension()))
    }

    pub fn converted(&self, format: OutputFormat) -> PathBuf {
        match format {
            OutputFormat::Raw => self.raw(),
            other => self.dir.join(format!("{BASE_NAME}.{}", other.as_str())),
        }
    }

    pub fn checksum(&self) -> PathBuf {
        self.checksum_with(self.checksum)
    }

    fn checksum_with(&self, algorithm: ChecksumAlgorithm) -> PathBuf {
        self.dir
            .join(format!("{BASE_NAME}.{RAW_EXTENSION}.{}", algorithm.extension()))
    }

    pub fn codec(&self) -> CompressionCodec {
        self.codec
    }

    pub fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    /// Every name any configuration could have produced.
    pub fn all_known(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.raw()];
        paths.extend(ALL_CODECS.iter().map(|c| self.compressed_with(*c)));
        paths.extend(ALL_CONTAINERS.iter().map(|f| self.converted(*f)));
        paths.extend(ALL_CHECKSUMS.iter().map(|a| self.checksum_with(*a)));
        paths
    }

    /// Delete artifacts left by a previous run so runs never accumulate files.
    pub fn remove_stale(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for path in self.all_known() {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed stale artifact");
                    removed.push(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove stale {}", path.display()));
                }
            }
        }
        Ok(removed)
    }

    /// Final artifact on disk, preferring converted, then compressed raw, then
    /// plain raw.
    pub fn locate(&self, format: OutputFormat) -> Option<Artifact> {
        if !format.is_raw() {
            let path = self.converted(format);
            if path.is_file() {
                return Some(Artifact::Converted { path, format });
            }
        }
        let compressed = self.compressed();
        if compressed.is_file() {
            return Some(Artifact::Compressed {
                path: compressed,
                codec: self.codec,
            });
        }
        let raw = self.raw();
        raw.is_file().then_some(Artifact::Raw { path: raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout(dir: &Path) -> ArtifactLayout {
        ArtifactLayout::new(dir, CompressionCodec::Gzip, ChecksumAlgorithm::Sha256)
    }

    #[test]
    fn names_are_fixed() {
        let l = layout(Path::new("/out"));
        assert_eq!(l.raw(), PathBuf::from("/out/disk.img"));
        assert_eq!(l.compressed(), PathBuf::from("/out/disk.img.gz"));
        assert_eq!(l.converted(OutputFormat::Qcow2), PathBuf::from("/out/disk.qcow2"));
        assert_eq!(l.converted(OutputFormat::Raw), PathBuf::from("/out/disk.img"));
        assert_eq!(l.checksum(), PathBuf::from("/out/disk.img.sha256"));

        let z = ArtifactLayout::new("/out", CompressionCodec::Zstd, ChecksumAlgorithm::Blake3);
        assert_eq!(z.compressed(), PathBuf::from("/out/disk.img.zst"));
        assert_eq!(z.checksum(), PathBuf::from("/out/disk.img.b3"));
    }

    #[test]
    fn remove_stale_clears_every_known_name_only() {
        let temp = tempdir().unwrap();
        let l = layout(temp.path());
        std::fs::write(l.raw(), b"old").unwrap();
        std::fs::write(temp.path().join("disk.img.zst"), b"old").unwrap();
        std::fs::write(l.converted(OutputFormat::Vdi), b"old").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"keep").unwrap();

        let removed = l.remove_stale().unwrap();
        assert_eq!(removed.len(), 3);
        assert!(temp.path().join("notes.txt").exists());
        assert!(l.locate(OutputFormat::Vdi).is_none());
    }

    #[test]
    fn locate_prefers_converted_then_compressed() {
        let temp = tempdir().unwrap();
        let l = layout(temp.path());

        std::fs::write(l.raw(), b"raw").unwrap();
        assert!(matches!(l.locate(OutputFormat::Qcow2), Some(Artifact::Raw { .. })));

        std::fs::write(l.compressed(), b"gz").unwrap();
        assert!(matches!(
            l.locate(OutputFormat::Qcow2),
            Some(Artifact::Compressed { .. })
        ));

        std::fs::write(l.converted(OutputFormat::Qcow2), b"qcow").unwrap();
        let found = l.locate(OutputFormat::Qcow2).unwrap();
        assert_eq!(found.path(), l.converted(OutputFormat::Qcow2));
    }
}
