//! Capture of the ImageTarget into the raw-family artifact.
//!
//! Both decisions that shape a capture (which reader, whether to compress)
//! are taken once in `CapturePlan::new` and never re-checked while bytes flow.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use flate2::write::GzEncoder;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::artifact::{Artifact, ArtifactLayout};
use super::checksum::{ChecksumAlgorithm, ChecksumRecord, Digester};
use super::resolver::ImageTarget;
use crate::config::{CompressionCodec, OutputFormat};
use crate::error::ExportError;
use crate::logging::LogThrottle;

/// Buffer size for device reads (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

/// Interval between progress log lines
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// How the target is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureStrategy {
    /// Allocated blocks only, read through ext2/3/4 metadata by `e2image`.
    Sparse,
    /// Every byte of the target, front to back.
    FullCopy,
}

impl CaptureStrategy {
    pub fn select(target: &ImageTarget) -> Self {
        if target.filesystem().is_ext_family() {
            Self::Sparse
        } else {
            Self::FullCopy
        }
    }
}

/// Whether the capture stream is compressed on its way to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionPlan {
    None,
    InStream(CompressionCodec),
}

impl CompressionPlan {
    /// Conversion re-encodes the image anyway, so compression here only
    /// happens for raw output.
    pub fn select(format: OutputFormat, compress: bool, codec: CompressionCodec) -> Self {
        if compress && format.is_raw() {
            Self::InStream(codec)
        } else {
            Self::None
        }
    }
}

/// Everything the capture needs, decided up front.
#[derive(Debug, Clone)]
pub struct CapturePlan {
    pub strategy: CaptureStrategy,
    pub compression: CompressionPlan,
    pub source: PathBuf,
    pub expected_size: u64,
    pub output: PathBuf,
    /// Digest algorithm and record path; only set for uncompressed captures
    /// with verification requested.
    pub checksum: Option<(ChecksumAlgorithm, PathBuf)>,
    pub e2image: PathBuf,
}

impl CapturePlan {
    pub fn new(
        target: &ImageTarget,
        layout: &ArtifactLayout,
        format: OutputFormat,
        compress: bool,
        verify: bool,
        e2image: PathBuf,
    ) -> Self {
        let strategy = CaptureStrategy::select(target);
        let compression = CompressionPlan::select(format, compress, layout.codec());

        let output = match compression {
            CompressionPlan::None => layout.raw(),
            CompressionPlan::InStream(_) => layout.compressed(),
        };

        let checksum = (verify && compression == CompressionPlan::None)
            .then(|| (layout.checksum_algorithm(), layout.checksum()));

        Self {
            strategy,
            compression,
            source: target.path().to_path_buf(),
            expected_size: target.size(),
            output,
            checksum,
            e2image,
        }
    }

    pub fn artifact(&self) -> Artifact {
        match self.compression {
            CompressionPlan::None => Artifact::Raw {
                path: self.output.clone(),
            },
            CompressionPlan::InStream(codec) => Artifact::Compressed {
                path: self.output.clone(),
                codec,
            },
        }
    }
}

#[derive(Debug)]
pub struct CaptureResult {
    pub artifact: Artifact,
    pub bytes_read: u64,
    pub checksum: Option<ChecksumRecord>,
    pub duration: Duration,
}

/// Run the capture on the blocking pool. Partial output is left in place on
/// failure.
pub async fn capture(plan: CapturePlan, cancel: CancellationToken) -> Result<CaptureResult> {
    tokio::task::spawn_blocking(move || capture_blocking(&plan, &cancel))
        .await
        .context("Capture task panicked")?
}

pub fn capture_blocking(plan: &CapturePlan, cancel: &CancellationToken) -> Result<CaptureResult> {
    info!(
        source = %plan.source.display(),
        output = %plan.output.display(),
        strategy = ?plan.strategy,
        compression = ?plan.compression,
        checksum = plan.checksum.is_some(),
        "Starting capture"
    );
    let start = Instant::now();

    let mut source = CaptureSource::open(plan)?;
    let mut sink = Sink::create(&plan.output, plan.compression)
        .map_err(|e| capture_error(format!("create {}: {e}", plan.output.display())))?;
    let mut digester = plan.checksum.as_ref().map(|(alg, _)| Digester::new(*alg));

    let throttle = LogThrottle::new(PROGRESS_INTERVAL);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_read: u64 = 0;

    let copied = loop {
        if cancel.is_cancelled() {
            source.abort();
            return Err(ExportError::Interrupted.into());
        }

        let n = match source.read(&mut buffer) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(capture_error(format!("read {}: {e}", plan.source.display()))),
        };

        let chunk = &buffer[..n];
        if let Some(d) = digester.as_mut() {
            d.update(chunk);
        }
        if let Err(e) = sink.write_chunk(chunk) {
            break Err(capture_error(format!("write {}: {e}", plan.output.display())));
        }
        bytes_read += n as u64;

        if throttle.should_log() {
            let percent = if plan.expected_size > 0 {
                (bytes_read as f64 / plan.expected_size as f64 * 100.0).min(100.0)
            } else {
                0.0
            };
            info!(bytes_read, total = plan.expected_size, percent = %format!("{percent:.1}"), "Capture progress");
        }
    };

    if let Err(e) = copied {
        source.abort();
        return Err(e);
    }

    if let Err(e) = sink.finish() {
        source.abort();
        return Err(capture_error(format!("finalize {}: {e}", plan.output.display())));
    }
    source.finish()?;

    if plan.strategy == CaptureStrategy::FullCopy
        && plan.expected_size > 0
        && bytes_read != plan.expected_size
    {
        warn!(
            bytes_read,
            expected = plan.expected_size,
            "Captured size differs from reported device size"
        );
    }

    let checksum = match (&plan.checksum, digester) {
        (Some((algorithm, record_path)), Some(d)) => {
            let record = ChecksumRecord::new(*algorithm, d.finalize(), &plan.output)?;
            record.write(record_path)?;
            info!(digest = %record.digest, algorithm = %algorithm, "Checksum recorded");
            Some(record)
        }
        _ => None,
    };

    let duration = start.elapsed();
    info!(
        bytes_read,
        duration_secs = duration.as_secs(),
        output = %plan.output.display(),
        "Capture complete"
    );

    Ok(CaptureResult {
        artifact: plan.artifact(),
        bytes_read,
        checksum,
        duration,
    })
}

fn capture_error(msg: String) -> anyhow::Error {
    ExportError::CaptureFailed(msg).into()
}

/// Producer half of the capture.
enum CaptureSource {
    Linear(File),
    Sparse {
        child: Child,
        stdout: ChildStdout,
        stderr: Option<JoinHandle<String>>,
    },
}

impl CaptureSource {
    fn open(plan: &CapturePlan) -> Result<Self> {
        match plan.strategy {
            CaptureStrategy::FullCopy => {
                let file = File::open(&plan.source).map_err(|e| {
                    capture_error(format!("open {}: {e}", plan.source.display()))
                })?;
                Ok(Self::Linear(file))
            }
            CaptureStrategy::Sparse => {
                // -r raw image, -a include file data, -p progress on stderr,
                // "-" writes to stdout
                debug!(tool = %plan.e2image.display(), source = %plan.source.display(), "Spawning e2image");
                let mut child = Command::new(&plan.e2image)
                    .arg("-rap")
                    .arg(&plan.source)
                    .arg("-")
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|e| {
                        capture_error(format!("spawn {}: {e}", plan.e2image.display()))
                    })?;

                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| anyhow!("e2image stdout not captured"))?;
                let stderr = child.stderr.take().map(|mut err| {
                    std::thread::spawn(move || {
                        let mut text = String::new();
                        let _ = err.read_to_string(&mut text);
                        text
                    })
                });

                Ok(Self::Sparse {
                    child,
                    stdout,
                    stderr,
                })
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Linear(file) => file.read(buf),
            Self::Sparse { stdout, .. } => stdout.read(buf),
        }
    }

    /// Stop the producer after a consumer-side failure.
    fn abort(&mut self) {
        if let Self::Sparse { child, .. } = self {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Reap the producer and surface a non-zero exit.
    fn finish(self) -> Result<()> {
        match self {
            Self::Linear(_) => Ok(()),
            Self::Sparse {
                mut child,
                stdout,
                stderr,
            } => {
                drop(stdout);
                let status = child
                    .wait()
                    .map_err(|e| capture_error(format!("wait for e2image: {e}")))?;
                let stderr = stderr
                    .and_then(|h| h.join().ok())
                    .unwrap_or_default();
                if status.success() {
                    Ok(())
                } else {
                    Err(capture_error(format!(
                        "e2image exited with {status}: {}",
                        stderr.trim()
                    )))
                }
            }
        }
    }
}

/// Consumer half of the capture.
enum Sink {
    /// Uncompressed; all-zero chunks become holes.
    Sparse { file: File, len: u64 },
    Gzip(GzEncoder<BufWriter<File>>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
}

impl Sink {
    fn create(path: &Path, compression: CompressionPlan) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(match compression {
            CompressionPlan::None => Self::Sparse { file, len: 0 },
            CompressionPlan::InStream(CompressionCodec::Gzip) => Self::Gzip(GzEncoder::new(
                BufWriter::with_capacity(BUFFER_SIZE, file),
                flate2::Compression::default(),
            )),
            CompressionPlan::InStream(CompressionCodec::Zstd) => Self::Zstd(
                zstd::stream::write::Encoder::new(BufWriter::with_capacity(BUFFER_SIZE, file), 3)?,
            ),
        })
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Self::Sparse { file, len } => {
                if chunk.iter().all(|b| *b == 0) {
                    file.seek(SeekFrom::Current(chunk.len() as i64))?;
                } else {
                    file.write_all(chunk)?;
                }
                *len += chunk.len() as u64;
                Ok(())
            }
            Self::Gzip(enc) => enc.write_all(chunk),
            Self::Zstd(enc) => enc.write_all(chunk),
        }
    }

    fn finish(self) -> io::Result<()> {
        let file = match self {
            Self::Sparse { file, len } => {
                // A trailing hole is only materialised by set_len
                file.set_len(len)?;
                file
            }
            Self::Gzip(enc) => enc.finish()?.into_inner().map_err(|e| e.into_error())?,
            Self::Zstd(enc) => enc.finish()?.into_inner().map_err(|e| e.into_error())?,
        };
        file.sync_all()
    }
}
