//! Raw image to virtual-disk container conversion through `qemu-img`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::artifact::{Artifact, ArtifactLayout};
use crate::config::{CompressionCodec, OutputFormat};
use crate::error::ExportError;

/// Buffer size for decompression (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub format: OutputFormat,
    /// The run asked for compression; honoured through the container's own
    /// compression where it has one.
    pub compress: bool,
    pub verify: bool,
    pub qemu_img: PathBuf,
}

/// Result of the container's own integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckOutcome {
    Passed,
    /// Reported as a warning; the artifact is kept for inspection.
    Failed(String),
    NotRequested,
    Unsupported,
}

#[derive(Debug)]
pub struct ConvertResult {
    pub artifact: Artifact,
    pub check: CheckOutcome,
}

pub async fn convert(
    input: &Artifact,
    layout: &ArtifactLayout,
    req: &ConvertRequest,
) -> Result<ConvertResult> {
    if let Artifact::Converted { .. } = input {
        debug!(artifact = %input.path().display(), "Artifact already converted");
        return Ok(ConvertResult {
            artifact: input.clone(),
            check: CheckOutcome::NotRequested,
        });
    }

    let raw = layout.raw();
    if let Artifact::Compressed { path, codec } = input {
        info!(from = %path.display(), to = %raw.display(), codec = %codec, "Decompressing before conversion");
        let (src, dst, codec) = (path.clone(), raw.clone(), *codec);
        tokio::task::spawn_blocking(move || decompress(&src, &dst, codec))
            .await
            .context("Decompression task panicked")??;
    }

    if !raw.is_file() {
        return Err(ExportError::MissingRawArtifact(raw).into());
    }

    let output = layout.converted(req.format);
    let args = convert_args(&raw, &output, req.format, req.compress);
    info!(
        format = %req.format,
        compressed = args.iter().any(|a| a == "-c"),
        output = %output.display(),
        "Converting image"
    );

    let result = Command::new(&req.qemu_img)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| conversion_error(req.format, format!("spawn {}: {e}", req.qemu_img.display())))?;

    if !result.status.success() {
        return Err(conversion_error(
            req.format,
            format!(
                "qemu-img exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            ),
        ));
    }

    let check = if !req.verify {
        CheckOutcome::NotRequested
    } else if !req.format.supports_check() {
        debug!(format = %req.format, "qemu-img check does not support this format");
        CheckOutcome::Unsupported
    } else {
        check_image(&req.qemu_img, &output, req.format).await
    };

    Ok(ConvertResult {
        artifact: Artifact::Converted {
            path: output,
            format: req.format,
        },
        check,
    })
}

/// `qemu-img convert` arguments. `-c` only where the container compresses
/// clusters itself.
pub fn convert_args(raw: &Path, output: &Path, format: OutputFormat, compress: bool) -> Vec<String> {
    let mut args = vec![
        "convert".to_string(),
        "-f".to_string(),
        "raw".to_string(),
        "-O".to_string(),
        format.as_str().to_string(),
    ];
    if compress && format.supports_internal_compression() {
        args.push("-c".to_string());
    }
    args.push(raw.to_string_lossy().into_owned());
    args.push(output.to_string_lossy().into_owned());
    args
}

async fn check_image(qemu_img: &Path, image: &Path, format: OutputFormat) -> CheckOutcome {
    let output = Command::new(qemu_img)
        .args(["check", "-f", format.as_str()])
        .arg(image)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            info!(image = %image.display(), "Container check passed");
            CheckOutcome::Passed
        }
        Ok(out) => {
            let detail = format!(
                "qemu-img check exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stdout).trim()
            );
            warn!(image = %image.display(), detail = %detail, "Container check failed, keeping artifact");
            CheckOutcome::Failed(detail)
        }
        Err(e) => {
            warn!(image = %image.display(), error = %e, "Could not run container check");
            CheckOutcome::Failed(e.to_string())
        }
    }
}

/// Expand a compressed raw artifact, replacing any stale raw file.
pub fn decompress(src: &Path, dst: &Path, codec: CompressionCodec) -> Result<u64> {
    let input = BufReader::with_capacity(
        BUFFER_SIZE,
        File::open(src).with_context(|| format!("Failed to open {}", src.display()))?,
    );
    let mut output = BufWriter::with_capacity(
        BUFFER_SIZE,
        File::create(dst).with_context(|| format!("Failed to create {}", dst.display()))?,
    );

    let bytes = match codec {
        CompressionCodec::Gzip => io::copy(&mut flate2::read::GzDecoder::new(input), &mut output),
        CompressionCodec::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::with_buffer(input)
                .with_context(|| format!("Failed to read zstd header of {}", src.display()))?;
            io::copy(&mut decoder, &mut output)
        }
    }
    .with_context(|| format!("Failed to decompress {}", src.display()))?;

    output
        .flush()
        .with_context(|| format!("Failed to write {}", dst.display()))?;
    debug!(bytes, "Decompressed raw image");
    Ok(bytes)
}

fn conversion_error(format: OutputFormat, reason: String) -> anyhow::Error {
    ExportError::ConversionFailed {
        format: format.to_string(),
        reason,
    }
    .into()
}
