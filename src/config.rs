use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::checksum::ChecksumAlgorithm;
use crate::error::ExportError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/diskport/config.toml";
pub const DEFAULT_OUTPUT_DIR: &str = "/tmp/diskport";
pub const DEFAULT_MARKER_PATH: &str = "/var/lib/diskport/export.ok";
pub const ENV_PREFIX: &str = "DISKPORT_";

static REMOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+$").expect("valid regex"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Explicit device to export; auto-detected when unset.
    pub device: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// One of raw, qcow2, vmdk, vdi. Validated at preflight.
    pub format: String,
    pub compress: bool,
    pub compression: CompressionCodec,
    pub verify: bool,
    pub checksum: ChecksumAlgorithm,
    /// `account@host`. Transfer is skipped when unset.
    pub remote: Option<String>,
    /// Directory on the remote host; the account's home when unset.
    pub remote_path: Option<String>,
    pub marker_path: PathBuf,
    pub tools: ToolPaths,
    pub verbose: bool,
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            format: OutputFormat::Raw.to_string(),
            compress: true,
            compression: CompressionCodec::Gzip,
            verify: true,
            checksum: ChecksumAlgorithm::Sha256,
            remote: None,
            remote_path: None,
            marker_path: PathBuf::from(DEFAULT_MARKER_PATH),
            tools: ToolPaths::default(),
            verbose: false,
            log_json: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `DISKPORT_*` environment variables and
    /// CLI overrides, in that order.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", file.display()))
    }

    pub fn output_format(&self) -> Result<OutputFormat, ExportError> {
        self.format.parse()
    }

    pub fn remote_destination(&self) -> Result<Option<RemoteDestination>, ExportError> {
        match &self.remote {
            None => Ok(None),
            Some(r) if r.trim().is_empty() => Ok(None),
            Some(r) => RemoteDestination::new(r, self.remote_path.clone()).map(Some),
        }
    }
}

/// Paths (or bare names resolved through `PATH`) of the external tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolPaths {
    pub e2image: PathBuf,
    pub qemu_img: PathBuf,
    pub rsync: PathBuf,
    pub ssh: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            e2image: PathBuf::from("e2image"),
            qemu_img: PathBuf::from("qemu-img"),
            rsync: PathBuf::from("rsync"),
            ssh: PathBuf::from("ssh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Raw,
    Qcow2,
    Vmdk,
    Vdi,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Vmdk => "vmdk",
            Self::Vdi => "vdi",
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw)
    }

    /// Whether `qemu-img convert -c` produces internally compressed clusters.
    pub fn supports_internal_compression(&self) -> bool {
        matches!(self, Self::Qcow2)
    }

    /// Whether `qemu-img check` understands the format.
    pub fn supports_check(&self) -> bool {
        matches!(self, Self::Qcow2 | Self::Vdi)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "raw" | "img" => Ok(Self::Raw),
            "qcow2" => Ok(Self::Qcow2),
            "vmdk" => Ok(Self::Vmdk),
            "vdi" => Ok(Self::Vdi),
            _ => Err(ExportError::InvalidFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    Gzip,
    Zstd,
}

impl CompressionCodec {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gzip => "gz",
            Self::Zstd => "zst",
        }
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gzip => f.write_str("gzip"),
            Self::Zstd => f.write_str("zstd"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDestination {
    pub account_host: String,
    pub path: Option<String>,
}

impl RemoteDestination {
    pub fn new(account_host: &str, path: Option<String>) -> Result<Self, ExportError> {
        let account_host = account_host.trim();
        if !REMOTE_RE.is_match(account_host) {
            return Err(ExportError::InvalidRemote(account_host.to_string()));
        }
        Ok(Self {
            account_host: account_host.to_string(),
            path: path.filter(|p| !p.trim().is_empty()),
        })
    }

    /// rsync destination argument. An empty path after the colon means the remote home.
    pub fn rsync_target(&self) -> String {
        match &self.path {
            Some(p) if p.ends_with('/') => format!("{}:{}", self.account_host, p),
            Some(p) => format!("{}:{}/", self.account_host, p),
            None => format!("{}:", self.account_host),
        }
    }

    /// Directory to `cd` into on the remote side before verifying.
    pub fn remote_dir(&self) -> &str {
        self.path.as_deref().unwrap_or(".")
    }
}

impl fmt::Display for RemoteDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rsync_target())
    }
}
