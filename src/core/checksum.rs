use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Buffer size for hashing reads (128KB)
const BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Blake3,
}

impl ChecksumAlgorithm {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "b3",
        }
    }

    /// Tool that understands `-c <file>` for this algorithm on the remote side.
    pub fn check_tool(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256sum",
            Self::Blake3 => "b3sum",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Blake3 => f.write_str("blake3"),
        }
    }
}

/// Incremental digest over a byte stream.
pub enum Digester {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Digester {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            ChecksumAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Lowercase hex digest.
    pub fn finalize(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Digest of the uncompressed raw artifact, stored next to it in the
/// `<hex>  <name>` format `sha256sum -c` and `b3sum -c` read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumRecord {
    pub algorithm: ChecksumAlgorithm,
    pub digest: String,
    pub file_name: String,
}

impl ChecksumRecord {
    pub fn new(algorithm: ChecksumAlgorithm, digest: String, artifact: &Path) -> Result<Self> {
        let file_name = artifact
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", artifact.display()))?
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            algorithm,
            digest,
            file_name,
        })
    }

    pub fn to_line(&self) -> String {
        format!("{}  {}\n", self.digest, self.file_name)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_line())
            .with_context(|| format!("Failed to write checksum file {}", path.display()))
    }

    pub fn read(path: &Path, algorithm: ChecksumAlgorithm) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checksum file {}", path.display()))?;

        let line = content
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| anyhow!("Checksum file {} is empty", path.display()))?;

        let (digest, name) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| anyhow!("Malformed checksum line: {}", line))?;

        // Binary-mode marker from `sha256sum -b`
        let name = name.trim_start().trim_start_matches('*');
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("Malformed digest in {}: {}", path.display(), digest);
        }

        Ok(Self {
            algorithm,
            digest: digest.to_lowercase(),
            file_name: name.to_string(),
        })
    }

    /// Whether this record is about `artifact` (same file name).
    pub fn describes(&self, artifact: &Path) -> bool {
        artifact
            .file_name()
            .is_some_and(|n| n.to_string_lossy() == self.file_name)
    }
}

/// Stream a file through the digest.
pub fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut digester = Digester::new(algorithm);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        digester.update(&buffer[..n]);
    }

    Ok(digester.finalize())
}

/// Recompute the digest of `path` and compare it with `record`.
pub fn verify_file(path: &Path, record: &ChecksumRecord) -> Result<bool> {
    Ok(hash_file(path, record.algorithm)? == record.digest)
}
