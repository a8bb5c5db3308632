//! Shared fixtures: regular files standing in for a disk and its partition,
//! and shell scripts standing in for e2image and qemu-img.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use diskport::adapters::SimulatedAdapter;
use diskport::config::{AppConfig, ToolPaths};
use diskport::context::AppContext;
use diskport::core::transfer_engine::TransferEngine;
use tempfile::TempDir;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const DISK_LEN: usize = 384 * 1024;
pub const PARTITION_LEN: usize = 256 * 1024;

pub struct Fixture {
    pub temp: TempDir,
    pub disk: PathBuf,
    pub partition: PathBuf,
    pub mount: PathBuf,
    pub tools: ToolPaths,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        let disk = root.join("sda");
        std::fs::write(&disk, pattern(DISK_LEN, 3)).unwrap();

        // Zero run in the middle exercises the sparse writer
        let mut part = pattern(PARTITION_LEN, 7);
        part[64 * 1024..192 * 1024].fill(0);
        let partition = root.join("sda1");
        std::fs::write(&partition, part).unwrap();

        let mount = root.join("mnt");
        std::fs::create_dir(&mount).unwrap();

        let bin = root.join("bin");
        std::fs::create_dir(&bin).unwrap();
        let tools = ToolPaths {
            e2image: fake_e2image(&bin),
            qemu_img: fake_qemu_img(&bin),
            rsync: bin.join("rsync"),
            ssh: bin.join("ssh"),
        };

        Self {
            temp,
            disk,
            partition,
            mount,
            tools,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn out(&self) -> PathBuf {
        self.root().join("out")
    }

    pub fn marker(&self) -> PathBuf {
        self.root().join("state/export.ok")
    }

    pub fn bin(&self) -> PathBuf {
        self.root().join("bin")
    }

    pub fn config(&self, format: &str, compress: bool, verify: bool) -> AppConfig {
        AppConfig {
            device: Some(self.disk.clone()),
            output_dir: self.out(),
            format: format.to_string(),
            compress,
            verify,
            marker_path: self.marker(),
            tools: self.tools.clone(),
            ..AppConfig::default()
        }
    }

    /// 10 GiB disk with one mounted ext4 partition.
    pub fn ext4_adapter(&self) -> SimulatedAdapter {
        SimulatedAdapter::new()
            .with_disk(&self.disk, 10 * GIB)
            .with_partition(
                &self.partition,
                &self.disk,
                PARTITION_LEN as u64,
                Some("ext4"),
            )
            .with_mount(&self.partition, &self.mount, "ext4")
    }

    /// Disk whose only partition is xfs, so the whole disk is imaged.
    pub fn xfs_adapter(&self) -> SimulatedAdapter {
        SimulatedAdapter::new()
            .with_disk(&self.disk, DISK_LEN as u64)
            .with_partition(
                &self.partition,
                &self.disk,
                PARTITION_LEN as u64,
                Some("xfs"),
            )
            .with_mount(&self.partition, &self.mount, "xfs")
    }

    pub fn log(&self, tool: &str) -> Vec<String> {
        std::fs::read_to_string(self.bin().join(format!("{tool}.log")))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Sorted file names in the output directory.
    pub fn outputs(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.out())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

pub fn context(
    config: AppConfig,
    adapter: &SimulatedAdapter,
    engine: impl TransferEngine + 'static,
) -> AppContext {
    AppContext::new(config, Arc::new(adapter.clone()), Arc::new(engine))
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) | 1)
        .collect()
}

pub fn script(path: &Path, body: &str) -> PathBuf {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

/// `e2image -rap <src> -`: logs its arguments and streams the source.
fn fake_e2image(bin: &Path) -> PathBuf {
    script(
        &bin.join("e2image"),
        &format!(
            "#!/bin/sh\necho \"$@\" >> \"{}/e2image.log\"\nexec cat \"$2\"\n",
            bin.display()
        ),
    )
}

/// `qemu-img convert ... <src> <dst>` copies; `qemu-img check` passes.
fn fake_qemu_img(bin: &Path) -> PathBuf {
    script(
        &bin.join("qemu-img"),
        &format!(
            r#"#!/bin/sh
echo "$@" >> "{bin}/qemu-img.log"
case "$1" in
  convert)
    prev=""; last=""
    for a in "$@"; do prev="$last"; last="$a"; done
    cp "$prev" "$last"
    ;;
esac
"#,
            bin = bin.display()
        ),
    )
}
