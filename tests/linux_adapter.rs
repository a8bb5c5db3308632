//! Linux adapter integration tests using loopback devices.
//!
//! Most tests require root privileges and Linux-specific tools (losetup, mkfs.ext4, mount).
//!
//! Run all tests: `cargo test --test linux_adapter`
//! Run ignored tests: `sudo cargo test --test linux_adapter -- --ignored`

#![cfg(target_os = "linux")]

use diskport::adapters::LinuxAdapter;
use diskport::core::{DeviceKind, HardwareAdapter};
use nix::unistd::Uid;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::{NamedTempFile, TempDir};

fn is_root() -> bool {
    Uid::effective().is_root()
}

fn has_tool(tool: &str) -> bool {
    which::which(tool).is_ok()
}

/// Create an ext4-formatted loopback device from a temp file.
/// Returns the loop device path (e.g., /dev/loop0) on success.
fn setup_loopback(file_path: &Path, size_mb: u64) -> Option<PathBuf> {
    let result = Command::new("dd")
        .args([
            "if=/dev/zero",
            &format!("of={}", file_path.display()),
            "bs=1M",
            &format!("count={}", size_mb),
        ])
        .output()
        .ok()?;
    if !result.status.success() {
        eprintln!("dd failed: {}", String::from_utf8_lossy(&result.stderr));
        return None;
    }

    let result = Command::new("mkfs.ext4")
        .arg("-F")
        .arg("-q")
        .arg(file_path)
        .output()
        .ok()?;
    if !result.status.success() {
        eprintln!(
            "mkfs.ext4 failed: {}",
            String::from_utf8_lossy(&result.stderr)
        );
        return None;
    }

    let output = Command::new("losetup")
        .arg("--find")
        .arg("--show")
        .arg(file_path)
        .output()
        .ok()?;
    if output.status.success() {
        Some(PathBuf::from(
            String::from_utf8_lossy(&output.stdout).trim(),
        ))
    } else {
        eprintln!(
            "losetup failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        None
    }
}

fn teardown_loopback(loop_device: &Path) {
    let _ = Command::new("losetup").arg("-d").arg(loop_device).output();
}

fn mount(device: &Path, target: &Path) -> bool {
    Command::new("mount")
        .arg(device)
        .arg(target)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn umount(target: &Path) {
    let _ = Command::new("umount").arg(target).status();
}

#[test]
fn test_list_devices() {
    let adapter = LinuxAdapter::new();
    let result = adapter.list_devices();
    assert!(
        result.is_ok(),
        "list_devices should not error: {:?}",
        result.err()
    );
}

#[test]
fn test_list_mounts_includes_root() {
    let adapter = LinuxAdapter::new();
    let mounts = adapter.list_mounts().expect("read mount table");
    assert!(mounts.iter().any(|m| m.target == Path::new("/")));
}

#[test]
fn test_available_space_of_tempdir() {
    let adapter = LinuxAdapter::new();
    let temp = TempDir::new().unwrap();
    assert!(adapter.available_space(temp.path()).unwrap() > 0);
    assert!(adapter.device_of(temp.path()).unwrap().is_some());
}

#[test]
#[ignore = "requires root privileges and losetup/mkfs.ext4"]
fn test_detects_loopback_device() {
    if !is_root() || !has_tool("losetup") || !has_tool("mkfs.ext4") {
        eprintln!("Skipping: requires root, losetup and mkfs.ext4");
        return;
    }

    let temp_file = NamedTempFile::new().expect("create temp file");
    let loop_device = match setup_loopback(temp_file.path(), 32) {
        Some(dev) => dev,
        None => {
            eprintln!("Failed to setup loopback device");
            return;
        }
    };

    let adapter = LinuxAdapter::new();
    let devices = adapter.list_devices();
    teardown_loopback(&loop_device);

    let devices = devices.expect("list devices");
    let found = devices
        .iter()
        .find(|d| d.path == loop_device)
        .expect("loop device in inventory");
    assert_eq!(found.kind, DeviceKind::Loop);
    assert_eq!(found.size, 32 * 1024 * 1024);
    assert_eq!(found.filesystem.as_deref(), Some("ext4"));
}

#[test]
#[ignore = "requires root privileges and losetup/mkfs.ext4/mount"]
fn test_freeze_and_thaw_mounted_loopback() {
    if !is_root() || !has_tool("losetup") || !has_tool("mkfs.ext4") {
        eprintln!("Skipping: requires root, losetup and mkfs.ext4");
        return;
    }

    let temp_file = NamedTempFile::new().expect("create temp file");
    let mount_point = TempDir::new().unwrap();
    let Some(loop_device) = setup_loopback(temp_file.path(), 32) else {
        eprintln!("Failed to setup loopback device");
        return;
    };
    if !mount(&loop_device, mount_point.path()) {
        teardown_loopback(&loop_device);
        eprintln!("Failed to mount loopback device");
        return;
    }

    let adapter = LinuxAdapter::new();
    assert!(adapter.supports_freeze());
    let frozen = adapter.freeze(mount_point.path());
    let double = adapter.freeze(mount_point.path());
    let thawed = adapter.thaw(mount_point.path());

    umount(mount_point.path());
    teardown_loopback(&loop_device);

    frozen.expect("freeze");
    assert!(double.is_err(), "second freeze must be rejected by the kernel");
    thawed.expect("thaw");
}
