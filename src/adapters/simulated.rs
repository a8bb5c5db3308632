use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};

use crate::core::hardware::{BlockDevice, DeviceKind, HardwareAdapter, MountEntry};
use crate::error::ExportError;

/// What the simulated kernel observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeEvent {
    Frozen(PathBuf),
    FreezeRejected(PathBuf),
    Thawed(PathBuf),
    ThawRejected(PathBuf),
}

/// Shared view of the freeze/thaw calls made against a `SimulatedAdapter`.
#[derive(Debug, Clone, Default)]
pub struct FreezeLog {
    events: Arc<Mutex<Vec<FreezeEvent>>>,
    frozen: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FreezeLog {
    pub fn events(&self) -> Vec<FreezeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Mounts that are frozen right now.
    pub fn currently_frozen(&self) -> Vec<PathBuf> {
        self.frozen
            .lock()
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, event: FreezeEvent) {
        if let Ok(mut frozen) = self.frozen.lock() {
            match &event {
                FreezeEvent::Frozen(p) => {
                    frozen.insert(p.clone());
                }
                FreezeEvent::Thawed(p) => {
                    frozen.remove(p);
                }
                _ => {}
            }
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// In-memory hardware for tests and dry runs. Device paths may point at
/// regular files, which the imaging engine reads like any block device.
#[derive(Debug, Clone)]
pub struct SimulatedAdapter {
    devices: Vec<BlockDevice>,
    mounts: Vec<MountEntry>,
    freeze_supported: bool,
    privileged: bool,
    fail_freeze: HashSet<PathBuf>,
    fail_thaw: HashSet<PathBuf>,
    available_space: Option<u64>,
    destination_devnum: Option<u64>,
    log: FreezeLog,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            mounts: Vec::new(),
            freeze_supported: true,
            privileged: true,
            fail_freeze: HashSet::new(),
            fail_thaw: HashSet::new(),
            available_space: None,
            destination_devnum: None,
            log: FreezeLog::default(),
        }
    }

    fn with_device(mut self, device: BlockDevice) -> Self {
        self.devices.push(device);
        self
    }

    fn block(path: impl Into<PathBuf>, size: u64, kind: DeviceKind) -> BlockDevice {
        BlockDevice {
            path: path.into(),
            size,
            kind,
            parent: None,
            filesystem: None,
            devnum: None,
            removable: false,
        }
    }

    pub fn with_disk(self, path: impl Into<PathBuf>, size: u64) -> Self {
        self.with_device(Self::block(path, size, DeviceKind::Disk))
    }

    pub fn with_loop(self, path: impl Into<PathBuf>, size: u64) -> Self {
        self.with_device(Self::block(path, size, DeviceKind::Loop))
    }

    pub fn with_optical(self, path: impl Into<PathBuf>, size: u64) -> Self {
        let mut device = Self::block(path, size, DeviceKind::Optical);
        device.removable = true;
        self.with_device(device)
    }

    pub fn with_partition(
        self,
        path: impl Into<PathBuf>,
        parent: impl Into<PathBuf>,
        size: u64,
        filesystem: Option<&str>,
    ) -> Self {
        let mut device = Self::block(path, size, DeviceKind::Partition);
        device.parent = Some(parent.into());
        device.filesystem = filesystem.map(str::to_string);
        self.with_device(device)
    }

    pub fn with_mount(
        mut self,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        fstype: &str,
    ) -> Self {
        self.mounts.push(MountEntry {
            source: source.into().to_string_lossy().into_owned(),
            target: target.into(),
            fstype: fstype.to_string(),
        });
        self
    }

    /// Assign a device number to an inventory entry.
    pub fn with_devnum(mut self, path: impl AsRef<Path>, devnum: u64) -> Self {
        for device in self.devices.iter_mut().filter(|d| d.path == path.as_ref()) {
            device.devnum = Some(devnum);
        }
        self
    }

    /// Device number reported for any destination path.
    pub fn with_destination_devnum(mut self, devnum: u64) -> Self {
        self.destination_devnum = Some(devnum);
        self
    }

    pub fn with_available_space(mut self, bytes: u64) -> Self {
        self.available_space = Some(bytes);
        self
    }

    pub fn without_freeze_support(mut self) -> Self {
        self.freeze_supported = false;
        self
    }

    pub fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    pub fn fail_freeze_on(mut self, mount: impl Into<PathBuf>) -> Self {
        self.fail_freeze.insert(mount.into());
        self
    }

    pub fn fail_thaw_on(mut self, mount: impl Into<PathBuf>) -> Self {
        self.fail_thaw.insert(mount.into());
        self
    }

    pub fn freeze_log(&self) -> FreezeLog {
        self.log.clone()
    }
}

impl HardwareAdapter for SimulatedAdapter {
    fn list_devices(&self) -> Result<Vec<BlockDevice>> {
        Ok(self.devices.clone())
    }

    fn list_mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(self.mounts.clone())
    }

    fn check_privileges(&self) -> Result<()> {
        if self.privileged {
            Ok(())
        } else {
            Err(ExportError::NotPrivileged.into())
        }
    }

    fn supports_freeze(&self) -> bool {
        self.freeze_supported
    }

    fn freeze(&self, mount: &Path) -> Result<()> {
        if self.fail_freeze.contains(mount) {
            self.log.record(FreezeEvent::FreezeRejected(mount.to_path_buf()));
            bail!("simulated EBUSY");
        }
        if self.log.currently_frozen().iter().any(|p| p == mount) {
            return Err(anyhow!("{} is already frozen", mount.display()));
        }
        self.log.record(FreezeEvent::Frozen(mount.to_path_buf()));
        Ok(())
    }

    fn thaw(&self, mount: &Path) -> Result<()> {
        if self.fail_thaw.contains(mount) {
            self.log.record(FreezeEvent::ThawRejected(mount.to_path_buf()));
            bail!("simulated EINVAL");
        }
        self.log.record(FreezeEvent::Thawed(mount.to_path_buf()));
        Ok(())
    }

    fn device_of(&self, _path: &Path) -> Result<Option<u64>> {
        Ok(self.destination_devnum)
    }

    fn available_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.available_space.unwrap_or(u64::MAX))
    }
}
