use std::sync::Arc;

use crate::core::hardware::HardwareAdapter;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::LinuxAdapter;
pub use simulated::{FreezeEvent, FreezeLog, SimulatedAdapter};

/// The adapter for the host platform.
pub fn get_adapter() -> Arc<dyn HardwareAdapter> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxAdapter::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        // No block device inventory outside Linux; resolution reports NoDeviceFound.
        Arc::new(SimulatedAdapter::new())
    }
}
