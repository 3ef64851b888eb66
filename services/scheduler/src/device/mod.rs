//! Devices under test and the pool that hands them out.
//!
//! - `Device`: one device known to the host, shared as a [`DeviceHandle`]
//! - `DeviceSelection`: requirement filter used to pick a device
//! - `DevicePool`: in-process [`DeviceManager`] guarding allocation state

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod pool;
pub mod selection;

pub use pool::{DeviceDescriptor, DeviceManager, DevicePool};
pub use selection::DeviceSelection;

/// Shared handle to a device.
pub type DeviceHandle = Arc<Device>;

/// Errors raised by device pool operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device {serial} is not available for allocation: {reason}")]
    NoDevice { serial: String, reason: String },

    #[error("device {0} is already registered")]
    Duplicate(String),
}

/// What kind of device a serial refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Physical,
    Emulator,
    /// Device reached over adb-over-tcp; the entry is a placeholder.
    Tcp,
    /// Stub device for invocations that need no hardware.
    Null,
    /// Remote virtual device.
    Remote,
}

impl DeviceKind {
    /// Placeholder devices always go back to the pool when freed.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, DeviceKind::Tcp | DeviceKind::Null)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Physical => "physical",
            DeviceKind::Emulator => "emulator",
            DeviceKind::Tcp => "tcp",
            DeviceKind::Null => "null",
            DeviceKind::Remote => "remote",
        };
        f.write_str(s)
    }
}

/// Connection state as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    NotAvailable,
    Recovery,
    Fastboot,
}

/// How aggressively a device should be recovered when it goes missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    None,
    Online,
    Available,
}

/// Allocation state tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAllocationState {
    Available,
    Allocated,
    Unavailable,
    Ignored,
}

impl fmt::Display for DeviceAllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceAllocationState::Available => "Available",
            DeviceAllocationState::Allocated => "Allocated",
            DeviceAllocationState::Unavailable => "Unavailable",
            DeviceAllocationState::Ignored => "Ignored",
        };
        f.write_str(s)
    }
}

/// End state requested when a device is handed back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeDeviceState {
    Available,
    Unavailable,
    Unresponsive,
    Ignore,
}

/// Descriptive properties reported by a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub product: Option<String>,
    pub variant: Option<String>,
    pub build_id: Option<String>,
    pub sdk_level: Option<u32>,
    pub battery_level: Option<u8>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug)]
struct DeviceStatus {
    state: DeviceState,
    recovery_mode: RecoveryMode,
    responsive: bool,
}

/// A device known to the host.
///
/// Identity and properties are fixed at registration; connection state,
/// recovery mode and responsiveness change while invocations run and are
/// kept behind a small lock of their own.
#[derive(Debug)]
pub struct Device {
    serial: String,
    kind: DeviceKind,
    properties: DeviceProperties,
    status: Mutex<DeviceStatus>,
}

impl Device {
    pub fn new(serial: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            serial: serial.into(),
            kind,
            properties: DeviceProperties::default(),
            status: Mutex::new(DeviceStatus {
                state: DeviceState::Online,
                recovery_mode: RecoveryMode::Available,
                responsive: true,
            }),
        }
    }

    pub fn physical(serial: impl Into<String>) -> Self {
        Self::new(serial, DeviceKind::Physical)
    }

    pub fn emulator(serial: impl Into<String>) -> Self {
        Self::new(serial, DeviceKind::Emulator)
    }

    pub fn tcp(serial: impl Into<String>) -> Self {
        Self::new(serial, DeviceKind::Tcp)
    }

    pub fn null_device(serial: impl Into<String>) -> Self {
        Self::new(serial, DeviceKind::Null)
    }

    #[must_use]
    pub fn with_properties(mut self, properties: DeviceProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn status(&self) -> MutexGuard<'_, DeviceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> DeviceState {
        self.status().state
    }

    pub fn set_state(&self, state: DeviceState) {
        self.status().state = state;
    }

    pub fn recovery_mode(&self) -> RecoveryMode {
        self.status().recovery_mode
    }

    pub fn set_recovery_mode(&self, mode: RecoveryMode) {
        self.status().recovery_mode = mode;
    }

    /// Whether the device still answers shell commands.
    pub fn is_responsive(&self) -> bool {
        self.status().responsive
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.status().responsive = responsive;
    }
}
