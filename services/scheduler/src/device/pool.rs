//! Device pool.
//!
//! The pool owns the allocation state of every known device:
//! - Available devices wait in a FIFO queue
//! - Allocation pops the first queued device matching a selection
//! - Freeing applies the end-state rules below and may requeue the device
//!
//! End-state rules on free:
//! - Placeholder devices (TCP, stub) always return to the queue
//! - Devices the host reports as `NotAvailable` never return
//! - `Available` requeues and resets recovery mode
//! - `Unavailable` / `Unresponsive` park the device; if it has also been
//!   disconnected from the host it is dropped from tracking
//! - `Ignore` parks the device as ignored
//!
//! A single mutex guards all of this, so concurrent allocations never hand
//! out the same device twice.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    Device, DeviceAllocationState, DeviceError, DeviceHandle, DeviceKind, DeviceSelection,
    DeviceState, FreeDeviceState, RecoveryMode,
};

/// Pool provider consumed by the scheduler.
pub trait DeviceManager: Send + Sync {
    /// Allocate the first available device matching `selection`.
    fn allocate(&self, selection: &DeviceSelection) -> Option<DeviceHandle>;

    /// Allocate the available device with this serial.
    fn allocate_serial(&self, serial: &str) -> Result<DeviceHandle, DeviceError>;

    /// Allocate a known device even if it is not in the available queue.
    ///
    /// Returns `None` for unknown serials and devices already allocated.
    fn force_allocate(&self, serial: &str) -> Option<DeviceHandle>;

    /// Return an allocated device to the pool.
    fn free(&self, device: &DeviceHandle, state: FreeDeviceState);

    /// Devices currently waiting in the available queue, in queue order.
    fn list_available(&self) -> Vec<DeviceDescriptor>;

    /// Every tracked device, allocated first and then by serial.
    fn list_all(&self) -> Vec<DeviceDescriptor>;

    fn available_count(&self) -> usize {
        self.list_available().len()
    }
}

/// Point-in-time view of a tracked device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub serial: String,
    pub kind: DeviceKind,
    pub allocation_state: DeviceAllocationState,
    pub state: DeviceState,
    pub product: String,
    pub variant: String,
    pub build_id: String,
    pub battery_level: Option<u8>,
}

impl DeviceDescriptor {
    fn from_entry(entry: &PoolEntry) -> Self {
        let device = &entry.device;
        let props = device.properties();
        let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "unknown".to_string());
        Self {
            serial: device.serial().to_string(),
            kind: device.kind(),
            allocation_state: entry.allocation,
            state: device.state(),
            product: or_unknown(&props.product),
            variant: or_unknown(&props.variant),
            build_id: or_unknown(&props.build_id),
            battery_level: props.battery_level,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {}:{} {}]",
            self.serial, self.product, self.variant, self.build_id
        )
    }
}

#[derive(Debug)]
struct PoolEntry {
    device: DeviceHandle,
    allocation: DeviceAllocationState,
    connected: bool,
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: BTreeMap<String, PoolEntry>,
    available: VecDeque<String>,
}

impl PoolInner {
    fn allocation_of(&self, serial: &str) -> Option<DeviceAllocationState> {
        self.entries.get(serial).map(|e| e.allocation)
    }

    fn mark_allocated(&mut self, serial: &str) -> Option<DeviceHandle> {
        let entry = self.entries.get_mut(serial)?;
        entry.allocation = DeviceAllocationState::Allocated;
        let handle = Arc::clone(&entry.device);
        self.available.retain(|s| s != serial);
        debug!(serial = %serial, "Device allocated");
        Some(handle)
    }
}

/// In-process device pool.
#[derive(Debug, Default)]
pub struct DevicePool {
    global_filter: Option<DeviceSelection>,
    inner: Mutex<PoolInner>,
}

impl DevicePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that ignores every device not matching `filter`.
    pub fn with_global_filter(filter: DeviceSelection) -> Self {
        Self {
            global_filter: Some(filter),
            inner: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a device.
    ///
    /// Devices rejected by the global filter are tracked as `Ignored`.
    pub fn register(&self, device: Device) -> Result<DeviceHandle, DeviceError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.entries.contains_key(device.serial()) {
            return Err(DeviceError::Duplicate(device.serial().to_string()));
        }

        let allocation = match &self.global_filter {
            Some(filter) if !filter.matches(&device) => DeviceAllocationState::Ignored,
            _ => DeviceAllocationState::Available,
        };
        let serial = device.serial().to_string();
        let handle = Arc::new(device);
        info!(serial = %serial, kind = %handle.kind(), state = %allocation, "Device registered");

        if allocation == DeviceAllocationState::Available {
            inner.available.push_back(serial.clone());
        }
        inner.entries.insert(
            serial,
            PoolEntry {
                device: Arc::clone(&handle),
                allocation,
                connected: true,
            },
        );
        Ok(handle)
    }

    /// The host lost the device.
    ///
    /// An idle device is dropped at once. An allocated device is dropped when
    /// its invocation frees it.
    pub fn disconnect(&self, serial: &str) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(serial) else {
            return;
        };
        entry.connected = false;
        entry.device.set_state(DeviceState::NotAvailable);
        if entry.allocation == DeviceAllocationState::Allocated {
            info!(serial = %serial, "Allocated device disconnected");
            return;
        }
        inner.entries.remove(serial);
        inner.available.retain(|s| s != serial);
        info!(serial = %serial, "Device disconnected and removed");
    }

    /// Allocation state of a tracked device.
    pub fn allocation_state(&self, serial: &str) -> Option<DeviceAllocationState> {
        self.lock().allocation_of(serial)
    }
}

impl DeviceManager for DevicePool {
    fn allocate(&self, selection: &DeviceSelection) -> Option<DeviceHandle> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let serial = inner
            .available
            .iter()
            .find(|serial| {
                inner
                    .entries
                    .get(serial.as_str())
                    .is_some_and(|e| selection.matches(&e.device))
            })
            .cloned()?;
        inner.mark_allocated(&serial)
    }

    fn allocate_serial(&self, serial: &str) -> Result<DeviceHandle, DeviceError> {
        let mut inner = self.lock();
        let no_device = |reason: String| DeviceError::NoDevice {
            serial: serial.to_string(),
            reason,
        };
        match inner.allocation_of(serial) {
            Some(DeviceAllocationState::Available) => inner
                .mark_allocated(serial)
                .ok_or_else(|| no_device("unknown device".to_string())),
            Some(other) => Err(no_device(format!("device is {other}"))),
            None => Err(no_device("unknown device".to_string())),
        }
    }

    fn force_allocate(&self, serial: &str) -> Option<DeviceHandle> {
        let mut inner = self.lock();
        match inner.allocation_of(serial) {
            None => {
                warn!(serial = %serial, "Cannot force allocate unknown device");
                None
            }
            Some(DeviceAllocationState::Allocated) => {
                warn!(serial = %serial, "Cannot force allocate device, already allocated");
                None
            }
            Some(_) => inner.mark_allocated(serial),
        }
    }

    fn free(&self, device: &DeviceHandle, state: FreeDeviceState) {
        let serial = device.serial();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(serial) else {
            warn!(serial = %serial, "Free called for unknown device");
            return;
        };
        if entry.allocation != DeviceAllocationState::Allocated {
            warn!(
                serial = %serial,
                state = %entry.allocation,
                "Free called for device that is not allocated, ignoring"
            );
            return;
        }

        let target = if device.kind().is_placeholder() {
            DeviceAllocationState::Available
        } else if device.state() == DeviceState::NotAvailable {
            DeviceAllocationState::Unavailable
        } else {
            match state {
                FreeDeviceState::Available => DeviceAllocationState::Available,
                FreeDeviceState::Unavailable | FreeDeviceState::Unresponsive => {
                    DeviceAllocationState::Unavailable
                }
                FreeDeviceState::Ignore => DeviceAllocationState::Ignored,
            }
        };

        debug!(serial = %serial, requested = ?state, result = %target, "Freeing device");
        match target {
            DeviceAllocationState::Available => {
                device.set_recovery_mode(RecoveryMode::Available);
                entry.allocation = target;
                inner.available.push_back(serial.to_string());
            }
            DeviceAllocationState::Unavailable if !entry.connected => {
                inner.entries.remove(serial);
                info!(serial = %serial, "Freed disconnected device, no longer tracked");
            }
            _ => entry.allocation = target,
        }
    }

    fn list_available(&self) -> Vec<DeviceDescriptor> {
        let inner = self.lock();
        inner
            .available
            .iter()
            .filter_map(|serial| inner.entries.get(serial))
            .map(DeviceDescriptor::from_entry)
            .collect()
    }

    fn list_all(&self) -> Vec<DeviceDescriptor> {
        let mut devices: Vec<_> = self
            .lock()
            .entries
            .values()
            .map(DeviceDescriptor::from_entry)
            .collect();
        sort_device_list(&mut devices);
        devices
    }

    fn available_count(&self) -> usize {
        self.lock().available.len()
    }
}

/// Allocated devices first, then by serial.
pub fn sort_device_list(devices: &mut [DeviceDescriptor]) {
    devices.sort_by(|a, b| {
        let a_idle = a.allocation_state != DeviceAllocationState::Allocated;
        let b_idle = b.allocation_state != DeviceAllocationState::Allocated;
        a_idle.cmp(&b_idle).then_with(|| a.serial.cmp(&b.serial))
    });
}
