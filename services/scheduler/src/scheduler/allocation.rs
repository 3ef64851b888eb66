//! Matching configurations to devices.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::configuration::{Configuration, DeviceConfig, MAX_SHARD_COUNT};
use crate::device::{DeviceHandle, DeviceManager, FreeDeviceState};

/// Outcome of allocating every device slot of a configuration.
///
/// Allocation is all or nothing: on failure no device is retained and
/// `allocated_devices()` is empty.
#[derive(Debug, Default)]
pub struct DeviceAllocationResult {
    allocated: Vec<(String, DeviceHandle)>,
    device_configs: Vec<DeviceConfig>,
    failures: BTreeMap<String, String>,
}

impl DeviceAllocationResult {
    pub fn was_successful(&self) -> bool {
        self.failures.is_empty() && !self.allocated.is_empty()
    }

    /// Allocated devices keyed by slot name, in slot order.
    pub fn allocated_devices(&self) -> &[(String, DeviceHandle)] {
        &self.allocated
    }

    /// Slots that were allocated, including expanded replicas.
    pub fn device_configs(&self) -> &[DeviceConfig] {
        &self.device_configs
    }

    pub fn add_allocated_device(&mut self, name: impl Into<String>, device: DeviceHandle) {
        self.allocated.push((name.into(), device));
    }

    pub fn add_allocation_failure(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        self.failures.insert(name.into(), reason.into());
    }

    /// One message describing every failed slot.
    pub fn format_failed_allocations(&self) -> String {
        self.failures
            .iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub(crate) fn into_devices(self) -> Vec<(String, DeviceHandle)> {
        self.allocated
    }

    /// Give every allocated device back as available and clear the result.
    pub(crate) fn release(&mut self, manager: &dyn DeviceManager) {
        for (_, device) in self.allocated.drain(..) {
            manager.free(&device, FreeDeviceState::Available);
        }
    }
}

/// Device slots to allocate for `configuration`, produced lazily.
///
/// With `--replicate-parent-setup` each slot is cloned so that every shard
/// gets its own device. The shard count is capped at [`MAX_SHARD_COUNT`].
fn expand_device_configs(
    configuration: &Configuration,
) -> impl Iterator<Item = DeviceConfig> + '_ {
    let options = configuration.command_options();
    let copies = if options.replicate_parent_setup {
        options.shard_count.unwrap_or(1).clamp(1, MAX_SHARD_COUNT)
    } else {
        1
    };

    configuration.device_configs().iter().flat_map(move |config| {
        (0..copies).map(move |replica| match replica {
            0 => config.clone(),
            _ => DeviceConfig::new(
                format!("{}-replica-{replica}", config.name),
                config.selection.clone(),
            ),
        })
    })
}

/// Allocate one device per slot of `configuration`.
pub fn allocate_devices(
    configuration: &Configuration,
    manager: &dyn DeviceManager,
) -> DeviceAllocationResult {
    let mut result = DeviceAllocationResult::default();
    let mut names = BTreeSet::new();

    // stops at the first slot that cannot be filled
    for config in expand_device_configs(configuration) {
        if !names.insert(config.name.clone()) {
            result.add_allocation_failure(config.name, "duplicate device slot name");
            break;
        }
        match manager.allocate(&config.selection) {
            Some(device) => {
                result.add_allocated_device(config.name.clone(), device);
                result.device_configs.push(config);
            }
            None => {
                let reason = format!("no available device matching {}", config.selection);
                result.add_allocation_failure(config.name, reason);
                break;
            }
        }
    }

    if !result.failures.is_empty() {
        debug!(
            config = %configuration.name(),
            failures = %result.format_failed_allocations(),
            "Device allocation failed, returning partial allocation"
        );
        result.release(manager);
    }
    result
}
