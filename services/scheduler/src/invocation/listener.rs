//! Invocation lifecycle callbacks.

use std::collections::BTreeMap;

use super::context::InvocationContext;
use super::InvocationError;
use crate::device::{DeviceState, FreeDeviceState};

/// End state of each device of an invocation, keyed by serial.
pub type DeviceEndStates = BTreeMap<String, FreeDeviceState>;

/// Callbacks for callers of `exec_command`.
///
/// `release_devices` is also how an invocation hands its devices back
/// early; see [`InvocationContext::mark_released_early`].
pub trait ScheduledInvocationListener: Send + Sync {
    fn invocation_initiated(&self, _context: &InvocationContext) {}

    fn invocation_complete(&self, _context: &InvocationContext, _end_states: &DeviceEndStates) {}

    fn release_devices(&self, _context: &InvocationContext, _end_states: &DeviceEndStates) {}
}

/// Listener that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ScheduledInvocationListener for NoopListener {}

/// Work out how each device of `context` should be returned to the pool.
///
/// A `DeviceNotAvailable` failure marks the named device unavailable, or
/// every device when the serial is not one of the invocation's. Otherwise a
/// device the host lost is unavailable, one that stopped answering is
/// unresponsive, and the rest are available.
pub fn compute_end_states(
    context: &InvocationContext,
    error: Option<&InvocationError>,
) -> DeviceEndStates {
    let lost_serial = match error {
        Some(InvocationError::DeviceNotAvailable { serial, .. }) => Some(serial.as_str()),
        _ => None,
    };
    let lost_is_ours = lost_serial.is_some_and(|s| context.device_name(s).is_some());

    context
        .devices()
        .map(|device| {
            let serial = device.serial();
            let lost = match lost_serial {
                Some(s) if lost_is_ours => s == serial,
                Some(_) => true,
                None => false,
            };
            let state = if lost || device.state() == DeviceState::NotAvailable {
                FreeDeviceState::Unavailable
            } else if !device.is_responsive() {
                FreeDeviceState::Unresponsive
            } else {
                FreeDeviceState::Available
            };
            (serial.to_string(), state)
        })
        .collect()
}
