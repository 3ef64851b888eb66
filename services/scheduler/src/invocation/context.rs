//! Per-invocation context.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tf_id::InvocationId;

use crate::device::DeviceHandle;

/// Attribute carrying the invocation id.
pub const INVOCATION_ID_ATTRIBUTE: &str = "invocation-id";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("invocation attributes are locked, cannot add '{0}'")]
    AttributesLocked(String),
}

/// Build under test on one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub build_id: String,
    pub build_target: String,
    pub attributes: BTreeMap<String, String>,
}

impl BuildInfo {
    pub fn new(build_id: impl Into<String>, build_target: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            build_target: build_target.into(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Devices, builds and attributes of one invocation.
///
/// Devices keep the order of the configuration's device slots. The scheduler
/// fills the context, locks its attributes and then shares it with the
/// invocation and listeners behind an `Arc`. Devices are not serialized.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InvocationContext {
    #[serde(skip)]
    devices: Vec<(String, DeviceHandle)>,
    build_infos: BTreeMap<String, BuildInfo>,
    attributes: BTreeMap<String, Vec<String>>,
    attributes_locked: bool,
    test_tag: Option<String>,
    #[serde(skip)]
    released_early: AtomicBool,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context tagged with `id` in its attributes.
    pub fn for_invocation(id: InvocationId) -> Self {
        let mut context = Self::new();
        context
            .attributes
            .insert(INVOCATION_ID_ATTRIBUTE.to_string(), vec![id.to_string()]);
        context
    }

    // ===== Devices =====

    /// Add or replace the device for slot `name`.
    pub fn add_allocated_device(&mut self, name: impl Into<String>, device: DeviceHandle) {
        let name = name.into();
        match self.devices.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = device,
            None => self.devices.push((name, device)),
        }
    }

    pub fn device(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices.iter().map(|(_, d)| d)
    }

    pub fn device_names(&self) -> Vec<&str> {
        self.devices.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn serials(&self) -> Vec<String> {
        self.devices().map(|d| d.serial().to_string()).collect()
    }

    /// Slot name of the device with this serial.
    pub fn device_name(&self, serial: &str) -> Option<&str> {
        self.devices
            .iter()
            .find(|(_, d)| d.serial() == serial)
            .map(|(n, _)| n.as_str())
    }

    // ===== Builds =====

    pub fn add_device_build_info(&mut self, name: impl Into<String>, info: BuildInfo) {
        self.build_infos.insert(name.into(), info);
    }

    pub fn build_info(&self, name: &str) -> Option<&BuildInfo> {
        self.build_infos.get(name)
    }

    pub fn build_infos(&self) -> &BTreeMap<String, BuildInfo> {
        &self.build_infos
    }

    /// Slot name the build was attached to.
    pub fn build_info_name(&self, info: &BuildInfo) -> Option<&str> {
        self.build_infos
            .iter()
            .find(|(_, b)| *b == info)
            .map(|(n, _)| n.as_str())
    }

    // ===== Attributes =====

    pub fn add_invocation_attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ContextError> {
        let key = key.into();
        if self.attributes_locked {
            return Err(ContextError::AttributesLocked(key));
        }
        self.attributes.entry(key).or_default().push(value.into());
        Ok(())
    }

    pub fn add_invocation_attributes(
        &mut self,
        attributes: &BTreeMap<String, Vec<String>>,
    ) -> Result<(), ContextError> {
        for (key, values) in attributes {
            for value in values {
                self.add_invocation_attribute(key.clone(), value.clone())?;
            }
        }
        Ok(())
    }

    /// Copy of the attribute multimap.
    pub fn attributes(&self) -> BTreeMap<String, Vec<String>> {
        self.attributes.clone()
    }

    pub fn lock_attributes(&mut self) {
        self.attributes_locked = true;
    }

    pub fn attributes_locked(&self) -> bool {
        self.attributes_locked
    }

    pub fn invocation_id(&self) -> Option<InvocationId> {
        self.attributes
            .get(INVOCATION_ID_ATTRIBUTE)
            .and_then(|values| values.first())
            .and_then(|id| id.parse().ok())
    }

    pub fn set_test_tag(&mut self, tag: impl Into<String>) {
        self.test_tag = Some(tag.into());
    }

    pub fn test_tag(&self) -> Option<&str> {
        self.test_tag.as_deref()
    }

    // ===== Early release =====

    /// Declare that the invocation is done with its devices ahead of
    /// completion. Must be called before releasing them through the listener.
    pub fn mark_released_early(&self) {
        self.released_early.store(true, Ordering::SeqCst);
    }

    pub fn was_released_early(&self) -> bool {
        self.released_early.load(Ordering::SeqCst)
    }
}
