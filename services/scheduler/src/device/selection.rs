//! Device requirement filters.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Device, DeviceKind};

/// Requirements a device must meet to be allocated for a command.
///
/// An empty selection matches any physical device or emulator. Stub, TCP
/// and remote devices only match when `device_type` asks for them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    pub serials: Vec<String>,
    pub exclude_serials: Vec<String>,
    /// `product` or `product:variant` entries; any one must match.
    pub product_types: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub min_battery: Option<u8>,
    pub max_battery: Option<u8>,
    /// Reject devices that do not report a battery level when a battery
    /// bound is set.
    pub require_battery_check: bool,
    pub min_sdk_level: Option<u32>,
    pub max_sdk_level: Option<u32>,
    pub device_type: Option<DeviceKind>,
}

impl DeviceSelection {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn serial(serial: impl Into<String>) -> Self {
        Self {
            serials: vec![serial.into()],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serials.push(serial.into());
        self
    }

    #[must_use]
    pub fn with_excluded_serial(mut self, serial: impl Into<String>) -> Self {
        self.exclude_serials.push(serial.into());
        self
    }

    #[must_use]
    pub fn with_device_type(mut self, kind: DeviceKind) -> Self {
        self.device_type = Some(kind);
        self
    }

    /// Returns true if `device` satisfies every requirement.
    pub fn matches(&self, device: &Device) -> bool {
        let serial = device.serial();
        if !self.serials.is_empty() && !self.serials.iter().any(|s| s == serial) {
            return false;
        }
        if self.exclude_serials.iter().any(|s| s == serial) {
            return false;
        }
        self.matches_kind(device.kind())
            && self.matches_product(device)
            && self.matches_properties(device)
            && self.matches_battery(device)
            && self.matches_sdk(device)
    }

    fn matches_kind(&self, kind: DeviceKind) -> bool {
        match self.device_type {
            Some(requested) => requested == kind,
            None => matches!(kind, DeviceKind::Physical | DeviceKind::Emulator),
        }
    }

    fn matches_product(&self, device: &Device) -> bool {
        if self.product_types.is_empty() {
            return true;
        }
        let props = device.properties();
        let Some(product) = props.product.as_deref() else {
            return false;
        };
        self.product_types
            .iter()
            .any(|wanted| match wanted.split_once(':') {
                Some((p, v)) => p == product && props.variant.as_deref() == Some(v),
                None => wanted == product,
            })
    }

    fn matches_properties(&self, device: &Device) -> bool {
        let extra = &device.properties().extra;
        self.properties
            .iter()
            .all(|(key, value)| extra.get(key) == Some(value))
    }

    fn matches_battery(&self, device: &Device) -> bool {
        if self.min_battery.is_none() && self.max_battery.is_none() {
            return true;
        }
        match device.properties().battery_level {
            Some(level) => {
                self.min_battery.map_or(true, |min| level >= min)
                    && self.max_battery.map_or(true, |max| level <= max)
            }
            None => !self.require_battery_check,
        }
    }

    fn matches_sdk(&self, device: &Device) -> bool {
        if self.min_sdk_level.is_none() && self.max_sdk_level.is_none() {
            return true;
        }
        let Some(level) = device.properties().sdk_level else {
            return false;
        };
        self.min_sdk_level.map_or(true, |min| level >= min)
            && self.max_sdk_level.map_or(true, |max| level <= max)
    }
}

impl fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.serials.is_empty() {
            parts.push(format!("serial in {:?}", self.serials));
        }
        if !self.exclude_serials.is_empty() {
            parts.push(format!("serial not in {:?}", self.exclude_serials));
        }
        if !self.product_types.is_empty() {
            parts.push(format!("product in {:?}", self.product_types));
        }
        for (key, value) in &self.properties {
            parts.push(format!("{key}={value}"));
        }
        if let Some(min) = self.min_battery {
            parts.push(format!("battery >= {min}"));
        }
        if let Some(max) = self.max_battery {
            parts.push(format!("battery <= {max}"));
        }
        if let Some(min) = self.min_sdk_level {
            parts.push(format!("sdk >= {min}"));
        }
        if let Some(max) = self.max_sdk_level {
            parts.push(format!("sdk <= {max}"));
        }
        if let Some(kind) = self.device_type {
            parts.push(format!("type {kind}"));
        }
        if parts.is_empty() {
            f.write_str("any device")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProperties;
    use rstest::rstest;

    fn device_with(properties: DeviceProperties) -> Device {
        Device::physical("serial0").with_properties(properties)
    }

    #[test]
    fn test_empty_selection_matches_physical_and_emulator() {
        let selection = DeviceSelection::any();
        assert!(selection.matches(&Device::physical("serial0")));
        assert!(selection.matches(&Device::emulator("emulator-5554")));
    }

    #[rstest]
    #[case::null(Device::null_device("null-device-0"))]
    #[case::tcp(Device::tcp("127.0.0.1:5555"))]
    #[case::remote(Device::new("gce-device-0", DeviceKind::Remote))]
    fn test_empty_selection_skips_special_devices(#[case] device: Device) {
        assert!(!DeviceSelection::any().matches(&device));
    }

    #[rstest]
    #[case(DeviceKind::Null, "null-device-0")]
    #[case(DeviceKind::Tcp, "127.0.0.1:5555")]
    #[case(DeviceKind::Remote, "gce-device-0")]
    #[case(DeviceKind::Emulator, "emulator-5554")]
    fn test_device_type_requested(#[case] kind: DeviceKind, #[case] serial: &str) {
        let selection = DeviceSelection::any().with_device_type(kind);
        assert!(selection.matches(&Device::new(serial, kind)));
        assert!(!selection.matches(&Device::physical("serial0")));
    }

    #[test]
    fn test_serial_filters() {
        let selection = DeviceSelection::serial("serial1");
        assert!(selection.matches(&Device::physical("serial1")));
        assert!(!selection.matches(&Device::physical("serial0")));

        let excluded = DeviceSelection::any().with_excluded_serial("serial0");
        assert!(!excluded.matches(&Device::physical("serial0")));
        assert!(excluded.matches(&Device::physical("serial1")));
    }

    #[test]
    fn test_product_type_and_variant() {
        let device = device_with(DeviceProperties {
            product: Some("sailfish".into()),
            variant: Some("userdebug".into()),
            ..Default::default()
        });

        let mut selection = DeviceSelection::any();
        selection.product_types = vec!["sailfish".into()];
        assert!(selection.matches(&device));

        selection.product_types = vec!["sailfish:userdebug".into()];
        assert!(selection.matches(&device));

        selection.product_types = vec!["sailfish:user".into(), "marlin".into()];
        assert!(!selection.matches(&device));

        assert!(!selection.matches(&Device::physical("serial1")));
    }

    #[test]
    fn test_properties_must_all_match() {
        let mut extra = BTreeMap::new();
        extra.insert("ro.hardware".to_string(), "walleye".to_string());
        extra.insert("ro.debuggable".to_string(), "1".to_string());
        let device = device_with(DeviceProperties {
            extra,
            ..Default::default()
        });

        let mut selection = DeviceSelection::any();
        selection
            .properties
            .insert("ro.hardware".into(), "walleye".into());
        assert!(selection.matches(&device));

        selection.properties.insert("ro.debuggable".into(), "0".into());
        assert!(!selection.matches(&device));
    }

    #[rstest]
    #[case(Some(50), Some(20), None, true)]
    #[case(Some(10), Some(20), None, false)]
    #[case(Some(90), None, Some(80), false)]
    #[case(Some(80), Some(20), Some(80), true)]
    fn test_battery_bounds(
        #[case] level: Option<u8>,
        #[case] min: Option<u8>,
        #[case] max: Option<u8>,
        #[case] expected: bool,
    ) {
        let device = device_with(DeviceProperties {
            battery_level: level,
            ..Default::default()
        });
        let selection = DeviceSelection {
            min_battery: min,
            max_battery: max,
            ..Default::default()
        };
        assert_eq!(selection.matches(&device), expected);
    }

    #[test]
    fn test_unknown_battery_requires_check_flag() {
        let device = Device::physical("serial0");
        let mut selection = DeviceSelection {
            min_battery: Some(20),
            ..Default::default()
        };
        assert!(selection.matches(&device));

        selection.require_battery_check = true;
        assert!(!selection.matches(&device));
    }

    #[test]
    fn test_sdk_bounds() {
        let device = device_with(DeviceProperties {
            sdk_level: Some(30),
            ..Default::default()
        });
        let mut selection = DeviceSelection {
            min_sdk_level: Some(28),
            max_sdk_level: Some(31),
            ..Default::default()
        };
        assert!(selection.matches(&device));

        selection.min_sdk_level = Some(31);
        assert!(!selection.matches(&device));

        // unknown sdk never satisfies a bound
        assert!(!selection.matches(&Device::physical("serial1")));
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceSelection::any().to_string(), "any device");
        let selection = DeviceSelection::serial("serial0").with_excluded_serial("serial1");
        assert_eq!(
            selection.to_string(),
            "serial in [\"serial0\"], serial not in [\"serial1\"]"
        );
    }
}
