//! Command configurations.
//!
//! A command's argument vector is turned into a [`Configuration`] by a
//! [`ConfigurationFactory`]. The scheduler only needs a small slice of a
//! full configuration: the command options that drive scheduling, and one
//! [`DeviceConfig`] per device the invocation needs.

use std::collections::BTreeMap;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{DeviceKind, DeviceSelection};

/// Name given to the device slot of single-device configurations.
pub const DEFAULT_DEVICE_NAME: &str = "device";

/// Upper bound for `--shard-count`.
pub const MAX_SHARD_COUNT: u32 = 256;

/// Errors creating or validating a configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no configuration name provided")]
    Empty,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Options controlling how a command is scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOptions {
    pub help_mode: bool,
    pub full_help_mode: bool,
    pub dry_run: bool,
    /// Dry run that also prints the resolved configuration.
    pub noisy_dry_run: bool,
    pub loop_mode: bool,
    pub min_loop_time: Duration,
    pub shard_count: Option<u32>,
    pub replicate_parent_setup: bool,
    pub invocation_data: BTreeMap<String, Vec<String>>,
    pub test_tag: Option<String>,
}

impl CommandOptions {
    pub fn is_help_mode(&self) -> bool {
        self.help_mode || self.full_help_mode
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run || self.noisy_dry_run
    }
}

/// Requirements for one named device slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub selection: DeviceSelection,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, selection: DeviceSelection) -> Self {
        Self {
            name: name.into(),
            selection,
        }
    }
}

/// Descriptor metadata attached to a configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// Sandboxed invocations do not receive invocation data as attributes.
    pub sandboxed: bool,
}

/// A resolved command configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    name: String,
    command_line: Vec<String>,
    command_options: CommandOptions,
    device_configs: Vec<DeviceConfig>,
    descriptor: ConfigurationDescriptor,
}

impl Configuration {
    /// Single-device configuration with no requirements.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            command_line: vec![name.clone()],
            name,
            command_options: CommandOptions::default(),
            device_configs: vec![DeviceConfig::new(
                DEFAULT_DEVICE_NAME,
                DeviceSelection::any(),
            )],
            descriptor: ConfigurationDescriptor::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command_line(&self) -> String {
        self.command_line.join(" ")
    }

    pub fn command_options(&self) -> &CommandOptions {
        &self.command_options
    }

    pub fn command_options_mut(&mut self) -> &mut CommandOptions {
        &mut self.command_options
    }

    pub fn device_configs(&self) -> &[DeviceConfig] {
        &self.device_configs
    }

    pub fn set_device_configs(&mut self, configs: Vec<DeviceConfig>) {
        self.device_configs = configs;
    }

    /// Requirements of the first device slot.
    pub fn device_requirements(&self) -> Option<&DeviceSelection> {
        self.device_configs.first().map(|c| &c.selection)
    }

    pub fn is_multi_device(&self) -> bool {
        self.device_configs.len() > 1
    }

    pub fn descriptor(&self) -> &ConfigurationDescriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut ConfigurationDescriptor {
        &mut self.descriptor
    }

    /// Check option combinations that parse fine but cannot be scheduled.
    pub fn validate_options(&self) -> Result<(), ConfigurationError> {
        let options = &self.command_options;
        if options.replicate_parent_setup && options.shard_count.unwrap_or(0) < 2 {
            return Err(ConfigurationError::Invalid(
                "--replicate-parent-setup requires --shard-count greater than 1".into(),
            ));
        }
        if options.shard_count.is_some_and(|shards| shards > MAX_SHARD_COUNT) {
            return Err(ConfigurationError::Invalid(format!(
                "--shard-count cannot exceed {MAX_SHARD_COUNT}"
            )));
        }
        if self.device_configs.is_empty() {
            return Err(ConfigurationError::Invalid(
                "configuration requires at least one device".into(),
            ));
        }

        let mut names = std::collections::BTreeSet::new();
        for config in &self.device_configs {
            if !names.insert(config.name.as_str()) {
                return Err(ConfigurationError::Invalid(format!(
                    "duplicate device name '{}'",
                    config.name
                )));
            }
            let selection = &config.selection;
            if let (Some(min), Some(max)) = (selection.min_battery, selection.max_battery) {
                if min > max {
                    return Err(ConfigurationError::Invalid(format!(
                        "min battery {min} is greater than max battery {max}"
                    )));
                }
            }
            if let (Some(min), Some(max)) = (selection.min_sdk_level, selection.max_sdk_level) {
                if min > max {
                    return Err(ConfigurationError::Invalid(format!(
                        "min sdk level {min} is greater than max sdk level {max}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builds configurations from command argument vectors.
pub trait ConfigurationFactory: Send + Sync {
    fn create_configuration_from_args(
        &self,
        args: &[String],
    ) -> Result<Configuration, ConfigurationError>;

    /// Usage text for the configuration named by `args`.
    fn print_help_for_config(&self, args: &[String]) -> String;
}

/// Default factory: `CONFIG_NAME [options]`, options parsed with clap.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgsConfigurationFactory;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceSpec {
    name: String,
    serial: Option<String>,
}

fn parse_device_spec(s: &str) -> Result<DeviceSpec, String> {
    let (name, serial) = match s.split_once(':') {
        Some((name, serial)) => (name, Some(serial.to_string())),
        None => (s, None),
    };
    if name.is_empty() {
        return Err("device name cannot be empty".into());
    }
    Ok(DeviceSpec {
        name: name.to_string(),
        serial,
    })
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

#[derive(Debug, Parser)]
#[command(
    name = "command",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct CommandArgs {
    /// Configuration to run.
    config_name: String,

    /// Run only on the device with this serial (repeatable).
    #[arg(long = "serial", short = 's')]
    serials: Vec<String>,

    /// Never run on the device with this serial (repeatable).
    #[arg(long = "exclude-serial")]
    exclude_serials: Vec<String>,

    /// Run on a device of this product, or product:variant.
    #[arg(long = "product-type")]
    product_types: Vec<String>,

    /// Require a device property KEY=VALUE.
    #[arg(long = "property", value_parser = parse_key_value)]
    properties: Vec<(String, String)>,

    #[arg(long)]
    min_battery: Option<u8>,

    #[arg(long)]
    max_battery: Option<u8>,

    #[arg(long)]
    require_battery_check: bool,

    #[arg(long)]
    min_sdk_level: Option<u32>,

    #[arg(long)]
    max_sdk_level: Option<u32>,

    /// Run on a stub device that needs no hardware.
    #[arg(long)]
    null_device: bool,

    #[arg(long)]
    tcp_device: bool,

    #[arg(long)]
    gce_device: bool,

    #[arg(long, short = 'e')]
    emulator: bool,

    #[arg(long = "physical-device", short = 'd')]
    physical_device: bool,

    /// Named device slot NAME[:SERIAL] (repeatable, multi-device).
    #[arg(long = "device", value_parser = parse_device_spec)]
    devices: Vec<DeviceSpec>,

    #[arg(long)]
    shard_count: Option<u32>,

    #[arg(long)]
    replicate_parent_setup: bool,

    /// Re-run the command forever.
    #[arg(long = "loop")]
    loop_mode: bool,

    /// Minimum time between loop iterations, in milliseconds.
    #[arg(long)]
    min_loop_time: Option<u64>,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    noisy_dry_run: bool,

    #[arg(long, short = 'h')]
    help: bool,

    #[arg(long)]
    help_all: bool,

    /// Invocation attribute KEY VALUE (repeatable).
    #[arg(long = "invocation-data", num_args = 2, value_names = ["KEY", "VALUE"])]
    invocation_data: Vec<String>,

    #[arg(long)]
    test_tag: Option<String>,

    #[arg(long)]
    sandboxed: bool,
}

impl CommandArgs {
    fn device_type(&self) -> Result<Option<DeviceKind>, ConfigurationError> {
        let requested: Vec<DeviceKind> = [
            (self.null_device, DeviceKind::Null),
            (self.tcp_device, DeviceKind::Tcp),
            (self.gce_device, DeviceKind::Remote),
            (self.emulator, DeviceKind::Emulator),
            (self.physical_device, DeviceKind::Physical),
        ]
        .into_iter()
        .filter_map(|(set, kind)| set.then_some(kind))
        .collect();

        match requested.as_slice() {
            [] => Ok(None),
            [kind] => Ok(Some(*kind)),
            _ => Err(ConfigurationError::InvalidArguments(
                "only one device type flag may be given".into(),
            )),
        }
    }

    fn selection(&self) -> Result<DeviceSelection, ConfigurationError> {
        Ok(DeviceSelection {
            serials: self.serials.clone(),
            exclude_serials: self.exclude_serials.clone(),
            product_types: self.product_types.clone(),
            properties: self.properties.iter().cloned().collect(),
            min_battery: self.min_battery,
            max_battery: self.max_battery,
            require_battery_check: self.require_battery_check,
            min_sdk_level: self.min_sdk_level,
            max_sdk_level: self.max_sdk_level,
            device_type: self.device_type()?,
        })
    }

    fn into_configuration(self, args: &[String]) -> Result<Configuration, ConfigurationError> {
        let base = self.selection()?;
        let device_configs = if self.devices.is_empty() {
            vec![DeviceConfig::new(DEFAULT_DEVICE_NAME, base)]
        } else {
            self.devices
                .iter()
                .map(|spec| {
                    let mut selection = base.clone();
                    if let Some(serial) = &spec.serial {
                        selection.serials = vec![serial.clone()];
                    }
                    DeviceConfig::new(spec.name.clone(), selection)
                })
                .collect()
        };

        let mut invocation_data: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pair in self.invocation_data.chunks(2) {
            if let [key, value] = pair {
                invocation_data
                    .entry(key.clone())
                    .or_default()
                    .push(value.clone());
            }
        }

        Ok(Configuration {
            name: self.config_name,
            command_line: args.to_vec(),
            command_options: CommandOptions {
                help_mode: self.help,
                full_help_mode: self.help_all,
                dry_run: self.dry_run,
                noisy_dry_run: self.noisy_dry_run,
                loop_mode: self.loop_mode,
                min_loop_time: Duration::from_millis(self.min_loop_time.unwrap_or(0)),
                shard_count: self.shard_count,
                replicate_parent_setup: self.replicate_parent_setup,
                invocation_data,
                test_tag: self.test_tag,
            },
            device_configs,
            descriptor: ConfigurationDescriptor {
                sandboxed: self.sandboxed,
            },
        })
    }
}

impl ConfigurationFactory for ArgsConfigurationFactory {
    fn create_configuration_from_args(
        &self,
        args: &[String],
    ) -> Result<Configuration, ConfigurationError> {
        if args.is_empty() {
            return Err(ConfigurationError::Empty);
        }
        let parsed = CommandArgs::try_parse_from(args)
            .map_err(|e| ConfigurationError::InvalidArguments(e.to_string()))?;
        parsed.into_configuration(args)
    }

    fn print_help_for_config(&self, args: &[String]) -> String {
        let name = args.first().map(String::as_str).unwrap_or("command");
        CommandArgs::command()
            .bin_name(name.to_string())
            .render_help()
            .to_string()
    }
}
