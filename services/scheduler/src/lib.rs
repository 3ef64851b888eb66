//! tf-scheduler Command Scheduler Library
//!
//! Queues test commands, matches them to devices from a shared pool and runs
//! each one as an invocation on its own task.
//!
//! ## Architecture
//!
//! ```text
//! CommandScheduler
//! ├── scheduling loop        (allocates devices, dispatches ready commands)
//! ├── command file watcher   (reloads changed command files)
//! └── invocation task(id)    (runs one TestInvocation, frees its devices)
//! ```
//!
//! ## Modules
//!
//! - `device`: Devices, selection filters and the device pool
//! - `configuration`: Command options and configuration factories
//! - `command`: Command trackers, queue entries and command files
//! - `invocation`: Invocation context, listeners and the executor trait
//! - `scheduler`: The scheduler itself

pub mod command;
pub mod config;
pub mod configuration;
pub mod device;
pub mod invocation;
pub mod scheduler;

// Re-export commonly used types
pub use config::{LogFormat, SchedulerConfig};
pub use configuration::{ArgsConfigurationFactory, Configuration, ConfigurationFactory};
pub use device::{Device, DeviceHandle, DeviceManager, DevicePool, DeviceSelection};
pub use invocation::{
    InvocationContext, InvocationError, ScheduledInvocationListener, SimulatedInvocation,
    TestInvocation,
};
pub use scheduler::{CommandScheduler, SchedulerError, SchedulerPhase, SchedulerResult};
pub use tf_id::{CommandId, InvocationId};
