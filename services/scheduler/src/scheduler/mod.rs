//! Command scheduler.
//!
//! Commands are queued until the device pool can satisfy their device
//! requirements, then handed to the [`TestInvocation`] on their own task.
//!
//! - `worker`: the scheduling loop
//! - `runner`: invocation tasks, device release and retirement
//! - `allocation`: matching a configuration to devices
//! - `display`: read-only introspection
//! - `watcher`: command file reload
//!
//! Lifecycle: `Created → Running → ShuttingDownOnEmpty | ShuttingDown →
//! Terminated`, published on a `watch` channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tf_id::{CommandId, InvocationId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::command::{
    CommandFileError, CommandFileParser, CommandTracker, ExecutableCommand, TextCommandFileParser,
};
use crate::config::SchedulerConfig;
use crate::configuration::{
    ArgsConfigurationFactory, Configuration, ConfigurationError, ConfigurationFactory,
};
use crate::device::{DeviceHandle, DeviceManager};
use crate::invocation::{InvocationError, ScheduledInvocationListener, TestInvocation};

pub mod allocation;
pub mod display;
mod queue;
mod runner;
mod watcher;
mod worker;

pub use allocation::{allocate_devices, DeviceAllocationResult};
pub use display::InvocationInfo;

use queue::CommandQueue;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by the command scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no device available: {0}")]
    NoDevice(String),

    #[error("Attempting invocation on device {serial} when one is already running")]
    DeviceBusy { serial: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    CommandFile(#[from] CommandFileError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("invalid command filter: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler must be started from within a tokio runtime")]
    NoRuntime,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle phase of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Created,
    Running,
    /// Keep scheduling until nothing is queued or running.
    ShuttingDownOnEmpty,
    /// No new dispatch; waiting for running invocations.
    ShuttingDown,
    Terminated,
}

impl SchedulerPhase {
    /// Commands are no longer accepted.
    pub fn is_stopping(&self) -> bool {
        matches!(self, SchedulerPhase::ShuttingDown | SchedulerPhase::Terminated)
    }
}

/// Wake-ups for the scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerEvent {
    CommandAdded,
    DevicesReleased,
    InvocationFinished(InvocationId),
}

#[derive(Debug, Clone)]
struct WatchedFile {
    extra_args: Vec<String>,
    modified: Option<SystemTime>,
}

struct Shared {
    config: SchedulerConfig,
    device_manager: Arc<dyn DeviceManager>,
    configuration_factory: Arc<dyn ConfigurationFactory>,
    invocation: Arc<dyn TestInvocation>,
    command_file_parser: Arc<dyn CommandFileParser>,
    queue: Mutex<CommandQueue>,
    phase_tx: watch::Sender<SchedulerPhase>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    /// Taken by the loop on start.
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SchedulerEvent>>>,
    stop_tx: watch::Sender<bool>,
    last_invocation_error: Mutex<Option<Arc<SchedulerError>>>,
    command_file_reload: AtomicBool,
    watched_files: Mutex<BTreeMap<PathBuf, WatchedFile>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`CommandScheduler`] from its collaborators.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    device_manager: Arc<dyn DeviceManager>,
    invocation: Arc<dyn TestInvocation>,
    configuration_factory: Arc<dyn ConfigurationFactory>,
    command_file_parser: Arc<dyn CommandFileParser>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn configuration_factory(mut self, factory: Arc<dyn ConfigurationFactory>) -> Self {
        self.configuration_factory = factory;
        self
    }

    pub fn command_file_parser(mut self, parser: Arc<dyn CommandFileParser>) -> Self {
        self.command_file_parser = parser;
        self
    }

    pub fn build(self) -> CommandScheduler {
        let (phase_tx, _) = watch::channel(SchedulerPhase::Created);
        let (stop_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        CommandScheduler {
            shared: Arc::new(Shared {
                config: self.config,
                device_manager: self.device_manager,
                configuration_factory: self.configuration_factory,
                invocation: self.invocation,
                command_file_parser: self.command_file_parser,
                queue: Mutex::default(),
                phase_tx,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                stop_tx,
                last_invocation_error: Mutex::new(None),
                command_file_reload: AtomicBool::new(false),
                watched_files: Mutex::default(),
            }),
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Schedules commands onto devices and runs their invocations.
///
/// Cloning gives another handle to the same scheduler.
#[derive(Clone)]
pub struct CommandScheduler {
    shared: Arc<Shared>,
}

impl CommandScheduler {
    pub fn builder(
        device_manager: Arc<dyn DeviceManager>,
        invocation: Arc<dyn TestInvocation>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            device_manager,
            invocation,
            configuration_factory: Arc::new(ArgsConfigurationFactory),
            command_file_parser: Arc::new(TextCommandFileParser),
        }
    }

    pub fn new(
        config: SchedulerConfig,
        device_manager: Arc<dyn DeviceManager>,
        invocation: Arc<dyn TestInvocation>,
    ) -> Self {
        Self::builder(device_manager, invocation)
            .config(config)
            .build()
    }

    fn lock_queue(&self) -> MutexGuard<'_, CommandQueue> {
        lock(&self.shared.queue)
    }

    fn notify(&self, event: SchedulerEvent) {
        if self.shared.events_tx.send(event).is_err() {
            debug!(?event, "Scheduler loop not running, event dropped");
        }
    }

    fn set_last_invocation_error(&self, error: SchedulerError) {
        *lock(&self.shared.last_invocation_error) = Some(Arc::new(error));
    }

    fn ensure_accepting(&self) -> SchedulerResult<()> {
        if self.phase().is_stopping() {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(())
    }

    // ===== Lifecycle =====

    /// Spawn the scheduling loop on the current tokio runtime.
    pub fn start(&self) -> SchedulerResult<()> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let events = lock(&self.shared.events_rx)
            .take()
            .ok_or(SchedulerError::AlreadyStarted)?;

        self.shared.phase_tx.send_if_modified(|phase| {
            if *phase == SchedulerPhase::Created {
                *phase = SchedulerPhase::Running;
                true
            } else {
                false
            }
        });

        runtime.spawn(worker::run(self.clone(), events));
        runtime.spawn(watcher::watch_command_files(self.clone()));
        Ok(())
    }

    fn is_started(&self) -> bool {
        lock(&self.shared.events_rx).is_none()
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.shared.phase_tx.borrow()
    }

    /// Stop dispatching. Running invocations are left to finish.
    pub fn shutdown(&self) {
        let changed = self.shared.phase_tx.send_if_modified(|phase| match phase {
            SchedulerPhase::Created
            | SchedulerPhase::Running
            | SchedulerPhase::ShuttingDownOnEmpty => {
                *phase = SchedulerPhase::ShuttingDown;
                true
            }
            _ => false,
        });
        if changed {
            info!("Command scheduler shutting down");
        }
    }

    /// Keep scheduling until no command is queued or running, then stop.
    pub fn shutdown_on_empty(&self) {
        let changed = self.shared.phase_tx.send_if_modified(|phase| match phase {
            SchedulerPhase::Created | SchedulerPhase::Running => {
                *phase = SchedulerPhase::ShuttingDownOnEmpty;
                true
            }
            _ => false,
        });
        if changed {
            info!("Command scheduler will shut down once empty");
        }
    }

    /// Shut down and ask every running invocation to stop.
    pub fn shutdown_hard(&self) {
        self.shutdown();
        self.shared.stop_tx.send_replace(true);

        let running = self.lock_queue().running().count();
        warn!(running, "Hard shutdown, stopping running invocations");
        for _ in 0..running {
            self.shared
                .invocation
                .notify_invocation_stopped("command scheduler hard shutdown");
        }
    }

    /// Wait for the scheduling loop to terminate.
    ///
    /// Returns at once if the scheduler was never started.
    pub async fn join(&self) {
        if !self.is_started() {
            return;
        }
        let mut phase_rx = self.shared.phase_tx.subscribe();
        // the sender lives in `shared`, so this only fails if we are dropped
        let _ = phase_rx
            .wait_for(|phase| *phase == SchedulerPhase::Terminated)
            .await;
    }

    /// Like [`join`](Self::join), but gives up after `timeout`.
    ///
    /// Returns `false` if the loop is still running.
    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.join()).await.is_ok()
    }

    /// Most recent invocation failure, including device conflicts hit by
    /// the loop.
    pub fn last_invocation_error(&self) -> Option<Arc<SchedulerError>> {
        lock(&self.shared.last_invocation_error).clone()
    }

    // ===== Commands =====

    /// Queue a command.
    ///
    /// Returns `Ok(false)` when the command only asks for help or is a dry
    /// run; nothing is queued then.
    pub fn add_command(&self, args: &[String]) -> SchedulerResult<bool> {
        self.add_command_from(args, None)
    }

    fn add_command_from(&self, args: &[String], command_file: Option<&Path>) -> SchedulerResult<bool> {
        self.ensure_accepting()?;
        let configuration = self
            .shared
            .configuration_factory
            .create_configuration_from_args(args)?;
        let options = configuration.command_options();

        if options.is_help_mode() {
            let help = self.shared.configuration_factory.print_help_for_config(args);
            info!(config = %configuration.name(), "{help}");
            return Ok(false);
        }

        configuration.validate_options()?;

        if options.is_dry_run() {
            if options.noisy_dry_run {
                match serde_json::to_string_pretty(&configuration) {
                    Ok(json) => info!(config = %configuration.name(), "{json}"),
                    Err(e) => warn!(error = %e, "Failed to render configuration"),
                }
            }
            info!(command = ?args, "Dry run, command not queued");
            return Ok(false);
        }

        let command_id = self.lock_queue().add_command(
            args.to_vec(),
            command_file.map(Path::to_path_buf),
            configuration,
        );
        info!(command_id = %command_id, command = ?args, "Command added");
        self.notify(SchedulerEvent::CommandAdded);
        Ok(true)
    }

    /// Queue every command of a command file, each with `extra_args`
    /// appended. Returns the number of commands queued.
    ///
    /// With reload enabled the file is watched, and adding it again
    /// replaces the commands it added before.
    pub fn add_command_file(&self, path: &Path, extra_args: &[String]) -> SchedulerResult<usize> {
        let reload = self.shared.command_file_reload.load(Ordering::SeqCst);
        let replace = reload && lock(&self.shared.watched_files).contains_key(path);
        let added = self.load_command_file(path, extra_args, replace)?;

        if reload {
            lock(&self.shared.watched_files).insert(
                path.to_path_buf(),
                WatchedFile {
                    extra_args: extra_args.to_vec(),
                    modified: file_modified(path),
                },
            );
        }
        Ok(added)
    }

    /// Reload a watched command file, replacing its commands.
    ///
    /// Files that are not watched are ignored.
    pub fn notify_file_changed(&self, path: &Path) -> SchedulerResult<usize> {
        let Some(watched) = lock(&self.shared.watched_files).get(path).cloned() else {
            debug!(path = %path.display(), "Change notified for unwatched file");
            return Ok(0);
        };
        info!(path = %path.display(), "Command file changed, reloading");
        let added = self.load_command_file(path, &watched.extra_args, true)?;
        if let Some(entry) = lock(&self.shared.watched_files).get_mut(path) {
            entry.modified = file_modified(path);
        }
        Ok(added)
    }

    fn load_command_file(
        &self,
        path: &Path,
        extra_args: &[String],
        replace: bool,
    ) -> SchedulerResult<usize> {
        let lines = self.shared.command_file_parser.parse_file(path)?;

        if replace {
            let mut queue = self.lock_queue();
            for id in queue.commands_from_file(path) {
                queue.remove_command(id);
            }
        }

        let mut added = 0;
        for line in lines {
            let mut args = line.args;
            args.extend_from_slice(extra_args);
            match self.add_command_from(&args, Some(path)) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(SchedulerError::ShuttingDown) => return Err(SchedulerError::ShuttingDown),
                Err(e) => warn!(
                    path = %path.display(),
                    line = line.line_number,
                    error = %e,
                    "Skipping invalid command"
                ),
            }
        }
        info!(path = %path.display(), added, "Loaded command file");
        Ok(added)
    }

    /// Watch files added from now on for changes.
    pub fn set_command_file_reload(&self, reload: bool) {
        self.shared
            .command_file_reload
            .store(reload, Ordering::SeqCst);
        if !reload {
            lock(&self.shared.watched_files).clear();
        }
    }

    /// Forget every queued command. Running invocations finish, but stop
    /// looping.
    pub fn remove_all_commands(&self) {
        self.lock_queue().remove_all();
        info!("Removed all commands");
    }

    pub fn remove_command(&self, id: CommandId) -> bool {
        let removed = self.lock_queue().remove_command(id);
        if removed {
            info!(command_id = %id, "Removed command");
        }
        removed
    }

    /// Number of ready, sleeping and executing commands.
    pub fn get_all_commands_size(&self) -> usize {
        self.lock_queue().len()
    }

    /// Trackers of every known command, by id.
    pub fn get_command_trackers(&self) -> Vec<CommandTracker> {
        self.lock_queue().trackers().cloned().collect()
    }

    // ===== Direct execution =====

    /// Run a command right away on freshly allocated devices, bypassing the
    /// queue.
    ///
    /// Fails with [`SchedulerError::NoDevice`] when the devices cannot be
    /// allocated now.
    pub fn exec_command(
        &self,
        listener: Arc<dyn ScheduledInvocationListener>,
        args: &[String],
    ) -> SchedulerResult<InvocationId> {
        self.ensure_accepting()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let configuration = self.create_validated(args)?;

        let dispatch = {
            let mut queue = self.lock_queue();
            let mut allocation =
                allocate_devices(&configuration, self.shared.device_manager.as_ref());
            if !allocation.was_successful() {
                return Err(SchedulerError::NoDevice(
                    allocation.format_failed_allocations(),
                ));
            }
            let busy = queue.busy_serial(allocation.allocated_devices().iter().map(|(_, d)| d));
            if let Some(serial) = busy {
                allocation.release(self.shared.device_manager.as_ref());
                return Err(SchedulerError::DeviceBusy { serial });
            }

            let command_id = queue.next_id();
            let device_configs = allocation.device_configs().to_vec();
            self.prepare_dispatch(
                &mut queue,
                ExecutableCommand::new(command_id, configuration),
                allocation.into_devices(),
                device_configs,
                true,
                listener,
            )
        };

        let invocation_id = dispatch.invocation_id;
        self.spawn_invocation(&runtime, dispatch);
        Ok(invocation_id)
    }

    /// Run a command on devices the caller already allocated.
    ///
    /// The devices stay owned by the caller: their end states are reported
    /// through `invocation_complete` but they are not freed.
    pub fn exec_command_on_devices(
        &self,
        listener: Arc<dyn ScheduledInvocationListener>,
        devices: &[DeviceHandle],
        args: &[String],
    ) -> SchedulerResult<InvocationId> {
        self.ensure_accepting()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let configuration = self.create_validated(args)?;
        let slots = configuration.device_configs();
        if slots.len() != devices.len() {
            return Err(SchedulerError::NoDevice(format!(
                "configuration needs {} device(s) but {} were provided",
                slots.len(),
                devices.len()
            )));
        }
        let named: Vec<(String, DeviceHandle)> = slots
            .iter()
            .zip(devices)
            .map(|(slot, device)| (slot.name.clone(), Arc::clone(device)))
            .collect();

        let dispatch = {
            let mut queue = self.lock_queue();
            if let Some(serial) = queue.busy_serial(devices) {
                return Err(SchedulerError::DeviceBusy { serial });
            }
            let command_id = queue.next_id();
            let device_configs = configuration.device_configs().to_vec();
            self.prepare_dispatch(
                &mut queue,
                ExecutableCommand::new(command_id, configuration),
                named,
                device_configs,
                false,
                listener,
            )
        };

        let invocation_id = dispatch.invocation_id;
        self.spawn_invocation(&runtime, dispatch);
        Ok(invocation_id)
    }

    fn create_validated(&self, args: &[String]) -> SchedulerResult<Configuration> {
        let configuration = self
            .shared
            .configuration_factory
            .create_configuration_from_args(args)?;
        configuration.validate_options()?;
        Ok(configuration)
    }
}

fn file_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
