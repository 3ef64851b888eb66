//! Queue state guarded by the scheduler's queue mutex.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tf_id::{CommandId, InvocationId};
use tracing::warn;

use crate::command::{CommandTracker, ExecutableCommand};
use crate::configuration::Configuration;
use crate::device::DeviceHandle;
use crate::invocation::InvocationContext;

/// An invocation between dispatch and retirement.
#[derive(Debug)]
pub(crate) struct RunningInvocation {
    pub command: ExecutableCommand,
    pub context: Arc<InvocationContext>,
    pub started_at: Instant,
    /// False when the caller allocated the devices and frees them itself.
    pub owns_devices: bool,
    pub devices_released: bool,
}

#[derive(Debug)]
pub(crate) struct CommandQueue {
    next_command_id: CommandId,
    trackers: BTreeMap<CommandId, CommandTracker>,
    ready: Vec<ExecutableCommand>,
    sleeping: Vec<ExecutableCommand>,
    executing: HashMap<InvocationId, RunningInvocation>,
    /// Serial → invocation currently claiming the device.
    busy: HashMap<String, InvocationId>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self {
            next_command_id: CommandId::FIRST,
            trackers: BTreeMap::new(),
            ready: Vec::new(),
            sleeping: Vec::new(),
            executing: HashMap::new(),
            busy: HashMap::new(),
        }
    }
}

impl CommandQueue {
    pub fn next_id(&mut self) -> CommandId {
        let id = self.next_command_id;
        self.next_command_id = id.next().unwrap_or_else(|| {
            warn!("Command ids exhausted, wrapping around");
            CommandId::FIRST
        });
        id
    }

    // ===== Commands =====

    /// Track a new command and queue its first run.
    pub fn add_command(
        &mut self,
        args: Vec<String>,
        command_file: Option<PathBuf>,
        configuration: Configuration,
    ) -> CommandId {
        let id = self.next_id();
        self.trackers
            .insert(id, CommandTracker::new(id, args, command_file));
        self.ready.push(ExecutableCommand::new(id, configuration));
        id
    }

    pub fn push_ready(&mut self, mut command: ExecutableCommand) {
        command.mark_waiting();
        self.ready.push(command);
    }

    pub fn push_sleeping(&mut self, wake_at: Instant, mut command: ExecutableCommand) {
        command.sleep_until(wake_at);
        self.sleeping.push(command);
    }

    /// Remove a command's queued entries and stop it from looping.
    ///
    /// Running entries finish their current run.
    pub fn remove_command(&mut self, id: CommandId) -> bool {
        let tracked = self.trackers.remove(&id).is_some();
        let queued = self.ready.len() + self.sleeping.len();
        self.ready.retain(|c| c.command_id() != id);
        self.sleeping.retain(|c| c.command_id() != id);
        let removed = queued != self.ready.len() + self.sleeping.len();
        for running in self.executing.values_mut() {
            if running.command.command_id() == id {
                running.command.cancel_loop();
            }
        }
        tracked || removed
    }

    pub fn remove_all(&mut self) {
        self.trackers.clear();
        self.ready.clear();
        self.sleeping.clear();
        for running in self.executing.values_mut() {
            running.command.cancel_loop();
        }
    }

    /// Ids of the commands loaded from `path`.
    pub fn commands_from_file(&self, path: &Path) -> Vec<CommandId> {
        self.trackers
            .values()
            .filter(|t| t.command_file() == Some(path))
            .map(CommandTracker::id)
            .collect()
    }

    /// Forget a tracker once nothing references it any more.
    pub fn drop_tracker_if_idle(&mut self, id: CommandId) {
        let referenced = self.ready.iter().any(|c| c.command_id() == id)
            || self.sleeping.iter().any(|c| c.command_id() == id)
            || self.executing.values().any(|r| r.command.command_id() == id);
        if !referenced {
            self.trackers.remove(&id);
        }
    }

    pub fn tracker(&self, id: CommandId) -> Option<&CommandTracker> {
        self.trackers.get(&id)
    }

    pub fn tracker_mut(&mut self, id: CommandId) -> Option<&mut CommandTracker> {
        self.trackers.get_mut(&id)
    }

    pub fn trackers(&self) -> impl Iterator<Item = &CommandTracker> {
        self.trackers.values()
    }

    // ===== Scheduling =====

    /// Move sleepers whose time is up back to the ready list.
    pub fn wake_sleepers(&mut self, now: Instant) {
        let (awake, still_sleeping): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sleeping)
            .into_iter()
            .partition(|c| c.wake_at().is_none_or(|at| at <= now));
        self.sleeping = still_sleeping;
        for command in awake {
            self.push_ready(command);
        }
    }

    /// Earliest wake time among sleeping commands.
    pub fn next_wake(&self) -> Option<Instant> {
        self.sleeping.iter().filter_map(ExecutableCommand::wake_at).min()
    }

    /// Take every ready command, least total execution time first.
    pub fn take_ready_by_priority(&mut self) -> Vec<ExecutableCommand> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.sort_by_key(|c| {
            let exec_time = self
                .trackers
                .get(&c.command_id())
                .map(CommandTracker::total_exec_time)
                .unwrap_or_default();
            (exec_time, c.command_id())
        });
        ready
    }

    /// First device already claimed by a running invocation.
    pub fn busy_serial<'a>(
        &self,
        devices: impl IntoIterator<Item = &'a DeviceHandle>,
    ) -> Option<String> {
        devices
            .into_iter()
            .map(|d| d.serial())
            .find(|serial| self.busy.contains_key(*serial))
            .map(str::to_string)
    }

    pub fn start_invocation(&mut self, id: InvocationId, running: RunningInvocation) {
        for serial in running.context.serials() {
            self.busy.insert(serial, id);
        }
        self.executing.insert(id, running);
    }

    pub fn running_mut(&mut self, id: &InvocationId) -> Option<&mut RunningInvocation> {
        self.executing.get_mut(id)
    }

    /// Drop the device claims of an invocation.
    pub fn release_claims(&mut self, id: &InvocationId) {
        self.busy.retain(|_, owner| owner != id);
    }

    pub fn retire(&mut self, id: &InvocationId) -> Option<RunningInvocation> {
        self.release_claims(id);
        self.executing.remove(id)
    }

    pub fn running(&self) -> impl Iterator<Item = (&InvocationId, &RunningInvocation)> {
        self.executing.iter()
    }

    pub fn running_invocation(&self, id: &InvocationId) -> Option<&RunningInvocation> {
        self.executing.get(id)
    }

    // ===== Counts and snapshots =====

    pub fn has_running(&self) -> bool {
        !self.executing.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.sleeping.len() + self.executing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every entry, ready, sleeping or executing, ordered by command id.
    pub fn entries(&self) -> Vec<&ExecutableCommand> {
        let mut entries: Vec<_> = self
            .ready
            .iter()
            .chain(self.sleeping.iter())
            .chain(self.executing.values().map(|r| &r.command))
            .collect();
        entries.sort_by_key(|c| c.command_id());
        entries
    }

    /// Configuration of any entry of command `id`.
    pub fn configuration_of(&self, id: CommandId) -> Option<&Configuration> {
        self.entries()
            .into_iter()
            .find(|c| c.command_id() == id)
            .map(ExecutableCommand::configuration)
    }
}
