//! Commands and their queue entries.

use std::fmt;
use std::time::{Duration, Instant};

use tf_id::CommandId;

use crate::configuration::Configuration;

pub mod file;
pub mod tracker;

pub use file::{CommandFileError, CommandFileParser, CommandLine, TextCommandFileParser};
pub use tracker::CommandTracker;

/// Where a queued command currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    WaitForDevice,
    Executing,
    Sleeping,
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandState::WaitForDevice => "Wait_for_device",
            CommandState::Executing => "Executing",
            CommandState::Sleeping => "Sleeping",
        };
        f.write_str(s)
    }
}

/// One runnable entry for a tracked command.
///
/// A tracker normally has one entry. Rescheduled configurations add more
/// entries for the same tracker.
#[derive(Debug, Clone)]
pub struct ExecutableCommand {
    command_id: CommandId,
    configuration: Configuration,
    state: CommandState,
    rescheduled: bool,
    loop_mode: bool,
    wake_at: Option<Instant>,
}

impl ExecutableCommand {
    pub fn new(command_id: CommandId, configuration: Configuration) -> Self {
        let loop_mode = configuration.command_options().loop_mode;
        Self {
            command_id,
            configuration,
            state: CommandState::WaitForDevice,
            rescheduled: false,
            loop_mode,
            wake_at: None,
        }
    }

    /// Entry for a configuration handed back by a running invocation.
    pub fn rescheduled(command_id: CommandId, configuration: Configuration) -> Self {
        Self {
            rescheduled: true,
            loop_mode: false,
            ..Self::new(command_id, configuration)
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn is_rescheduled(&self) -> bool {
        self.rescheduled
    }

    pub fn is_loop_mode(&self) -> bool {
        self.loop_mode
    }

    /// Stop re-queueing after the current run.
    pub fn cancel_loop(&mut self) {
        self.loop_mode = false;
    }

    pub fn mark_executing(&mut self) {
        self.state = CommandState::Executing;
        self.wake_at = None;
    }

    pub fn mark_waiting(&mut self) {
        self.state = CommandState::WaitForDevice;
        self.wake_at = None;
    }

    pub fn sleep_until(&mut self, wake_at: Instant) {
        self.state = CommandState::Sleeping;
        self.wake_at = Some(wake_at);
    }

    pub fn wake_at(&self) -> Option<Instant> {
        self.wake_at
    }

    /// Time left before a sleeping command becomes ready.
    pub fn sleep_remaining(&self, now: Instant) -> Option<Duration> {
        self.wake_at.map(|at| at.saturating_duration_since(now))
    }
}
