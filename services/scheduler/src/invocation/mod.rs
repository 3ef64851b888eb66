//! Test invocation interface.
//!
//! The scheduler does not know how tests are run. It hands each dispatched
//! command to a [`TestInvocation`] along with:
//! - the [`InvocationContext`] holding the allocated devices
//! - the resolved configuration
//! - a [`Rescheduler`] for queueing follow-up configurations
//! - a listener for releasing devices early
//! - a stop signal raised by a hard shutdown

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::configuration::Configuration;

pub mod context;
pub mod listener;
pub mod simulated;

pub use context::{BuildInfo, ContextError, InvocationContext, INVOCATION_ID_ATTRIBUTE};
pub use listener::{compute_end_states, DeviceEndStates, NoopListener, ScheduledInvocationListener};
pub use simulated::SimulatedInvocation;

/// Ways an invocation can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// The device dropped off during the run. The scheduler takes it out of
    /// rotation.
    #[error("device {serial} not available: {message}")]
    DeviceNotAvailable { serial: String, message: String },

    #[error("invocation failed: {0}")]
    Failed(String),

    #[error("invocation stopped: {0}")]
    Stopped(String),

    #[error("invocation panicked: {0}")]
    Panicked(String),
}

/// Collects configurations an invocation wants run again.
///
/// Configurations are queued when the invocation finishes, whatever its
/// outcome.
#[derive(Debug, Clone, Default)]
pub struct Rescheduler {
    pending: Arc<Mutex<Vec<Configuration>>>,
}

impl Rescheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_config(&self, configuration: Configuration) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(configuration);
        true
    }

    pub(crate) fn take_scheduled(&self) -> Vec<Configuration> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Everything an invocation gets to run with.
pub struct InvocationRequest {
    pub context: Arc<InvocationContext>,
    pub configuration: Configuration,
    pub rescheduler: Rescheduler,
    pub listener: Arc<dyn ScheduledInvocationListener>,
    /// Flips to `true` when the scheduler is shut down hard.
    pub stop: watch::Receiver<bool>,
}

/// Runs one invocation against allocated devices.
#[async_trait]
pub trait TestInvocation: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<(), InvocationError>;

    /// Called on hard shutdown for every invocation still running.
    fn notify_invocation_stopped(&self, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescheduler_collects_configs() {
        let rescheduler = Rescheduler::new();
        let shared = rescheduler.clone();
        assert!(shared.schedule_config(Configuration::new("first")));
        assert!(shared.schedule_config(Configuration::new("second")));

        let scheduled = rescheduler.take_scheduled();
        let names: Vec<_> = scheduled.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(rescheduler.take_scheduled().is_empty());
    }

    #[test]
    fn test_error_messages() {
        let err = InvocationError::DeviceNotAvailable {
            serial: "serial0".into(),
            message: "adb offline".into(),
        };
        assert_eq!(err.to_string(), "device serial0 not available: adb offline");
    }
}
