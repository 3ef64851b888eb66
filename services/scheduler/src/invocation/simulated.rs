//! Simulated invocation for development and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{InvocationError, InvocationRequest, TestInvocation};

/// Pretends to run tests by sleeping.
pub struct SimulatedInvocation {
    run_time: Duration,
    fail_device: bool,
    runs: AtomicU64,
}

impl SimulatedInvocation {
    pub fn new(run_time: Duration) -> Self {
        Self {
            run_time,
            fail_device: false,
            runs: AtomicU64::new(0),
        }
    }

    /// Every run ends with its first device reported not available.
    pub fn failing(run_time: Duration) -> Self {
        Self {
            fail_device: true,
            ..Self::new(run_time)
        }
    }

    /// Number of invocations started so far.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedInvocation {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl TestInvocation for SimulatedInvocation {
    async fn invoke(&self, mut request: InvocationRequest) -> Result<(), InvocationError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let serials = request.context.serials();
        info!(
            run,
            config = %request.configuration.name(),
            devices = ?serials,
            "[SIM] Running invocation"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.run_time) => {}
            _ = request.stop.wait_for(|stop| *stop) => {
                return Err(InvocationError::Stopped("scheduler shut down".into()));
            }
        }

        if self.fail_device {
            let serial = serials.into_iter().next().unwrap_or_default();
            return Err(InvocationError::DeviceNotAvailable {
                serial,
                message: "[SIM] device dropped".into(),
            });
        }

        debug!(run, "[SIM] Invocation finished");
        Ok(())
    }

    fn notify_invocation_stopped(&self, message: &str) {
        info!(message, "[SIM] Invocation stop requested");
    }
}
