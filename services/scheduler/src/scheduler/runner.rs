//! Invocation tasks.
//!
//! Each dispatched command runs on its own task inside an `invocation` span.
//! When the invocation returns, its devices are freed with the end states
//! the run left them in, and the command is retired, requeued or put to
//! sleep in one critical section on the queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tf_id::{CommandId, InvocationId};
use tokio::runtime::Handle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::queue::{CommandQueue, RunningInvocation};
use super::{CommandScheduler, SchedulerError, SchedulerEvent};
use crate::command::ExecutableCommand;
use crate::configuration::{Configuration, DeviceConfig};
use crate::device::{DeviceHandle, FreeDeviceState};
use crate::invocation::{
    compute_end_states, DeviceEndStates, InvocationContext, InvocationError, InvocationRequest,
    Rescheduler, ScheduledInvocationListener,
};

/// A dispatched invocation waiting to be spawned.
pub(super) struct Dispatch {
    pub invocation_id: InvocationId,
    command_id: CommandId,
    configuration: Configuration,
    context: Arc<InvocationContext>,
    listener: Arc<dyn ScheduledInvocationListener>,
}

/// Listener handed to invocations so they can give devices back early.
struct FreeDeviceHandler {
    scheduler: CommandScheduler,
    invocation_id: InvocationId,
    listener: Arc<dyn ScheduledInvocationListener>,
}

impl ScheduledInvocationListener for FreeDeviceHandler {
    fn release_devices(&self, context: &InvocationContext, end_states: &DeviceEndStates) {
        self.scheduler
            .release_devices_early(&self.invocation_id, context, end_states);
        self.listener.release_devices(context, end_states);
    }
}

impl CommandScheduler {
    /// Register `command` as executing on `devices`.
    ///
    /// Builds the invocation context: devices by slot name, the invocation
    /// id, invocation data (unless sandboxed) and the test tag. Attributes
    /// are locked before the invocation sees the context.
    pub(super) fn prepare_dispatch(
        &self,
        queue: &mut CommandQueue,
        mut command: ExecutableCommand,
        devices: Vec<(String, DeviceHandle)>,
        device_configs: Vec<DeviceConfig>,
        owns_devices: bool,
        listener: Arc<dyn ScheduledInvocationListener>,
    ) -> Dispatch {
        let invocation_id = InvocationId::new();
        let mut configuration = command.configuration().clone();
        // slots are already expanded, a rescheduled copy must not expand again
        configuration.set_device_configs(device_configs);
        configuration.command_options_mut().replicate_parent_setup = false;

        let mut context = InvocationContext::for_invocation(invocation_id);
        for (name, device) in devices {
            context.add_allocated_device(name, device);
        }
        let options = configuration.command_options();
        if !configuration.descriptor().sandboxed {
            if let Err(e) = context.add_invocation_attributes(&options.invocation_data) {
                warn!(error = %e, "Failed to add invocation data");
            }
        }
        if let Some(tag) = &options.test_tag {
            context.set_test_tag(tag.clone());
        }
        context.lock_attributes();
        let context = Arc::new(context);

        command.mark_executing();
        let command_id = command.command_id();
        info!(
            invocation_id = %invocation_id,
            command_id = %command_id,
            config = %configuration.name(),
            devices = ?context.serials(),
            "Dispatching invocation"
        );
        queue.start_invocation(
            invocation_id,
            RunningInvocation {
                command,
                context: Arc::clone(&context),
                started_at: Instant::now(),
                owns_devices,
                devices_released: false,
            },
        );

        Dispatch {
            invocation_id,
            command_id,
            configuration,
            context,
            listener,
        }
    }

    pub(super) fn spawn_invocation(&self, runtime: &Handle, dispatch: Dispatch) {
        let span = info_span!(
            "invocation",
            invocation_id = %dispatch.invocation_id,
            command_id = %dispatch.command_id,
            devices = ?dispatch.context.serials(),
        );
        runtime.spawn(self.clone().run_invocation(dispatch).instrument(span));
    }

    async fn run_invocation(self, dispatch: Dispatch) {
        let Dispatch {
            invocation_id,
            configuration,
            context,
            listener,
            ..
        } = dispatch;
        let started = Instant::now();
        let rescheduler = Rescheduler::new();

        listener.invocation_initiated(&context);

        let request = InvocationRequest {
            context: Arc::clone(&context),
            configuration,
            rescheduler: rescheduler.clone(),
            listener: Arc::new(FreeDeviceHandler {
                scheduler: self.clone(),
                invocation_id,
                listener: Arc::clone(&listener),
            }),
            stop: self.shared.stop_tx.subscribe(),
        };

        let invocation = Arc::clone(&self.shared.invocation);
        let result = match AssertUnwindSafe(invocation.invoke(request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(InvocationError::Panicked(panic_message(panic.as_ref()))),
        };
        let elapsed = started.elapsed();

        let error = result.err();
        match &error {
            None => info!(elapsed_ms = elapsed.as_millis() as u64, "Invocation complete"),
            Some(e @ InvocationError::DeviceNotAvailable { .. }) => {
                warn!(error = %e, "Device lost during invocation")
            }
            Some(e @ InvocationError::Stopped(_)) => info!(error = %e, "Invocation stopped"),
            Some(e) => error!(error = %e, "Invocation failed"),
        }
        if let Some(e) = &error {
            self.set_last_invocation_error(SchedulerError::Invocation(e.clone()));
        }

        let end_states = compute_end_states(&context, error.as_ref());
        listener.invocation_complete(&context, &end_states);
        self.complete_invocation(
            &invocation_id,
            &end_states,
            rescheduler.take_scheduled(),
            elapsed,
        );
    }

    fn free_devices(&self, context: &InvocationContext, end_states: &DeviceEndStates) {
        for device in context.devices() {
            let state = end_states
                .get(device.serial())
                .copied()
                .unwrap_or(FreeDeviceState::Available);
            self.shared.device_manager.free(device, state);
        }
    }

    /// Free an invocation's devices before it completes.
    ///
    /// Only a context marked as released early gives up its claim on the
    /// devices. Otherwise they go back to the pool but any dispatch onto
    /// them conflicts until the invocation completes.
    fn release_devices_early(
        &self,
        invocation_id: &InvocationId,
        context: &InvocationContext,
        end_states: &DeviceEndStates,
    ) {
        {
            let mut queue = self.lock_queue();
            let Some(running) = queue.running_mut(invocation_id) else {
                warn!(invocation_id = %invocation_id, "Release requested for unknown invocation");
                return;
            };
            if running.devices_released {
                debug!(invocation_id = %invocation_id, "Devices already released");
                return;
            }
            running.devices_released = true;
            if running.owns_devices {
                self.free_devices(context, end_states);
            }

            if context.was_released_early() {
                queue.release_claims(invocation_id);
                info!(invocation_id = %invocation_id, "Devices released early");
            } else {
                warn!(
                    invocation_id = %invocation_id,
                    "Devices freed without early release, still claimed by the invocation"
                );
            }
        }
        self.notify(SchedulerEvent::DevicesReleased);
    }

    /// Retire a finished invocation.
    ///
    /// Frees its devices unless released already, queues rescheduled
    /// configurations, and requeues looping commands.
    fn complete_invocation(
        &self,
        invocation_id: &InvocationId,
        end_states: &DeviceEndStates,
        rescheduled: Vec<Configuration>,
        elapsed: Duration,
    ) {
        {
            let mut queue = self.lock_queue();
            let Some(running) = queue.retire(invocation_id) else {
                warn!(invocation_id = %invocation_id, "Completed invocation was not running");
                return;
            };
            if running.owns_devices && !running.devices_released {
                self.free_devices(&running.context, end_states);
            }

            let command = running.command;
            let command_id = command.command_id();
            if let Some(tracker) = queue.tracker_mut(command_id) {
                tracker.add_exec_time(elapsed);
            }

            for configuration in rescheduled {
                info!(
                    command_id = %command_id,
                    config = %configuration.name(),
                    "Rescheduling configuration"
                );
                queue.push_ready(ExecutableCommand::rescheduled(command_id, configuration));
            }

            // direct executions have no tracker and never loop
            if command.is_loop_mode() && queue.tracker(command_id).is_some() {
                let min_loop_time = command.configuration().command_options().min_loop_time;
                match min_loop_time.checked_sub(elapsed) {
                    Some(remaining) if !remaining.is_zero() => {
                        debug!(
                            command_id = %command_id,
                            sleep_ms = remaining.as_millis() as u64,
                            "Loop command sleeping"
                        );
                        queue.push_sleeping(Instant::now() + remaining, command);
                    }
                    _ => queue.push_ready(command),
                }
            } else {
                queue.drop_tracker_if_idle(command_id);
            }
        }
        self.notify(SchedulerEvent::InvocationFinished(*invocation_id));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
