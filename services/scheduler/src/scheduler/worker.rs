//! Scheduling loop.
//!
//! Scans ready commands whenever something may have changed (a command was
//! added, devices were released, an invocation finished, the phase moved)
//! and at least once per poll interval. Commands whose devices cannot be
//! allocated stay queued for the next scan.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::allocation::allocate_devices;
use super::{CommandScheduler, SchedulerError, SchedulerEvent, SchedulerPhase};
use crate::invocation::NoopListener;

/// Run the scheduling loop until shutdown, then wait for running
/// invocations and mark the scheduler terminated.
pub(super) async fn run(scheduler: CommandScheduler, mut events: mpsc::UnboundedReceiver<SchedulerEvent>) {
    let poll_interval = scheduler.shared.config.poll_interval;
    let mut phase_rx = scheduler.shared.phase_tx.subscribe();
    info!(
        poll_interval_ms = poll_interval.as_millis() as u64,
        "Command scheduler started"
    );

    loop {
        let phase = *phase_rx.borrow_and_update();
        let empty = scheduler.lock_queue().is_empty();
        match phase {
            SchedulerPhase::ShuttingDown | SchedulerPhase::Terminated => break,
            SchedulerPhase::ShuttingDownOnEmpty if empty => {
                info!("Command queue empty, shutting down");
                break;
            }
            _ => {}
        }

        let next_wake = scheduler.schedule_ready_commands();
        let wait = next_wake.map_or(poll_interval, |wake| wake.min(poll_interval));

        tokio::select! {
            _ = phase_rx.changed() => {}
            Some(event) = events.recv() => debug!(?event, "Scheduler woken"),
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!("Scheduling stopped, waiting for running invocations");
    loop {
        let running = scheduler.lock_queue().has_running();
        if !running {
            break;
        }
        tokio::select! {
            Some(event) = events.recv() => debug!(?event, "Scheduler woken while draining"),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    scheduler
        .shared
        .phase_tx
        .send_replace(SchedulerPhase::Terminated);
    info!("Command scheduler terminated");
}

impl CommandScheduler {
    /// Dispatch every ready command whose devices can be allocated now.
    ///
    /// Returns how long until the next sleeping command wakes up.
    fn schedule_ready_commands(&self) -> Option<Duration> {
        let runtime = Handle::current();
        let manager = self.shared.device_manager.as_ref();
        let now = Instant::now();
        let mut dispatches = Vec::new();

        let next_wake = {
            let mut queue = self.lock_queue();
            queue.wake_sleepers(now);

            for command in queue.take_ready_by_priority() {
                let mut allocation = allocate_devices(command.configuration(), manager);
                if !allocation.was_successful() {
                    queue.push_ready(command);
                    continue;
                }

                let busy = queue.busy_serial(allocation.allocated_devices().iter().map(|(_, d)| d));
                if let Some(serial) = busy {
                    let error = SchedulerError::DeviceBusy { serial };
                    warn!(
                        command_id = %command.command_id(),
                        error = %error,
                        "Device conflict, command stays queued"
                    );
                    self.set_last_invocation_error(error);
                    allocation.release(manager);
                    queue.push_ready(command);
                    continue;
                }

                let device_configs = allocation.device_configs().to_vec();
                dispatches.push(self.prepare_dispatch(
                    &mut queue,
                    command,
                    allocation.into_devices(),
                    device_configs,
                    true,
                    Arc::new(NoopListener),
                ));
            }
            queue.next_wake()
        };

        for dispatch in dispatches {
            self.spawn_invocation(&runtime, dispatch);
        }
        next_wake.map(|at| at.saturating_duration_since(now))
    }
}
