//! Integration tests for device ownership: end states, early release and
//! direct execution through `exec_command`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{args, fake_pool, register, scheduler, wait_until, RecordingListener, ScriptedInvocation};
use tf_scheduler::device::{
    Device, DeviceAllocationState, DeviceManager, DeviceState, FreeDeviceState,
};
use tf_scheduler::invocation::{DeviceEndStates, InvocationError};
use tf_scheduler::{SchedulerError, SchedulerPhase};
use tokio::sync::{Notify, Semaphore};

/// Invocation that releases its devices as soon as it starts, then blocks
/// until `gate` hands it a permit.
fn releasing_invocation(gate: Arc<Semaphore>, mark_early: bool) -> Arc<ScriptedInvocation> {
    ScriptedInvocation::new(move |request| {
        let gate = Arc::clone(&gate);
        async move {
            if mark_early {
                request.context.mark_released_early();
            }
            let end_states: DeviceEndStates = request
                .context
                .serials()
                .into_iter()
                .map(|serial| (serial, FreeDeviceState::Available))
                .collect();
            request.listener.release_devices(&request.context, &end_states);
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_device_released_early_runs_next_command() {
    let pool = fake_pool(1);
    let gate = Arc::new(Semaphore::new(0));
    let invocation = releasing_invocation(Arc::clone(&gate), true);
    let scheduler = scheduler(&pool, &invocation);

    scheduler.add_command(&args(&["first"])).unwrap();
    scheduler.add_command(&args(&["second"])).unwrap();
    scheduler.start().unwrap();

    // both run on the single device while the first is still blocked
    wait_until(|| invocation.invoke_count() == 2).await;

    gate.add_permits(2);
    scheduler.shutdown_on_empty();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
    assert_eq!(scheduler.phase(), SchedulerPhase::Terminated);
    assert_eq!(pool.available_count(), 1);
    assert!(scheduler.last_invocation_error().is_none());
}

#[tokio::test]
async fn test_release_without_early_mark_keeps_claim() {
    let pool = fake_pool(1);
    let gate = Arc::new(Semaphore::new(0));
    let invocation = releasing_invocation(Arc::clone(&gate), false);
    let scheduler = scheduler(&pool, &invocation);

    scheduler.add_command(&args(&["first"])).unwrap();
    scheduler.start().unwrap();
    wait_until(|| invocation.invoke_count() == 1).await;
    scheduler.add_command(&args(&["second"])).unwrap();

    wait_until(|| scheduler.last_invocation_error().is_some()).await;
    let error = scheduler.last_invocation_error().unwrap();
    assert_eq!(
        error.to_string(),
        "Attempting invocation on device serial0 when one is already running"
    );
    assert_eq!(invocation.invoke_count(), 1);

    gate.add_permits(1);
    wait_until(|| invocation.invoke_count() == 2).await;
    gate.add_permits(1);
    scheduler.shutdown_on_empty();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
    assert_eq!(pool.available_count(), 1);
}

#[tokio::test]
async fn test_lost_device_leaves_rotation() {
    let pool = fake_pool(1);
    let invocation = ScriptedInvocation::new(|request| async move {
        for device in request.context.devices() {
            device.set_state(DeviceState::NotAvailable);
        }
        Ok(())
    });
    let scheduler = scheduler(&pool, &invocation);

    scheduler.add_command(&args(&["test"])).unwrap();
    scheduler.start().unwrap();
    scheduler.shutdown_on_empty();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);

    assert_eq!(pool.available_count(), 0);
    assert_eq!(
        pool.allocation_state("serial0"),
        Some(DeviceAllocationState::Unavailable)
    );
}

#[tokio::test]
async fn test_disconnected_device_is_forgotten() {
    let pool = fake_pool(1);
    let invocation = ScriptedInvocation::new({
        let pool = Arc::clone(&pool);
        move |request| {
            let pool = Arc::clone(&pool);
            async move {
                pool.disconnect(&request.context.serials()[0]);
                Err(InvocationError::DeviceNotAvailable {
                    serial: "serial0".into(),
                    message: "adb connection lost".into(),
                })
            }
        }
    });
    let scheduler = scheduler(&pool, &invocation);

    scheduler.add_command(&args(&["test"])).unwrap();
    scheduler.start().unwrap();
    scheduler.shutdown_on_empty();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);

    assert_eq!(pool.allocation_state("serial0"), None);
    assert!(matches!(
        scheduler.last_invocation_error().as_deref(),
        Some(SchedulerError::Invocation(InvocationError::DeviceNotAvailable { .. }))
    ));
}

#[tokio::test]
async fn test_unresponsive_device_is_parked() {
    let pool = fake_pool(1);
    let listener = RecordingListener::new();
    let invocation = ScriptedInvocation::new(|request| async move {
        for device in request.context.devices() {
            device.set_responsive(false);
        }
        Ok(())
    });
    let scheduler = scheduler(&pool, &invocation);
    scheduler.start().unwrap();

    scheduler
        .exec_command(listener.clone(), &args(&["test"]))
        .unwrap();
    wait_until(|| listener.completed_count() == 1).await;

    assert_eq!(
        listener.completed()[0]["serial0"],
        FreeDeviceState::Unresponsive
    );
    wait_until(|| pool.allocation_state("serial0") == Some(DeviceAllocationState::Unavailable))
        .await;

    scheduler.shutdown();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_placeholder_device_always_returns() {
    let pool = fake_pool(0);
    register(&pool, Device::tcp("tcp-device-0"));
    let invocation = ScriptedInvocation::new(|request| async move {
        Err(InvocationError::DeviceNotAvailable {
            serial: request.context.serials()[0].clone(),
            message: "not connected".into(),
        })
    });
    let scheduler = scheduler(&pool, &invocation);

    scheduler.add_command(&args(&["test", "--tcp-device"])).unwrap();
    scheduler.start().unwrap();
    scheduler.shutdown_on_empty();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);

    assert_eq!(
        pool.allocation_state("tcp-device-0"),
        Some(DeviceAllocationState::Available)
    );
}

#[tokio::test]
async fn test_exec_command_reports_to_listener() {
    let pool = fake_pool(1);
    let invocation = ScriptedInvocation::succeeding();
    let listener = RecordingListener::new();
    let scheduler = scheduler(&pool, &invocation);
    scheduler.start().unwrap();

    let invocation_id = scheduler
        .exec_command(listener.clone(), &args(&["test"]))
        .unwrap();
    wait_until(|| listener.completed_count() == 1).await;

    assert_eq!(listener.initiated_count(), 1);
    assert_eq!(
        listener.completed()[0].get("serial0"),
        Some(&FreeDeviceState::Available)
    );
    assert_eq!(
        invocation.contexts()[0].invocation_id(),
        Some(invocation_id)
    );
    wait_until(|| pool.available_count() == 1).await;

    scheduler.shutdown();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_early_release_reaches_exec_listener() {
    let pool = fake_pool(1);
    let gate = Arc::new(Semaphore::new(0));
    let invocation = releasing_invocation(Arc::clone(&gate), true);
    let listener = RecordingListener::new();
    let scheduler = scheduler(&pool, &invocation);
    scheduler.start().unwrap();

    scheduler
        .exec_command(listener.clone(), &args(&["test"]))
        .unwrap();
    wait_until(|| listener.released_count() == 1).await;
    wait_until(|| pool.available_count() == 1).await;
    assert_eq!(listener.completed_count(), 0);

    gate.add_permits(1);
    wait_until(|| listener.completed_count() == 1).await;
    assert_eq!(listener.released_count(), 1);

    scheduler.shutdown();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_exec_command_waits_for_single_device() {
    let pool = fake_pool(1);
    let gate = Arc::new(Semaphore::new(0));
    let invocation = ScriptedInvocation::new({
        let gate = Arc::clone(&gate);
        move |_| {
            let gate = Arc::clone(&gate);
            async move {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                Ok(())
            }
        }
    });
    let first = RecordingListener::new();
    let third = RecordingListener::new();
    let scheduler = scheduler(&pool, &invocation);
    scheduler.start().unwrap();

    scheduler
        .exec_command(first.clone(), &args(&["first"]))
        .unwrap();
    wait_until(|| invocation.invoke_count() == 1).await;

    let err = scheduler
        .exec_command(RecordingListener::new(), &args(&["second"]))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoDevice(_)));

    gate.add_permits(1);
    wait_until(|| first.completed_count() == 1).await;
    wait_until(|| pool.available_count() == 1).await;

    scheduler
        .exec_command(third.clone(), &args(&["third"]))
        .unwrap();
    gate.add_permits(1);
    wait_until(|| third.completed_count() == 1).await;
    assert_eq!(invocation.invoke_count(), 2);

    scheduler.shutdown();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_exec_command_without_devices() {
    let pool = fake_pool(0);
    let invocation = ScriptedInvocation::succeeding();
    let scheduler = scheduler(&pool, &invocation);
    scheduler.start().unwrap();

    let err = scheduler
        .exec_command(RecordingListener::new(), &args(&["test"]))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoDevice(_)));
    assert_eq!(invocation.invoke_count(), 0);

    scheduler.shutdown();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_exec_on_busy_device() {
    let pool = fake_pool(1);
    let gate = Arc::new(Notify::new());
    let invocation = ScriptedInvocation::new({
        let gate = Arc::clone(&gate);
        move |_| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(())
            }
        }
    });
    let scheduler = scheduler(&pool, &invocation);
    scheduler.start().unwrap();

    let busy = register(&pool, Device::physical("caller-owned"));
    let held = pool.allocate_serial("caller-owned").unwrap();
    assert!(Arc::ptr_eq(&busy, &held));

    scheduler
        .exec_command_on_devices(RecordingListener::new(), &[Arc::clone(&held)], &args(&["first"]))
        .unwrap();
    wait_until(|| invocation.invoke_count() == 1).await;

    // allocated outside the scheduler, so the pool cannot hand it out
    let err = scheduler
        .exec_command(RecordingListener::new(), &args(&["test", "--serial", "caller-owned"]))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoDevice(_)));

    // a caller-supplied device already running an invocation is busy
    let err = scheduler
        .exec_command_on_devices(RecordingListener::new(), &[held], &args(&["second"]))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Attempting invocation on device caller-owned when one is already running"
    );

    gate.notify_one();
    scheduler.shutdown();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_exec_on_caller_devices_keeps_them_allocated() {
    let pool = fake_pool(2);
    let first = pool.allocate_serial("serial0").unwrap();
    let second = pool.allocate_serial("serial1").unwrap();
    let invocation = ScriptedInvocation::succeeding();
    let listener = RecordingListener::new();
    let scheduler = scheduler(&pool, &invocation);
    scheduler.start().unwrap();

    scheduler
        .exec_command_on_devices(
            listener.clone(),
            &[first, second],
            &args(&["test", "--device", "a", "--device", "b"]),
        )
        .unwrap();
    wait_until(|| listener.completed_count() == 1).await;

    assert_eq!(listener.device_names(), vec![vec!["a", "b"]]);
    assert_eq!(
        pool.allocation_state("serial0"),
        Some(DeviceAllocationState::Allocated)
    );
    assert_eq!(
        pool.allocation_state("serial1"),
        Some(DeviceAllocationState::Allocated)
    );

    scheduler.shutdown();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_exec_on_devices_slot_mismatch() {
    let pool = fake_pool(1);
    let device = pool.allocate_serial("serial0").unwrap();
    let invocation = ScriptedInvocation::succeeding();
    let scheduler = scheduler(&pool, &invocation);
    scheduler.start().unwrap();

    let err = scheduler
        .exec_command_on_devices(
            RecordingListener::new(),
            &[device],
            &args(&["test", "--device", "a", "--device", "b"]),
        )
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NoDevice(_)));

    scheduler.shutdown();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
}
