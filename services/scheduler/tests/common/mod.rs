//! Shared fakes for scheduler integration tests.
//!
//! - `ScriptedInvocation`: executor whose behavior is a closure per test
//! - `RecordingListener`: captures lifecycle callbacks, early releases included
//! - `fake_pool`: pool of physical devices `serial0..serialN`

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use tf_scheduler::device::{Device, DeviceHandle, DevicePool};
use tf_scheduler::invocation::{
    DeviceEndStates, InvocationContext, InvocationError, InvocationRequest,
    ScheduledInvocationListener, TestInvocation,
};
use tf_scheduler::{CommandScheduler, SchedulerConfig};

type Script =
    Box<dyn Fn(InvocationRequest) -> BoxFuture<'static, Result<(), InvocationError>> + Send + Sync>;

/// Executor driven by a per-test closure.
pub struct ScriptedInvocation {
    script: Script,
    invokes: AtomicUsize,
    stops: AtomicUsize,
    contexts: Mutex<Vec<Arc<InvocationContext>>>,
}

impl ScriptedInvocation {
    pub fn new<F, Fut>(script: F) -> Arc<Self>
    where
        F: Fn(InvocationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), InvocationError>> + Send + 'static,
    {
        Arc::new(Self {
            script: Box::new(move |request| script(request).boxed()),
            invokes: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// Every invocation succeeds at once.
    pub fn succeeding() -> Arc<Self> {
        Self::new(|_| async { Ok(()) })
    }

    /// Every invocation succeeds after `duration`.
    pub fn sleeping(duration: Duration) -> Arc<Self> {
        Self::new(move |_| async move {
            tokio::time::sleep(duration).await;
            Ok(())
        })
    }

    pub fn invoke_count(&self) -> usize {
        self.invokes.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Contexts of every invocation so far, in call order.
    pub fn contexts(&self) -> Vec<Arc<InvocationContext>> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestInvocation for ScriptedInvocation {
    async fn invoke(&self, request: InvocationRequest) -> Result<(), InvocationError> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        self.contexts
            .lock()
            .unwrap()
            .push(Arc::clone(&request.context));
        (self.script)(request).await
    }

    fn notify_invocation_stopped(&self, _message: &str) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Listener that records every callback.
#[derive(Default)]
pub struct RecordingListener {
    initiated: AtomicUsize,
    released: AtomicUsize,
    completed: Mutex<Vec<DeviceEndStates>>,
    device_names: Mutex<Vec<Vec<String>>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn initiated_count(&self) -> usize {
        self.initiated.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> Vec<DeviceEndStates> {
        self.completed.lock().unwrap().clone()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    /// Slot names of each completed invocation.
    pub fn device_names(&self) -> Vec<Vec<String>> {
        self.device_names.lock().unwrap().clone()
    }
}

impl ScheduledInvocationListener for RecordingListener {
    fn invocation_initiated(&self, _context: &InvocationContext) {
        self.initiated.fetch_add(1, Ordering::SeqCst);
    }

    fn release_devices(&self, _context: &InvocationContext, _end_states: &DeviceEndStates) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn invocation_complete(&self, context: &InvocationContext, end_states: &DeviceEndStates) {
        self.device_names.lock().unwrap().push(
            context
                .device_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        );
        self.completed.lock().unwrap().push(end_states.clone());
    }
}

/// Pool with physical devices `serial0..serial{count - 1}`.
pub fn fake_pool(count: usize) -> Arc<DevicePool> {
    let pool = DevicePool::new();
    for i in 0..count {
        pool.register(Device::physical(format!("serial{i}"))).unwrap();
    }
    Arc::new(pool)
}

/// Register `device` and return its handle.
pub fn register(pool: &DevicePool, device: Device) -> DeviceHandle {
    pool.register(device).unwrap()
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_command_file_poll_interval(Duration::from_millis(20))
}

pub fn scheduler(pool: &Arc<DevicePool>, invocation: &Arc<ScriptedInvocation>) -> CommandScheduler {
    CommandScheduler::new(test_config(), pool.clone(), invocation.clone())
}

pub fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}
