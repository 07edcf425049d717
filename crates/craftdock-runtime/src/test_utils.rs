//! In-memory `ContainerRuntime` for tests across the workspace: tracks
//! instances in a map, counts adapter calls, and lets tests inject failures,
//! gate starts, and feed log lines.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use craftdock_common::{Error, Result, ServerStatus};
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, Semaphore};
use tokio_stream::wrappers::BroadcastStream;

use crate::{ContainerRuntime, InstanceState, ProvisionSpec};

struct FakeInstance {
    status: ServerStatus,
    port: Option<u16>,
    memory_mb: u32,
    logs: broadcast::Sender<String>,
}

#[derive(Default)]
pub struct FakeRuntime {
    instances: DashMap<String, FakeInstance>,
    next_port: AtomicU16,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub restart_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_remove: AtomicBool,
    /// Currently open log tails; decremented when a tail stream is dropped.
    pub open_tails: Arc<AtomicUsize>,
    start_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(49152),
            ..Default::default()
        })
    }

    /// Make subsequent `start` calls block until `permits` are added to the
    /// returned semaphore. Used to hold a server mid-transition.
    pub fn gate_starts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.start_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Feed a log line to every open tail for `name`.
    pub fn push_log(&self, name: &str, line: &str) {
        if let Some(instance) = self.instances.get(name) {
            let _ = instance.logs.send(line.to_string());
        }
    }

    /// Force the observed status, bypassing the lifecycle methods.
    pub fn set_status(&self, name: &str, status: ServerStatus) {
        if let Some(mut instance) = self.instances.get_mut(name) {
            instance.status = status;
        }
    }

    pub fn declared_memory(&self, name: &str) -> Option<u32> {
        self.instances.get(name).map(|i| i.memory_mb)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn provision(&self, spec: ProvisionSpec) -> Result<()> {
        if self.instances.contains_key(&spec.name) {
            return Err(Error::DuplicateName(spec.name));
        }
        let (logs, _) = broadcast::channel(64);
        self.instances.insert(
            spec.name,
            FakeInstance {
                status: ServerStatus::Stopped,
                port: None,
                memory_mb: spec.memory_mb,
                logs,
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.start_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Runtime("start gate closed".to_string()))?;
            permit.forget();
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Runtime("injected start failure".to_string()));
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let mut instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("no instance named {name}")))?;
        instance.status = ServerStatus::Running;
        instance.port = Some(port);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("no instance named {name}")))?;
        instance.status = ServerStatus::Stopped;
        instance.port = None;
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.restart_calls.fetch_add(1, Ordering::SeqCst);
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let mut instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("no instance named {name}")))?;
        instance.status = ServerStatus::Running;
        instance.port = Some(port);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(Error::Runtime("injected remove failure".to_string()));
        }
        self.instances
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("no instance named {name}")))
    }

    async fn inspect(&self, name: &str) -> Result<InstanceState> {
        Ok(self
            .instances
            .get(name)
            .map(|i| InstanceState {
                status: i.status,
                port: i.port,
            })
            .unwrap_or_else(InstanceState::absent))
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        Ok(self.instances.iter().map(|e| e.key().clone()).collect())
    }

    fn tail_logs(&self, name: &str) -> BoxStream<'static, Result<String>> {
        let Some(instance) = self.instances.get(name) else {
            return futures::stream::iter(vec![Err(Error::NotFound(format!(
                "no instance named {name}"
            )))])
            .boxed();
        };
        let rx = instance.logs.subscribe();
        self.open_tails.fetch_add(1, Ordering::SeqCst);
        let inner = BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok().map(Ok) })
            .boxed();
        Box::pin(TailGuard {
            inner,
            open_tails: self.open_tails.clone(),
        })
    }
}

/// Wraps a tail stream so the fake can observe when it is released.
struct TailGuard {
    inner: BoxStream<'static, Result<String>>,
    open_tails: Arc<AtomicUsize>,
}

impl Stream for TailGuard {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

impl Drop for TailGuard {
    fn drop(&mut self) {
        self.open_tails.fetch_sub(1, Ordering::SeqCst);
    }
}
