//! Per-server event fan-out. Each server name gets its own topic so
//! subscribers only ever see their server's events. The first subscriber
//! spawns the log tail; dropping the last one aborts it and releases the
//! underlying stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use craftdock_common::{LifecyclePhase, ServerEvent};
use craftdock_runtime::ContainerRuntime;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Broadcast channel buffer size per topic.
const EVENT_BUFFER: usize = 256;

struct ServerTopic {
    name: String,
    events_tx: broadcast::Sender<ServerEvent>,
    subscribers: AtomicUsize,
    tail: Mutex<Option<JoinHandle<()>>>,
}

pub struct EventHub {
    topics: DashMap<String, Arc<ServerTopic>>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl EventHub {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            runtime,
        })
    }

    /// Send a status notification to whoever is listening on `name`. Dropped
    /// when nobody is.
    pub fn publish(&self, name: &str, event: ServerEvent) {
        if let Some(topic) = self.topics.get(name) {
            let _ = topic.events_tx.send(event);
        }
    }

    pub fn subscribe(self: &Arc<Self>, name: &str) -> Subscription {
        // The count is incremented while the map entry is held, so a
        // concurrent last-unsubscribe either sees the new subscriber or has
        // already retired the topic before this entry (re)creates it.
        let entry = self.topics.entry(name.to_string()).or_insert_with(|| {
            let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
            Arc::new(ServerTopic {
                name: name.to_string(),
                events_tx,
                subscribers: AtomicUsize::new(0),
                tail: Mutex::new(None),
            })
        });
        let count = entry.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
        let topic = entry.clone();
        drop(entry);

        let rx = topic.events_tx.subscribe();
        self.ensure_tail(&topic);
        debug!(%name, subscribers = count, "Subscribed to server events");

        Subscription {
            hub: self.clone(),
            name: name.to_string(),
            rx,
        }
    }

    pub fn active_topics(&self) -> usize {
        self.topics.len()
    }

    fn ensure_tail(&self, topic: &Arc<ServerTopic>) {
        let mut guard = topic.tail.lock().unwrap();
        // Respawn when the previous tail ran to completion (instance gone or
        // stream error) so a new subscriber is not left on a dead feed.
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let mut stream = self.runtime.tail_logs(&topic.name);
        let events_tx = topic.events_tx.clone();
        let name = topic.name.clone();
        *guard = Some(tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(line) => {
                        let _ = events_tx.send(ServerEvent::Log { line });
                    }
                    Err(e) => {
                        warn!(%name, error = %e, "Log tail failed");
                        let _ = events_tx.send(ServerEvent::Status {
                            phase: LifecyclePhase::Stopped,
                            error: Some(format!("log stream ended: {e}")),
                        });
                        break;
                    }
                }
            }
            debug!(%name, "Log tail ended");
        }));
    }

    fn unsubscribe(&self, name: &str) {
        let Some(topic) = self.topics.get(name).map(|t| t.clone()) else {
            return;
        };
        if topic.subscribers.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last subscriber gone: release the tail and retire the topic.
            // The count is rechecked under the tail lock, so a subscriber
            // arriving between the decrement and here keeps its tail.
            {
                let mut guard = topic.tail.lock().unwrap();
                if topic.subscribers.load(Ordering::SeqCst) == 0 {
                    if let Some(handle) = guard.take() {
                        handle.abort();
                    }
                }
            }
            self.topics
                .remove_if(name, |_, t| t.subscribers.load(Ordering::SeqCst) == 0);
            debug!(%name, "Released server topic");
        }
    }
}

/// Handle to one subscriber's stream of events. Dropping it counts the
/// subscriber out; the last drop releases the log tail.
pub struct Subscription {
    hub: Arc<EventHub>,
    name: String,
    rx: broadcast::Receiver<ServerEvent>,
}

impl Subscription {
    pub fn server_name(&self) -> &str {
        &self.name
    }

    /// Next event, skipping over lag gaps. `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(name = %self.name, skipped, "Subscriber lagged, skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.name);
    }
}
