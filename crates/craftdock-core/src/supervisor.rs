//! Control dispatcher: one explicit lifecycle phase per server name, held in
//! a concurrent map whose entry lock is the per-server serialization point.
//! Commands against a name mid-transition are rejected, never queued. A
//! failed runtime call rolls the phase back to the prior stable state and the
//! failure detail goes out as a status event.

use std::sync::Arc;

use craftdock_common::{Error, LifecyclePhase, Result, ServerEvent, ServerStatus};
use craftdock_runtime::{ContainerRuntime, ProvisionSpec};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, instrument, warn};

use crate::events::EventHub;
use crate::registry::{AccountId, ServerId, ServerRecord, ServerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Delete,
}

pub struct ControlSupervisor {
    registry: Arc<ServerRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    hub: Arc<EventHub>,
    phases: DashMap<String, LifecyclePhase>,
    quota_mb: u32,
}

impl ControlSupervisor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        hub: Arc<EventHub>,
        quota_mb: u32,
    ) -> Self {
        Self {
            registry,
            runtime,
            hub,
            phases: DashMap::new(),
            quota_mb,
        }
    }

    /// Provision a new server: registry record (with the quota guard
    /// enforced inside the insert transaction), then the container. A
    /// provisioning failure rolls the record back so the name is not durably
    /// claimed by a server that never existed.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        owner: AccountId,
        name: &str,
        memory_mb: u32,
    ) -> Result<ServerRecord> {
        let record = self
            .registry
            .create_server(name, memory_mb, owner, self.quota_mb)
            .await?;
        let spec = ProvisionSpec {
            name: record.name.clone(),
            memory_mb: record.memory_mb,
            rcon_secret: record.rcon_secret.clone(),
        };
        if let Err(e) = self.runtime.provision(spec).await {
            warn!(%name, error = %e, "Provisioning failed, rolling back record");
            if let Err(rollback) = self.registry.delete(record.id, owner).await {
                warn!(%name, error = %rollback, "Record rollback failed");
            }
            return Err(e);
        }

        self.phases
            .insert(record.name.clone(), LifecyclePhase::Stopped);
        info!(%name, memory_mb, "Server created");
        Ok(record)
    }

    /// Run one lifecycle command to completion and return the acted-on
    /// record. The transition is claimed synchronously (conflicts are
    /// rejected here); the runtime call that follows is the unit of
    /// atomicity and is not cancellable.
    pub async fn dispatch(
        &self,
        owner: AccountId,
        id: ServerId,
        command: Command,
    ) -> Result<ServerRecord> {
        let record = self.registry.get(id, owner).await?;
        self.refresh_phase(&record.name).await?;
        let (prior, transitional) = self.begin(&record.name, command)?;
        self.hub.publish(
            &record.name,
            ServerEvent::Status {
                phase: transitional,
                error: None,
            },
        );

        let outcome = match command {
            Command::Start => self
                .start_instance(&record)
                .await
                .map(|_| LifecyclePhase::Running),
            Command::Stop => self
                .runtime
                .stop(&record.name)
                .await
                .map(|_| LifecyclePhase::Stopped),
            Command::Restart => self
                .restart_instance(&record)
                .await
                .map(|_| LifecyclePhase::Running),
            Command::Delete => self.delete_flow(&record, owner).await,
        };

        match outcome {
            Ok(LifecyclePhase::Deleted) => {
                self.phases.remove(&record.name);
                self.hub.publish(
                    &record.name,
                    ServerEvent::Status {
                        phase: LifecyclePhase::Deleted,
                        error: None,
                    },
                );
                info!(name = %record.name, "Server deleted");
                Ok(record)
            }
            Ok(stable) => {
                self.phases.insert(record.name.clone(), stable);
                self.hub.publish(
                    &record.name,
                    ServerEvent::Status {
                        phase: stable,
                        error: None,
                    },
                );
                info!(name = %record.name, ?command, ?stable, "Transition complete");
                Ok(record)
            }
            Err(e) => {
                // Roll back to the last stable phase; the failure is
                // surfaced, never swallowed.
                self.phases.insert(record.name.clone(), prior);
                self.hub.publish(
                    &record.name,
                    ServerEvent::Status {
                        phase: prior,
                        error: Some(e.to_string()),
                    },
                );
                warn!(name = %record.name, ?command, error = %e, "Transition failed, rolled back");
                Err(e)
            }
        }
    }

    /// Current phase for a name, for status displays.
    pub fn phase(&self, name: &str) -> Option<LifecyclePhase> {
        self.phases.get(name).map(|p| *p)
    }

    /// Sync the cached phase with one runtime observation, so a container
    /// started or removed behind our back cannot wedge the server on a stale
    /// stable phase. Transitional phases are never overwritten; the command
    /// in flight owns them.
    async fn refresh_phase(&self, name: &str) -> Result<()> {
        let state = self.runtime.inspect(name).await?;
        let observed = if state.status == ServerStatus::Running {
            LifecyclePhase::Running
        } else {
            LifecyclePhase::Stopped
        };
        match self.phases.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(observed);
            }
            Entry::Occupied(mut entry) => {
                if !entry.get().is_transitional() {
                    entry.insert(observed);
                }
            }
        }
        Ok(())
    }

    /// Start the backing instance, re-provisioning it first when it has
    /// vanished out from under its record.
    async fn start_instance(&self, record: &ServerRecord) -> Result<()> {
        match self.runtime.start(&record.name).await {
            Err(Error::NotFound(_)) => {
                warn!(name = %record.name, "Instance missing, re-provisioning");
                self.runtime
                    .provision(ProvisionSpec {
                        name: record.name.clone(),
                        memory_mb: record.memory_mb,
                        rcon_secret: record.rcon_secret.clone(),
                    })
                    .await?;
                self.runtime.start(&record.name).await
            }
            other => other,
        }
    }

    async fn restart_instance(&self, record: &ServerRecord) -> Result<()> {
        match self.runtime.restart(&record.name).await {
            Err(Error::NotFound(_)) => self.start_instance(record).await,
            other => other,
        }
    }

    /// Claim the transition for `command` or reject it. Runs under the
    /// map entry's lock, so exactly one claimant wins per name.
    fn begin(&self, name: &str, command: Command) -> Result<(LifecyclePhase, LifecyclePhase)> {
        match self.phases.entry(name.to_string()) {
            Entry::Vacant(_) => Err(Error::NotFound(format!("no lifecycle state for {name}"))),
            Entry::Occupied(mut entry) => {
                let prior = *entry.get();
                if prior.is_transitional() {
                    return Err(Error::Conflict(format!(
                        "{name} is busy ({prior:?} in progress)"
                    )));
                }
                let transitional = match command {
                    Command::Start if prior == LifecyclePhase::Stopped => LifecyclePhase::Starting,
                    Command::Start => {
                        return Err(Error::Conflict(format!("{name} is already running")))
                    }
                    Command::Stop if prior == LifecyclePhase::Running => LifecyclePhase::Stopping,
                    Command::Stop => {
                        return Err(Error::Conflict(format!("{name} is not running")))
                    }
                    Command::Restart => LifecyclePhase::Restarting,
                    Command::Delete => LifecyclePhase::Deleting,
                };
                entry.insert(transitional);
                Ok((prior, transitional))
            }
        }
    }

    /// Runtime removal strictly before record deletion: a failure here keeps
    /// the record, so no live container is ever orphaned without one.
    async fn delete_flow(&self, record: &ServerRecord, owner: AccountId) -> Result<LifecyclePhase> {
        match self.runtime.remove(&record.name).await {
            Ok(()) => {}
            // A record with no backing container is stale state; deleting
            // the record resolves the drift.
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.registry.delete(record.id, owner).await?;
        Ok(LifecyclePhase::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use craftdock_runtime::test_utils::FakeRuntime;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Fixture {
        supervisor: Arc<ControlSupervisor>,
        registry: Arc<ServerRegistry>,
        runtime: Arc<FakeRuntime>,
        hub: Arc<EventHub>,
        owner: AccountId,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(ServerRegistry::in_memory().await.unwrap());
        let runtime = FakeRuntime::new();
        let hub = EventHub::new(runtime.clone());
        let owner = registry
            .create_account("steve@example.com", "hash")
            .await
            .unwrap()
            .id;
        let supervisor = Arc::new(ControlSupervisor::new(
            registry.clone(),
            runtime.clone(),
            hub.clone(),
            2000,
        ));
        Fixture {
            supervisor,
            registry,
            runtime,
            hub,
            owner,
        }
    }

    #[tokio::test]
    async fn test_create_provisions_container() {
        let f = fixture().await;
        let record = f.supervisor.create(f.owner, "alpha", 512).await.unwrap();
        assert_eq!(f.runtime.declared_memory("alpha"), Some(512));
        assert_eq!(
            f.supervisor.phase("alpha"),
            Some(LifecyclePhase::Stopped)
        );
        assert_eq!(f.registry.get(record.id, f.owner).await.unwrap().name, "alpha");
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_provision_failure() {
        let f = fixture().await;
        // Claim the name in the runtime so provisioning collides.
        f.runtime
            .provision(ProvisionSpec {
                name: "alpha".to_string(),
                memory_mb: 64,
                rcon_secret: "x".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            f.supervisor.create(f.owner, "alpha", 512).await,
            Err(Error::DuplicateName(_))
        ));
        assert!(f.registry.list_by_owner(f.owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_guard_rejects_over_allocation() {
        let f = fixture().await;
        f.supervisor.create(f.owner, "alpha", 1500).await.unwrap();
        assert!(matches!(
            f.supervisor.create(f.owner, "beta", 600).await,
            Err(Error::Validation(_))
        ));
        // Within the remaining budget still works.
        f.supervisor.create(f.owner, "gamma", 500).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_cycle_emits_status_events() {
        let f = fixture().await;
        let record = f.supervisor.create(f.owner, "alpha", 512).await.unwrap();
        let mut sub = f.hub.subscribe("alpha");

        f.supervisor
            .dispatch(f.owner, record.id, Command::Start)
            .await
            .unwrap();
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Running));

        let phases: Vec<LifecyclePhase> = [sub.recv().await.unwrap(), sub.recv().await.unwrap()]
            .into_iter()
            .map(|e| match e {
                ServerEvent::Status { phase, error: None } => phase,
                other => panic!("expected clean status event, got {other:?}"),
            })
            .collect();
        assert_eq!(
            phases,
            vec![LifecyclePhase::Starting, LifecyclePhase::Running]
        );

        f.supervisor
            .dispatch(f.owner, record.id, Command::Stop)
            .await
            .unwrap();
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Stopped));
    }

    #[tokio::test]
    async fn test_start_when_running_rejected_without_second_call() {
        let f = fixture().await;
        let record = f.supervisor.create(f.owner, "alpha", 512).await.unwrap();
        f.supervisor
            .dispatch(f.owner, record.id, Command::Start)
            .await
            .unwrap();
        assert_eq!(f.runtime.start_calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            f.supervisor.dispatch(f.owner, record.id, Command::Start).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(f.runtime.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runtime_failure_rolls_phase_back() {
        let f = fixture().await;
        let record = f.supervisor.create(f.owner, "alpha", 512).await.unwrap();
        let mut sub = f.hub.subscribe("alpha");
        f.runtime.fail_start.store(true, Ordering::SeqCst);

        assert!(matches!(
            f.supervisor.dispatch(f.owner, record.id, Command::Start).await,
            Err(Error::Runtime(_))
        ));
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Stopped));

        // Starting, then the rollback notification with the detail.
        let _ = sub.recv().await.unwrap();
        match sub.recv().await.unwrap() {
            ServerEvent::Status {
                phase: LifecyclePhase::Stopped,
                error: Some(detail),
            } => assert!(detail.contains("injected start failure")),
            other => panic!("expected failure status, got {other:?}"),
        }

        // The rollback leaves the server startable again.
        f.runtime.fail_start.store(false, Ordering::SeqCst);
        f.supervisor
            .dispatch(f.owner, record.id, Command::Start)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_while_starting_is_rejected() {
        let f = fixture().await;
        let record = f.supervisor.create(f.owner, "alpha", 512).await.unwrap();
        let gate = f.runtime.gate_starts();

        let start_task = {
            let supervisor = f.supervisor.clone();
            let owner = f.owner;
            tokio::spawn(async move { supervisor.dispatch(owner, record.id, Command::Start).await })
        };

        // Wait until the start has claimed its transition.
        while f.supervisor.phase("alpha") != Some(LifecyclePhase::Starting) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(
            f.supervisor.dispatch(f.owner, record.id, Command::Delete).await,
            Err(Error::Conflict(_))
        ));

        gate.add_permits(1);
        start_task.await.unwrap().unwrap();
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Running));

        // Stable again: delete may proceed now.
        f.supervisor
            .dispatch(f.owner, record.id, Command::Delete)
            .await
            .unwrap();
        assert!(f.registry.list_by_owner(f.owner).await.unwrap().is_empty());
        assert_eq!(f.supervisor.phase("alpha"), None);
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_record() {
        let f = fixture().await;
        let record = f.supervisor.create(f.owner, "alpha", 512).await.unwrap();
        f.runtime.fail_remove.store(true, Ordering::SeqCst);

        assert!(matches!(
            f.supervisor.dispatch(f.owner, record.id, Command::Delete).await,
            Err(Error::Runtime(_))
        ));
        // Record retained and queryable; container still managed.
        assert_eq!(
            f.registry.get(record.id, f.owner).await.unwrap().name,
            "alpha"
        );
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Stopped));

        f.runtime.fail_remove.store(false, Ordering::SeqCst);
        f.supervisor
            .dispatch(f.owner, record.id, Command::Delete)
            .await
            .unwrap();
        assert!(matches!(
            f.registry.get(record.id, f.owner).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_with_missing_container_resolves_drift() {
        let f = fixture().await;
        let record = f.supervisor.create(f.owner, "alpha", 512).await.unwrap();
        // Container vanishes behind our back.
        f.runtime.remove("alpha").await.unwrap();

        f.supervisor
            .dispatch(f.owner, record.id, Command::Delete)
            .await
            .unwrap();
        assert!(f.registry.list_by_owner(f.owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_phase_synced_from_runtime_observation() {
        let f = fixture().await;
        let record = f.registry.create_server("alpha", 512, f.owner, 2000).await.unwrap();
        f.runtime
            .provision(ProvisionSpec {
                name: "alpha".to_string(),
                memory_mb: 512,
                rcon_secret: record.rcon_secret.clone(),
            })
            .await
            .unwrap();
        f.runtime.start("alpha").await.unwrap();

        // Supervisor has never seen this name; the first command syncs the
        // phase from inspect and then rejects the redundant start.
        assert!(matches!(
            f.supervisor.dispatch(f.owner, record.id, Command::Start).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Running));
    }

    #[tokio::test]
    async fn test_externally_removed_instance_recovers() {
        let f = fixture().await;
        let record = f.supervisor.create(f.owner, "alpha", 512).await.unwrap();
        f.supervisor
            .dispatch(f.owner, record.id, Command::Start)
            .await
            .unwrap();
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Running));

        // Container vanishes behind our back while the cache says Running.
        f.runtime.remove("alpha").await.unwrap();

        // Stop reflects the observed state instead of the stale cache.
        assert!(matches!(
            f.supervisor.dispatch(f.owner, record.id, Command::Stop).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Stopped));

        // Start re-provisions the missing container and runs it.
        f.supervisor
            .dispatch(f.owner, record.id, Command::Start)
            .await
            .unwrap();
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Running));
        assert_eq!(f.runtime.declared_memory("alpha"), Some(512));
    }

    #[tokio::test]
    async fn test_restart_recovers_missing_instance() {
        let f = fixture().await;
        let record = f.supervisor.create(f.owner, "alpha", 512).await.unwrap();
        f.runtime.remove("alpha").await.unwrap();

        f.supervisor
            .dispatch(f.owner, record.id, Command::Restart)
            .await
            .unwrap();
        assert_eq!(f.supervisor.phase("alpha"), Some(LifecyclePhase::Running));
        assert_eq!(f.runtime.declared_memory("alpha"), Some(512));
    }

    #[tokio::test]
    async fn test_quota_guard_holds_under_concurrent_creates() {
        let f = fixture().await;
        let a = {
            let supervisor = f.supervisor.clone();
            let owner = f.owner;
            tokio::spawn(async move { supervisor.create(owner, "alpha", 1500).await })
        };
        let b = {
            let supervisor = f.supervisor.clone();
            let owner = f.owner;
            tokio::spawn(async move { supervisor.create(owner, "beta", 1500).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(Error::Validation(_))))
                .count(),
            1
        );
        assert!(f.registry.declared_memory_for_owner(f.owner).await.unwrap() <= 2000);
    }

    #[tokio::test]
    async fn test_commands_on_unknown_id() {
        let f = fixture().await;
        assert!(matches!(
            f.supervisor.dispatch(f.owner, 999, Command::Start).await,
            Err(Error::NotFound(_))
        ));
    }
}
