//! Merges registry records with live runtime observations into the one
//! aggregated view the product shows. Read-only, lock-free, best-effort:
//! a container created or removed mid-scan may read as absent or stale.

use std::collections::HashSet;
use std::sync::Arc;

use craftdock_common::{Error, ReconciledView, Result, ServerStatus, ServerView};
use craftdock_runtime::{ContainerRuntime, InstanceState};
use tracing::debug;

use crate::registry::{AccountId, ServerRegistry};

pub struct Reconciler {
    registry: Arc<ServerRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    quota_mb: u32,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ServerRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        quota_mb: u32,
    ) -> Self {
        Self {
            registry,
            runtime,
            quota_mb,
        }
    }

    /// Classify every record of the owner as started or stopped and compute
    /// memory usage against the quota. A record with no live container is
    /// stopped, not an error.
    pub async fn reconcile_for_owner(&self, owner: AccountId) -> Result<ReconciledView> {
        let records = self.registry.list_by_owner(owner).await?;

        let mut started = Vec::new();
        let mut stopped = Vec::new();
        for record in &records {
            let state = match self.runtime.inspect(&record.name).await {
                Ok(state) => state,
                // Raced with a removal between listing and inspecting.
                Err(Error::NotFound(_)) => InstanceState::absent(),
                Err(e) => return Err(e),
            };
            let view = ServerView {
                id: record.id,
                name: record.name.clone(),
                memory_mb: record.memory_mb,
                status: state.status,
                port: state.port,
            };
            if state.status == ServerStatus::Running {
                started.push(view);
            } else {
                stopped.push(view);
            }
        }

        let used_memory_mb: u32 = started.iter().map(|v| v.memory_mb).sum();
        let free_memory_mb = self.quota_mb.saturating_sub(used_memory_mb);

        let orphans = self.find_orphans().await?;
        debug!(
            owner,
            started = started.len(),
            stopped = stopped.len(),
            orphans = orphans.len(),
            used_memory_mb,
            "Reconciled owner view"
        );

        Ok(ReconciledView {
            started,
            stopped,
            orphans,
            used_memory_mb,
            free_memory_mb,
            quota_mb: self.quota_mb,
        })
    }

    /// Managed containers with no record under any owner. Surfaced so drift
    /// is visible rather than silently dropped.
    async fn find_orphans(&self) -> Result<Vec<String>> {
        let known: HashSet<String> = self.registry.all_names().await?.into_iter().collect();
        let mut orphans: Vec<String> = self
            .runtime
            .list_managed()
            .await?
            .into_iter()
            .filter(|name| !known.contains(name))
            .collect();
        orphans.sort();
        Ok(orphans)
    }
}
