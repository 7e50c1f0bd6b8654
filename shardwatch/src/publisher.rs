//! Write side of the availability protocol.
//!
//! Watchers that health-check the members of a resource group publish their view
//! here: the group state consumed by [`AvailabilityClient`](crate::AvailabilityClient),
//! one availability [`Snapshot`] per observer, and ephemeral registrations
//! that vanish with the observer's session.

use tracing::{debug, info, warn};

use crate::config::HaConfig;
use crate::consensus::{Partition, Snapshot, aggregate};
use crate::coordination::{Acl, CoordinationClient, CreateMode, child_path};
use crate::error::{PublishError, PublishResult};
use crate::state::ResourceGroupState;

/// Publishes group states and availability votes through one session.
pub struct AvailabilityPublisher<K: CoordinationClient> {
    client: K,
    base_path: String,
    acl: Acl,
}

impl<K: CoordinationClient> AvailabilityPublisher<K> {
    /// Wrap a connected session.
    ///
    /// Nodes are created creator-only when credentials are configured, open
    /// otherwise.
    pub fn new(client: K, config: &HaConfig) -> Self {
        let acl = if config.credentials().is_some() {
            Acl::CreatorAll
        } else {
            Acl::OpenUnsafe
        };
        Self {
            client,
            base_path: config.base_path.clone(),
            acl,
        }
    }

    /// The wrapped session.
    pub fn client(&self) -> &K {
        &self.client
    }

    /// ACL applied to nodes this publisher creates.
    pub fn acl(&self) -> Acl {
        self.acl
    }

    /// Store `state` as the group `name`, creating the node if needed.
    pub async fn publish(&self, name: &str, state: &ResourceGroupState) -> PublishResult<()> {
        let path = child_path(&self.base_path, name);
        let data = state.to_bytes()?;
        self.write(&path, &data).await?;
        info!(group = name, master = ?state.master, slaves = state.slaves.len(), "published group state");
        Ok(())
    }

    /// Create every path in `paths` along with missing ancestors, in order.
    pub async fn ensure_paths(&self, paths: &[String]) -> PublishResult<()> {
        for path in paths {
            self.client
                .mkdirp(path, self.acl, CreateMode::Persistent)
                .await?;
            debug!(%path, "path ensured");
        }
        Ok(())
    }

    /// Create an ephemeral node at `path` (and persistent ancestors).
    pub async fn register_ephemeral(&self, path: &str) -> PublishResult<()> {
        self.client
            .mkdirp(path, self.acl, CreateMode::Ephemeral)
            .await?;
        info!(%path, "registered ephemeral node");
        Ok(())
    }

    /// Store `observer`'s availability snapshot under `vote_path`.
    pub async fn publish_snapshot(
        &self,
        vote_path: &str,
        observer: &str,
        snapshot: &Snapshot,
    ) -> PublishResult<()> {
        let path = child_path(vote_path, observer);
        let data = serde_json::to_vec(snapshot)?;
        self.write(&path, &data).await?;
        debug!(
            %observer,
            available = snapshot.available.len(),
            unavailable = snapshot.unavailable.len(),
            "published availability snapshot"
        );
        Ok(())
    }

    /// Read every observer's snapshot under `vote_path`.
    ///
    /// Observers that registered but have not voted yet (empty node) are
    /// skipped.
    pub async fn collect_snapshots(&self, vote_path: &str) -> PublishResult<Vec<Snapshot>> {
        let observers = self.client.get_children(vote_path).await?;
        let mut snapshots = Vec::with_capacity(observers.len());
        for observer in observers {
            let path = child_path(vote_path, &observer);
            let data = match self.client.get_data(&path).await {
                Ok(data) => data,
                // Observer went away between listing and reading
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e.into()),
            };
            if data.is_empty() {
                continue;
            }
            let snapshot = serde_json::from_slice(&data)
                .map_err(|source| PublishError::Decode { path, source })?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    /// Collect all snapshots under `vote_path` and aggregate them.
    pub async fn reconcile(&self, vote_path: &str) -> PublishResult<Partition> {
        let snapshots = self.collect_snapshots(vote_path).await?;
        if snapshots.is_empty() {
            warn!(%vote_path, "no availability snapshots to reconcile");
        }
        Ok(aggregate(&snapshots))
    }

    async fn write(&self, path: &str, data: &[u8]) -> PublishResult<()> {
        match self.client.set_data(path, data).await {
            Err(e) if e.is_no_node() => {
                self.client
                    .mkdirp(path, self.acl, CreateMode::Persistent)
                    .await?;
                self.client.set_data(path, data).await?;
                Ok(())
            }
            result => Ok(result?),
        }
    }
}
