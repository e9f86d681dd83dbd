use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::utils::task_with_timeout;
use crate::utils::ErrorRecorder;
use crate::DiscoveryConfig;
use crate::DiscoveryError;
use crate::Result;
use crate::Settings;
use crate::SrvTopoServer;
use crate::TabletType;
use crate::Target;

/// Computes the serving target set of a cell.
pub struct TargetDiscovery {
    ts: Arc<dyn SrvTopoServer>,
    config: DiscoveryConfig,
    remote_operation_timeout: Duration,
}

impl TargetDiscovery {
    pub fn new(
        ts: Arc<dyn SrvTopoServer>,
        settings: &Settings,
    ) -> Self {
        Self {
            ts,
            config: settings.discovery.clone(),
            remote_operation_timeout: settings.topo.remote_operation_timeout(),
        }
    }

    /// Returns every `(cell, keyspace, shard, tablet_type)` served in `cell`
    /// for the requested tablet types. An empty `keyspaces` means all
    /// keyspaces of the cell.
    ///
    /// Keyspaces without a serving view are skipped. Any other per-keyspace
    /// failure fails the call once every probe has finished, with
    /// [`DiscoveryError::Aggregate`] carrying the targets that were found.
    /// The result is a set: its order carries no meaning.
    #[instrument(skip(self))]
    pub async fn find_all_targets(
        &self,
        cell: &str,
        keyspaces: &[String],
        tablet_types: &[TabletType],
    ) -> Result<Vec<Target>> {
        let keyspaces: BTreeSet<String> = if keyspaces.is_empty() {
            task_with_timeout(
                &format!("get keyspace names in cell {cell}"),
                self.remote_operation_timeout,
                self.ts.get_srv_keyspace_names(cell, self.config.stale_names_ok),
            )
            .await?
            .into_iter()
            .collect()
        } else {
            keyspaces.iter().cloned().collect()
        };
        let tablet_types: BTreeSet<TabletType> = tablet_types.iter().copied().collect();

        let targets = Mutex::new(Vec::new());
        let recorder = ErrorRecorder::default();

        stream::iter(keyspaces)
            .for_each_concurrent(self.config.concurrency_limit(), |keyspace| {
                let targets = &targets;
                let recorder = &recorder;
                let tablet_types = &tablet_types;
                async move {
                    let fetched = task_with_timeout(
                        &format!("get keyspace {keyspace} in cell {cell}"),
                        self.remote_operation_timeout,
                        self.ts.get_srv_keyspace(cell, &keyspace),
                    )
                    .await;

                    let srv_keyspace = match fetched {
                        Ok(srv_keyspace) => srv_keyspace,
                        Err(e) if e.is_no_node() => {
                            warn!("GetSrvKeyspace({}, {}) returned no node, skipping", cell, keyspace);
                            return;
                        }
                        Err(e) => {
                            warn!("GetSrvKeyspace({}, {}) failed: {}", cell, keyspace, e);
                            recorder.record(e);
                            return;
                        }
                    };

                    let found: Vec<Target> = srv_keyspace
                        .partitions
                        .iter()
                        .filter(|partition| tablet_types.contains(&partition.served_type))
                        .flat_map(|partition| {
                            partition.shard_references.iter().map(|shard| {
                                Target::new(cell, &keyspace, &shard.name, partition.served_type)
                            })
                        })
                        .collect();
                    debug!("keyspace {} serves {} target(s)", keyspace, found.len());
                    targets.lock().extend(found);
                }
            })
            .await;

        let targets = targets.into_inner();
        if recorder.has_errors() {
            return Err(DiscoveryError::Aggregate {
                targets,
                errors: recorder.into_errors(),
            }
            .into());
        }
        Ok(targets)
    }
}
