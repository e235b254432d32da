//! Propagation of topology and metadata changes to shard members
//!
//! A broadcast ships the artifact to every target that is behind, then keeps
//! retrying the targets that failed until enough of the population holds the
//! new version. Members exchange versions among themselves, so reaching the
//! threshold is enough for the change to spread everywhere eventually.

use std::cmp::Ordering;
use std::fmt;

use kvplane_admin::{MetadataUpdate, NodeAdmin, RemoteResult, ReplicaRole, TopologyUpdate};
use kvplane_topology::{ChangeInfo, Metadata, NodeId, ShardId, Topology};
use tracing::{debug, info, warn};

use crate::context::PlanContext;
use crate::error::PlanResult;

/// Number of targets that must be updated, and how many may fail.
///
/// `threshold = max(1, floor(population * percent / 100))`.
pub fn threshold(population: usize, percent: u8) -> (usize, usize) {
    let threshold = (population * usize::from(percent) / 100).max(1);
    (threshold, population.saturating_sub(threshold))
}

/// What is being shipped
#[derive(Clone, Copy)]
enum Artifact<'a> {
    Topology(&'a Topology),
    Metadata {
        metadata: &'a Metadata,
        topology: &'a Topology,
    },
}

/// A member or a shard, resolved to its representative on every attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Node(NodeId),
    Shard(ShardId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Node(node) => fmt::Display::fmt(node, f),
            Target::Shard(shard) => fmt::Display::fmt(shard, f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Current,
    Updated,
    Stale,
    Failed,
}

impl Artifact<'_> {
    fn sequence_number(&self) -> u64 {
        match self {
            Artifact::Topology(topology) => topology.sequence_number(),
            Artifact::Metadata { metadata, .. } => metadata.sequence_number(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Artifact::Topology(_) => "topology".to_string(),
            Artifact::Metadata { metadata, .. } => format!("{} metadata", metadata.kind()),
        }
    }

    async fn sequence_number_of(&self, admin: &dyn NodeAdmin) -> RemoteResult<u64> {
        match self {
            Artifact::Topology(_) => admin.topology_seq_num().await,
            Artifact::Metadata { metadata, .. } => admin.metadata_seq_num(metadata.kind()).await,
        }
    }

    async fn send(&self, admin: &dyn NodeAdmin, from_seq: u64) -> RemoteResult<u64> {
        match self {
            Artifact::Topology(topology) => {
                let update = match topology.changes_since(from_seq) {
                    Some(changes) => TopologyUpdate::Delta(changes),
                    None => TopologyUpdate::Full(Box::new((*topology).clone())),
                };
                admin.update_topology(update).await
            }
            Artifact::Metadata { metadata, .. } => {
                let update = match metadata.change_info(from_seq) {
                    ChangeInfo::Delta(changes) => MetadataUpdate::Delta(changes),
                    ChangeInfo::Insufficient => MetadataUpdate::Full(Box::new((*metadata).clone())),
                };
                admin.update_metadata(metadata.kind(), update).await
            }
        }
    }
}

/// Broadcast a topology to every data node.
///
/// Returns `false` if interrupted before enough nodes were updated.
pub async fn broadcast_topology(ctx: &PlanContext, topology: &Topology) -> PlanResult<bool> {
    let targets = topology
        .data_nodes()
        .map(|n| Target::Node(n.id()))
        .collect();
    broadcast(ctx, Artifact::Topology(topology), targets).await
}

/// Broadcast metadata to one member of every shard.
///
/// Returns `false` if interrupted before enough shards were updated.
pub async fn broadcast_metadata(
    ctx: &PlanContext,
    topology: &Topology,
    metadata: &Metadata,
) -> PlanResult<bool> {
    let targets = topology.shards().map(|s| Target::Shard(s.id)).collect();
    broadcast(ctx, Artifact::Metadata { metadata, topology }, targets).await
}

async fn broadcast(
    ctx: &PlanContext,
    artifact: Artifact<'_>,
    targets: Vec<Target>,
) -> PlanResult<bool> {
    if targets.is_empty() {
        debug!("No targets for {} broadcast", artifact.describe());
        return Ok(true);
    }

    let config = &ctx.config().broadcast;
    let (threshold, acceptable_failures) = threshold(targets.len(), config.threshold_percent);
    debug!(
        "Broadcasting {} {} to {} targets, threshold {}",
        artifact.describe(),
        artifact.sequence_number(),
        targets.len(),
        threshold
    );

    let mut failing = targets;
    loop {
        let mut still_failing = Vec::new();
        for target in failing {
            match ship(ctx, artifact, target).await {
                Outcome::Stale => {
                    info!(
                        "{} holds newer {} than {}, ending broadcast",
                        target,
                        artifact.describe(),
                        artifact.sequence_number()
                    );
                    return Ok(true);
                }
                Outcome::Failed => still_failing.push(target),
                Outcome::Current | Outcome::Updated => {}
            }
        }

        if still_failing.len() <= acceptable_failures {
            return Ok(true);
        }

        warn!(
            "{} broadcast: {} targets failed, {} acceptable; retrying",
            artifact.describe(),
            still_failing.len(),
            acceptable_failures
        );
        if !ctx.sleep(config.retry_delay).await {
            info!("{} broadcast interrupted", artifact.describe());
            return Ok(false);
        }
        ctx.registry().refresh().await;
        failing = still_failing;
    }
}

async fn ship(ctx: &PlanContext, artifact: Artifact<'_>, target: Target) -> Outcome {
    let node = match target {
        Target::Node(node) => node,
        Target::Shard(shard) => {
            let Artifact::Metadata { topology, .. } = artifact else {
                return Outcome::Failed;
            };
            match representative(ctx, topology, shard).await {
                Some(node) => node,
                None => {
                    debug!("No responsive member in {}", shard);
                    return Outcome::Failed;
                }
            }
        }
    };

    let admin = match ctx.node_admin(node).await {
        Ok(admin) => admin,
        Err(e) => {
            debug!("Cannot reach {}: {}", node, e);
            return Outcome::Failed;
        }
    };

    let seq = match ctx.call(artifact.sequence_number_of(admin.as_ref())).await {
        Ok(seq) => seq,
        Err(e) => {
            debug!("{} did not report its {} version: {}", node, artifact.describe(), e);
            return Outcome::Failed;
        }
    };

    match seq.cmp(&artifact.sequence_number()) {
        Ordering::Equal => Outcome::Current,
        Ordering::Greater => Outcome::Stale,
        Ordering::Less => match ctx.call(artifact.send(admin.as_ref(), seq)).await {
            Ok(_) => Outcome::Updated,
            Err(e) => {
                debug!("Failed to update {} on {}: {}", artifact.describe(), node, e);
                Outcome::Failed
            }
        },
    }
}

/// The shard leader, or any running data node when no leader answers
async fn representative(ctx: &PlanContext, topology: &Topology, shard: ShardId) -> Option<NodeId> {
    let mut responsive = None;
    for node in topology.electable_nodes(shard) {
        let Ok(admin) = ctx.node_admin(node.id()).await else {
            continue;
        };
        match ctx.call(admin.ping()).await {
            Ok(status) if status.state.is_running() => {
                if status.role == ReplicaRole::Leader {
                    return Some(node.id());
                }
                responsive.get_or_insert(node.id());
            }
            _ => {}
        }
    }
    responsive
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_math() {
        assert_eq!(threshold(7, 60), (4, 3));
        assert_eq!(threshold(3, 100), (3, 0));
        assert_eq!(threshold(1, 10), (1, 0));
        assert_eq!(threshold(10, 0), (1, 9));
    }
}
