//! Quorum health checks guarding destructive operations
//!
//! A shard keeps its ability to elect a leader only while a majority of its
//! electable members run. These checks refuse to take a member down when that
//! majority would be lost.

use std::time::Instant;

use futures::future::join_all;
use kvplane_admin::{NodeStatus, ServiceState};
use kvplane_topology::{NodeId, ShardId, Topology};
use tracing::{debug, info, warn};

use crate::context::PlanContext;
use crate::error::{PlanError, PlanResult};

/// Number of electable members configured in a shard
pub fn electable_factor(topology: &Topology, shard: ShardId) -> usize {
    topology.electable_nodes(shard).count()
}

/// Majority of `factor` electable members
pub fn quorum(factor: usize) -> usize {
    factor / 2 + 1
}

async fn statuses(ctx: &PlanContext, nodes: &[NodeId]) -> Vec<(NodeId, Option<NodeStatus>)> {
    join_all(nodes.iter().map(|node| async move {
        let status = match ctx.node_admin(*node).await {
            Ok(admin) => ctx.call(admin.ping()).await.ok(),
            Err(_) => None,
        };
        (*node, status)
    }))
    .await
}

fn is_running(status: Option<&NodeStatus>) -> bool {
    status.is_some_and(|s| s.state == ServiceState::Running)
}

/// Verify that the shard keeps a quorum without `exclude`.
///
/// Returns the electable replication factor. Shards with two or fewer
/// electable members are not checked; callers decide for them.
pub async fn verify_quorum(
    ctx: &PlanContext,
    topology: &Topology,
    shard: ShardId,
    exclude: Option<NodeId>,
) -> PlanResult<usize> {
    let factor = electable_factor(topology, shard);
    if factor <= 2 {
        return Ok(factor);
    }

    let quorum = quorum(factor);
    let others: Vec<NodeId> = topology
        .electable_nodes(shard)
        .map(|n| n.id())
        .filter(|id| Some(*id) != exclude)
        .collect();
    let running = statuses(ctx, &others)
        .await
        .iter()
        .filter(|(_, status)| is_running(status.as_ref()))
        .count();

    if running < quorum {
        return Err(PlanError::quorum(format!(
            "{shard} has {running} running members besides the target, quorum is {quorum} of {factor}"
        )));
    }
    debug!("{} keeps quorum: {} running, {} needed", shard, running, quorum);
    Ok(factor)
}

/// Wait until enough members besides `exclude` have caught up with the leader.
///
/// A shard of two data nodes and an arbiter waits for exactly one replica.
/// Returns `false` if interrupted.
pub async fn await_catch_up(
    ctx: &PlanContext,
    topology: &Topology,
    shard: ShardId,
    exclude: Option<NodeId>,
) -> PlanResult<bool> {
    let config = &ctx.config().health;
    let factor = electable_factor(topology, shard);
    if factor <= 1 {
        return Ok(true);
    }
    let needed = if factor == 2 && topology.arbiters(shard).next().is_some() {
        1
    } else {
        quorum(factor).min(factor - 1)
    };

    let others: Vec<NodeId> = topology
        .electable_nodes(shard)
        .map(|n| n.id())
        .filter(|id| Some(*id) != exclude)
        .collect();
    let deadline = Instant::now() + config.catch_up_timeout;
    loop {
        let caught_up = statuses(ctx, &others)
            .await
            .iter()
            .filter(|(_, status)| {
                status.as_ref().is_some_and(|s| {
                    s.state == ServiceState::Running
                        && s.replica_lag_ms.unwrap_or(u64::MAX) <= config.acceptable_lag_ms
                })
            })
            .count();
        if caught_up >= needed {
            debug!("{}: {} of {} members caught up", shard, caught_up, needed);
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Err(PlanError::quorum(format!(
                "{shard}: only {caught_up} members caught up within {:?}, {needed} needed",
                config.catch_up_timeout
            )));
        }
        if !ctx.sleep(config.poll_interval).await {
            return Ok(false);
        }
    }
}

/// Refuse to stop `node` when its shard would lose the ability to elect a
/// leader.
///
/// Shards of one electable member are refused unless `allow_override` is set.
/// Shards of two need a running arbiter and a running other data node.
pub async fn ensure_safe_to_stop(
    ctx: &PlanContext,
    topology: &Topology,
    node: NodeId,
    allow_override: bool,
) -> PlanResult<()> {
    if !node.is_electable() {
        return Ok(());
    }

    let factor = verify_quorum(ctx, topology, node.shard, Some(node)).await?;
    match factor {
        0 | 1 => {
            if allow_override {
                warn!("Stopping {}, the only electable member of {}", node, node.shard);
                Ok(())
            } else {
                Err(PlanError::quorum(format!(
                    "{} is the only electable member of {}",
                    node, node.shard
                )))
            }
        }
        2 => {
            if allow_override {
                warn!("Stopping {} in a two-node shard by override", node);
                return Ok(());
            }
            ensure_pair_survives(ctx, topology, node).await
        }
        _ => Ok(()),
    }
}

async fn ensure_pair_survives(ctx: &PlanContext, topology: &Topology, node: NodeId) -> PlanResult<()> {
    let config = &ctx.config().health;
    let other: Vec<NodeId> = topology
        .electable_nodes(node.shard)
        .map(|n| n.id())
        .filter(|id| *id != node)
        .collect();
    let arbiters: Vec<NodeId> = topology.arbiters(node.shard).map(|n| n.id()).collect();
    if arbiters.is_empty() {
        return Err(PlanError::quorum(format!(
            "{} has two electable members and no arbiter",
            node.shard
        )));
    }

    let attempts = config.arbiter_recheck_attempts.max(1);
    for attempt in 1..=attempts {
        let other_running = statuses(ctx, &other)
            .await
            .iter()
            .all(|(_, status)| is_running(status.as_ref()));
        let arbiter_running = statuses(ctx, &arbiters)
            .await
            .iter()
            .any(|(_, status)| is_running(status.as_ref()));
        if other_running && arbiter_running {
            info!("{} can stop: other data node and arbiter are running", node);
            return Ok(());
        }
        debug!(
            "{} not safe to stop (attempt {}/{}): other running {}, arbiter running {}",
            node, attempt, attempts, other_running, arbiter_running
        );
        if attempt < attempts && !ctx.sleep(config.arbiter_recheck_delay).await {
            break;
        }
    }
    Err(PlanError::quorum(format!(
        "stopping {} would leave {} without a running pair",
        node, node.shard
    )))
}
