//! Replication group membership changes
//!
//! Membership changes are committed by the group's leader, so they are sent
//! through any other member that can forward them. A member answering that the
//! group has no leader is evidence of an election in progress; only then is
//! the sweep repeated.

use kvplane_admin::{MemberAddress, MembershipReply};
use kvplane_topology::{NodeId, Topology};
use tracing::{debug, info, warn};

use crate::context::PlanContext;
use crate::error::{PlanError, PlanResult};

#[derive(Debug, Clone, Copy)]
enum MembershipOp<'a> {
    ChangeAddress(&'a str),
    Remove,
}

/// Ask the group to record a new address for `node`.
///
/// Returns `false` if interrupted while the group had no leader.
pub async fn change_address(
    ctx: &PlanContext,
    topology: &Topology,
    node: NodeId,
    host_port: &str,
) -> PlanResult<bool> {
    run(ctx, topology, node, MembershipOp::ChangeAddress(host_port)).await
}

/// Ask the group to drop `node`.
///
/// Returns `false` if interrupted while the group had no leader.
pub async fn remove_member(ctx: &PlanContext, topology: &Topology, node: NodeId) -> PlanResult<bool> {
    run(ctx, topology, node, MembershipOp::Remove).await
}

async fn run(
    ctx: &PlanContext,
    topology: &Topology,
    node: NodeId,
    op: MembershipOp<'_>,
) -> PlanResult<bool> {
    let peers: Vec<NodeId> = topology
        .nodes_in_shard(node.shard)
        .map(|n| n.id())
        .filter(|id| *id != node)
        .collect();
    if peers.is_empty() {
        debug!("{} has no peers, nothing to change in its group", node);
        return Ok(true);
    }

    let config = &ctx.config().membership;
    let mut sweeps = 0u32;
    loop {
        let mut no_leader = false;
        for peer in &peers {
            let admin = match ctx.node_admin(*peer).await {
                Ok(admin) => admin,
                Err(e) => {
                    debug!("Cannot reach {}: {}", peer, e);
                    continue;
                }
            };
            let reply = match op {
                MembershipOp::ChangeAddress(host_port) => {
                    ctx.call(admin.update_member_address(node, host_port)).await
                }
                MembershipOp::Remove => ctx.call(admin.remove_member(node)).await,
            };
            match reply {
                Ok(MembershipReply::Applied) => {
                    info!("{} applied {:?} for {}", peer, op, node);
                    return Ok(true);
                }
                Ok(MembershipReply::NoLeader) => {
                    debug!("{} reports no leader in {}", peer, node.shard);
                    no_leader = true;
                }
                Err(e) => debug!("{:?} for {} failed on {}: {}", op, node, peer, e),
            }
        }

        if !no_leader {
            return Err(PlanError::remote(format!(
                "no member of {} accepted {:?} for {}",
                node.shard, op, node
            )));
        }

        sweeps += 1;
        if config.max_sweeps.is_some_and(|max| sweeps >= max) {
            return Err(PlanError::quorum(format!(
                "{} had no leader after {} sweeps",
                node.shard, sweeps
            )));
        }

        warn!("{} has no leader, retrying {:?} for {}", node.shard, op, node);
        if !ctx.sleep(config.retry_delay).await {
            return Ok(false);
        }
        ctx.registry().refresh().await;
    }
}

/// Where the replication group believes a member lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveAddress {
    /// The address the group has recorded
    Known(String),
    /// The group does not list the member
    NotMember,
    /// Every member that answered reported no leader
    NoLeader,
    /// No member answered
    Unknown,
}

/// Ask the members of `node`'s group, including `node` itself, for its address
pub async fn member_address(ctx: &PlanContext, topology: &Topology, node: NodeId) -> LiveAddress {
    let mut not_member = false;
    let mut no_leader = false;
    for member in topology.nodes_in_shard(node.shard) {
        let Ok(admin) = ctx.node_admin(member.id()).await else {
            continue;
        };
        match ctx.call(admin.member_address(node)).await {
            Ok(MemberAddress::Known(host_port)) => return LiveAddress::Known(host_port),
            Ok(MemberAddress::NotMember) => not_member = true,
            Ok(MemberAddress::NoLeader) => no_leader = true,
            Err(e) => debug!("{} did not answer address query for {}: {}", member.id(), node, e),
        }
    }
    if not_member {
        LiveAddress::NotMember
    } else if no_leader {
        LiveAddress::NoLeader
    } else {
        LiveAddress::Unknown
    }
}
