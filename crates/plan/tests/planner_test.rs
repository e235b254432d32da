//! Planner admission, execution, failure reports and recovery

use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{TestCluster, fast_config, ha_address};

use assert_matches::assert_matches;
use kvplane_admin::{Admin, ServiceState};
use kvplane_admin_mock::{MonitorEvent, RecordingMonitor};
use kvplane_plan::task::{
    AddNode, AddShard, BroadcastTopology, ChangeNodeAddress, RelocateNode, RemoveNode, StopNode,
    WaitForNodeState,
};
use kvplane_plan::{
    CleanupStatus, FaultKind, FaultPoint, Plan, PlanState, PlanStep, Planner, ScriptedFaults,
    TaskKind, TaskState,
};
use kvplane_topology::codec::encode;
use kvplane_topology::{ComponentId, NodeId, ShardId, StorageNodeId};

async fn approved(planner: &Planner, name: &str, steps: Vec<PlanStep>) -> u64 {
    let id = planner.create_plan(name, steps).await.unwrap();
    planner.approve(id).await.unwrap();
    id
}

fn grow_shard() -> Vec<PlanStep> {
    vec![
        PlanStep::task(TaskKind::AddNode(AddNode {
            node: NodeId::data(1, 4),
            storage_node: StorageNodeId(4),
            ha_host_port: ha_address(4),
        })),
        PlanStep::task(TaskKind::BroadcastTopology(BroadcastTopology)),
    ]
}

#[tokio::test]
#[tracing_test::traced_test]
async fn rerunning_a_completed_change_does_nothing() {
    let test = TestCluster::builder(1, 3).with_spare_storage_nodes(1).build();
    let monitor = Arc::new(RecordingMonitor::new());
    let planner = test.planner().with_monitor(monitor.clone());

    let first = approved(&planner, "grow", grow_shard()).await;
    assert_eq!(planner.execute(first).await.unwrap(), PlanState::Succeeded);
    assert_eq!(test.admin.topology_saves(), 1);
    let full_updates = test.cluster.total_calls().full_topology_updates;
    assert_eq!(full_updates, 4);
    assert!(monitor.is_registered(ComponentId::Node(NodeId::data(1, 4))));

    let second = approved(&planner, "grow again", grow_shard()).await;
    assert_eq!(planner.execute(second).await.unwrap(), PlanState::Succeeded);

    assert_eq!(test.admin.topology_saves(), 1);
    assert_eq!(test.cluster.total_calls().full_topology_updates, full_updates);
    assert_eq!(test.cluster.total_calls().delta_topology_updates, 0);
    assert_eq!(planner.held_locks(), 0);
    let plan = planner.plan(second).unwrap();
    assert_eq!(plan.runs().len(), 1);
    assert!(
        plan.runs()[0]
            .task_runs
            .iter()
            .all(|r| r.state == TaskState::Succeeded)
    );
}

#[tokio::test]
async fn plans_must_be_approved_and_cannot_run_once_canceled() {
    let test = TestCluster::three_nodes();
    let planner = test.planner();
    let steps = vec![PlanStep::task(TaskKind::AddShard(AddShard {
        shard: ShardId(2),
    }))];

    let id = planner.create_plan("shard", steps).await.unwrap();
    assert_eq!(id, 1);
    assert_eq!(planner.state(id).unwrap(), PlanState::Pending);
    let err = planner.execute(id).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::InvalidState);

    planner.cancel(id).await.unwrap();
    let err = planner.execute(id).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::InvalidState);
    assert_eq!(planner.state(id).unwrap(), PlanState::Canceled);
    assert!(test.admin.load_plan_record(id).await.unwrap().is_some());

    let err = planner.approve(42).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::InvalidState);
}

#[tokio::test]
async fn duplicate_work_is_refused_while_a_plan_may_run() {
    let test = TestCluster::three_nodes();
    let planner = test.planner();
    let add_shard = || {
        vec![PlanStep::task(TaskKind::AddShard(AddShard {
            shard: ShardId(2),
        }))]
    };

    let first = approved(&planner, "first", add_shard()).await;
    let err = planner.create_plan("second", add_shard()).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::InvalidState);

    planner.execute(first).await.unwrap();
    let second = planner.create_plan("second", add_shard()).await.unwrap();
    assert_eq!(second, 2);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn overlapping_plans_are_refused_until_the_holder_ends() {
    let test = TestCluster::three_nodes();
    test.cluster.set_group_leader(ShardId(1), false);
    let planner = Arc::new(test.planner());

    let holder = approved(
        &planner,
        "move address",
        vec![PlanStep::task(TaskKind::ChangeNodeAddress(ChangeNodeAddress {
            node: NodeId::data(1, 1),
            new_ha_host_port: "host1:6011".to_string(),
        }))],
    )
    .await;
    let blocked = approved(
        &planner,
        "stop",
        vec![PlanStep::task(TaskKind::StopNode(StopNode {
            node: NodeId::data(1, 1),
            allow_override: false,
        }))],
    )
    .await;

    let running = planner.clone();
    let handle = tokio::spawn(async move { running.execute(holder).await });
    tokio::time::timeout(Duration::from_secs(5), async {
        while planner.held_locks() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let err = planner.execute(blocked).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::LockConflict);
    assert_eq!(planner.state(blocked).unwrap(), PlanState::Approved);
    assert!(logs_contain("is locked by plan-1"));

    planner.interrupt(holder).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, PlanState::Interrupted);
    let report = planner.failure_report(holder).unwrap().unwrap();
    assert_eq!(report.fault, FaultKind::Interrupted);
    assert_eq!(report.cleanup, CleanupStatus::Exhausted);
    assert_eq!(planner.held_locks(), 0);

    assert_eq!(planner.execute(blocked).await.unwrap(), PlanState::Succeeded);
    assert_eq!(
        test.cluster.node_state(NodeId::data(1, 1)),
        Some(ServiceState::Stopped)
    );
}

#[tokio::test]
#[tracing_test::traced_test]
async fn failed_plan_reports_and_runs_again() {
    let test = TestCluster::three_nodes();
    let faults = Arc::new(ScriptedFaults::new().fail_once(FaultPoint::AfterStop, FaultKind::Remote));
    let planner = test.planner().with_faults(faults.clone());
    let node = NodeId::data(1, 3);

    let id = approved(
        &planner,
        "shrink",
        vec![PlanStep::task(TaskKind::RemoveNode(RemoveNode { node }))],
    )
    .await;

    assert_eq!(planner.execute(id).await.unwrap(), PlanState::Error);
    let report = planner.failure_report(id).unwrap().unwrap();
    assert_eq!(report.task, "RemoveNode(rg1-rn3)");
    assert_eq!(report.fault, FaultKind::Remote);
    assert_eq!(report.cleanup, CleanupStatus::Completed);
    assert_eq!(faults.pending(), 0);
    assert!(test.current_topology().await.node(node).is_some());
    assert_eq!(test.cluster.node_state(node), Some(ServiceState::Running));

    assert_eq!(planner.execute(id).await.unwrap(), PlanState::Succeeded);
    let plan = planner.plan(id).unwrap();
    assert_eq!(plan.runs().len(), 2);
    assert_eq!(plan.runs()[1].attempt, 2);
    assert_eq!(planner.failure_report(id).unwrap(), None);
    assert!(test.current_topology().await.node(node).is_none());
}

#[tokio::test]
async fn relocation_saved_before_failure_is_broadcast_on_rerun() {
    let test = TestCluster::builder(1, 3).with_spare_storage_nodes(1).build();
    let faults = Arc::new(ScriptedFaults::new().fail_once(FaultPoint::AfterSave, FaultKind::Remote));
    let planner = test.planner().with_faults(faults);
    let node = NodeId::data(1, 2);

    let id = approved(
        &planner,
        "move",
        vec![PlanStep::task(TaskKind::RelocateNode(RelocateNode {
            node,
            old_sn: StorageNodeId(2),
            new_sn: StorageNodeId(4),
            new_ha_host_port: ha_address(4),
        }))],
    )
    .await;

    assert_eq!(planner.execute(id).await.unwrap(), PlanState::Error);
    assert_eq!(test.admin.topology_saves(), 1);

    assert_eq!(planner.execute(id).await.unwrap(), PlanState::Succeeded);
    let topology = test.current_topology().await;
    assert_eq!(topology.node(node).unwrap().storage_node(), StorageNodeId(4));
    for member in 1..=3 {
        assert_eq!(
            test.cluster.node_topology_seq(NodeId::data(1, member)),
            topology.sequence_number()
        );
    }
    assert_eq!(test.cluster.node_state(node), Some(ServiceState::Running));
    assert!(test.cluster.agent_config(StorageNodeId(2), node).is_none());
}

#[tokio::test]
async fn removal_saved_before_failure_finishes_on_rerun() {
    let test = TestCluster::three_nodes();
    let faults = Arc::new(ScriptedFaults::new().fail_once(FaultPoint::AfterSave, FaultKind::Remote));
    let monitor = Arc::new(RecordingMonitor::new());
    let planner = test
        .planner()
        .with_faults(faults)
        .with_monitor(monitor.clone());
    let node = NodeId::data(1, 3);

    let id = approved(
        &planner,
        "shrink",
        vec![PlanStep::task(TaskKind::RemoveNode(RemoveNode { node }))],
    )
    .await;

    assert_eq!(planner.execute(id).await.unwrap(), PlanState::Error);
    assert!(test.current_topology().await.node(node).is_none());

    assert_eq!(planner.execute(id).await.unwrap(), PlanState::Succeeded);
    let topology = test.current_topology().await;
    for member in 1..=2 {
        assert_eq!(
            test.cluster.node_topology_seq(NodeId::data(1, member)),
            topology.sequence_number()
        );
    }
    assert!(test.cluster.agent_config(StorageNodeId(3), node).is_none());
    assert!(test.current_parameters().await.node(node).is_none());
    assert!(
        monitor
            .events()
            .contains(&MonitorEvent::Unregister(ComponentId::Node(node)))
    );
    assert_eq!(test.admin.topology_saves(), 1);
}

#[tokio::test]
async fn lenient_tasks_do_not_end_the_plan() {
    let test = TestCluster::three_nodes();
    test.cluster.set_reachable(NodeId::data(1, 3), false);
    let planner = test.planner();

    let id = approved(
        &planner,
        "wait",
        vec![
            PlanStep::lenient(TaskKind::WaitForNodeState(WaitForNodeState {
                node: NodeId::data(1, 3),
                target: ServiceState::Running,
                timeout: Duration::from_millis(30),
            })),
            PlanStep::task(TaskKind::AddShard(AddShard { shard: ShardId(2) })),
        ],
    )
    .await;

    assert_eq!(planner.execute(id).await.unwrap(), PlanState::Succeeded);
    let plan = planner.plan(id).unwrap();
    let run = plan.last_run().unwrap();
    let waited = run.task_run("WaitForNodeState(rg1-rn3 Running)").unwrap();
    assert_eq!(waited.state, TaskState::Error);
    assert_eq!(waited.fault, Some(FaultKind::Remote));
    assert_eq!(waited.cleanup, CleanupStatus::NotNeeded);
    assert!(run.failure.is_none());
    assert!(test.current_topology().await.shard(ShardId(2)).is_some());
}

#[tokio::test]
async fn parallel_waits_share_a_single_worker() {
    let test = TestCluster::three_nodes();
    let node = NodeId::data(1, 2);
    test.cluster.set_state(node, ServiceState::Stopped);
    let mut config = fast_config();
    config.executor.pool_size = 1;
    let planner = Planner::new(test.admin.clone(), test.cluster.clone(), config);

    let waits = (1..=3).map(|n| {
        TaskKind::WaitForNodeState(WaitForNodeState {
            node: NodeId::data(1, n),
            target: ServiceState::Running,
            timeout: Duration::from_secs(5),
        })
    });
    let id = approved(&planner, "wait", vec![PlanStep::parallel(waits)]).await;

    let cluster = test.cluster.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cluster.set_state(node, ServiceState::Running);
    });

    assert_eq!(planner.execute(id).await.unwrap(), PlanState::Succeeded);
    let plan = planner.plan(id).unwrap();
    assert_eq!(plan.last_run().unwrap().task_runs.len(), 3);
}

#[tokio::test]
async fn parallel_failure_ends_the_plan() {
    let test = TestCluster::three_nodes();
    test.cluster.set_reachable(NodeId::data(1, 2), false);
    let planner = test.planner();

    let waits = (1..=3).map(|n| {
        TaskKind::WaitForNodeState(WaitForNodeState {
            node: NodeId::data(1, n),
            target: ServiceState::Running,
            timeout: Duration::from_millis(30),
        })
    });
    let id = approved(
        &planner,
        "wait",
        vec![
            PlanStep::parallel(waits),
            PlanStep::task(TaskKind::AddShard(AddShard { shard: ShardId(2) })),
        ],
    )
    .await;

    assert_eq!(planner.execute(id).await.unwrap(), PlanState::Error);
    let report = planner.failure_report(id).unwrap().unwrap();
    assert_eq!(report.task, "WaitForNodeState(rg1-rn2 Running)");
    assert_eq!(report.fault, FaultKind::Remote);
    assert!(test.current_topology().await.shard(ShardId(2)).is_none());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn recovery_marks_running_plans_interrupted() {
    let test = TestCluster::three_nodes();
    let steps = vec![PlanStep::task(TaskKind::AddShard(AddShard {
        shard: ShardId(2),
    }))];
    let mut running = Plan::new(5, "shard", steps);
    running.transition(PlanState::Approved).unwrap();
    running.begin_run().unwrap();
    test.admin
        .save_plan_record(5, encode(&running).unwrap())
        .await
        .unwrap();
    let pending = Plan::new(3, "pending", Vec::new());
    test.admin
        .save_plan_record(3, encode(&pending).unwrap())
        .await
        .unwrap();

    let planner = test.planner();
    assert_eq!(planner.recover().await.unwrap(), 2);
    assert_eq!(planner.state(5).unwrap(), PlanState::Interrupted);
    assert_eq!(planner.state(3).unwrap(), PlanState::Pending);
    assert_matches!(
        planner.plan(5).unwrap().last_run(),
        Some(run) if run.outcome == PlanState::Interrupted
    );

    let next = planner.create_plan("next", Vec::new()).await.unwrap();
    assert_eq!(next, 6);

    assert_eq!(planner.execute(5).await.unwrap(), PlanState::Succeeded);
    assert_eq!(planner.plan(5).unwrap().runs().len(), 2);
    assert!(test.current_topology().await.shard(ShardId(2)).is_some());
}
