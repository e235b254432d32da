//! Task idempotence, topology repair and cleanup jobs

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod common;
use common::{TestCluster, fast_config, ha_address};

use assert_matches::assert_matches;
use kvplane_admin::{Admin, ServiceState};
use kvplane_admin_mock::{MonitorEvent, RecordingMonitor};
use kvplane_plan::remedy::{self, Remedy};
use kvplane_plan::task::{
    AddNode, AddShard, AddStorageNode, AddUser, AlterTable, AssignPartitions, ChangeNodeAddress,
    CreateTable, DropTable, RelocateNode, RemoveNode, RemoveUser, StartNode, StopNode,
    UpdateNodeParams, WaitForNodeState,
};
use kvplane_plan::{CleanupJob, CleanupStatus, FaultKind, NextJob, Task, TaskState};
use kvplane_topology::{
    ComponentId, FieldDef, MetadataKind, NodeId, PartitionId, ShardId, StorageNodeId, TableDef,
    UserDef,
};
use tokio_util::sync::CancellationToken;

fn users_table() -> TableDef {
    TableDef {
        name: "users".to_string(),
        fields: vec![
            FieldDef {
                name: "id".to_string(),
                field_type: "LONG".to_string(),
                nullable: false,
            },
            FieldDef {
                name: "email".to_string(),
                field_type: "STRING".to_string(),
                nullable: true,
            },
        ],
        primary_key: vec!["id".to_string()],
        description: None,
    }
}

#[tokio::test]
#[tracing_test::traced_test]
async fn add_node_twice_changes_topology_once() {
    let test = TestCluster::builder(1, 3).with_spare_storage_nodes(1).build();
    let monitor = Arc::new(RecordingMonitor::new());
    let ctx = test.context().with_monitor(monitor.clone());
    let node = NodeId::data(1, 4);
    let task = AddNode {
        node,
        storage_node: StorageNodeId(4),
        ha_host_port: ha_address(4),
    };

    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));
    let after_first = test.current_topology().await;
    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));

    assert_eq!(test.admin.topology_saves(), 1);
    assert_eq!(test.current_topology().await, after_first);
    assert_eq!(test.cluster.node_state(node), Some(ServiceState::Running));
    assert!(test.cluster.agent_config(StorageNodeId(4), node).is_some());
    assert!(monitor.is_registered(ComponentId::Node(node)));
}

#[tokio::test]
async fn add_node_on_another_storage_node_is_refused() {
    let test = TestCluster::builder(1, 3).with_spare_storage_nodes(1).build();
    let ctx = test.context();

    let err = AddNode {
        node: NodeId::data(1, 2),
        storage_node: StorageNodeId(4),
        ha_host_port: ha_address(4),
    }
    .execute(&ctx)
    .await
    .unwrap_err();

    assert_eq!(err.kind(), FaultKind::InvalidState);
    assert_eq!(test.admin.topology_saves(), 0);
}

#[tokio::test]
async fn layout_tasks_are_idempotent() {
    let test = TestCluster::three_nodes();
    let ctx = test.context();
    let add_sn = AddStorageNode {
        sn: StorageNodeId(9),
        host: "host9".to_string(),
        port: 5000,
        root_dir: "/var/kvstore/sn9".to_string(),
    };
    let add_shard = AddShard { shard: ShardId(2) };
    let assign = AssignPartitions {
        shard: ShardId(1),
        partitions: vec![PartitionId(1), PartitionId(2)],
    };

    for _ in 0..2 {
        assert_matches!(add_sn.execute(&ctx).await, Ok(TaskState::Succeeded));
        assert_matches!(add_shard.execute(&ctx).await, Ok(TaskState::Succeeded));
        assert_matches!(assign.execute(&ctx).await, Ok(TaskState::Succeeded));
    }

    assert_eq!(test.admin.topology_saves(), 3);
    let topology = test.current_topology().await;
    assert!(topology.storage_node(StorageNodeId(9)).is_some());
    assert!(topology.shard(ShardId(2)).is_some());
    assert_eq!(topology.partitions_of(ShardId(1)).count(), 2);
    assert!(
        test.current_parameters()
            .await
            .storage_node(StorageNodeId(9))
            .is_some()
    );
    assert_eq!(
        test.cluster.node_topology_seq(NodeId::data(1, 1)),
        topology.sequence_number()
    );
}

#[tokio::test]
async fn partitions_move_between_shards() {
    let test = TestCluster::builder(2, 3).build();
    let ctx = test.context();

    AssignPartitions {
        shard: ShardId(1),
        partitions: vec![PartitionId(7)],
    }
    .execute(&ctx)
    .await
    .unwrap();
    AssignPartitions {
        shard: ShardId(2),
        partitions: vec![PartitionId(7)],
    }
    .execute(&ctx)
    .await
    .unwrap();

    let topology = test.current_topology().await;
    assert_eq!(topology.partition(PartitionId(7)).unwrap().shard, ShardId(2));
    assert_eq!(test.admin.topology_saves(), 2);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn remove_node_twice() {
    let test = TestCluster::three_nodes();
    let ctx = test.context();
    let node = NodeId::data(1, 3);
    let task = RemoveNode { node };

    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));
    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));

    assert_eq!(test.admin.topology_saves(), 1);
    assert!(test.current_topology().await.node(node).is_none());
    assert!(test.current_parameters().await.node(node).is_none());
    assert_eq!(test.cluster.member_address_of(node), None);
    assert!(test.cluster.agent_config(StorageNodeId(3), node).is_none());
    assert_eq!(task.cleanup_job(), Some(CleanupJob::RepairNode(node)));
}

#[tokio::test]
async fn remove_node_refused_without_quorum() {
    let test = TestCluster::three_nodes();
    test.cluster.set_reachable(NodeId::data(1, 2), false);
    let ctx = test.context();

    let err = RemoveNode {
        node: NodeId::data(1, 3),
    }
    .execute(&ctx)
    .await
    .unwrap_err();

    assert_eq!(err.kind(), FaultKind::Quorum);
    assert_eq!(test.cluster.agent_stops(StorageNodeId(3)), 0);
    assert_eq!(test.admin.topology_saves(), 0);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn relocate_node_twice() {
    let test = TestCluster::builder(1, 3).with_spare_storage_nodes(1).build();
    let ctx = test.context();
    let node = NodeId::data(1, 2);
    let task = RelocateNode {
        node,
        old_sn: StorageNodeId(2),
        new_sn: StorageNodeId(4),
        new_ha_host_port: ha_address(4),
    };

    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));
    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));

    assert_eq!(test.admin.topology_saves(), 1);
    let topology = test.current_topology().await;
    assert_eq!(topology.node(node).unwrap().storage_node(), StorageNodeId(4));
    let params = test.current_parameters().await;
    assert_eq!(params.node(node).unwrap().ha_host_port, ha_address(4));
    assert_eq!(test.cluster.node_storage_node(node), Some(StorageNodeId(4)));
    assert_eq!(test.cluster.member_address_of(node), Some(ha_address(4)));
    assert!(test.cluster.agent_config(StorageNodeId(2), node).is_none());
}

#[tokio::test]
async fn change_node_address_twice() {
    let test = TestCluster::three_nodes();
    let ctx = test.context();
    let node = NodeId::data(1, 1);
    let task = ChangeNodeAddress {
        node,
        new_ha_host_port: "host1:6011".to_string(),
    };

    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));
    let calls = test.cluster.total_calls().membership_calls;
    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));

    assert_eq!(test.cluster.total_calls().membership_calls, calls);
    assert_eq!(
        test.cluster.member_address_of(node).as_deref(),
        Some("host1:6011")
    );
    assert_eq!(
        test.cluster
            .agent_config(StorageNodeId(1), node)
            .unwrap()
            .ha_host_port,
        "host1:6011"
    );
}

#[tokio::test]
async fn change_node_address_needs_quorum() {
    let test = TestCluster::builder(1, 5).build();
    for n in 1..=3 {
        test.cluster.set_state(NodeId::data(1, n), ServiceState::Stopped);
    }
    let ctx = test.context();
    let node = NodeId::data(1, 5);

    let err = ChangeNodeAddress {
        node,
        new_ha_host_port: "host5:6011".to_string(),
    }
    .execute(&ctx)
    .await
    .unwrap_err();

    assert_eq!(err.kind(), FaultKind::Quorum);
    assert_eq!(test.cluster.total_calls().membership_calls, 0);
    assert_eq!(test.cluster.member_address_of(node), Some(ha_address(5)));
}

#[tokio::test]
async fn stop_and_start_node() {
    let test = TestCluster::three_nodes();
    let ctx = test.context();
    let node = NodeId::data(1, 1);

    let stop = StopNode {
        node,
        allow_override: false,
    };
    assert_matches!(stop.execute(&ctx).await, Ok(TaskState::Succeeded));
    assert_matches!(stop.execute(&ctx).await, Ok(TaskState::Succeeded));
    assert_eq!(test.cluster.node_state(node), Some(ServiceState::Stopped));
    assert!(test.current_parameters().await.node(node).unwrap().disabled);
    assert_eq!(stop.cleanup_job(), Some(CleanupJob::ReenableNode(node)));

    assert_matches!(StartNode { node }.execute(&ctx).await, Ok(TaskState::Succeeded));
    assert_eq!(test.cluster.node_state(node), Some(ServiceState::Running));
    assert!(!test.current_parameters().await.node(node).unwrap().disabled);
}

#[tokio::test]
async fn wait_for_node_state_counts_unreachable_as_stopped() {
    let test = TestCluster::three_nodes();
    let ctx = test.context();
    let node = NodeId::data(1, 2);
    test.cluster.set_reachable(node, false);

    let task = WaitForNodeState {
        node,
        target: ServiceState::Stopped,
        timeout: Duration::from_secs(1),
    };
    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));

    let task = WaitForNodeState {
        node,
        target: ServiceState::Running,
        timeout: Duration::from_millis(50),
    };
    assert_matches!(
        task.step(&ctx, Instant::now()).await,
        Ok(NextJob::RetryAfter(_))
    );
    let err = task.execute(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), FaultKind::Remote);
}

#[tokio::test]
async fn update_node_params_pushes_to_agent_and_node() {
    let test = TestCluster::three_nodes();
    let ctx = test.context();
    let node = NodeId::data(1, 1);
    let changes = BTreeMap::from([("cache_size".to_string(), "512MB".to_string())]);
    let task = UpdateNodeParams {
        node,
        changes: changes.clone(),
    };

    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));
    assert_matches!(task.execute(&ctx).await, Ok(TaskState::Succeeded));

    let stored = test.current_parameters().await;
    assert!(stored.node(node).unwrap().contains_all(&changes));
    assert!(test.cluster.node_params(node).unwrap().contains_all(&changes));
    assert!(
        test.cluster
            .agent_config(StorageNodeId(1), node)
            .unwrap()
            .contains_all(&changes)
    );
    assert_eq!(test.cluster.node_calls(node).parameter_pushes, 2);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn metadata_edits_are_idempotent() {
    let test = TestCluster::builder(2, 3).build();
    let ctx = test.context();
    let create = CreateTable {
        table: users_table(),
    };
    let user = AddUser {
        user: UserDef {
            name: "alice".to_string(),
            admin: false,
            password_hash: "hash".to_string(),
        },
    };

    for _ in 0..2 {
        assert_matches!(create.execute(&ctx).await, Ok(TaskState::Succeeded));
        assert_matches!(user.execute(&ctx).await, Ok(TaskState::Succeeded));
    }
    assert_eq!(test.admin.metadata_saves(), 2);
    assert_eq!(
        test.cluster
            .node_metadata_seq(NodeId::data(2, 1), MetadataKind::Table),
        1
    );

    let mut altered = users_table();
    altered.description = Some("accounts".to_string());
    let alter = AlterTable { table: altered };
    assert_matches!(alter.execute(&ctx).await, Ok(TaskState::Succeeded));
    assert_matches!(alter.execute(&ctx).await, Ok(TaskState::Succeeded));

    let drop = DropTable {
        name: "users".to_string(),
    };
    let remove = RemoveUser {
        name: "alice".to_string(),
    };
    for _ in 0..2 {
        assert_matches!(drop.execute(&ctx).await, Ok(TaskState::Succeeded));
        assert_matches!(remove.execute(&ctx).await, Ok(TaskState::Succeeded));
    }

    assert_eq!(test.admin.metadata_saves(), 5);
    let tables = test.admin.metadata(MetadataKind::Table).await.unwrap().unwrap();
    assert!(tables.table("users").is_none());
    assert_eq!(
        test.cluster
            .node_metadata_seq(NodeId::data(1, 1), MetadataKind::Table),
        tables.sequence_number()
    );
}

#[tokio::test]
async fn conflicting_table_definition_is_refused() {
    let test = TestCluster::three_nodes();
    let ctx = test.context();
    CreateTable {
        table: users_table(),
    }
    .execute(&ctx)
    .await
    .unwrap();

    let mut other = users_table();
    other.primary_key = vec!["email".to_string()];
    let err = CreateTable { table: other }.execute(&ctx).await.unwrap_err();

    assert_eq!(err.kind(), FaultKind::InvalidState);
}

#[tokio::test]
async fn remedy_decision_table() {
    let test = TestCluster::builder(1, 3).with_spare_storage_nodes(1).build();
    let ctx = test.context();

    assert_eq!(
        remedy::diagnose(&ctx, NodeId::data(1, 9)).await.unwrap(),
        Remedy::NoFix
    );
    assert_eq!(
        remedy::diagnose(&ctx, NodeId::data(1, 1)).await.unwrap(),
        Remedy::NoFix
    );

    test.cluster.set_group_leader(ShardId(1), false);
    assert_eq!(
        remedy::diagnose(&ctx, NodeId::data(1, 1)).await.unwrap(),
        Remedy::WaitAndRetry(NodeId::data(1, 1))
    );
    test.cluster.set_group_leader(ShardId(1), true);

    test.cluster.set_member_address(NodeId::data(1, 1), ha_address(4));
    assert_eq!(
        remedy::diagnose(&ctx, NodeId::data(1, 1)).await.unwrap(),
        Remedy::CorrectLocation {
            node: NodeId::data(1, 1),
            from: StorageNodeId(1),
            to: StorageNodeId(4),
            ha_host_port: ha_address(4),
        }
    );

    test.cluster
        .remove_agent_config(StorageNodeId(2), NodeId::data(1, 2));
    assert_eq!(
        remedy::diagnose(&ctx, NodeId::data(1, 2)).await.unwrap(),
        Remedy::NeedsDeploy {
            node: NodeId::data(1, 2),
            storage_node: StorageNodeId(2),
        }
    );

    let mut disabled = test
        .current_parameters()
        .await
        .node(NodeId::data(1, 3))
        .cloned()
        .unwrap();
    disabled.disabled = true;
    test.admin.update_node_params(disabled).await.unwrap();
    assert_eq!(
        remedy::diagnose(&ctx, NodeId::data(1, 3)).await.unwrap(),
        Remedy::ReenableNode(NodeId::data(1, 3))
    );
}

#[tokio::test]
#[tracing_test::traced_test]
async fn correct_location_moves_records_forward() {
    let test = TestCluster::builder(1, 3).with_spare_storage_nodes(1).build();
    let ctx = test.context();
    let node = NodeId::data(1, 1);
    test.cluster.set_member_address(node, ha_address(4));

    let remedy = remedy::diagnose(&ctx, node).await.unwrap();
    assert!(remedy::apply(&ctx, &remedy).await.unwrap());

    let topology = test.current_topology().await;
    assert_eq!(topology.node(node).unwrap().storage_node(), StorageNodeId(4));
    let params = test.current_parameters().await;
    assert_eq!(params.node(node).unwrap().storage_node, StorageNodeId(4));
    assert_eq!(params.node(node).unwrap().ha_host_port, ha_address(4));
    assert!(test.cluster.agent_config(StorageNodeId(4), node).is_some());
    assert!(test.cluster.agent_config(StorageNodeId(1), node).is_none());
    assert_eq!(
        remedy::diagnose(&ctx, node).await.unwrap(),
        Remedy::NoFix
    );
}

#[tokio::test]
async fn enabled_node_left_stopped_is_restarted() {
    let test = TestCluster::three_nodes();
    let ctx = test.context();
    let node = NodeId::data(1, 3);
    test.cluster.set_state(node, ServiceState::Stopped);

    let remedy = remedy::diagnose(&ctx, node).await.unwrap();
    assert_eq!(remedy, Remedy::ReenableNode(node));
    assert!(remedy::apply(&ctx, &remedy).await.unwrap());

    assert_eq!(test.cluster.node_state(node), Some(ServiceState::Running));
    assert!(!test.current_parameters().await.node(node).unwrap().disabled);
    assert_eq!(remedy::diagnose(&ctx, node).await.unwrap(), Remedy::NoFix);
}

#[tokio::test]
async fn needs_deploy_recreates_node_config() {
    let test = TestCluster::three_nodes();
    let ctx = test.context();
    let node = NodeId::data(1, 2);
    test.cluster.remove_agent_config(StorageNodeId(2), node);

    let remedy = remedy::diagnose(&ctx, node).await.unwrap();
    assert!(remedy::apply(&ctx, &remedy).await.unwrap());

    assert!(test.cluster.agent_config(StorageNodeId(2), node).is_some());
    assert_eq!(remedy::diagnose(&ctx, node).await.unwrap(), Remedy::NoFix);
}

#[tokio::test]
async fn cleanup_reenables_a_stopped_node() {
    let test = TestCluster::three_nodes();
    let monitor = Arc::new(RecordingMonitor::new());
    let ctx = test.context().with_monitor(monitor.clone());
    let node = NodeId::data(1, 1);
    StopNode {
        node,
        allow_override: false,
    }
    .execute(&ctx)
    .await
    .unwrap();

    let status = CleanupJob::ReenableNode(node).run(&ctx.for_cleanup()).await;

    assert_eq!(status, CleanupStatus::Completed);
    assert_eq!(test.cluster.node_state(node), Some(ServiceState::Running));
    assert!(!test.current_parameters().await.node(node).unwrap().disabled);
    assert!(
        monitor
            .events()
            .contains(&MonitorEvent::CollectNow(ComponentId::Node(node)))
    );
}

#[tokio::test]
#[tracing_test::traced_test]
async fn cleanup_gives_up_after_bounded_attempts() {
    let test = TestCluster::three_nodes();
    test.cluster.set_group_leader(ShardId(1), false);
    let ctx = test.context();

    let status = CleanupJob::RepairNode(NodeId::data(1, 1))
        .run(&ctx.for_cleanup())
        .await;

    assert_eq!(status, CleanupStatus::Exhausted);
    assert!(logs_contain("gave up after 3 attempts"));
}

#[tokio::test]
async fn cleanup_stops_on_cleanup_interrupt() {
    let test = TestCluster::three_nodes();
    test.cluster.set_group_leader(ShardId(1), false);
    let mut config = fast_config();
    config.cleanup.max_attempts = 1_000;
    let interrupt = CancellationToken::new();
    let cleanup_interrupt = CancellationToken::new();
    let ctx = test
        .context_with(config)
        .with_interrupts(interrupt.clone(), cleanup_interrupt.clone());

    // The plan interrupt alone does not stop cleanup.
    interrupt.cancel();
    let canceller = cleanup_interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let status = tokio::time::timeout(
        Duration::from_secs(5),
        CleanupJob::RepairNode(NodeId::data(1, 1)).run(&ctx.for_cleanup()),
    )
    .await
    .expect("cleanup interrupt must stop the job");

    assert_eq!(status, CleanupStatus::Pending);
    assert!(ctx.is_cleanup_interrupted());
}

#[tokio::test]
async fn cleanup_aborts_on_unexpected_error() {
    let test = TestCluster::three_nodes();
    let node = NodeId::data(1, 1);
    test.admin.remove_node_params(node).await.unwrap();
    let ctx = test.context();

    let status = CleanupJob::ReenableNode(node).run(&ctx.for_cleanup()).await;

    assert_eq!(status, CleanupStatus::Aborted);
}
