mod common;

use common::{addrs, test_config, Fixture};
use controller::metadata::{NodeRole, SlotRange, TOTAL_SLOTS};
use controller::{ControllerError, ErrorKind};

#[tokio::test]
async fn test_each_node_without_replicas_becomes_a_shard() {
    let fixture = Fixture::new(test_config("ctl-a"));
    // shards take replicas + 1 nodes, so two lone masters split the slots
    let cluster = fixture.demo(2, 0).await;

    assert_eq!(cluster.version, 1);
    assert_eq!(cluster.shards.len(), 2);
    assert_eq!(cluster.shards[0].slot_ranges, vec![SlotRange::new(0, 8191).unwrap()]);
    assert_eq!(
        cluster.shards[1].slot_ranges,
        vec![SlotRange::new(8192, 16383).unwrap()]
    );
    for shard in &cluster.shards {
        assert_eq!(shard.nodes.len(), 1);
        assert_eq!(shard.nodes[0].role, NodeRole::Master);
        assert!(shard.migrating_slot.is_none());
        assert!(shard.importing_slot.is_none());
    }
    assert!(cluster.is_fully_assigned());

    let stored = fixture.controller.get_cluster("ns", "demo").await.unwrap();
    assert_eq!(stored, cluster);
}

#[tokio::test]
async fn test_create_single_shard_with_replica() {
    let fixture = Fixture::new(test_config("ctl-a"));
    let cluster = fixture.demo(2, 1).await;

    assert_eq!(cluster.shards.len(), 1);
    let shard = &cluster.shards[0];
    assert_eq!(shard.slot_ranges, vec![SlotRange::full()]);
    assert_eq!(shard.slot_count(), TOTAL_SLOTS);
    assert_eq!(shard.master().unwrap().addr, "127.0.0.1:7000");
    assert_eq!(shard.replicas().count(), 1);
}

#[tokio::test]
async fn test_create_cluster_rejects_bad_input() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.controller.create_namespace("ns").await.unwrap();

    // three nodes cannot form shards of two
    let err = fixture
        .controller
        .create_cluster("ns", "demo", &addrs(3), 1, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = fixture
        .controller
        .create_cluster("missing", "demo", &addrs(2), 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // nothing was written
    assert!(fixture.controller.list_clusters("ns").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_namespace_lifecycle() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(2, 0).await;

    let err = fixture.controller.create_namespace("ns").await.unwrap_err();
    assert!(matches!(err, ControllerError::AlreadyExists(_)));

    let err = fixture.controller.delete_namespace("ns").await.unwrap_err();
    assert!(matches!(err, ControllerError::NotEmpty(_)));

    assert_eq!(fixture.controller.list_namespaces().await.unwrap(), vec!["ns"]);
    assert_eq!(fixture.controller.list_clusters("ns").await.unwrap(), vec!["demo"]);

    fixture.controller.delete_cluster("ns", "demo").await.unwrap();
    fixture.controller.delete_namespace("ns").await.unwrap();
    assert!(fixture.controller.list_namespaces().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shard_and_node_crud_bump_version() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(2, 0).await;
    let c = &fixture.controller;

    let index = c
        .create_shard("ns", "demo", &["127.0.0.1:7100".to_string()], None)
        .await
        .unwrap();
    assert_eq!(index, 2);
    let shard = c.get_shard("ns", "demo", 2).await.unwrap();
    assert!(shard.slot_ranges.is_empty());
    assert_eq!(c.get_cluster("ns", "demo").await.unwrap().version, 2);

    let replica = c
        .create_node("ns", "demo", 0, "127.0.0.1:7200", NodeRole::Replica, None)
        .await
        .unwrap();
    assert_eq!(replica.id.len(), 40);
    assert_eq!(c.list_nodes("ns", "demo", 0).await.unwrap().len(), 2);

    // addresses are unique across the cluster
    let err = c
        .create_node("ns", "demo", 1, "127.0.0.1:7200", NodeRole::Replica, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::AlreadyExists(_)));

    let master = c.get_shard("ns", "demo", 0).await.unwrap().master().unwrap().id.clone();
    let err = c.delete_node("ns", "demo", 0, &master).await.unwrap_err();
    assert!(matches!(err, ControllerError::CannotDeleteMaster(_)));
    c.delete_node("ns", "demo", 0, &replica.id).await.unwrap();

    // a shard owning slots cannot go
    let err = c.delete_shard("ns", "demo", 0).await.unwrap_err();
    assert!(matches!(err, ControllerError::SlotsStillAssigned(0)));
    c.delete_shard("ns", "demo", 2).await.unwrap();

    let cluster = c.get_cluster("ns", "demo").await.unwrap();
    assert_eq!(cluster.shards.len(), 2);
    assert_eq!(cluster.version, 5);
}

#[tokio::test]
async fn test_leader_only_operations_need_leadership() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(2, 1).await;
    let c = &fixture.controller;
    assert!(!c.is_leader());

    let range = SlotRange::single(100).unwrap();
    let err = c.migrate("ns", "demo", 0, range, true).await.unwrap_err();
    assert_eq!(err, ControllerError::NotLeader);
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    let err = c.failover("ns", "demo", 0, None).await.unwrap_err();
    assert_eq!(err, ControllerError::NotLeader);

    // nothing reached the nodes or the record
    assert!(fixture.rpc.calls().is_empty());
    assert_eq!(c.get_cluster("ns", "demo").await.unwrap().version, 1);
}
