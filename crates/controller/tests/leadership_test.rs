mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_config, wait_for, Fixture};
use controller::election::LeaderState;
use controller::store::MemoryStore;

#[tokio::test]
async fn test_single_active_controller() {
    let store = Arc::new(MemoryStore::new());
    let a = Fixture::with_store(test_config("ctl-a"), store.clone());
    let b = Fixture::with_store(test_config("ctl-b"), store);

    a.controller.start();
    b.controller.start();
    wait_for(
        || a.controller.is_leader() || b.controller.is_leader(),
        Duration::from_secs(3),
    )
    .await;

    for _ in 0..20 {
        assert!(
            !(a.controller.is_leader() && b.controller.is_leader()),
            "two active controllers"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (leader, standby) = if a.controller.is_leader() { (&a, &b) } else { (&b, &a) };
    let info = standby.controller.leader_info().await.unwrap();
    assert_eq!(info.state, LeaderState::Standby);
    assert_eq!(info.leader.as_deref(), Some(leader.controller.id()));

    // a clean shutdown releases the lease right away
    leader.controller.shutdown().await;
    assert!(!leader.controller.is_leader());
    wait_for(|| standby.controller.is_leader(), Duration::from_secs(4)).await;
    standby.controller.shutdown().await;
}

#[tokio::test]
async fn test_standby_serves_topology_reads_and_writes() {
    let store = Arc::new(MemoryStore::new());
    let a = Fixture::with_store(test_config("ctl-a"), store.clone());
    let b = Fixture::with_store(test_config("ctl-b"), store);
    a.lead().await;
    b.controller.start();

    // CRUD goes through any controller; the store arbitrates
    b.demo(2, 0).await;
    let seen = a.controller.get_cluster("ns", "demo").await.unwrap();
    assert_eq!(seen.shards.len(), 2);
    assert!(!b.controller.is_leader());

    a.controller.shutdown().await;
    b.controller.shutdown().await;
}
