mod common;

use std::time::Duration;

use common::{demo_until, test_config, Fixture};
use controller::metadata::SlotRange;
use controller::migration::AbortOutcome;
use controller::node_client::MigrationProgress;
use controller::ControllerError;

fn slot(n: u32) -> SlotRange {
    SlotRange::single(n).unwrap()
}

#[tokio::test]
async fn test_slot_only_migration_moves_ownership() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(2, 0).await;
    fixture.lead().await;

    let ticket = fixture
        .controller
        .migrate("ns", "demo", 1, slot(100), true)
        .await
        .unwrap();
    assert_eq!(ticket.source, 0);
    assert_eq!(ticket.target, 1);
    assert_eq!(ticket.cluster.version, 2);
    assert_eq!(ticket.cluster.shards[0].migrating_slot, Some(slot(100)));
    assert_eq!(ticket.cluster.shards[0].target_shard_index, Some(1));
    assert_eq!(ticket.cluster.shards[1].importing_slot, Some(slot(100)));

    let cluster = demo_until(&fixture.controller, |c| c.slot_owner(100) == Some(1)).await;
    assert_eq!(cluster.version, 3);
    for shard in &cluster.shards {
        assert!(shard.migrating_slot.is_none());
        assert!(shard.importing_slot.is_none());
        assert!(shard.target_shard_index.is_none());
    }
    assert_eq!(cluster.slot_owner(99), Some(0));
    assert_eq!(cluster.slot_owner(101), Some(0));
    assert!(cluster.is_fully_assigned());

    // no data moved, but every node learns the new topology
    assert_eq!(fixture.rpc.count("migrate "), 0);
    common::wait_for(|| fixture.rpc.count("topology ") == 2, Duration::from_secs(3)).await;
    fixture.controller.shutdown().await;
}

#[tokio::test]
async fn test_transfer_commits_when_source_reports_success() {
    let fixture = Fixture::new(test_config("ctl-a"));
    let created = fixture.demo(2, 0).await;
    fixture.rpc.set_progress(MigrationProgress::Success);
    fixture.lead().await;

    let range = SlotRange::new(100, 199).unwrap();
    fixture
        .controller
        .migrate("ns", "demo", 1, range, false)
        .await
        .unwrap();
    let cluster = demo_until(&fixture.controller, |c| c.slot_owner(150) == Some(1)).await;
    assert!(cluster.shards.iter().all(|s| !s.has_migration()));

    let target_id = &created.shards[1].master().unwrap().id;
    assert_eq!(
        fixture.rpc.count(&format!("migrate 127.0.0.1:7000 100-199 {}", target_id)),
        1
    );
    fixture.controller.shutdown().await;
}

#[tokio::test]
async fn test_failed_transfer_aborts() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(2, 0).await;
    fixture.rpc.set_progress(MigrationProgress::Failed);
    fixture.lead().await;

    fixture
        .controller
        .migrate("ns", "demo", 1, slot(100), false)
        .await
        .unwrap();
    let cluster = demo_until(&fixture.controller, |c| {
        c.shards.iter().all(|s| !s.has_migration())
    })
    .await;
    assert_eq!(cluster.slot_owner(100), Some(0));
    assert_eq!(cluster.version, 3);
    fixture.controller.shutdown().await;
}

#[tokio::test]
async fn test_transfer_rides_out_store_outage() {
    let mut config = test_config("ctl-a");
    // no lease renewal falls inside the outage
    config.election.lease_ttl_secs = 10;
    let fixture = Fixture::new(config);
    fixture.demo(2, 0).await;
    fixture.lead().await;
    let c = &fixture.controller;

    c.migrate("ns", "demo", 1, slot(100), false).await.unwrap();
    common::wait_for(|| fixture.rpc.count("migrate ") == 1, Duration::from_secs(3)).await;

    fixture.store.set_available(false);
    fixture.rpc.set_progress(MigrationProgress::Success);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(c.migration_orchestrator().is_running("ns", "demo", slot(100)));
    fixture.store.set_available(true);

    let cluster = demo_until(c, |c| c.slot_owner(100) == Some(1)).await;
    assert!(cluster.shards.iter().all(|s| !s.has_migration()));
    common::wait_for(
        || !c.migration_orchestrator().is_running("ns", "demo", slot(100)),
        Duration::from_secs(3),
    )
    .await;
    assert!(c.is_leader());
    c.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_migrations_of_one_slot() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(2, 0).await;
    // transfers never finish, so the winner's markers stay put
    fixture.rpc.set_progress(MigrationProgress::InProgress);
    fixture.lead().await;

    let c = &fixture.controller;
    let (a, b) = tokio::join!(
        c.migrate("ns", "demo", 1, slot(100), false),
        c.migrate("ns", "demo", 1, slot(100), false),
    );
    let (ok, err) = match (a, b) {
        (Ok(ticket), Err(e)) | (Err(e), Ok(ticket)) => (ticket, e),
        other => panic!("expected exactly one success, got {:?}", other),
    };
    assert_eq!(ok.source, 0);
    assert_eq!(err, ControllerError::SlotAlreadyMigrating("100".to_string()));

    let cluster = c.get_cluster("ns", "demo").await.unwrap();
    assert_eq!(cluster.version, 2);
    assert_eq!(cluster.shards[0].migrating_slot, Some(slot(100)));
    c.shutdown().await;
}

#[tokio::test]
async fn test_migration_input_errors() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(2, 0).await;
    fixture.lead().await;
    let c = &fixture.controller;

    let err = c.migrate("ns", "demo", 0, slot(100), true).await.unwrap_err();
    assert_eq!(err, ControllerError::SameShard(0));

    // spans both shards
    let range = SlotRange::new(8000, 8300).unwrap();
    let err = c.migrate("ns", "demo", 1, range, true).await.unwrap_err();
    assert!(matches!(err, ControllerError::SlotNotOwned(_)));

    let err = c.migrate("ns", "demo", 7, slot(100), true).await.unwrap_err();
    assert_eq!(err.kind(), controller::ErrorKind::NotFound);

    assert_eq!(c.get_cluster("ns", "demo").await.unwrap().version, 1);
    c.shutdown().await;
}

#[tokio::test]
async fn test_abort_running_migration() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(2, 0).await;
    fixture.rpc.set_progress(MigrationProgress::InProgress);
    fixture.lead().await;
    let c = &fixture.controller;

    let err = c.abort_migration("ns", "demo", 0).await.unwrap_err();
    assert_eq!(err, ControllerError::NoMigration(0));

    c.migrate("ns", "demo", 1, slot(100), false).await.unwrap();
    let outcome = c.abort_migration("ns", "demo", 0).await.unwrap();
    assert_eq!(outcome, AbortOutcome::Requested);

    let cluster = demo_until(c, |c| c.shards.iter().all(|s| !s.has_migration())).await;
    assert_eq!(cluster.slot_owner(100), Some(0));
    c.shutdown().await;
}

#[tokio::test]
async fn test_new_leader_settles_interrupted_migrations() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(4, 0).await;

    // markers left behind by a previous leader
    fixture
        .controller
        .repository()
        .update_cluster("ns", "demo", |c| {
            c.begin_migration(1, slot(100))?;
            c.begin_migration(3, slot(10000))
        })
        .await
        .unwrap();

    fixture.rpc.set_progress(MigrationProgress::Success);
    fixture.lead().await;

    let cluster = demo_until(&fixture.controller, |c| {
        c.shards.iter().all(|s| !s.has_migration())
    })
    .await;
    assert_eq!(cluster.slot_owner(100), Some(1));
    assert_eq!(cluster.slot_owner(10000), Some(3));
    fixture.controller.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_source_aborts_on_recovery() {
    let fixture = Fixture::new(test_config("ctl-a"));
    fixture.demo(2, 0).await;
    fixture
        .controller
        .repository()
        .update_cluster("ns", "demo", |c| c.begin_migration(1, slot(100)))
        .await
        .unwrap();

    fixture.rpc.set_progress(MigrationProgress::Success);
    fixture.rpc.set_down("127.0.0.1:7000", true);
    fixture.lead().await;

    let cluster = demo_until(&fixture.controller, |c| {
        c.shards.iter().all(|s| !s.has_migration())
    })
    .await;
    assert_eq!(cluster.slot_owner(100), Some(0));
    fixture.controller.shutdown().await;
}
