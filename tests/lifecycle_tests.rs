mod common;

use std::sync::Arc;
use std::time::Duration;

use common::descriptors::random_entries;

use metashop::config::PublishMode;
use metashop::error::MetashopError;
use metashop::index::engine::SNAPSHOT_FILE;
use metashop::index::{EngineHandle, IndexCoordinator, MatchEngine, MatchParams, RebuildOutcome, RebuildState};
use metashop::types::TrainingEntry;

fn coordinator(dir: &std::path::Path, mode: PublishMode) -> Arc<IndexCoordinator> {
    Arc::new(IndexCoordinator::new(
        Arc::new(EngineHandle::new()),
        dir.to_path_buf(),
        MatchParams::default(),
        mode,
    ))
}

#[test]
fn test_immediate_rebuild_publishes_and_persists() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Immediate);
    assert!(coord.handle().current().is_none());

    let outcome = coord.rebuild(&random_entries(&[1, 2], 8, 1)).unwrap();
    let RebuildOutcome::Published {
        snapshot_id,
        persisted,
    } = outcome
    else {
        panic!("expected an immediate publish, got {outcome:?}");
    };
    assert!(persisted);
    assert_eq!(coord.handle().current().unwrap().id(), snapshot_id);
    assert_eq!(coord.state(), RebuildState::Idle);
    assert!(dir.path().join(SNAPSHOT_FILE).exists());
}

#[test]
fn test_second_build_is_rejected_while_one_runs() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Immediate);

    let ticket = coord.begin_build().unwrap();
    assert_eq!(coord.state(), RebuildState::Building);
    assert!(matches!(
        coord.begin_build(),
        Err(MetashopError::RebuildInProgress)
    ));
    assert!(matches!(
        coord.rebuild(&random_entries(&[1], 4, 2)),
        Err(MetashopError::RebuildInProgress)
    ));

    ticket.finish(&random_entries(&[1], 4, 2)).unwrap();
    assert!(coord.begin_build().is_ok());
}

#[test]
fn test_dropped_ticket_returns_to_idle() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Immediate);

    drop(coord.begin_build().unwrap());
    assert_eq!(coord.state(), RebuildState::Idle);
    assert!(coord.begin_build().is_ok());
}

#[test]
fn test_failed_build_keeps_live_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Immediate);
    let first = coord.rebuild(&random_entries(&[1, 2], 8, 3)).unwrap();

    let empty = vec![TrainingEntry {
        product_id: 9,
        descriptors: vec![],
    }];
    let err = coord.rebuild(&empty).unwrap_err();
    assert!(matches!(err, MetashopError::Index(_)));

    assert_eq!(coord.state(), RebuildState::Idle);
    assert_eq!(
        coord.handle().current().unwrap().id(),
        first.snapshot_id()
    );
}

#[test]
fn test_deferred_rebuild_waits_for_adoption() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Deferred);

    let outcome = coord.rebuild(&random_entries(&[1, 2], 8, 4)).unwrap();
    assert!(matches!(outcome, RebuildOutcome::Pending { .. }));
    assert_eq!(coord.state(), RebuildState::ReadyToPublish);
    assert!(coord.handle().current().is_none());
    assert!(!dir.path().join(SNAPSHOT_FILE).exists());

    // A parked snapshot blocks further builds until adopted.
    assert!(matches!(
        coord.begin_build(),
        Err(MetashopError::RebuildInProgress)
    ));

    let status = coord.status();
    assert_eq!(
        status.pending.as_ref().map(|p| p.snapshot_id.clone()),
        Some(outcome.snapshot_id().to_string())
    );
    assert!(status.live.is_none());

    assert_eq!(coord.adopt_pending(), Some(outcome.snapshot_id()));
    assert_eq!(coord.state(), RebuildState::Idle);
    assert_eq!(
        coord.handle().current().unwrap().id(),
        outcome.snapshot_id()
    );
    assert!(dir.path().join(SNAPSHOT_FILE).exists());

    // Nothing left to adopt.
    assert_eq!(coord.adopt_pending(), None);
}

#[test]
fn test_adopt_while_building_does_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Deferred);
    let _ticket = coord.begin_build().unwrap();
    assert_eq!(coord.adopt_pending(), None);
    assert_eq!(coord.state(), RebuildState::Building);
}

#[test]
fn test_persisted_snapshot_is_served_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let entries = random_entries(&[1, 2, 3], 8, 5);
    let id = coordinator(dir.path(), PublishMode::Immediate)
        .rebuild(&entries)
        .unwrap()
        .snapshot_id();

    let restarted = coordinator(dir.path(), PublishMode::Immediate);
    assert_eq!(restarted.load_persisted().unwrap(), Some(id));
    let engine = restarted.handle().current().unwrap();
    assert_eq!(engine.id(), id);
    assert_eq!(
        engine.query(&[entries[2].descriptors[1]]).best().map(|c| c.product_id),
        Some(3)
    );
}

#[test]
fn test_load_persisted_without_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Immediate);
    assert_eq!(coord.load_persisted().unwrap(), None);
    assert!(!coord.handle().is_loaded());
}

#[test]
fn test_readers_keep_their_snapshot_across_publish() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Immediate);
    let old_entries = random_entries(&[1], 8, 6);
    coord.rebuild(&old_entries).unwrap();

    let pinned = coord.handle().current().unwrap();
    coord.rebuild(&random_entries(&[2], 8, 7)).unwrap();

    // The pinned snapshot still answers with the old catalog.
    assert_ne!(pinned.id(), coord.handle().current().unwrap().id());
    assert_eq!(pinned.owners(), &[1; 8]);
    assert_eq!(coord.handle().current().unwrap().owners(), &[2; 8]);
}

#[test]
fn test_handle_swap_returns_previous() {
    let handle = EngineHandle::new();
    let first = Arc::new(MatchEngine::build(&random_entries(&[1], 4, 8), MatchParams::default()).unwrap());
    let second = Arc::new(MatchEngine::build(&random_entries(&[2], 4, 9), MatchParams::default()).unwrap());

    assert!(handle.publish(first.clone()).is_none());
    let previous = handle.publish(second.clone()).unwrap();
    assert_eq!(previous.id(), first.id());
    assert_eq!(handle.current().unwrap().id(), second.id());
}

#[tokio::test]
async fn test_adoption_loop_publishes_and_stops() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Deferred);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let task = coord
        .clone()
        .spawn_adoption_loop(Duration::from_millis(20), stop_rx);

    let builder = coord.clone();
    let id = tokio::task::spawn_blocking(move || builder.rebuild(&random_entries(&[1, 2], 8, 10)))
        .await
        .unwrap()
        .unwrap()
        .snapshot_id();

    let adopted = async {
        loop {
            if coord.handle().current().map(|e| e.id()) == Some(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), adopted)
        .await
        .expect("snapshot was not adopted");
    assert_eq!(coord.state(), RebuildState::Idle);

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("adoption loop did not stop")
        .unwrap();
}

#[test]
fn test_status_reports_live_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let coord = coordinator(dir.path(), PublishMode::Immediate);
    coord.rebuild(&random_entries(&[4, 5, 6], 10, 11)).unwrap();

    let status = coord.status();
    let live = status.live.expect("live snapshot");
    assert_eq!(live.descriptors, 30);
    assert_eq!(live.products, 3);
    assert_eq!(status.publish_mode, PublishMode::Immediate);
    assert!(status.pending.is_none());

    let value = serde_json::to_value(coord.status()).unwrap();
    assert_eq!(value["state"], "idle");
    assert_eq!(value["publish_mode"], "immediate");
    assert_eq!(value["live"]["algorithm"], "lsh");
}
