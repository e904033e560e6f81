//! Persistence sync lifecycle: listing, marking, quarantine.

use std::time::Duration;

use chrono::Utc;
use wellmonitor::storage::{Db, RowKey, SyncKind};
use wellmonitor::types::{PumpStatus, Reading, RelayAction, RelayActionKind};

const DL: Duration = Duration::from_secs(5);

fn reading(amps: f64) -> Reading {
    Reading {
        id: 0,
        timestamp_utc: Utc::now(),
        current_amps: Some(amps),
        status: PumpStatus::Normal,
        raw_text: format!("{amps:.2}"),
        confidence: 0.9,
        image_ref: None,
        processing_ms: 10,
        synced: false,
        error: None,
    }
}

/// Listing unsynced rows then marking them synced excludes them from
/// subsequent listings — across row families.
#[tokio::test]
async fn mark_synced_excludes_rows_from_listing() {
    let db = Db::open_in_memory().await.unwrap();

    for i in 0..5 {
        db.insert_reading(&reading(f64::from(i)), DL).await.unwrap();
    }
    db.insert_relay_action(
        &RelayAction {
            id: 0,
            timestamp_utc: Utc::now(),
            action: RelayActionKind::Cycle,
            reason: "Dry×3".to_string(),
            duration_ms: 5000,
            success: true,
            error: None,
            synced: false,
        },
        DL,
    )
    .await
    .unwrap();

    // Partial mark: 3 of 5 readings.
    let rows = db.list_unsynced(SyncKind::Readings, 3, DL).await.unwrap();
    assert_eq!(rows.len(), 3);
    let keys: Vec<RowKey> = rows.iter().map(|r| r.key.clone()).collect();
    db.mark_synced(SyncKind::Readings, &keys, DL).await.unwrap();

    let remaining = db.list_unsynced(SyncKind::Readings, 100, DL).await.unwrap();
    assert_eq!(remaining.len(), 2);
    for row in &remaining {
        assert!(!keys.contains(&row.key), "marked row reappeared");
    }

    let relay_rows = db.list_unsynced(SyncKind::RelayActions, 100, DL).await.unwrap();
    assert_eq!(relay_rows.len(), 1);
}

/// Batches respect the limit and come back oldest-first.
#[tokio::test]
async fn batches_are_bounded_and_ordered() {
    let db = Db::open_in_memory().await.unwrap();
    for i in 0..250 {
        db.insert_reading(&reading(f64::from(i % 10)), DL).await.unwrap();
    }

    let batch = db.list_unsynced(SyncKind::Readings, 100, DL).await.unwrap();
    assert_eq!(batch.len(), 100);

    let ids: Vec<i64> = batch
        .iter()
        .map(|r| match r.key {
            RowKey::Id(id) => id,
            RowKey::Period(_) => panic!("readings keyed by id"),
        })
        .collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "batch must be oldest-first");
}

/// A quarantined row stops blocking the backlog and carries its reason.
#[tokio::test]
async fn quarantine_unblocks_and_records_reason() {
    let db = Db::open_in_memory().await.unwrap();
    let id = db.insert_reading(&reading(4.0), DL).await.unwrap();
    db.insert_reading(&reading(5.0), DL).await.unwrap();

    db.quarantine(SyncKind::Readings, &RowKey::Id(id), "field mismatch", DL)
        .await
        .unwrap();

    let remaining = db.list_unsynced(SyncKind::Readings, 100, DL).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining.iter().all(|r| r.key != RowKey::Id(id)));
}
