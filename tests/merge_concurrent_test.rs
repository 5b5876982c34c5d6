//! Conflict resolution between pending local writes and concurrent remote
//! transactions: presence is decided by the tag algebra (add-wins with
//! deletion observability), values column-wise by last writer.

mod common;

use std::time::Duration;

use satlite::oplog::parse_timestamp;
use satlite::tags::{Tag, TagSet};
use satlite::types::{Change, DataChange, Lsn, RecordType, Transaction};

use common::{
    eventually_async, parent_relation, parent_row, parent_rows, shadow_tags, start_satellite,
};

fn remote_insert_tx(
    id: i64,
    value: &str,
    other: i64,
    commit_ms: i64,
    lsn_byte: u8,
) -> Transaction {
    let tag = Tag::generate(
        "client-remote",
        chrono::DateTime::from_timestamp_millis(commit_ms).unwrap(),
    );
    Transaction {
        origin: Some("client-remote".to_string()),
        commit_timestamp: commit_ms,
        lsn: Lsn::from_bytes(vec![lsn_byte]),
        changes: vec![Change::Data(DataChange {
            relation: parent_relation(),
            record_type: RecordType::Insert,
            new_record: Some(parent_row(id, Some(value), Some(other))),
            old_record: None,
            tags: vec![tag],
        })],
    }
}

/// Two rows inserted and deleted locally, snapshotted at t1. Remote inserts
/// arrive for both: one committed before t1, one after. The unobserved
/// remote inserts win presence for both rows; values go per column to the
/// later writer — local for row 1, remote for row 2.
#[tokio::test]
async fn local_delete_vs_concurrent_remote_insert() {
    let h = start_satellite().await;

    h.adapter
        .run_batch(
            "BEGIN;\
             INSERT INTO parent (id, value) VALUES (1, 'local');\
             INSERT INTO parent (id, value) VALUES (2, 'local');\
             DELETE FROM parent;\
             COMMIT;",
        )
        .await
        .unwrap();
    h.satellite.snapshot().await.unwrap();
    assert!(parent_rows(&h.adapter).await.is_empty());

    // The snapshot instant t1, from any promoted row.
    let t1 = {
        let rows = common::oplog_rows(&h.adapter).await;
        parse_timestamp(rows[0].3.as_deref().expect("promoted"))
            .unwrap()
            .timestamp_millis()
    };

    h.client
        .deliver_transaction(remote_insert_tx(1, "remote", 1, t1 - 1, 1));
    h.client
        .deliver_transaction(remote_insert_tx(2, "remote", 2, t1 + 1, 2));

    let rows = eventually_async(
        Duration::from_secs(5),
        Duration::from_millis(10),
        || async {
            let rows = parent_rows(&h.adapter).await;
            (rows.len() == 2).then_some(rows)
        },
    )
    .await;

    // Row 1: the local writes are newer (t1 > t1-1) — local values win.
    assert_eq!(rows[0], (1, Some("local".to_string()), None));
    // Row 2: the remote insert is newer (t1+1 > t1) — remote values win.
    assert_eq!(rows[1], (2, Some("remote".to_string()), Some(2)));

    // Presence came from the surviving remote tags.
    let row1_tags = shadow_tags(&h.adapter, "{\"id\":1}").await.expect("shadow");
    let expected: TagSet = vec![Tag::generate(
        "client-remote",
        chrono::DateTime::from_timestamp_millis(t1 - 1).unwrap(),
    )]
    .into();
    assert_eq!(row1_tags, expected);
}

/// A remote delete that observed an acknowledged row deletes it; a remote
/// delete that missed a newer pending local write does not.
#[tokio::test]
async fn remote_delete_only_wins_when_it_observed_the_row() {
    let h = start_satellite().await;

    // Both rows inserted and snapshotted together at t1.
    h.adapter
        .run_batch(
            "INSERT INTO parent (id, value) VALUES (10, 'a');\
             INSERT INTO parent (id, value) VALUES (11, 'b');",
        )
        .await
        .unwrap();
    h.satellite.snapshot().await.unwrap();
    let observed_10 = shadow_tags(&h.adapter, "{\"id\":10}").await.unwrap();
    let observed_11 = shadow_tags(&h.adapter, "{\"id\":11}").await.unwrap();

    // Row 11 then gets a newer pending update at t2.
    h.adapter
        .run("UPDATE parent SET value = 'b2' WHERE id = 11")
        .await
        .unwrap();
    h.satellite.snapshot().await.unwrap();

    // Ship the backlog, then play back the t1 transaction as its own
    // round-trip acknowledgement: the t1 oplog rows are garbage-collected,
    // so only row 11's t2 update remains pending.
    h.client.deliver_outbound_started();
    let (first_tx, ackd_rowid) = eventually_async(
        Duration::from_secs(5),
        Duration::from_millis(10),
        || async {
            h.client.with_calls(|calls| {
                (calls.enqueued.len() == 2).then(|| {
                    (
                        calls.enqueued[0].clone(),
                        calls.enqueued[0].lsn.clone(),
                    )
                })
            })
        },
    )
    .await;
    h.client
        .deliver_ack(ackd_rowid, satlite::types::AckType::RemoteCommit);
    h.client.deliver_transaction(first_tx);
    eventually_async(
        Duration::from_secs(5),
        Duration::from_millis(10),
        || async {
            let pending = common::oplog_rows(&h.adapter).await;
            (pending.len() == 1).then_some(())
        },
    )
    .await;

    // Concurrent remote deletes, each carrying what it observed at t1.
    let commit_ms = chrono::Utc::now().timestamp_millis() + 10;
    let delete = |id: i64, observed: &TagSet, lsn_byte: u8| Transaction {
        origin: Some("client-remote".to_string()),
        commit_timestamp: commit_ms,
        lsn: Lsn::from_bytes(vec![lsn_byte]),
        changes: vec![Change::Data(DataChange {
            relation: parent_relation(),
            record_type: RecordType::Delete,
            new_record: None,
            old_record: Some(parent_row(id, None, None)),
            tags: observed.iter().cloned().collect(),
        })],
    };

    h.client.deliver_transaction(delete(10, &observed_10, 101));
    h.client.deliver_transaction(delete(11, &observed_11, 102));

    let rows = eventually_async(
        Duration::from_secs(5),
        Duration::from_millis(10),
        || async {
            let lsn = common::meta_value(&h.adapter, "lsn").await;
            if lsn.as_deref() != Some(Lsn::from_bytes(vec![102]).to_base64().as_str()) {
                return None;
            }
            Some(parent_rows(&h.adapter).await)
        },
    )
    .await;

    // Row 10 observed-deleted; row 11's newer pending write survives.
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, 11);
    assert_eq!(rows[0].1.as_deref(), Some("b2"));
    assert!(shadow_tags(&h.adapter, "{\"id\":10}").await.is_none());
    assert!(shadow_tags(&h.adapter, "{\"id\":11}").await.is_some());
}
