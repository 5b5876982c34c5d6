//! Behind-window recovery: when the server can no longer resume from the
//! client's position, the client clears its replication state (LSN and
//! subscriptions, in memory and in meta), retries the start, and
//! re-subscribes previously delivered shapes.

mod common;

use std::time::Duration;

use satlite::error::Error;
use satlite::subscriptions::{InitialDataChange, SubscriptionData};
use satlite::tags::Tag;
use satlite::types::Lsn;
use satlite::{ConnectivityState, ShapeDefinition};

use common::{eventually_async, meta_value, parent_relation, parent_row, start_satellite};

#[tokio::test]
async fn behind_window_resets_state_and_resubscribes() {
    let h = start_satellite().await;

    // Deliver a fulfilled shape subscription so there is state to lose.
    let synced = h
        .satellite
        .subscribe(vec![ShapeDefinition::new("parent")])
        .await
        .unwrap();
    let subscription_id = eventually_async(
        Duration::from_secs(5),
        Duration::from_millis(10),
        || async {
            h.client
                .with_calls(|calls| calls.subscribes.first().map(|(id, _)| id.clone()))
        },
    )
    .await;
    let tag = Tag::generate("server", chrono::Utc::now());
    h.client.deliver_subscription_data(SubscriptionData {
        subscription_id,
        lsn: Lsn::from_bytes(vec![42]),
        data: vec![InitialDataChange {
            relation: parent_relation(),
            record: parent_row(1, Some("synced"), None),
            tags: vec![tag],
        }],
    });
    synced.wait().await.unwrap();
    assert_eq!(
        meta_value(&h.adapter, "lsn").await,
        Some(Lsn::from_bytes(vec![42]).to_base64())
    );
    assert_ne!(meta_value(&h.adapter, "subscriptions").await.as_deref(), Some(""));

    // Next start-replication attempt: behind the window once, then fine.
    h.client.push_start_result(Err(Error::BehindWindow));
    h.client.push_start_result(Ok(()));
    h.notifier.connectivity_changed(ConnectivityState::Available);

    // A fresh start was attempted after the reset...
    eventually_async(
        Duration::from_secs(5),
        Duration::from_millis(10),
        || async {
            h.client
                .with_calls(|calls| (calls.starts.len() >= 3).then_some(()))
        },
    )
    .await;
    h.client.with_calls(|calls| {
        let (lsn, _, subs) = calls.starts.last().unwrap();
        assert!(lsn.is_none(), "retry offers no resume position");
        assert!(subs.is_empty(), "retry resumes no subscriptions");
    });

    // ...the persisted state is empty...
    assert_eq!(meta_value(&h.adapter, "lsn").await.as_deref(), Some(""));
    assert_eq!(
        meta_value(&h.adapter, "subscriptions").await.as_deref(),
        Some("")
    );

    // ...and the previously delivered shape was re-subscribed.
    eventually_async(
        Duration::from_secs(5),
        Duration::from_millis(10),
        || async {
            h.client.with_calls(|calls| {
                (calls.subscribes.len() == 2).then(|| {
                    let (_, shapes) = &calls.subscribes[1];
                    assert_eq!(shapes.len(), 1);
                    assert_eq!(shapes[0].definition.tablename, "parent");
                })
            })
        },
    )
    .await;
}

/// With recovery disabled, behind-window is fatal to the caller of start.
#[tokio::test]
async fn behind_window_without_recovery_is_fatal() {
    use satlite::config::{AuthConfig, SatelliteConfig};
    use satlite::schema::Database;
    use satlite::testing::MockClient;
    use satlite::{Adapter, Notifier, Satellite};
    use std::sync::Arc;

    let conn = Database::open_in_memory().unwrap().into_connection();
    let adapter = Adapter::new(conn);
    let client = MockClient::new();
    client.push_start_result(Err(Error::BehindWindow));

    let mut satellite = Satellite::start(
        adapter,
        Arc::new(client.clone()),
        Notifier::new(),
        AuthConfig::new("jwt"),
        SatelliteConfig {
            clear_on_behind_window: false,
            polling_interval: Duration::from_secs(3600),
            ..SatelliteConfig::default()
        },
    )
    .await
    .unwrap();

    let err = satellite.wait_connected().await.unwrap_err();
    assert!(matches!(err, Error::BehindWindow));
    client.with_calls(|calls| assert_eq!(calls.starts.len(), 1, "no retry"));
}
