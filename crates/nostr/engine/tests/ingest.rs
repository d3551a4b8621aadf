//! Ingest and import behaviour across relays.

mod common;

use common::{imported_notices, kind1_task, start, start_with};
use nostr_engine::testing::{RecordingStore, event_frame, settle, signed_event};
use nostr_engine::{
    EventStatus, EventStore, IngestEvent, RelayEndpoint, RelaySet, ReqTask, SendOptions, TaskOutcome, join_relays,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_same_event_from_two_relays_is_saved_once() {
    let harness = start(vec![RelayEndpoint::new("wss://a"), RelayEndpoint::new("wss://b")]).await;
    let mut imported = harness.engine.subscribe_imported();
    let (task, outcomes) = kind1_task(&harness, "S1");
    harness.engine.submit(task).unwrap();
    settle().await;

    let e1 = signed_event("alice", 1, "hello");
    harness.relay("wss://a").push(&event_frame("S1", &e1));
    harness.relay("wss://b").push(&event_frame("S1", &e1));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(harness.store.saves(), 1);
    let stored = harness.store.fetch_by_id(&e1.id).unwrap().unwrap();
    assert_eq!(join_relays(&stored.relays), "wss://a wss://b");
    assert_eq!(imported_notices(&mut imported), vec![HashSet::from(["S1".to_string()])]);
    assert_eq!(outcomes.responses(), 1);
    assert_eq!(outcomes.timeouts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_response_fires_once_and_timeout_never_follows() {
    let harness = start(vec![RelayEndpoint::new("wss://a")]).await;
    let (task, outcomes) = kind1_task(&harness, "S1");
    harness.engine.submit(task.timeout(Duration::from_secs(5))).unwrap();
    settle().await;

    harness
        .relay("wss://a")
        .push(&event_frame("S1", &signed_event("alice", 1, "one")));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(outcomes.responses(), 1);

    // more traffic and sweeps after the response change nothing
    harness
        .relay("wss://a")
        .push(&event_frame("S1", &signed_event("alice", 1, "two")));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(outcomes.responses(), 1);
    assert_eq!(outcomes.timeouts(), 0);
    assert_eq!(harness.engine.backlog().pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_already_saved_event_still_answers_request() {
    let store = RecordingStore::new();
    let e1 = signed_event("alice", 1, "known");
    store.save(&e1, &RelaySet::from(["wss://a".to_string()])).unwrap();

    let harness = start_with(
        vec![RelayEndpoint::new("wss://a"), RelayEndpoint::new("wss://b")],
        store,
        None,
    )
    .await;
    let (task, outcomes) = kind1_task(&harness, "S1");
    harness.engine.submit(task).unwrap();
    settle().await;

    harness.relay("wss://b").push(&event_frame("S1", &e1));
    tokio::time::sleep(Duration::from_secs(2)).await;

    // only the preload save; the new relay is still recorded
    assert_eq!(harness.store.saves(), 1);
    let stored = harness.store.fetch_by_id(&e1.id).unwrap().unwrap();
    assert_eq!(join_relays(&stored.relays), "wss://a wss://b");
    assert_eq!(outcomes.responses(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_forged_copy_does_not_block_authentic_copy() {
    let harness = start(vec![RelayEndpoint::new("wss://a"), RelayEndpoint::new("wss://b")]).await;
    let (task, _outcomes) = kind1_task(&harness, "S1");
    harness.engine.submit(task).unwrap();
    settle().await;

    let authentic = signed_event("alice", 1, "real");
    let mut forged = authentic.clone();
    forged.content = "tampered".to_string();

    harness.relay("wss://a").push(&event_frame("S1", &forged));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.store.saves(), 0);

    harness.relay("wss://b").push(&event_frame("S1", &authentic));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.store.saves(), 1);
    let stored = harness.store.fetch_by_id(&authentic.id).unwrap().unwrap();
    assert_eq!(stored.event.content, "real");
    assert!(stored.relays.contains("wss://b"));
}

#[tokio::test(start_paused = true)]
async fn test_event_status_never_regresses_across_out_of_order_frames() {
    let harness = start(vec![
        RelayEndpoint::new("wss://a"),
        RelayEndpoint::new("wss://b"),
        RelayEndpoint::new("wss://c"),
    ])
    .await;
    let (task, _outcomes) = kind1_task(&harness, "S1");
    harness.engine.submit(task).unwrap();
    settle().await;

    let authentic = signed_event("alice", 1, "real");
    let mut forged = authentic.clone();
    forged.content = "tampered".to_string();
    let malformed = serde_json::json!([
        "EVENT",
        "S1",
        {"id": authentic.id, "pubkey": authentic.pubkey, "kind": 1}
    ])
    .to_string();

    let mut seen = Vec::new();

    harness.relay("wss://c").push(&malformed);
    settle().await;
    seen.push(harness.engine.event_status(&authentic.id).await.unwrap());

    harness.relay("wss://a").push(&event_frame("S1", &forged));
    settle().await;
    seen.push(harness.engine.event_status(&authentic.id).await.unwrap());

    // the forged copy is dropped at drain
    tokio::time::sleep(Duration::from_secs(1)).await;
    seen.push(harness.engine.event_status(&authentic.id).await.unwrap());
    assert_eq!(harness.store.saves(), 0);

    harness.relay("wss://b").push(&event_frame("S1", &authentic));
    settle().await;
    seen.push(harness.engine.event_status(&authentic.id).await.unwrap());

    tokio::time::sleep(Duration::from_secs(1)).await;
    seen.push(harness.engine.event_status(&authentic.id).await.unwrap());

    harness.relay("wss://a").push(&event_frame("S1", &forged));
    harness.relay("wss://c").push(&malformed);
    harness.relay("wss://b").push(&event_frame("S1", &authentic));
    tokio::time::sleep(Duration::from_secs(1)).await;
    seen.push(harness.engine.event_status(&authentic.id).await.unwrap());

    assert_eq!(
        seen,
        vec![
            Some(EventStatus::Received),
            Some(EventStatus::Parsed),
            Some(EventStatus::Parsed),
            Some(EventStatus::Parsed),
            Some(EventStatus::Saved),
            Some(EventStatus::Saved),
        ]
    );
    assert_eq!(harness.store.saves(), 1);
    let stored = harness.store.fetch_by_id(&authentic.id).unwrap().unwrap();
    assert_eq!(stored.event.content, "real");
}

#[tokio::test(start_paused = true)]
async fn test_priority_request_receives_event() {
    let harness = start(vec![RelayEndpoint::new("wss://a")]).await;
    let mut imported = harness.engine.subscribe_imported();
    let pool = Arc::clone(harness.engine.pool());

    let engine_backlog = harness.engine.backlog().clone();
    let pending = tokio::spawn(async move {
        engine_backlog
            .request(
                ReqTask::new(move |id| {
                    pool.send(&common::kind1_req(id), &SendOptions::default()).unwrap();
                })
                .with_subscription_id("thread")
                .priority(),
            )
            .await
    });
    settle().await;

    let note = signed_event("alice", 1, "reply");
    harness.relay("wss://a").push(&event_frame("prio-thread", &note));

    match pending.await.unwrap() {
        Ok(TaskOutcome::Response(response)) => {
            assert_eq!(response.subscription_id, "prio-thread");
            assert_eq!(response.event, Some(note.clone()));
        }
        other => panic!("Expected priority response, got {:?}", other),
    }

    let mut priority = 0;
    while let Ok(event) = imported.try_recv() {
        if let IngestEvent::PriorityImported { event, .. } = event {
            assert_eq!(event.id, note.id);
            priority += 1;
        }
    }
    assert_eq!(priority, 1);
    assert_eq!(harness.store.saves(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_priority_copy_of_queued_event_is_notified_early() {
    let harness = start(vec![RelayEndpoint::new("wss://a"), RelayEndpoint::new("wss://b")]).await;
    let mut imported = harness.engine.subscribe_imported();
    let (feed, _feed_outcomes) = kind1_task(&harness, "S1");
    harness.engine.submit(feed).unwrap();
    let (thread, thread_outcomes) = kind1_task(&harness, "prio-thread");
    harness.engine.submit(thread.priority()).unwrap();
    settle().await;

    let note = signed_event("alice", 1, "both");
    harness.relay("wss://a").push(&event_frame("S1", &note));
    settle().await;
    harness.relay("wss://b").push(&event_frame("prio-thread", &note));
    settle().await;

    // answered before the normal lane drains
    assert_eq!(thread_outcomes.responses(), 1);
    assert_eq!(harness.store.saves(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.store.saves(), 1);
    let stored = harness.store.fetch_by_id(&note.id).unwrap().unwrap();
    assert_eq!(join_relays(&stored.relays), "wss://a wss://b");
    let touched: HashSet<String> = common::imported_notices(&mut imported).into_iter().flatten().collect();
    assert!(touched.contains("S1"));
    assert!(touched.contains("prio-thread"));
}

#[tokio::test(start_paused = true)]
async fn test_ok_from_another_relay_extends_attribution() {
    let harness = start(vec![RelayEndpoint::new("wss://a"), RelayEndpoint::new("wss://b")]).await;
    let (task, _outcomes) = kind1_task(&harness, "S1");
    harness.engine.submit(task).unwrap();
    settle().await;

    let e1 = signed_event("alice", 1, "hello");
    harness.relay("wss://a").push(&event_frame("S1", &e1));
    tokio::time::sleep(Duration::from_secs(1)).await;

    harness
        .relay("wss://b")
        .push(&serde_json::json!(["OK", e1.id, true, ""]).to_string());
    settle().await;

    let stored = harness.store.fetch_by_id(&e1.id).unwrap().unwrap();
    assert_eq!(join_relays(&stored.relays), "wss://a wss://b");
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_can_be_retried() {
    let harness = start(vec![RelayEndpoint::new("wss://a"), RelayEndpoint::new("wss://b")]).await;
    let (task, _outcomes) = kind1_task(&harness, "S1");
    harness.engine.submit(task).unwrap();
    settle().await;

    let e1 = signed_event("alice", 1, "hello");
    harness.store.set_fail_saves(true);
    harness.relay("wss://a").push(&event_frame("S1", &e1));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(harness.store.fetch_by_id(&e1.id).unwrap().is_none());

    harness.store.set_fail_saves(false);
    harness.relay("wss://b").push(&event_frame("S1", &e1));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(harness.store.fetch_by_id(&e1.id).unwrap().is_some());
}
