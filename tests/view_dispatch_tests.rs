//! Integration tests for view routing, catch-up and recovery

use cim_event_sourcing::{
    metadata_keys, ConsistencyMode, DomainEvent, EventStore, EventTypeDecl, EventTypeHierarchy,
    EventDispatcher, GlobalInstanceLocator, InMemoryEventStore, InMemoryViewManager,
    InstancePerAggregateRootLocator, SaveOutcome, Subscriptions, TypedViewManager, View,
    ViewConfig, ViewManager, ViewManagerEventDispatcher,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
struct Ledger {
    account_events: u32,
    monetary_total: i64,
    other: u32,
}

impl View for Ledger {
    fn subscriptions(subscriptions: &mut Subscriptions<Self>) {
        subscriptions
            .on_type("AccountEvent", |view: &mut Ledger, _| {
                view.account_events += 1;
                Ok(())
            })
            .on_type("Monetary", |view: &mut Ledger, event| {
                view.monetary_total += event.payload()["amount"].as_i64().unwrap_or_default();
                Ok(())
            })
            .on_all(|view: &mut Ledger, _| {
                view.other += 1;
                Ok(())
            });
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Journal {
    entries: Vec<(String, i64)>,
}

impl View for Journal {
    fn subscriptions(subscriptions: &mut Subscriptions<Self>) {
        subscriptions.on_all(|view: &mut Journal, event| {
            anyhow::ensure!(event.event_type() != "Corrupt", "cannot journal {event}");
            view.entries
                .push((event.event_type().to_string(), event.global_sequence_number()?));
            Ok(())
        });
    }
}

fn hierarchy() -> Arc<EventTypeHierarchy> {
    Arc::new(
        EventTypeHierarchy::builder()
            .declare(EventTypeDecl::new("AccountEvent"))
            .declare(EventTypeDecl::new("AccountOpened").extends("AccountEvent"))
            .declare(
                EventTypeDecl::new("Deposited")
                    .extends("AccountEvent")
                    .implements("Monetary"),
            )
            .build()
            .unwrap(),
    )
}

fn config() -> ViewConfig {
    ViewConfig {
        max_items_per_batch: 3,
        wait_poll_interval_ms: 5,
        idle_poll_interval_ms: 20,
    }
}

async fn commit(
    store: &InMemoryEventStore,
    root: &str,
    seq: i64,
    event_type: &str,
    amount: i64,
) -> Vec<DomainEvent> {
    let event = DomainEvent::new(event_type, serde_json::json!({ "amount": amount }))
        .with_meta(metadata_keys::AGGREGATE_ROOT_ID, root)
        .with_meta(metadata_keys::SEQUENCE_NUMBER, seq.to_string());
    match store.save(Uuid::new_v4(), vec![event]).await.unwrap() {
        SaveOutcome::Committed(events) => events,
        SaveOutcome::Conflict(conflict) => panic!("unexpected conflict: {conflict}"),
    }
}

#[tokio::test]
async fn handlers_are_reached_through_interfaces_ancestors_and_the_root_type() {
    let store = Arc::new(InMemoryEventStore::new());
    let ledger = Arc::new(InMemoryViewManager::<Ledger>::new(
        "ledger",
        Arc::new(GlobalInstanceLocator),
        hierarchy(),
    ));
    let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
        .with_view_manager(ledger.clone(), ConsistencyMode::Immediate);

    for events in [
        commit(&store, "acc", 0, "AccountOpened", 0).await,
        commit(&store, "acc", 1, "Deposited", 40).await,
        commit(&store, "acc", 2, "Deposited", 2).await,
        commit(&store, "acc", 3, "AuditTrailed", 0).await,
    ] {
        dispatcher.dispatch(&events).await;
    }

    let view = ledger.load("__global__").await.unwrap();
    assert_eq!(
        view.state,
        Ledger {
            account_events: 1,
            monetary_total: 42,
            other: 1,
        }
    );
    assert_eq!(view.last_global_sequence_number, 3);
    assert_eq!(ledger.position(), 3);
}

#[tokio::test]
async fn replay_after_purge_matches_an_uninterrupted_run() {
    let store = Arc::new(InMemoryEventStore::new());
    let live = Arc::new(InMemoryViewManager::<Journal>::new(
        "live",
        Arc::new(InstancePerAggregateRootLocator),
        Arc::new(EventTypeHierarchy::flat()),
    ));
    let rebuilt = Arc::new(InMemoryViewManager::<Journal>::new(
        "rebuilt",
        Arc::new(InstancePerAggregateRootLocator),
        Arc::new(EventTypeHierarchy::flat()),
    ));
    let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
        .with_view_manager(live.clone(), ConsistencyMode::Immediate)
        .with_view_manager(rebuilt.clone(), ConsistencyMode::Immediate);

    for seq in 0..4 {
        for root in ["a", "b"] {
            let events = commit(&store, root, seq, "Noted", seq).await;
            dispatcher.dispatch(&events).await;
        }
    }

    dispatcher.purge_and_replay("rebuilt").await.unwrap();

    assert_eq!(rebuilt.position(), live.position());
    assert_eq!(rebuilt.view_ids().await, live.view_ids().await);
    for root in ["a", "b"] {
        let expected = live.load(root).await.unwrap();
        let actual = rebuilt.load(root).await.unwrap();
        assert_eq!(actual.state, expected.state);
        assert_eq!(
            actual.last_global_sequence_number,
            expected.last_global_sequence_number
        );
    }
}

#[tokio::test]
async fn failing_handler_stops_the_manager_and_keeps_the_last_good_state() {
    let store = Arc::new(InMemoryEventStore::new());
    let journal = Arc::new(InMemoryViewManager::<Journal>::new(
        "journal",
        Arc::new(GlobalInstanceLocator),
        Arc::new(EventTypeHierarchy::flat()),
    ));
    let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
        .with_view_manager(journal.clone(), ConsistencyMode::Immediate);

    let good = commit(&store, "a", 0, "Noted", 1).await;
    dispatcher.dispatch(&good).await;
    let bad = commit(&store, "a", 1, "Corrupt", 1).await;
    dispatcher.dispatch(&bad).await;
    let after = commit(&store, "a", 2, "Noted", 1).await;
    dispatcher.dispatch(&after).await;

    assert!(journal.is_stopped());
    assert_eq!(journal.position(), 0);
    let view = journal.load("__global__").await.unwrap();
    assert_eq!(view.state.entries, vec![("Noted".to_string(), 0)]);
}

#[tokio::test]
async fn eventual_managers_see_events_committed_before_and_after_start() {
    let store = Arc::new(InMemoryEventStore::new());
    for seq in 0..5 {
        commit(&store, "a", seq, "Noted", seq).await;
    }
    let journal = Arc::new(InMemoryViewManager::<Journal>::new(
        "journal",
        Arc::new(GlobalInstanceLocator),
        Arc::new(EventTypeHierarchy::flat()),
    ));
    let mut updates = journal.subscribe_updates();
    let dispatcher = ViewManagerEventDispatcher::new(store.clone(), config())
        .with_view_manager(journal.clone(), ConsistencyMode::Eventual);

    dispatcher.initialize(false).await.unwrap();
    assert_eq!(journal.position(), 4);

    // Never dispatched locally; found by the idle poll
    commit(&store, "a", 5, "Noted", 5).await;
    let events = commit(&store, "a", 6, "Noted", 6).await;
    dispatcher.dispatch(&events).await;

    let mut last_seen = -1;
    while last_seen < 6 {
        let update = tokio::time::timeout(std::time::Duration::from_secs(5), updates.recv())
            .await
            .expect("views were not updated in time")
            .unwrap();
        assert_eq!(update.view_manager_id, "journal");
        assert!(update.position > last_seen);
        last_seen = update.position;
    }

    let view = journal.load("__global__").await.unwrap();
    let positions: Vec<i64> = view.state.entries.iter().map(|(_, global)| *global).collect();
    assert_eq!(positions, (0..=6).collect::<Vec<_>>());
    dispatcher.shutdown().await;
}
