//! End-to-end flows through `App`: store, router, sync, tree cache, buses.

use std::sync::Arc;

use parking_lot::Mutex;

use wardsync_core::events::{
    CrudBus, CrudEvent, CrudEventKind, GlobalEvent, GlobalEventKind, Interest, Item, Listener,
    Subscriber,
};
use wardsync_core::filter::{LocationUuidFilter, SelectionFilter};
use wardsync_core::location::load_tree_from_store;
use wardsync_core::models::{Gender, Location, Patient, PatientDelta};
use wardsync_core::remote::MockRemote;
use wardsync_core::store::{ContentRouter, Query, ResourcePath, SelectionBuilder, Store};
use wardsync_core::App;

fn record<E: wardsync_core::events::BusEvent + Clone>(
    interest: Interest<E::Kind>,
) -> (Arc<Mutex<Vec<E>>>, Arc<dyn Subscriber<E>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener: Arc<dyn Subscriber<E>> = {
        let seen = seen.clone();
        Listener::new(interest, move |event: &E| seen.lock().push(event.clone()))
    };
    (seen, listener)
}

fn insert_patient(router: &ContentRouter, uuid: &str, location: &str) {
    let mut patient = Patient::new(uuid);
    patient.location_uuid = Some(location.to_string());
    router
        .insert(&ResourcePath::Patients, &patient.to_content_values())
        .unwrap();
}

#[test]
fn test_subtree_counts_from_rows() {
    let router = ContentRouter::new(Store::in_memory().unwrap());
    for location in [Location::new("A", None), Location::new("B", Some("A"))] {
        router
            .insert(&ResourcePath::Locations, &location.to_content_values())
            .unwrap();
    }
    insert_patient(&router, "p1", "B");
    insert_patient(&router, "p2", "B");
    insert_patient(&router, "p3", "A");

    let tree = load_tree_from_store(&router, "en").unwrap();
    assert_eq!(tree.patient_count("A"), Some(3));
    assert_eq!(tree.patient_count("B"), Some(2));

    // The subtree filter selects the same three patients.
    let filter = LocationUuidFilter::subtree(&tree, "A");
    let rows = router
        .query(&ResourcePath::Patients, &filter.to_query(""))
        .unwrap();
    assert_eq!(rows.len(), 3);
}

#[test]
fn test_selection_builder_composes_predicates() {
    let builder = SelectionBuilder::new()
        .table("patients")
        .and_where("x=?", ["1"])
        .and_where("y=?", ["2"]);
    assert_eq!(builder.selection(), "x=? AND y=?");
    assert_eq!(builder.args(), ["1".to_string(), "2".to_string()]);
}

#[tokio::test]
async fn test_force_sync_is_single_flight() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemote::new().with_location(Location::new("site", None)));
    let app = App::with_remote(
        Store::in_memory().unwrap(),
        remote.clone(),
        dir.path().to_path_buf(),
        "en",
    );
    let (seen, listener) = record::<GlobalEvent>(Interest::Kinds(vec![
        GlobalEventKind::SyncStarted,
        GlobalEventKind::SyncSucceeded,
    ]));
    app.global_bus().register(listener);

    remote.hold();
    assert!(app.sync().force_sync());
    assert!(!app.sync().force_sync());
    assert!(!app.sync().force_sync());
    remote.release();

    while !seen
        .lock()
        .iter()
        .any(|e| matches!(e, GlobalEvent::SyncSucceeded))
    {
        app.next().await;
    }
    assert_eq!(remote.calls("list_locations"), 1);
    let started = seen
        .lock()
        .iter()
        .filter(|e| matches!(e, GlobalEvent::SyncStarted))
        .count();
    assert_eq!(started, 1);
}

#[tokio::test]
async fn test_unclaimed_fetch_result_is_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::with_remote(
        Store::in_memory().unwrap(),
        Arc::new(MockRemote::new()),
        dir.path().to_path_buf(),
        "en",
    );
    insert_patient(app.router(), "p1", "site");

    // Subscribed only to failures: the cursor itself goes unclaimed.
    let bus: Arc<CrudBus> = app.crud_bus("screen");
    let (failures, listener) = record::<CrudEvent>(Interest::Kinds(vec![CrudEventKind::TaskFailed]));
    bus.register(listener);

    app.model().fetch_users(&bus);
    app.next().await;
    assert!(failures.lock().is_empty());
    assert_eq!(bus.cleanup_subscriber_count(), 1);

    // Registering the same model's cleanup again is idempotent.
    app.model().fetch_users(&bus);
    app.next().await;
    assert_eq!(bus.cleanup_subscriber_count(), 1);
}

#[tokio::test]
async fn test_add_patient_updates_tree_counts() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(
        MockRemote::new()
            .with_location(Location::new("site", None).named("en", "Site"))
            .with_location(Location::new("tent", Some("site")).named("en", "Tent")),
    );
    let app = App::with_remote(
        Store::in_memory().unwrap(),
        remote.clone(),
        dir.path().to_path_buf(),
        "en",
    );
    app.sync_now().await.unwrap();
    while app.locations().current().is_none() {
        app.next().await;
    }
    assert_eq!(app.locations().current().unwrap().patient_count("site"), Some(0));

    let (loaded, global_listener) =
        record::<GlobalEvent>(Interest::Kinds(vec![GlobalEventKind::LocationsLoaded]));
    app.global_bus().register(global_listener);
    let bus = app.crud_bus("admission");
    let (created, listener) = record::<CrudEvent>(Interest::All);
    bus.register(listener);

    app.model().add_patient(
        &bus,
        PatientDelta {
            id: Some("KH.7".to_string()),
            given_name: Some("Ada".to_string()),
            family_name: Some("Lovelace".to_string()),
            gender: Some(Gender::Female),
            location_uuid: Some("tent".to_string()),
            ..Default::default()
        },
    );
    // Wait for the tree rebuilt after the admission.
    let admitted = |e: &GlobalEvent| {
        matches!(e, GlobalEvent::LocationsLoaded(tree) if tree.patient_count("site") == Some(1))
    };
    while !loaded.lock().iter().any(admitted) {
        app.next().await;
    }

    let events = created.lock().clone();
    assert_eq!(events.len(), 1);
    let CrudEvent::ItemCreated(Item::Patient(patient)) = &events[0] else {
        panic!("expected created patient, got {:?}", events[0]);
    };
    assert_eq!(remote.patients()[0].uuid, patient.uuid);

    let tree = app.locations().current().unwrap();
    assert_eq!(tree.patient_count("site"), Some(1));
    assert_eq!(tree.patient_count("tent"), Some(1));
    assert_eq!(
        app.router()
            .query(&ResourcePath::Patients, &Query::new())
            .unwrap()
            .len(),
        1
    );
}
