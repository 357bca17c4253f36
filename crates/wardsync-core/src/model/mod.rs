//! `AppModel`: one-shot asynchronous operations for the screens.
//!
//! Every operation returns immediately. Its work runs as a tokio task and
//! ends in exactly one event, the result or a `TaskFailed`, which is queued
//! on the delivery queue and posted on the caller's crud bus when the queue
//! is pumped.
//!
//! Writes go to the local store first and to the server second. When the
//! server step fails the local write is undone before the failure is
//! reported: a provisional row is deleted, a changed row is restored.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cursor::{FromRow, TypedCursor};
use crate::error::{DataError, Result};
use crate::events::{
    CrudBus, CrudCleanupSubscriber, CrudEvent, Delivery, FetchedCursor, GlobalBus, GlobalEvent,
    Item, ItemKind, TaskFailure, TaskKind,
};
use crate::filter::{SelectionFilter, UuidFilter};
use crate::location::load_tree_from_store;
use crate::models::{Encounter, Observation, Order, Patient, PatientDelta, User, VoidObs};
use crate::remote::{RemoteResult, RemoteSource};
use crate::store::contracts::{observations, patients, users, ROW_ID};
use crate::store::{ContentRouter, ContentValues, Query, ResourcePath};
use crate::sync::SyncManager;

pub struct AppModel {
    router: Arc<ContentRouter>,
    remote: Arc<dyn RemoteSource>,
    sync: Arc<SyncManager>,
    global: Arc<GlobalBus>,
    delivery: Delivery,
    cleanup: Arc<CrudCleanupSubscriber>,
}

impl AppModel {
    pub fn new(
        router: Arc<ContentRouter>,
        remote: Arc<dyn RemoteSource>,
        sync: Arc<SyncManager>,
        global: Arc<GlobalBus>,
        delivery: Delivery,
    ) -> Self {
        Self {
            router,
            remote,
            sync,
            global,
            delivery,
            cleanup: Arc::new(CrudCleanupSubscriber),
        }
    }

    /// True once a full sync has completed after the last one started.
    pub fn is_full_model_available(&self) -> bool {
        match self.sync.sync_times() {
            Ok(times) => times.is_full_model_available(),
            Err(e) => {
                warn!(error = %e, "Could not read sync times");
                false
            }
        }
    }

    pub fn last_full_sync_time(&self) -> Option<DateTime<Utc>> {
        self.sync
            .sync_times()
            .ok()
            .and_then(|times| times.last_full_sync_time())
    }

    // ========================================================================
    // Fetches
    // ========================================================================

    /// Patients matching `filter` for `constraint`, as a cursor.
    pub fn fetch_patients(&self, bus: &Arc<CrudBus>, filter: &dyn SelectionFilter, constraint: &str) {
        let mut query = filter.to_query(constraint);
        if query.sort_order.is_none() {
            query = query.order_by(patients::ID);
        }
        let router = self.router.clone();
        self.spawn_fetch(bus, TaskKind::FetchPatients, async move {
            let cursor = router
                .run(move |r| TypedCursor::<Patient>::load(r.query(&ResourcePath::Patients, &query)?))
                .await?;
            Ok(CrudEvent::CursorFetched(FetchedCursor::Patients(cursor)))
        });
    }

    /// One locally stored patient by uuid.
    pub fn fetch_single_patient(&self, bus: &Arc<CrudBus>, uuid: &str) {
        let router = self.router.clone();
        let uuid = uuid.to_string();
        self.spawn_fetch(bus, TaskKind::FetchPatient, async move {
            let patient = router.run(move |r| find_patient(r, &uuid)).await?;
            Ok(CrudEvent::ItemFetched(Item::Patient(patient)))
        });
    }

    /// Fetch a patient from the server by id and store it locally.
    pub fn download_single_patient(&self, bus: &Arc<CrudBus>, id: &str) {
        let router = self.router.clone();
        let remote = self.remote.clone();
        let id = id.to_string();
        self.spawn_fetch(bus, TaskKind::DownloadPatient, async move {
            let patient = remote.get_patient(&id).await?;
            let stored = router
                .run(move |r| {
                    delete_patient_row(r, &patient.uuid)?;
                    insert_patient(r, &patient)
                })
                .await?;
            debug!(uuid = %stored.uuid, "Downloaded patient");
            Ok(CrudEvent::ItemFetched(Item::Patient(stored)))
        });
    }

    pub fn fetch_users(&self, bus: &Arc<CrudBus>) {
        let router = self.router.clone();
        self.spawn_fetch(bus, TaskKind::FetchUsers, async move {
            let cursor = router
                .run(|r| {
                    let query = Query::new().order_by(users::FULL_NAME);
                    TypedCursor::<User>::load(r.query(&ResourcePath::Users, &query)?)
                })
                .await?;
            Ok(CrudEvent::CursorFetched(FetchedCursor::Users(cursor)))
        });
    }

    /// Unvoided observations of one patient, oldest first.
    pub fn fetch_observations(&self, bus: &Arc<CrudBus>, patient_uuid: &str) {
        let router = self.router.clone();
        let query = Query::new()
            .filter(
                &format!("{} = ? AND {} = 0", observations::PATIENT_UUID, observations::VOIDED),
                [patient_uuid],
            )
            .order_by(observations::ENCOUNTER_TIME);
        self.spawn_fetch(bus, TaskKind::FetchObservations, async move {
            let cursor = router
                .run(move |r| {
                    TypedCursor::<Observation>::load(r.query(&ResourcePath::Observations, &query)?)
                })
                .await?;
            Ok(CrudEvent::CursorFetched(FetchedCursor::Observations(cursor)))
        });
    }

    /// A location tree built from the store, independent of the resident one.
    pub fn fetch_location_tree(&self, bus: &Arc<CrudBus>, locale: &str) {
        let router = self.router.clone();
        let locale = locale.to_string();
        self.spawn_fetch(bus, TaskKind::FetchLocationTree, async move {
            let tree = router
                .run(move |r| load_tree_from_store(r, &locale))
                .await?;
            Ok(CrudEvent::LocationTreeFetched(Arc::new(tree)))
        });
    }

    // ========================================================================
    // Patients
    // ========================================================================

    /// Create a patient. On success `PatientCreated` is also posted on the
    /// global bus.
    pub fn add_patient(&self, bus: &Arc<CrudBus>, delta: PatientDelta) {
        let router = self.router.clone();
        let remote = self.remote.clone();
        let global = self.global.clone();
        let delivery = self.delivery.clone();
        self.spawn_unit(bus, TaskKind::AddPatient, async move {
            delta.validate_for_create()?;

            let mut provisional = Patient::new(&Uuid::new_v4().to_string());
            delta.apply(&mut provisional);
            let local = {
                let provisional = provisional.clone();
                router.run(move |r| insert_patient(r, &provisional)).await?
            };

            let provisional_uuid = local.uuid.clone();
            let mut created = remote_step(&router, remote.add_patient(&delta), move |r| {
                delete_patient_row(r, &provisional_uuid)
            })
            .await?;

            created.row_id = local.row_id;
            let stored = router
                .run(move |r| {
                    r.update(
                        &ResourcePath::Patients,
                        &created.to_content_values(),
                        Some(&by_uuid()),
                        &[local.uuid.clone()],
                    )?;
                    Ok(created)
                })
                .await?;

            debug!(uuid = %stored.uuid, "Patient created");
            delivery.post(&global, GlobalEvent::PatientCreated(stored.clone()));
            Ok(CrudEvent::ItemCreated(Item::Patient(stored)))
        });
    }

    pub fn update_patient(&self, bus: &Arc<CrudBus>, uuid: &str, delta: PatientDelta) {
        let router = self.router.clone();
        let remote = self.remote.clone();
        let uuid = uuid.to_string();
        self.spawn_unit(bus, TaskKind::UpdatePatient, async move {
            if delta.is_empty() {
                return Err(DataError::Validation("empty patient update".to_string()));
            }

            let original = {
                let uuid = uuid.clone();
                let delta = delta.clone();
                router
                    .run(move |r| {
                        let original = find_patient(r, &uuid)?;
                        write_patient(r, &uuid, &delta.to_content_values())?;
                        Ok(original)
                    })
                    .await?
            };

            let restore = original.clone();
            let mut updated = remote_step(&router, remote.update_patient(&uuid, &delta), move |r| {
                write_patient(r, &restore.uuid, &restore.to_content_values())
            })
            .await?;

            updated.row_id = original.row_id;
            let stored = router
                .run(move |r| {
                    write_patient(r, &uuid, &updated.to_content_values())?;
                    Ok(updated)
                })
                .await?;
            Ok(CrudEvent::ItemUpdated(Item::Patient(stored)))
        });
    }

    pub fn delete_patient(&self, bus: &Arc<CrudBus>, uuid: &str) {
        let router = self.router.clone();
        let remote = self.remote.clone();
        let uuid = uuid.to_string();
        self.spawn_unit(bus, TaskKind::DeletePatient, async move {
            let original = {
                let uuid = uuid.clone();
                router
                    .run(move |r| {
                        let original = find_patient(r, &uuid)?;
                        delete_patient_row(r, &uuid)?;
                        Ok(original)
                    })
                    .await?
            };

            remote_step(&router, remote.delete_patient(&uuid), move |r| {
                restore_patient(r, &original)
            })
            .await?;

            Ok(CrudEvent::ItemDeleted {
                kind: ItemKind::Patient,
                uuid,
            })
        });
    }

    // ========================================================================
    // Encounters, orders and observations
    // ========================================================================

    /// Record an encounter for `patient`.
    ///
    /// Its observations are stored locally under a provisional encounter
    /// uuid, which is replaced by the server's once the server accepts it.
    pub fn add_encounter(&self, bus: &Arc<CrudBus>, patient: &Patient, mut encounter: Encounter) {
        let router = self.router.clone();
        let remote = self.remote.clone();
        encounter.patient_uuid = patient.uuid.clone();
        self.spawn_unit(bus, TaskKind::AddEncounter, async move {
            if encounter.observations.is_empty() && encounter.order_uuids.is_empty() {
                return Err(DataError::Validation("encounter without observations".to_string()));
            }

            let provisional_uuid = Uuid::new_v4().to_string();
            let mut local = encounter.clone();
            local.uuid = Some(provisional_uuid.clone());
            let rows: Vec<ContentValues> = local
                .observation_rows()
                .iter()
                .map(Observation::to_content_values)
                .collect();
            router
                .run(move |r| r.bulk_insert(&ResourcePath::Observations, &rows).map(|_| ()))
                .await?;

            let undo_uuid = provisional_uuid.clone();
            let created = remote_step(&router, remote.add_encounter(&encounter), move |r| {
                r.delete(
                    &ResourcePath::Observations,
                    Some(&by_encounter()),
                    &[undo_uuid],
                )
                .map(|_| ())
            })
            .await?;

            if let Some(server_uuid) = created.uuid.clone() {
                router
                    .run(move |r| {
                        let mut values = ContentValues::new();
                        values.put_str(observations::ENCOUNTER_UUID, &server_uuid);
                        r.update(
                            &ResourcePath::Observations,
                            &values,
                            Some(&by_encounter()),
                            &[provisional_uuid],
                        )
                        .map(|_| ())
                    })
                    .await?;
            }
            Ok(CrudEvent::ItemCreated(Item::Encounter(created)))
        });
    }

    /// Record that `order_uuid` was executed for `patient` now.
    pub fn add_order_executed_encounter(&self, bus: &Arc<CrudBus>, patient: &Patient, order_uuid: &str) {
        let mut encounter = Encounter::new(&patient.uuid, Utc::now());
        encounter.order_uuids.push(order_uuid.to_string());
        self.add_encounter(bus, patient, encounter);
    }

    /// Create `order` when it has no uuid, update the stored order otherwise.
    pub fn save_order(&self, bus: &Arc<CrudBus>, order: Order) {
        let router = self.router.clone();
        let remote = self.remote.clone();
        self.spawn_unit(bus, TaskKind::SaveOrder, async move {
            match order.uuid.clone() {
                Some(uuid) => {
                    let path = ResourcePath::Order(uuid);
                    let original = {
                        let path = path.clone();
                        let values = order.to_content_values();
                        router
                            .run(move |r| {
                                let original = find_order(r, &path)?;
                                r.update(&path, &values, None, &[])?;
                                Ok(original)
                            })
                            .await?
                    };

                    let undo_path = path.clone();
                    let saved = remote_step(&router, remote.save_order(&order), move |r| {
                        r.update(&undo_path, &original.to_content_values(), None, &[])
                            .map(|_| ())
                    })
                    .await?;

                    let stored = store_order(&router, path, saved).await?;
                    Ok(CrudEvent::ItemUpdated(Item::Order(stored)))
                }
                None => {
                    if order.patient_uuid.is_empty() {
                        return Err(DataError::Validation("order without patient".to_string()));
                    }
                    let provisional_uuid = Uuid::new_v4().to_string();
                    let path = ResourcePath::Order(provisional_uuid.clone());
                    let mut provisional = order.clone();
                    provisional.uuid = Some(provisional_uuid);
                    router
                        .run(move |r| {
                            r.insert(&ResourcePath::Orders, &provisional.to_content_values())
                                .map(|_| ())
                        })
                        .await?;

                    let undo_path = path.clone();
                    let saved = remote_step(&router, remote.save_order(&order), move |r| {
                        r.delete(&undo_path, None, &[]).map(|_| ())
                    })
                    .await?;

                    let stored = store_order(&router, path, saved).await?;
                    Ok(CrudEvent::ItemCreated(Item::Order(stored)))
                }
            }
        });
    }

    pub fn delete_order(&self, bus: &Arc<CrudBus>, uuid: &str) {
        let router = self.router.clone();
        let remote = self.remote.clone();
        let uuid = uuid.to_string();
        self.spawn_unit(bus, TaskKind::DeleteOrder, async move {
            let path = ResourcePath::Order(uuid.clone());
            let original = router
                .run(move |r| {
                    let original = find_order(r, &path)?;
                    r.delete(&path, None, &[])?;
                    Ok(original)
                })
                .await?;

            remote_step(&router, remote.delete_order(&uuid), move |r| {
                r.insert(&ResourcePath::Orders, &original.to_content_values())
                    .map(|_| ())
            })
            .await?;

            Ok(CrudEvent::ItemDeleted {
                kind: ItemKind::Order,
                uuid,
            })
        });
    }

    /// Mark an observation voided locally and on the server.
    pub fn void_observation(&self, bus: &Arc<CrudBus>, obs: VoidObs) {
        let router = self.router.clone();
        let remote = self.remote.clone();
        self.spawn_unit(bus, TaskKind::VoidObservation, async move {
            let path = ResourcePath::Observation(obs.uuid.clone());
            {
                let path = path.clone();
                router.run(move |r| set_voided(r, &path, true)).await?;
            }

            remote_step(&router, remote.void_observation(&obs), move |r| {
                set_voided(r, &path, false)
            })
            .await?;

            Ok(CrudEvent::ItemDeleted {
                kind: ItemKind::Observation,
                uuid: obs.uuid,
            })
        });
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Run a fetch whose result may go unclaimed.
    ///
    /// The cleanup subscriber joins the bus now and again just before the
    /// result is posted, since it leaves whenever the bus loses its last
    /// subscriber in between.
    fn spawn_fetch<F>(&self, bus: &Arc<CrudBus>, task: TaskKind, unit: F)
    where
        F: Future<Output = Result<CrudEvent>> + Send + 'static,
    {
        bus.register_cleanup_subscriber(self.cleanup.clone());
        self.spawn(bus, task, Some(self.cleanup.clone()), unit);
    }

    /// Run `unit` as a tokio task and queue its event for `bus`.
    fn spawn_unit<F>(&self, bus: &Arc<CrudBus>, task: TaskKind, unit: F)
    where
        F: Future<Output = Result<CrudEvent>> + Send + 'static,
    {
        self.spawn(bus, task, None, unit);
    }

    fn spawn<F>(
        &self,
        bus: &Arc<CrudBus>,
        task: TaskKind,
        cleanup: Option<Arc<CrudCleanupSubscriber>>,
        unit: F,
    ) where
        F: Future<Output = Result<CrudEvent>> + Send + 'static,
    {
        let bus = bus.clone();
        let delivery = self.delivery.clone();
        tokio::spawn(async move {
            let event = match unit.await {
                Ok(event) => event,
                Err(e) => {
                    warn!(?task, error = %e, "Task failed");
                    CrudEvent::TaskFailed(TaskFailure::new(task, &e))
                }
            };
            delivery.complete(move || {
                if let Some(cleanup) = cleanup {
                    bus.register_cleanup_subscriber(cleanup);
                }
                bus.post(event);
            });
        });
    }
}

/// Await the server step of a write; when it fails, run `undo` on the store
/// before returning the server's error.
async fn remote_step<T, U>(
    router: &Arc<ContentRouter>,
    step: impl Future<Output = RemoteResult<T>>,
    undo: U,
) -> Result<T>
where
    U: FnOnce(&ContentRouter) -> Result<()> + Send + 'static,
{
    match step.await {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Err(undo_error) = router.run(undo).await {
                error!(error = %undo_error, "Failed to undo local write");
            }
            Err(e.into())
        }
    }
}

fn by_uuid() -> String {
    format!("{} = ?", patients::UUID)
}

fn by_encounter() -> String {
    format!("{} = ?", observations::ENCOUNTER_UUID)
}

fn find_patient(router: &ContentRouter, uuid: &str) -> Result<Patient> {
    let rows = router.query(&ResourcePath::Patients, &UuidFilter.to_query(uuid))?;
    match rows.first() {
        Some(row) => Patient::from_row(row),
        None => Err(DataError::NotFound(format!("patient {}", uuid))),
    }
}

/// Insert `patient`, returning it with its new row id.
fn insert_patient(router: &ContentRouter, patient: &Patient) -> Result<Patient> {
    let path = router.insert(&ResourcePath::Patients, &patient.to_content_values())?;
    let mut stored = patient.clone();
    if let ResourcePath::Patient(row_id) = path {
        stored.row_id = row_id.parse().ok();
    }
    Ok(stored)
}

/// Put a deleted patient back under its old row id, so paths to it stay valid.
fn restore_patient(router: &ContentRouter, patient: &Patient) -> Result<()> {
    let mut values = patient.to_content_values();
    if let Some(row_id) = patient.row_id {
        values.put(ROW_ID, row_id);
    }
    router.insert(&ResourcePath::Patients, &values)?;
    Ok(())
}

fn write_patient(router: &ContentRouter, uuid: &str, values: &ContentValues) -> Result<()> {
    router.update(
        &ResourcePath::Patients,
        values,
        Some(&by_uuid()),
        &[uuid.to_string()],
    )?;
    Ok(())
}

fn delete_patient_row(router: &ContentRouter, uuid: &str) -> Result<()> {
    router.delete(&ResourcePath::Patients, Some(&by_uuid()), &[uuid.to_string()])?;
    Ok(())
}

fn find_order(router: &ContentRouter, path: &ResourcePath) -> Result<Order> {
    let rows = router.query(path, &Query::new())?;
    match rows.first() {
        Some(row) => Order::from_row(row),
        None => Err(DataError::NotFound(path.to_string())),
    }
}

/// Overwrite the order stored at `path` with the server's copy.
async fn store_order(router: &Arc<ContentRouter>, path: ResourcePath, saved: Order) -> Result<Order> {
    router
        .run(move |r| {
            r.update(&path, &saved.to_content_values(), None, &[])?;
            Ok(saved)
        })
        .await
}

fn set_voided(router: &ContentRouter, path: &ResourcePath, voided: bool) -> Result<()> {
    let mut values = ContentValues::new();
    values.put(observations::VOIDED, i64::from(voided));
    if router.update(path, &values, None, &[])? == 0 {
        return Err(DataError::NotFound(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CrudEventKind, DeliveryQueue, Interest, Listener, Subscriber};
    use crate::filter::NameFilter;
    use crate::models::{Gender, ORDER_EXECUTED_CONCEPT_UUID};
    use crate::remote::{MockFailure, MockRemote};
    use crate::store::Store;
    use crate::FailureReason;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct Harness {
        model: AppModel,
        router: Arc<ContentRouter>,
        remote: Arc<MockRemote>,
        global: Arc<GlobalBus>,
        queue: DeliveryQueue,
        bus: Arc<CrudBus>,
        events: Arc<Mutex<VecDeque<CrudEvent>>>,
        listener: Arc<dyn Subscriber<CrudEvent>>,
    }

    fn harness(remote: MockRemote) -> Harness {
        let router = Arc::new(ContentRouter::new(Store::in_memory().unwrap()));
        let remote = Arc::new(remote);
        let global = Arc::new(GlobalBus::new("global"));
        let queue = DeliveryQueue::new();
        let sync = Arc::new(SyncManager::new(
            router.clone(),
            remote.clone(),
            global.clone(),
            queue.handle(),
        ));
        let model = AppModel::new(router.clone(), remote.clone(), sync, global.clone(), queue.handle());
        let bus = Arc::new(CrudBus::new("crud"));
        let events = Arc::new(Mutex::new(VecDeque::new()));
        let listener: Arc<dyn Subscriber<CrudEvent>> = {
            let events = events.clone();
            Listener::new(Interest::All, move |e: &CrudEvent| events.lock().push_back(e.clone()))
        };
        bus.register(listener.clone());
        Harness {
            model,
            router,
            remote,
            global,
            queue,
            bus,
            events,
            listener,
        }
    }

    impl Harness {
        async fn next_event(&self) -> CrudEvent {
            loop {
                if let Some(event) = self.events.lock().pop_front() {
                    return event;
                }
                self.queue.next().await;
            }
        }

        fn patient_count(&self) -> usize {
            self.router
                .query(&ResourcePath::Patients, &Query::new())
                .unwrap()
                .len()
        }

        fn store_patient(&self, uuid: &str, id: &str, given: &str) -> Patient {
            let mut patient = Patient::new(uuid);
            patient.id = Some(id.to_string());
            patient.given_name = Some(given.to_string());
            patient.family_name = Some("Doe".to_string());
            insert_patient(&self.router, &patient).unwrap()
        }
    }

    fn new_patient() -> PatientDelta {
        PatientDelta {
            id: Some("KH.1".to_string()),
            given_name: Some("Ada".to_string()),
            family_name: Some("Lovelace".to_string()),
            gender: Some(Gender::Female),
            location_uuid: Some("tent-1".to_string()),
            ..Default::default()
        }
    }

    fn failure(event: CrudEvent) -> TaskFailure {
        match event {
            CrudEvent::TaskFailed(failure) => failure,
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_patients_with_filter() {
        let h = harness(MockRemote::new());
        h.store_patient("u-1", "1", "Ada");
        h.store_patient("u-2", "2", "Grace");
        h.store_patient("u-3", "3", "Adam");

        h.model.fetch_patients(&h.bus, &NameFilter, "ada");
        let CrudEvent::CursorFetched(FetchedCursor::Patients(cursor)) = h.next_event().await else {
            panic!("expected patients cursor");
        };
        let ids: Vec<_> = cursor.iter().unwrap().map(|p| p.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(h.bus.cleanup_subscriber_count(), 1);
    }

    struct CursorCapture(Arc<Mutex<Option<FetchedCursor>>>);

    impl crate::events::CleanupSubscriber<CrudEvent> for CursorCapture {
        fn on_no_subscriber(self: Arc<Self>, _bus: &CrudBus, event: &CrudEvent) {
            if let CrudEvent::CursorFetched(cursor) = event {
                *self.0.lock() = Some(cursor.clone());
            }
        }

        fn on_all_unregistered(self: Arc<Self>, _bus: &CrudBus) {}
    }

    #[tokio::test]
    async fn test_unclaimed_cursor_is_closed() {
        let h = harness(MockRemote::new());
        h.store_patient("u-1", "1", "Ada");

        // Only failures are claimed on this bus, so the cursor goes unclaimed.
        let bus = Arc::new(CrudBus::new("screen"));
        let failures: Arc<dyn Subscriber<CrudEvent>> =
            Listener::new(Interest::Kinds(vec![CrudEventKind::TaskFailed]), |_: &CrudEvent| {});
        bus.register(failures);
        let seen = Arc::new(Mutex::new(None));
        bus.register_cleanup_subscriber(Arc::new(CursorCapture(seen.clone())));

        h.model.fetch_patients(&bus, &crate::filter::AllFilter, "");
        while seen.lock().is_none() {
            h.queue.next().await;
        }
        let cursor = seen.lock().take().unwrap();
        assert!(cursor.is_closed());
    }

    #[tokio::test]
    async fn test_cursor_closed_after_last_subscriber_leaves() {
        let h = harness(MockRemote::new());
        h.store_patient("u-1", "1", "Ada");
        let seen = Arc::new(Mutex::new(None));
        h.bus
            .register_cleanup_subscriber(Arc::new(CursorCapture(seen.clone())));

        // The screen goes away while the fetch is still running.
        h.model.fetch_patients(&h.bus, &crate::filter::AllFilter, "");
        h.bus.unregister(&h.listener);
        assert_eq!(h.bus.cleanup_subscriber_count(), 1);

        while seen.lock().is_none() {
            h.queue.next().await;
        }
        let cursor = seen.lock().take().unwrap();
        assert!(cursor.is_closed());
        assert!(h.events.lock().is_empty());
        assert_eq!(h.bus.cleanup_subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_fetch_single_patient() {
        let h = harness(MockRemote::new());
        let stored = h.store_patient("u-1", "1", "Ada");

        h.model.fetch_single_patient(&h.bus, "u-1");
        let CrudEvent::ItemFetched(Item::Patient(patient)) = h.next_event().await else {
            panic!("expected patient");
        };
        assert_eq!(patient, stored);

        h.model.fetch_single_patient(&h.bus, "missing");
        let failure = failure(h.next_event().await);
        assert_eq!(failure.task, TaskKind::FetchPatient);
        assert_eq!(failure.reason, FailureReason::NotFound);
    }

    #[tokio::test]
    async fn test_download_single_patient_upserts() {
        let mut remote_patient = Patient::new("srv-1");
        remote_patient.id = Some("KH.9".to_string());
        remote_patient.given_name = Some("Remote".to_string());
        let h = harness(MockRemote::new().with_patient(remote_patient));
        h.store_patient("srv-1", "KH.9", "Stale");

        h.model.download_single_patient(&h.bus, "KH.9");
        let CrudEvent::ItemFetched(Item::Patient(patient)) = h.next_event().await else {
            panic!("expected patient");
        };
        assert_eq!(patient.given_name.as_deref(), Some("Remote"));
        assert!(patient.row_id.is_some());
        assert_eq!(h.patient_count(), 1);
        assert_eq!(
            find_patient(&h.router, "srv-1").unwrap().given_name.as_deref(),
            Some("Remote")
        );
    }

    #[tokio::test]
    async fn test_fetch_location_tree() {
        let h = harness(MockRemote::new());
        for location in [
            crate::models::Location::new("site", None),
            crate::models::Location::new("tent-1", Some("site")),
        ] {
            h.router
                .insert(&ResourcePath::Locations, &location.to_content_values())
                .unwrap();
        }
        let mut patient = Patient::new("u-1");
        patient.location_uuid = Some("tent-1".to_string());
        insert_patient(&h.router, &patient).unwrap();

        h.model.fetch_location_tree(&h.bus, "en");
        let CrudEvent::LocationTreeFetched(tree) = h.next_event().await else {
            panic!("expected tree");
        };
        assert_eq!(tree.patient_count("site"), Some(1));
    }

    #[tokio::test]
    async fn test_add_patient_replaces_provisional_row() {
        let h = harness(MockRemote::new());
        let created = Arc::new(Mutex::new(Vec::new()));
        let global_listener: Arc<dyn Subscriber<GlobalEvent>> = {
            let created = created.clone();
            Listener::new(Interest::All, move |e: &GlobalEvent| {
                if let GlobalEvent::PatientCreated(p) = e {
                    created.lock().push(p.uuid.clone());
                }
            })
        };
        h.global.register(global_listener);

        h.model.add_patient(&h.bus, new_patient());
        let CrudEvent::ItemCreated(Item::Patient(patient)) = h.next_event().await else {
            panic!("expected created patient");
        };

        let server = h.remote.patients();
        assert_eq!(server.len(), 1);
        assert_eq!(patient.uuid, server[0].uuid);
        assert_eq!(patient.full_name(), "Ada Lovelace");
        assert_eq!(h.patient_count(), 1);
        let local = find_patient(&h.router, &patient.uuid).unwrap();
        assert_eq!(local.row_id, patient.row_id);
        assert_eq!(local.location_uuid.as_deref(), Some("tent-1"));
        assert_eq!(*created.lock(), vec![patient.uuid.clone()]);
    }

    #[tokio::test]
    async fn test_add_patient_remote_failure_removes_provisional_row() {
        let h = harness(MockRemote::new());
        h.remote.set_failure(Some(MockFailure::Offline));

        h.model.add_patient(&h.bus, new_patient());
        let failure = failure(h.next_event().await);
        assert_eq!(failure.task, TaskKind::AddPatient);
        assert_eq!(failure.reason, FailureReason::Connectivity);
        assert_eq!(h.patient_count(), 0);
        assert!(h.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_add_patient_validation_never_reaches_server() {
        let h = harness(MockRemote::new());
        h.model.add_patient(
            &h.bus,
            PatientDelta {
                given_name: Some("Ada".to_string()),
                ..Default::default()
            },
        );
        let failure = failure(h.next_event().await);
        assert_eq!(failure.reason, FailureReason::Validation);
        assert_eq!(h.remote.calls("add_patient"), 0);
        assert_eq!(h.patient_count(), 0);
    }

    #[tokio::test]
    async fn test_update_patient_and_revert_on_failure() {
        let mut remote_patient = Patient::new("u-1");
        remote_patient.given_name = Some("Ada".to_string());
        let h = harness(MockRemote::new().with_patient(remote_patient));
        h.store_patient("u-1", "1", "Ada");

        let rename = PatientDelta {
            given_name: Some("Augusta".to_string()),
            ..Default::default()
        };
        h.model.update_patient(&h.bus, "u-1", rename.clone());
        let CrudEvent::ItemUpdated(Item::Patient(updated)) = h.next_event().await else {
            panic!("expected update");
        };
        assert_eq!(updated.given_name.as_deref(), Some("Augusta"));
        assert_eq!(
            find_patient(&h.router, "u-1").unwrap().given_name.as_deref(),
            Some("Augusta")
        );

        h.remote.set_failure(Some(MockFailure::ServerError));
        h.model.update_patient(
            &h.bus,
            "u-1",
            PatientDelta {
                given_name: Some("Nobody".to_string()),
                ..Default::default()
            },
        );
        let failure = failure(h.next_event().await);
        assert_eq!(failure.reason, FailureReason::ServerError);
        assert_eq!(
            find_patient(&h.router, "u-1").unwrap().given_name.as_deref(),
            Some("Augusta")
        );
    }

    #[tokio::test]
    async fn test_delete_patient_restores_on_failure() {
        let h = harness(MockRemote::new());
        let stored = h.store_patient("u-1", "1", "Ada");
        let row_id = stored.row_id.unwrap();

        h.remote.set_failure(Some(MockFailure::Offline));
        h.model.delete_patient(&h.bus, "u-1");
        failure(h.next_event().await);
        assert_eq!(h.patient_count(), 1);

        // The restored row answers to the path it had before the delete.
        let rows = h
            .router
            .query(&ResourcePath::Patient(row_id.to_string()), &Query::new())
            .unwrap();
        assert_eq!(rows.len(), 1);
        let restored = Patient::from_row(rows.first().unwrap()).unwrap();
        assert_eq!(restored.row_id, Some(row_id));
        assert_eq!(restored.uuid, "u-1");

        h.remote.set_failure(None);
        h.model.delete_patient(&h.bus, "u-1");
        let event = h.next_event().await;
        assert!(matches!(
            event,
            CrudEvent::ItemDeleted { kind: ItemKind::Patient, ref uuid } if uuid == "u-1"
        ));
        assert_eq!(h.patient_count(), 0);
    }

    #[tokio::test]
    async fn test_order_executed_encounter() {
        let h = harness(MockRemote::new());
        let patient = h.store_patient("u-1", "1", "Ada");

        h.model.add_order_executed_encounter(&h.bus, &patient, "order-1");
        let CrudEvent::ItemCreated(Item::Encounter(encounter)) = h.next_event().await else {
            panic!("expected encounter");
        };
        let server_uuid = encounter.uuid.clone().unwrap();

        let rows = h
            .router
            .query(&ResourcePath::Observations, &Query::new())
            .unwrap();
        assert_eq!(rows.len(), 1);
        let obs = Observation::from_row(rows.first().unwrap()).unwrap();
        assert_eq!(obs.concept_uuid, ORDER_EXECUTED_CONCEPT_UUID);
        assert_eq!(obs.value.as_deref(), Some("order-1"));
        assert_eq!(obs.encounter_uuid.as_deref(), Some(server_uuid.as_str()));
        assert_eq!(obs.patient_uuid, "u-1");
    }

    #[tokio::test]
    async fn test_failed_encounter_leaves_no_observations() {
        let h = harness(MockRemote::new());
        let patient = h.store_patient("u-1", "1", "Ada");
        h.remote.set_failure(Some(MockFailure::ServerError));

        let encounter = Encounter::new("ignored", Utc::now()).observe("temperature", "38.2");
        h.model.add_encounter(&h.bus, &patient, encounter);
        assert_eq!(failure(h.next_event().await).task, TaskKind::AddEncounter);
        assert!(h
            .router
            .query(&ResourcePath::Observations, &Query::new())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_save_and_delete_order() {
        let h = harness(MockRemote::new());
        let order = Order {
            uuid: None,
            patient_uuid: "u-1".to_string(),
            instructions: "Paracetamol 1g".to_string(),
            start: Some(Utc::now()),
            stop: None,
        };

        h.model.save_order(&h.bus, order);
        let CrudEvent::ItemCreated(Item::Order(created)) = h.next_event().await else {
            panic!("expected created order");
        };
        let uuid = created.uuid.clone().unwrap();
        assert_eq!(h.remote.orders()[0].uuid.as_deref(), Some(uuid.as_str()));
        let stored = find_order(&h.router, &ResourcePath::Order(uuid.clone())).unwrap();
        assert_eq!(stored.instructions, "Paracetamol 1g");

        let mut changed = created.clone();
        changed.instructions = "Paracetamol 500mg".to_string();
        h.model.save_order(&h.bus, changed);
        let CrudEvent::ItemUpdated(Item::Order(updated)) = h.next_event().await else {
            panic!("expected updated order");
        };
        assert_eq!(updated.instructions, "Paracetamol 500mg");

        h.model.delete_order(&h.bus, &uuid);
        let event = h.next_event().await;
        assert!(matches!(event, CrudEvent::ItemDeleted { kind: ItemKind::Order, .. }));
        assert!(h
            .router
            .query(&ResourcePath::Orders, &Query::new())
            .unwrap()
            .is_empty());
        assert!(h.remote.orders().is_empty());
    }

    #[tokio::test]
    async fn test_void_observation() {
        let obs = Observation {
            uuid: Some("o-1".to_string()),
            patient_uuid: "u-1".to_string(),
            encounter_uuid: None,
            encounter_time: Utc::now(),
            concept_uuid: "temperature".to_string(),
            value: Some("39.0".to_string()),
            voided: false,
        };
        let h = harness(MockRemote::new().with_observation(obs.clone()));
        h.router
            .insert(&ResourcePath::Observations, &obs.to_content_values())
            .unwrap();

        h.model.void_observation(&h.bus, VoidObs::new("o-1"));
        assert!(matches!(
            h.next_event().await,
            CrudEvent::ItemDeleted { kind: ItemKind::Observation, .. }
        ));
        assert!(h.remote.observations()[0].voided);

        h.model.fetch_observations(&h.bus, "u-1");
        let CrudEvent::CursorFetched(FetchedCursor::Observations(cursor)) = h.next_event().await
        else {
            panic!("expected observations");
        };
        assert_eq!(cursor.count().unwrap(), 0);

        h.model.void_observation(&h.bus, VoidObs::new("missing"));
        assert_eq!(failure(h.next_event().await).reason, FailureReason::NotFound);
        h.bus.unregister(&h.listener);
    }

    #[tokio::test]
    async fn test_full_model_flags_follow_sync() {
        let h = harness(MockRemote::new());
        assert!(!h.model.is_full_model_available());
        assert!(h.model.last_full_sync_time().is_none());

        assert!(h.model.sync.force_sync());
        while h.model.sync.is_syncing() || h.queue.pump() > 0 {
            tokio::task::yield_now().await;
        }
        assert!(h.model.is_full_model_available());
        assert!(h.model.last_full_sync_time().is_some());
    }
}
