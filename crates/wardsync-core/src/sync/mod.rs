//! Full synchronization with the remote records server.
//!
//! At most one full sync runs at a time. A sync replaces the local locations,
//! patients, users and orders with the server's copy and merges observations
//! changed since the last sync token. Its start and end times are recorded in
//! the `misc` row; the local model counts as complete only when the recorded
//! end is later than the recorded start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{Delivery, GlobalBus, GlobalEvent};
use crate::models::{Location, Observation, Order, Patient, User};
use crate::remote::RemoteSource;
use crate::store::contracts::{misc, observations};
use crate::store::{ContentRouter, ContentValues, Query, ResourcePath};

/// Upper bound on `?` placeholders in one `IN (...)` list.
const MAX_IN_PARAMS: usize = 500;

/// Sync bookkeeping recorded in the `misc` row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncTimes {
    pub full_sync_start: Option<DateTime<Utc>>,
    pub full_sync_end: Option<DateTime<Utc>>,
    /// Server time of the last observation batch.
    pub obs_sync: Option<DateTime<Utc>>,
}

impl SyncTimes {
    /// True when a full sync has completed since the last one started.
    pub fn is_full_model_available(&self) -> bool {
        matches!(
            (self.full_sync_start, self.full_sync_end),
            (Some(start), Some(end)) if end > start
        )
    }

    pub fn last_full_sync_time(&self) -> Option<DateTime<Utc>> {
        if self.is_full_model_available() {
            self.full_sync_end
        } else {
            None
        }
    }
}

/// Row counts written by one full sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub locations: usize,
    pub patients: usize,
    pub users: usize,
    pub orders: usize,
    pub observations: usize,
}

pub struct SyncManager {
    router: Arc<ContentRouter>,
    remote: Arc<dyn RemoteSource>,
    global: Arc<GlobalBus>,
    delivery: Delivery,
    syncing: AtomicBool,
}

impl SyncManager {
    pub fn new(
        router: Arc<ContentRouter>,
        remote: Arc<dyn RemoteSource>,
        global: Arc<GlobalBus>,
        delivery: Delivery,
    ) -> Self {
        Self {
            router,
            remote,
            global,
            delivery,
            syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Start a full sync in the background unless one is already running.
    ///
    /// Returns false, and does nothing else, when a sync is in flight.
    /// `SyncStarted` is queued immediately; `SyncSucceeded` or `SyncFailed`
    /// is queued when the sync ends.
    pub fn force_sync(self: &Arc<Self>) -> bool {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Full sync already in progress");
            return false;
        }

        info!("Starting full sync");
        self.delivery.post(&self.global, GlobalEvent::SyncStarted);

        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager.run_full_sync().await;
            manager.syncing.store(false, Ordering::Release);
            let event = match result {
                Ok(stats) => {
                    info!(
                        locations = stats.locations,
                        patients = stats.patients,
                        users = stats.users,
                        orders = stats.orders,
                        observations = stats.observations,
                        "Full sync complete"
                    );
                    GlobalEvent::SyncSucceeded
                }
                Err(e) => {
                    warn!(error = %e, "Full sync failed");
                    GlobalEvent::SyncFailed { reason: e.reason() }
                }
            };
            manager.delivery.post(&manager.global, event);
        });
        true
    }

    async fn run_full_sync(&self) -> Result<SyncStats> {
        let start = Utc::now().timestamp_millis();
        let since = self
            .router
            .run(move |router| {
                write_misc(router, misc::FULL_SYNC_START_MILLIS, start)?;
                read_sync_times(router)
            })
            .await?
            .obs_sync;

        let remote = &self.remote;
        let (locations, patients, users, orders, obs_batch) = futures::try_join!(
            remote.list_locations(),
            remote.list_patients(),
            remote.list_users(),
            remote.list_orders(),
            remote.list_observations_since(since),
        )?;
        debug!(
            locations = locations.len(),
            patients = patients.len(),
            observations = obs_batch.items.len(),
            "Fetched remote records"
        );

        let obs_token = obs_batch.server_time.timestamp_millis();
        let observations = obs_batch.items;
        self.router
            .run(move |router| {
                let stats = SyncStats {
                    locations: replace_locations(router, &locations)?,
                    patients: replace_all(router, ResourcePath::Patients, &patients, Patient::to_content_values)?,
                    users: replace_all(router, ResourcePath::Users, &users, User::to_content_values)?,
                    orders: replace_all(router, ResourcePath::Orders, &orders, Order::to_content_values)?,
                    observations: merge_observations(router, &observations)?,
                };
                write_misc(router, misc::OBS_SYNC_MILLIS, obs_token)?;
                let end = Utc::now().timestamp_millis().max(start + 1);
                write_misc(router, misc::FULL_SYNC_END_MILLIS, end)?;
                Ok(stats)
            })
            .await
    }

    /// Sync times currently recorded in the store.
    pub fn sync_times(&self) -> Result<SyncTimes> {
        read_sync_times(&self.router)
    }
}

fn write_misc(router: &ContentRouter, column: &str, millis: i64) -> Result<()> {
    let mut values = ContentValues::new();
    values.put(column, millis);
    router.update(&ResourcePath::Misc, &values, None, &[])?;
    Ok(())
}

fn read_sync_times(router: &ContentRouter) -> Result<SyncTimes> {
    let rows = router.query(&ResourcePath::Misc, &Query::new())?;
    let Some(row) = rows.first() else {
        return Ok(SyncTimes::default());
    };
    let time = |column: &str| {
        row.get_i64(column)
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    };
    Ok(SyncTimes {
        full_sync_start: time(misc::FULL_SYNC_START_MILLIS),
        full_sync_end: time(misc::FULL_SYNC_END_MILLIS),
        obs_sync: time(misc::OBS_SYNC_MILLIS),
    })
}

fn replace_all<T>(
    router: &ContentRouter,
    path: ResourcePath,
    items: &[T],
    to_values: fn(&T) -> ContentValues,
) -> Result<usize> {
    router.delete(&path, None, &[])?;
    let rows: Vec<ContentValues> = items.iter().map(to_values).collect();
    router.bulk_insert(&path, &rows)
}

fn replace_locations(router: &ContentRouter, locations: &[Location]) -> Result<usize> {
    router.delete(&ResourcePath::LocationNames, None, &[])?;
    let inserted = replace_all(
        router,
        ResourcePath::Locations,
        locations,
        Location::to_content_values,
    )?;
    let names: Vec<ContentValues> = locations.iter().flat_map(Location::name_rows).collect();
    router.bulk_insert(&ResourcePath::LocationNames, &names)?;
    Ok(inserted)
}

/// Replace stored observations that share a uuid with `batch`, and the
/// locally recorded copies of the batch's encounters, then insert the batch.
fn merge_observations(router: &ContentRouter, batch: &[Observation]) -> Result<usize> {
    let uuids: Vec<String> = batch.iter().filter_map(|o| o.uuid.clone()).collect();
    for chunk in uuids.chunks(MAX_IN_PARAMS) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        router.delete(
            &ResourcePath::Observations,
            Some(&format!("{} IN ({})", observations::UUID, placeholders)),
            chunk,
        )?;
    }

    let mut encounters: Vec<String> = batch.iter().filter_map(|o| o.encounter_uuid.clone()).collect();
    encounters.sort();
    encounters.dedup();
    for chunk in encounters.chunks(MAX_IN_PARAMS) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        router.delete(
            &ResourcePath::Observations,
            Some(&format!(
                "{} IS NULL AND {} IN ({})",
                observations::UUID,
                observations::ENCOUNTER_UUID,
                placeholders
            )),
            chunk,
        )?;
    }
    let rows: Vec<ContentValues> = batch.iter().map(Observation::to_content_values).collect();
    router.bulk_insert(&ResourcePath::Observations, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeliveryQueue, GlobalEventKind, Interest, Listener, Subscriber};
    use crate::remote::{MockFailure, MockRemote};
    use crate::store::Store;
    use crate::FailureReason;
    use parking_lot::Mutex;

    fn millis(ms: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(ms).single()
    }

    #[test]
    fn test_full_model_availability() {
        let times = |start: Option<i64>, end: Option<i64>| SyncTimes {
            full_sync_start: start.and_then(millis),
            full_sync_end: end.and_then(millis),
            obs_sync: None,
        };
        assert!(!times(None, None).is_full_model_available());
        assert!(!times(Some(10), None).is_full_model_available());
        assert!(!times(None, Some(10)).is_full_model_available());
        assert!(!times(Some(10), Some(10)).is_full_model_available());
        assert!(!times(Some(10), Some(5)).is_full_model_available());
        assert!(times(Some(10), Some(11)).is_full_model_available());
        assert_eq!(times(Some(10), Some(11)).last_full_sync_time(), millis(11));
        assert_eq!(times(Some(12), Some(11)).last_full_sync_time(), None);
    }

    struct Harness {
        manager: Arc<SyncManager>,
        remote: Arc<MockRemote>,
        router: Arc<ContentRouter>,
        queue: DeliveryQueue,
        events: Arc<Mutex<Vec<GlobalEvent>>>,
        _listener: Arc<dyn Subscriber<GlobalEvent>>,
    }

    fn harness(remote: MockRemote) -> Harness {
        let router = Arc::new(ContentRouter::new(Store::in_memory().unwrap()));
        let remote = Arc::new(remote);
        let global = Arc::new(GlobalBus::new("global"));
        let queue = DeliveryQueue::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let listener: Arc<dyn Subscriber<GlobalEvent>> = {
            let events = events.clone();
            Listener::new(Interest::All, move |e: &GlobalEvent| events.lock().push(e.clone()))
        };
        global.register(listener.clone());
        let manager = Arc::new(SyncManager::new(
            router.clone(),
            remote.clone(),
            global,
            queue.handle(),
        ));
        Harness {
            manager,
            remote,
            router,
            queue,
            events,
            _listener: listener,
        }
    }

    impl Harness {
        async fn wait_for_end(&self) {
            loop {
                self.queue.next().await;
                let ended = self.events.lock().iter().any(|e| {
                    matches!(e, GlobalEvent::SyncSucceeded | GlobalEvent::SyncFailed { .. })
                });
                if ended {
                    return;
                }
            }
        }

        fn kinds(&self) -> Vec<GlobalEventKind> {
            use crate::events::BusEvent;
            self.events.lock().iter().map(|e| e.kind()).collect()
        }
    }

    fn observation(uuid: &str, value: &str) -> Observation {
        Observation {
            uuid: Some(uuid.to_string()),
            patient_uuid: "p-1".to_string(),
            encounter_uuid: None,
            encounter_time: Utc::now(),
            concept_uuid: "temperature".to_string(),
            value: Some(value.to_string()),
            voided: false,
        }
    }

    #[tokio::test]
    async fn test_full_sync_replaces_local_records() {
        let mut patient = Patient::new("p-1");
        patient.location_uuid = Some("tent".to_string());
        let h = harness(
            MockRemote::new()
                .with_location(Location::new("site", None).named("en", "Site"))
                .with_location(Location::new("tent", Some("site")))
                .with_patient(patient)
                .with_user(User {
                    uuid: "u-1".to_string(),
                    full_name: "Nurse One".to_string(),
                })
                .with_observation(observation("o-1", "37.5")),
        );

        assert!(!h.manager.sync_times().unwrap().is_full_model_available());
        assert!(h.manager.force_sync());
        h.wait_for_end().await;

        assert_eq!(
            h.kinds(),
            vec![GlobalEventKind::SyncStarted, GlobalEventKind::SyncSucceeded]
        );
        assert!(!h.manager.is_syncing());
        let times = h.manager.sync_times().unwrap();
        assert!(times.is_full_model_available());
        assert!(times.obs_sync.is_some());

        let count = |path: ResourcePath| h.router.query(&path, &Query::new()).unwrap().len();
        assert_eq!(count(ResourcePath::Locations), 2);
        assert_eq!(count(ResourcePath::LocationNames), 1);
        assert_eq!(count(ResourcePath::Patients), 1);
        assert_eq!(count(ResourcePath::Users), 1);
        assert_eq!(count(ResourcePath::Observations), 1);
    }

    #[tokio::test]
    async fn test_observations_are_merged_by_uuid() {
        let h = harness(MockRemote::new().with_observation(observation("o-1", "38.0")));
        h.router
            .bulk_insert(
                &ResourcePath::Observations,
                &[
                    observation("o-1", "37.0").to_content_values(),
                    observation("o-2", "36.8").to_content_values(),
                ],
            )
            .unwrap();

        h.manager.force_sync();
        h.wait_for_end().await;

        let rows = h
            .router
            .query(
                &ResourcePath::Observations,
                &Query::new().order_by(observations::UUID),
            )
            .unwrap();
        let values: Vec<_> = rows
            .iter()
            .map(|r| (r.get_string(observations::UUID), r.get_string(observations::VALUE)))
            .collect();
        assert_eq!(
            values,
            vec![
                (Some("o-1".to_string()), Some("38.0".to_string())),
                (Some("o-2".to_string()), Some("36.8".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_force_sync_is_ignored_while_running() {
        let h = harness(MockRemote::new());
        h.remote.hold();

        assert!(h.manager.force_sync());
        assert!(h.manager.is_syncing());
        assert!(!h.manager.force_sync());
        assert!(!h.manager.force_sync());

        h.remote.release();
        h.wait_for_end().await;
        assert_eq!(h.remote.calls("list_locations"), 1);
        assert_eq!(
            h.kinds(),
            vec![GlobalEventKind::SyncStarted, GlobalEventKind::SyncSucceeded]
        );
    }

    #[tokio::test]
    async fn test_failed_sync_reports_reason_and_leaves_model_incomplete() {
        let h = harness(MockRemote::new());
        h.remote.set_failure(Some(MockFailure::Offline));

        h.manager.force_sync();
        h.wait_for_end().await;

        let last = h.events.lock().last().cloned();
        assert!(matches!(
            last,
            Some(GlobalEvent::SyncFailed {
                reason: FailureReason::Connectivity
            })
        ));
        let times = h.manager.sync_times().unwrap();
        assert!(times.full_sync_start.is_some());
        assert!(!times.is_full_model_available());
        assert!(!h.manager.is_syncing());
    }
}
