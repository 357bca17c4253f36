//! Wiring of the data layer into one `App`.
//!
//! The `App` owns the store, the buses and the delivery queue, and hands out
//! the `AppModel`, the location tree cache and the sync manager. Whoever owns
//! the `App` is the interactive context: it drains completions with `pump` or
//! `next`, and every event is posted from there.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::FailureReason;
use crate::events::{
    CrudBus, DeliveryQueue, GlobalBus, GlobalEvent, GlobalEventKind, Interest, Listener,
    Subscriber,
};
use crate::location::{LocationTreeCache, SnapshotStore};
use crate::model::AppModel;
use crate::remote::{HttpRemote, RemoteSource};
use crate::store::{ContentRouter, Store};
use crate::sync::SyncManager;

pub struct App {
    router: Arc<ContentRouter>,
    global: Arc<GlobalBus>,
    queue: DeliveryQueue,
    sync: Arc<SyncManager>,
    locations: Arc<LocationTreeCache>,
    model: AppModel,
}

impl App {
    /// Open the store under the configured data directory and talk to the
    /// configured server.
    pub fn open(config: &Config) -> Result<Self> {
        let (url, username, password) = config.server()?;
        let remote = HttpRemote::new(url, username, password)
            .context("Failed to create HTTP client")?;

        let data_dir = config.data_dir()?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        let db_path = config.database_path()?;
        let store = Store::open(&db_path)
            .with_context(|| format!("Failed to open store at {}", db_path.display()))?;
        info!(path = %db_path.display(), "Opened local store");

        Ok(Self::with_remote(store, Arc::new(remote), data_dir, &config.locale))
    }

    /// Assemble an `App` from its parts.
    pub fn with_remote(
        store: Store,
        remote: Arc<dyn RemoteSource>,
        cache_dir: PathBuf,
        locale: &str,
    ) -> Self {
        let router = Arc::new(ContentRouter::new(store));
        let global = Arc::new(GlobalBus::new("global"));
        let queue = DeliveryQueue::new();
        let sync = Arc::new(SyncManager::new(
            router.clone(),
            remote.clone(),
            global.clone(),
            queue.handle(),
        ));
        let locations = LocationTreeCache::new(
            router.clone(),
            SnapshotStore::new(cache_dir),
            sync.clone(),
            global.clone(),
            queue.handle(),
            locale,
        );
        let model = AppModel::new(
            router.clone(),
            remote,
            sync.clone(),
            global.clone(),
            queue.handle(),
        );
        Self {
            router,
            global,
            queue,
            sync,
            locations,
            model,
        }
    }

    pub fn router(&self) -> &Arc<ContentRouter> {
        &self.router
    }

    pub fn global_bus(&self) -> &Arc<GlobalBus> {
        &self.global
    }

    pub fn model(&self) -> &AppModel {
        &self.model
    }

    pub fn locations(&self) -> &Arc<LocationTreeCache> {
        &self.locations
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// A new bus for one consumer's crud results.
    pub fn crud_bus(&self, name: &'static str) -> Arc<CrudBus> {
        Arc::new(CrudBus::new(name))
    }

    /// Run every queued completion without waiting.
    pub fn pump(&self) -> usize {
        self.queue.pump()
    }

    /// Wait for the next completion and run it.
    pub async fn next(&self) {
        self.queue.next().await
    }

    /// Request a full sync (or join the one in flight) and drive the queue
    /// until it ends.
    pub async fn sync_now(&self) -> std::result::Result<(), FailureReason> {
        let outcome: Arc<Mutex<Option<std::result::Result<(), FailureReason>>>> =
            Arc::new(Mutex::new(None));
        let listener: Arc<dyn Subscriber<GlobalEvent>> = {
            let outcome = outcome.clone();
            Listener::new(
                Interest::Kinds(vec![GlobalEventKind::SyncSucceeded, GlobalEventKind::SyncFailed]),
                move |event: &GlobalEvent| {
                    let result = match event {
                        GlobalEvent::SyncFailed { reason } => Err(*reason),
                        _ => Ok(()),
                    };
                    *outcome.lock() = Some(result);
                },
            )
        };
        self.global.register(listener.clone());

        if !self.sync.force_sync() {
            debug!("Joining sync already in flight");
        }
        let result = loop {
            if let Some(result) = outcome.lock().take() {
                break result;
            }
            self.queue.next().await;
        };

        self.global.unregister(&listener);
        result
    }
}
