//! The resident location tree.
//!
//! One `LocationTreeCache` is created per `App` and handed to whoever needs
//! the tree. The resident tree is swapped in one atomic step, so readers see
//! either the old tree or the new one.

use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::snapshot::SnapshotStore;
use super::{load_tree_from_store, LocationTree};
use crate::events::{
    Delivery, GlobalBus, GlobalEvent, GlobalEventKind, Interest, Listener, Subscriber,
};
use crate::store::ContentRouter;
use crate::sync::SyncManager;

pub struct LocationTreeCache {
    current: ArcSwapOption<LocationTree>,
    router: Arc<ContentRouter>,
    snapshots: SnapshotStore,
    sync: Arc<SyncManager>,
    global: Arc<GlobalBus>,
    delivery: Delivery,
    locale: String,
    listener: Mutex<Option<Arc<dyn Subscriber<GlobalEvent>>>>,
    /// Held for a whole rebuild, from reading the store to the announcement.
    rebuilding: tokio::sync::Mutex<()>,
}

impl LocationTreeCache {
    pub fn new(
        router: Arc<ContentRouter>,
        snapshots: SnapshotStore,
        sync: Arc<SyncManager>,
        global: Arc<GlobalBus>,
        delivery: Delivery,
        locale: &str,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            current: ArcSwapOption::empty(),
            router,
            snapshots,
            sync,
            global,
            delivery,
            locale: locale.to_string(),
            listener: Mutex::new(None),
            rebuilding: tokio::sync::Mutex::new(()),
        });
        cache.attach();
        cache
    }

    /// Listen for the global events that invalidate the resident tree.
    fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let listener: Arc<dyn Subscriber<GlobalEvent>> = Listener::new(
            Interest::Kinds(vec![
                GlobalEventKind::SyncSucceeded,
                GlobalEventKind::SyncFailed,
                GlobalEventKind::PatientCreated,
            ]),
            move |event: &GlobalEvent| {
                let Some(cache) = weak.upgrade() else {
                    return;
                };
                match event {
                    GlobalEvent::SyncSucceeded | GlobalEvent::PatientCreated(_) => cache.rebuild(),
                    GlobalEvent::SyncFailed { reason } => {
                        debug!(%reason, "Sync failed, keeping resident location tree");
                        cache.delivery.post(
                            &cache.global,
                            GlobalEvent::LocationsLoadFailed { reason: *reason },
                        );
                    }
                    _ => {}
                }
            },
        );
        self.global.register(listener.clone());
        *self.listener.lock() = Some(listener);
    }

    /// Stop reacting to global events.
    pub fn detach(&self) {
        if let Some(listener) = self.listener.lock().take() {
            self.global.unregister(&listener);
        }
    }

    /// The resident tree, if one has been loaded.
    pub fn current(&self) -> Option<Arc<LocationTree>> {
        self.current.load_full()
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.is_syncing()
    }

    pub fn force_sync(&self) -> bool {
        self.sync.force_sync()
    }

    /// Return the best tree available without waiting on the network.
    ///
    /// A resident tree is returned as is. Otherwise the disk snapshot is
    /// loaded and made resident. With neither, a full sync is requested and
    /// `None` returned; the tree arrives later as `LocationsLoaded`.
    /// Every tree returned is also announced as `LocationsLoaded`.
    pub fn build(&self) -> Option<Arc<LocationTree>> {
        if let Some(tree) = self.current.load_full() {
            debug!(locations = tree.len(), "Using resident location tree");
            self.announce(tree.clone());
            return Some(tree);
        }

        if let Some(cached) = self.snapshots.load() {
            let age = cached.age_display();
            match cached.data.into_tree() {
                Ok(tree) => {
                    let tree = Arc::new(tree);
                    debug!(locations = tree.len(), age = %age, "Loaded location snapshot");
                    self.current.store(Some(tree.clone()));
                    self.announce(tree.clone());
                    return Some(tree);
                }
                Err(e) => warn!(error = %e, "Discarding unusable location snapshot"),
            }
        }

        if !self.sync.force_sync() {
            debug!("Already syncing, location tree will follow");
        }
        None
    }

    /// Drop the resident tree and its snapshot.
    pub fn clear(&self) -> crate::Result<()> {
        self.current.store(None);
        self.snapshots.clear()
    }

    fn announce(&self, tree: Arc<LocationTree>) {
        self.delivery
            .post(&self.global, GlobalEvent::LocationsLoaded(tree));
    }

    /// Rebuild from the store in the background, then swap the new tree in,
    /// save it as the snapshot and announce it.
    ///
    /// Rebuilds run one at a time. The store is read inside the critical
    /// section, so the last rebuild to publish has read the newest rows.
    fn rebuild(self: &Arc<Self>) {
        let cache = self.clone();
        tokio::spawn(async move {
            let _rebuilding = cache.rebuilding.lock().await;
            let locale = cache.locale.clone();
            let built = cache
                .router
                .run(move |router| load_tree_from_store(router, &locale))
                .await;
            let tree = match built {
                Ok(tree) => Arc::new(tree),
                Err(e) => {
                    warn!(error = %e, "Location tree rebuild failed");
                    cache.delivery.post(
                        &cache.global,
                        GlobalEvent::LocationsLoadFailed { reason: e.reason() },
                    );
                    return;
                }
            };

            cache.current.store(Some(tree.clone()));
            info!(locations = tree.len(), "Location tree rebuilt");

            let snapshots = cache.snapshots.clone();
            let to_save = tree.clone();
            match tokio::task::spawn_blocking(move || snapshots.save(&to_save)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to save location snapshot"),
                Err(e) => warn!(error = %e, "Location snapshot task failed"),
            }

            cache.announce(tree);
        });
    }
}

impl Drop for LocationTreeCache {
    fn drop(&mut self) {
        self.detach();
    }
}
