//! Event buses and completion delivery.
//!
//! Two buses share one implementation: the global bus for sync and location
//! lifecycle signals, and crud buses scoped to one consumer for the results
//! of `AppModel` operations.

pub mod bus;
pub mod crud;
pub mod delivery;
pub mod global;

pub use bus::{BusEvent, CleanupSubscriber, EventBus, Interest, Listener, Subscriber};
pub use crud::{
    CrudCleanupSubscriber, CrudEvent, CrudEventKind, FetchedCursor, Item, ItemKind, TaskFailure,
    TaskKind,
};
pub use delivery::{Delivery, DeliveryQueue};
pub use global::{GlobalEvent, GlobalEventKind};

pub type GlobalBus = EventBus<GlobalEvent>;
pub type CrudBus = EventBus<CrudEvent>;
