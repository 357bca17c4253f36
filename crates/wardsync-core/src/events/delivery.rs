//! Hand-off of completion phases to the interactive context.
//!
//! Background units never post on a bus themselves. They queue a completion
//! on the `DeliveryQueue`, and whoever owns the interactive context drains
//! it with `pump` (from a frame or poll loop) or `next` (from async code).

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, trace};

use super::bus::{BusEvent, EventBus};

type Completion = Box<dyn FnOnce() + Send + 'static>;

pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Completion>,
    rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Sender side for background units.
    pub fn handle(&self) -> Delivery {
        Delivery {
            tx: self.tx.clone(),
        }
    }

    /// Run every queued completion, returning how many ran.
    pub fn pump(&self) -> usize {
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };
        let mut ran = 0;
        while let Ok(completion) = rx.try_recv() {
            completion();
            ran += 1;
        }
        if ran > 0 {
            trace!(completions = ran, "Pumped delivery queue");
        }
        ran
    }

    /// Wait for the next completion and run it.
    pub async fn next(&self) {
        let completion = {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        // The queue holds a sender, so the channel never closes.
        if let Some(completion) = completion {
            completion();
        }
    }
}

/// Cloneable sender of completions.
#[derive(Clone)]
pub struct Delivery {
    tx: mpsc::UnboundedSender<Completion>,
}

impl Delivery {
    /// Queue `completion` to run on the interactive context.
    pub fn complete(&self, completion: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(completion)).is_err() {
            error!("Failed to queue completion - delivery queue dropped");
        }
    }

    /// Queue a post of `event` on `bus`.
    pub fn post<E: BusEvent>(&self, bus: &Arc<EventBus<E>>, event: E) {
        let bus = bus.clone();
        self.complete(move || {
            bus.post(event);
        });
    }
}
