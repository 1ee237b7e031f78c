//! Throttled dispatch queues
//!
//! C-Gate drops commands that arrive too fast and brokers dislike publish
//! bursts, so every outbound path goes through a paced FIFO: a single worker
//! pops items in insertion order and enforces a minimum interval between
//! dispatches. The first item after an idle period goes out immediately;
//! the pacing clock starts after each dispatch.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::warn;

/// Sink for dispatched queue items.
#[async_trait]
pub trait QueueConsumer<T>: Send {
    async fn dispatch(&mut self, item: T) -> Result<(), String>;
}

/// Pending items beyond this are dropped; a queue this deep means the far
/// end has been gone for a while and the orchestrator will clear it anyway.
const MAX_PENDING: usize = 1024;

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

/// Clonable producer handle. `clear` drops everything still pending.
pub struct QueueHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> QueueHandle<T> {
    pub fn push(&self, item: T) {
        {
            let mut items = self.shared.items.lock().unwrap();
            if items.len() >= MAX_PENDING {
                warn!(pending = items.len(), "queue_full_dropping_item");
                return;
            }
            items.push_back(item);
        }
        self.shared.notify.notify_one();
    }

    /// Drop all pending items. Items already handed to the consumer are
    /// unaffected; items enqueued before the clear never dispatch.
    pub fn clear(&self) {
        self.shared.items.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn drain(&self) -> Vec<T> {
        self.shared.items.lock().unwrap().drain(..).collect()
    }
}

pub struct ThrottledQueue<T> {
    shared: Arc<Shared<T>>,
    interval: Duration,
}

impl<T: Send + 'static> ThrottledQueue<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared { items: Mutex::new(VecDeque::new()), notify: Notify::new() }),
            interval,
        }
    }

    pub fn handle(&self) -> QueueHandle<T> {
        QueueHandle { shared: self.shared.clone() }
    }

    fn pop(&self) -> Option<T> {
        self.shared.items.lock().unwrap().pop_front()
    }

    /// Worker loop: dispatch in insertion order, then hold the pacing
    /// interval before the next dispatch. Consumer failures are logged and
    /// the item discarded; the queue keeps running.
    pub async fn run<C: QueueConsumer<T>>(
        self,
        mut consumer: C,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let item = loop {
                if let Some(item) = self.pop() {
                    break item;
                }
                tokio::select! {
                    _ = self.shared.notify.notified() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            };

            if let Err(e) = consumer.dispatch(item).await {
                warn!(error = %e, "queue_dispatch_failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
