//! Delivery queues between background samplers and subscribers.
//!
//! A [`DeliveryQueue`] is an unbounded FIFO of `f64` values. The producer side
//! never blocks and never drops a value; the consumer side may wait until an
//! item is available. Clones are handles to the same queue: two consumers
//! draining the same queue compete for its items.
//!
//! A [`DeliverySlot`] is the single mutable queue reference kept per
//! (channel, tracked value). Samplers push into whatever queue the slot
//! currently holds, and a subscription may swap in its own queue at bind time.
//! There is no fan-out to several subscribers.

use futures::stream::{self, Stream};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueInner {
    items: Mutex<VecDeque<f64>>,
    available: Notify,
}

/// Unbounded, ordered, thread-safe mailbox of values.
#[derive(Debug, Clone, Default)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value. Never blocks.
    pub fn push(&self, value: f64) {
        self.inner.items.lock().push_back(value);
        self.inner.available.notify_one();
    }

    /// Take the oldest value, waiting until one is available.
    pub async fn recv(&self) -> f64 {
        loop {
            if let Some(value) = self.try_recv() {
                return value;
            }
            // notify_one stores a permit when nobody waits, so a push racing
            // with the check above still wakes us.
            self.inner.available.notified().await;
        }
    }

    /// Take the oldest value if there is one.
    pub fn try_recv(&self) -> Option<f64> {
        self.inner.items.lock().pop_front()
    }

    /// Take all queued values, oldest first.
    pub fn drain(&self) -> Vec<f64> {
        self.inner.items.lock().drain(..).collect()
    }

    /// Number of queued values
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Whether the queue holds no values
    pub fn is_empty(&self) -> bool {
        self.inner.items.lock().is_empty()
    }

    /// Whether two handles refer to the same queue
    pub fn same_queue(&self, other: &DeliveryQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Endless stream of values for a subscription's drain loop.
    pub fn into_stream(self) -> impl Stream<Item = f64> + Send + 'static {
        stream::unfold(self, |queue| async move {
            let value = queue.recv().await;
            Some((value, queue))
        })
    }
}

/// The queue currently bound for one (channel, tracked value).
#[derive(Debug, Default)]
pub struct DeliverySlot {
    current: RwLock<DeliveryQueue>,
}

impl DeliverySlot {
    /// Create a slot holding a fresh queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Push into the currently bound queue
    pub fn push(&self, value: f64) {
        self.current.read().push(value);
    }

    /// Handle to the currently bound queue
    pub fn queue(&self) -> DeliveryQueue {
        self.current.read().clone()
    }

    /// Bind `queue` for all subsequent pushes and return the previous binding.
    pub fn rebind(&self, queue: DeliveryQueue) -> DeliveryQueue {
        std::mem::replace(&mut *self.current.write(), queue)
    }
}
