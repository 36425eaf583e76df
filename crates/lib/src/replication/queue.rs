//! Per-session outbound queues.
//!
//! The map publishes each mutation once; [`OutboundQueues`] hands an
//! `Arc` of it to every registered session without holding any storage
//! lock. Queues are unbounded so a slow peer never blocks local writes; a
//! session that falls too far behind is caught up by the next bootstrap
//! after it reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::record::Mutation;

/// Identifies one session's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// Fan-out of published mutations to every live session.
#[derive(Debug, Default)]
pub struct OutboundQueues {
    next: AtomicU64,
    senders: Mutex<HashMap<SessionId, mpsc::UnboundedSender<Arc<Mutation>>>>,
}

impl OutboundQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a queue. Everything published from now on is delivered to it.
    pub fn register(&self) -> (SessionId, mpsc::UnboundedReceiver<Arc<Mutation>>) {
        let id = SessionId(self.next.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: SessionId) {
        self.senders.lock().remove(&id);
    }

    /// Queue `mutation` for every session except `origin`, the session it
    /// arrived on. Returns how many queues received it.
    pub fn publish(&self, mutation: Arc<Mutation>, origin: Option<SessionId>) -> usize {
        let mut senders = self.senders.lock();
        let mut delivered = 0;
        senders.retain(|id, tx| {
            if Some(*id) == origin {
                return true;
            }
            match tx.send(Arc::clone(&mutation)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Receiver gone: the session ended without unregistering.
                Err(_) => false,
            }
        });
        delivered
    }

    /// Drop every queue, ending the writers that drain them.
    pub fn close_all(&self) {
        self.senders.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.lock().is_empty()
    }
}

/// Unregisters its queue when dropped.
#[derive(Debug)]
pub struct QueueRegistration {
    queues: Arc<OutboundQueues>,
    id: SessionId,
}

impl QueueRegistration {
    pub fn register(queues: Arc<OutboundQueues>) -> (Self, mpsc::UnboundedReceiver<Arc<Mutation>>) {
        let (id, rx) = queues.register();
        (Self { queues, id }, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for QueueRegistration {
    fn drop(&mut self) {
        self.queues.unregister(self.id);
    }
}
