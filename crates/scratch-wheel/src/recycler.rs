//! Rendezvous between user threads and the wheel's control thread.
//!
//! Exactly one value is "current" at a time. Any number of user threads may
//! share it; any of them may request its recycling, but only the one that
//! actually clears it hands it to the control thread. Replacements queue up
//! until a slot for them opens.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

struct Exchange<T> {
    current: Option<Arc<T>>,
    /// Completed replacements not yet promoted to `current`.
    pending: VecDeque<Arc<T>>,
}

pub struct BackgroundRecycler<T> {
    exchange: Mutex<Exchange<T>>,
    available: Condvar,
    to_recycle_tx: Sender<Arc<T>>,
    to_recycle_rx: Receiver<Arc<T>>,
}

impl<T> BackgroundRecycler<T> {
    #[must_use]
    pub fn new() -> Self {
        let (to_recycle_tx, to_recycle_rx) = unbounded();
        Self {
            exchange: Mutex::new(Exchange {
                current: None,
                pending: VecDeque::new(),
            }),
            available: Condvar::new(),
            to_recycle_tx,
            to_recycle_rx,
        }
    }

    /// The current value, blocking until one is published. Concurrent
    /// callers may all receive the same `Arc`.
    pub fn get_current(&self) -> Arc<T> {
        let mut exchange = self.exchange.lock();
        loop {
            if let Some(current) = &exchange.current {
                return Arc::clone(current);
            }
            if let Some(next) = exchange.pending.pop_front() {
                exchange.current = Some(Arc::clone(&next));
                return next;
            }
            self.available.wait(&mut exchange);
        }
    }

    /// The current value if one is published, without blocking.
    #[must_use]
    pub fn peek_current(&self) -> Option<Arc<T>> {
        self.exchange.lock().current.clone()
    }

    /// Retire `value` if it is still current. Racing callers agree on one
    /// winner (identity comparison); only the winner enqueues the value for
    /// the control thread. The next pending replacement, if any, is
    /// promoted immediately.
    pub fn request_recycle(&self, value: &Arc<T>) {
        let mut exchange = self.exchange.lock();
        let is_current = exchange
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, value));
        if !is_current {
            return;
        }
        exchange.current = None;
        if let Some(next) = exchange.pending.pop_front() {
            exchange.current = Some(next);
            self.available.notify_all();
        }
        drop(exchange);
        // The channel is unbounded and we hold the only receiver: the send
        // cannot fail while the recycler is alive.
        let _ = self.to_recycle_tx.send(Arc::clone(value));
    }

    /// Control-thread side: wait up to `timeout` for a retired value.
    #[must_use]
    pub fn try_next_to_be_recycled(&self, timeout: Duration) -> Option<Arc<T>> {
        self.to_recycle_rx.recv_timeout(timeout).ok()
    }

    /// Control-thread side: publish a replacement.
    pub fn complete_recycle(&self, value: Arc<T>) {
        let mut exchange = self.exchange.lock();
        if exchange.current.is_none() {
            exchange.current = Some(value);
        } else {
            exchange.pending.push_back(value);
        }
        self.available.notify_all();
    }
}

impl<T> Default for BackgroundRecycler<T> {
    fn default() -> Self {
        Self::new()
    }
}
