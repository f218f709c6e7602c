//! Capacity bounded connection pool
//!
//! Idle connections live in a lock-free MPMC queue. `total` counts every
//! connection owned by the pool, idle or leased, and is only raised through
//! a compare-and-swap so it never exceeds `capacity`.

use crate::stats::ConnectionStats;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct Idle<C> {
    conn: C,
    last_used: Instant,
}

pub struct ConnectionPool<C> {
    idle_tx: Sender<Idle<C>>,
    idle_rx: Receiver<Idle<C>>,
    capacity: usize,
    total: AtomicUsize,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl<C> ConnectionPool<C> {
    pub fn new(capacity: usize) -> Self {
        let (idle_tx, idle_rx) = bounded(capacity.max(1));
        Self {
            idle_tx,
            idle_rx,
            capacity,
            total: AtomicUsize::new(0),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle_rx.len()
    }

    /// Dequeue the oldest idle connection
    pub fn take(&self) -> Option<C> {
        self.idle_rx.try_recv().ok().map(|idle| idle.conn)
    }

    /// Claim a slot for a new connection, `false` when the pool is full
    pub fn try_reserve(&self) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                if total < self.capacity {
                    Some(total + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Give back a slot claimed by `try_reserve` or held by a closed connection
    pub fn release(&self) {
        let _ = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| total.checked_sub(1));
    }

    /// Return a leased connection to the idle queue
    ///
    /// The connection is handed back when the queue cannot take it.
    pub fn put(&self, conn: C) -> Result<(), C> {
        let idle = Idle {
            conn,
            last_used: Instant::now(),
        };
        match self.idle_tx.try_send(idle) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(idle)) | Err(TrySendError::Disconnected(idle)) => Err(idle.conn),
        }
    }

    pub fn record_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove idle connections unused for longer than `max_idle`
    ///
    /// Stale connections sit at the head of the queue. Once a fresh one is
    /// found, it and every entry queued behind it are cycled to the tail in
    /// order, so the queue stays sorted by last use.
    pub fn trim_idle(&self, max_idle: Duration, mut close: impl FnMut(C)) -> usize {
        let now = Instant::now();
        let mut trimmed = 0;
        let mut remaining = self.idle_rx.len();
        let mut rotating = false;

        while remaining > 0 {
            let idle = match self.idle_rx.try_recv() {
                Ok(idle) => idle,
                Err(_) => break,
            };
            remaining -= 1;

            if !rotating && now.saturating_duration_since(idle.last_used) > max_idle {
                self.release();
                close(idle.conn);
                trimmed += 1;
                continue;
            }
            rotating = true;
            if let Err(TrySendError::Full(idle)) | Err(TrySendError::Disconnected(idle)) =
                self.idle_tx.try_send(idle)
            {
                self.release();
                close(idle.conn);
                trimmed += 1;
            }
        }
        trimmed
    }

    /// Remove every idle connection
    pub fn drain(&self) -> Vec<C> {
        let mut drained = Vec::new();
        while let Ok(idle) = self.idle_rx.try_recv() {
            self.release();
            drained.push(idle.conn);
        }
        drained
    }

    pub fn stats(&self) -> ConnectionStats {
        let in_pool = self.idle_count();
        let in_use = self.total().saturating_sub(in_pool);
        ConnectionStats {
            in_pool,
            in_use,
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}
