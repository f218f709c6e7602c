//! Deadline tracking for asynchronous attempts
//!
//! One background thread watches every in-flight attempt instead of arming a
//! timer per attempt. New entries go through a lock-free intake channel. Each
//! wake drains the intake onto the working list and walks the list once,
//! dropping entries that finished or expired and re-appending the rest.

use crate::error::{ClientError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Shortest sleep between walks
const MIN_INTERVAL: Duration = Duration::from_millis(5);

const IDLE: u64 = u64::MAX;

/// Entry watched by the queue
pub trait TimeoutTracked: Send + Sync {
    /// Check the deadline, returning `true` when the entry can be dropped
    fn check_timeout(&self, now: Instant) -> bool;
}

struct Shared {
    /// Current sleep interval in milliseconds, `IDLE` when nothing is tracked
    interval_ms: AtomicU64,
    valid: AtomicBool,
}

pub struct AsyncTimeoutQueue {
    intake: Sender<Arc<dyn TimeoutTracked>>,
    wake: Sender<()>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncTimeoutQueue {
    /// Start the background thread
    pub fn start() -> Result<Self> {
        let (intake, intake_rx) = unbounded();
        let (wake, wake_rx) = bounded(1);
        let shared = Arc::new(Shared {
            interval_ms: AtomicU64::new(IDLE),
            valid: AtomicBool::new(true),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("timeout".to_string())
            .spawn(move || run(thread_shared, intake_rx, wake_rx))?;

        Ok(Self {
            intake,
            wake,
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Track `entry`, waking the thread early when `timeout` is shorter than its interval
    pub fn add(&self, entry: Arc<dyn TimeoutTracked>, timeout: Duration) -> Result<()> {
        if !self.shared.valid.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.intake.send(entry).map_err(|_| ClientError::Closed)?;

        let timeout_ms = (timeout.max(MIN_INTERVAL).as_millis() as u64).min(IDLE - 1);
        let previous = self.shared.interval_ms.fetch_min(timeout_ms, Ordering::AcqRel);
        if timeout_ms < previous {
            let _ = self.wake.try_send(());
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.valid.load(Ordering::Acquire)
    }

    /// Stop the thread, entries still tracked are abandoned
    pub fn stop(&self) {
        if !self.shared.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.wake.try_send(());
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Timeout thread panicked");
            }
        }
        debug!("Timeout queue stopped");
    }
}

impl Drop for AsyncTimeoutQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, intake: Receiver<Arc<dyn TimeoutTracked>>, wake: Receiver<()>) {
    let mut tracked: VecDeque<Arc<dyn TimeoutTracked>> = VecDeque::new();

    while shared.valid.load(Ordering::Acquire) {
        let interval = shared.interval_ms.load(Ordering::Acquire);
        let woken = if interval == IDLE {
            wake.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            wake.recv_timeout(Duration::from_millis(interval + 1))
        };
        if let Err(RecvTimeoutError::Disconnected) = woken {
            break;
        }
        if !shared.valid.load(Ordering::Acquire) {
            break;
        }

        tracked.extend(intake.try_iter());
        check_timeouts(&mut tracked, Instant::now());
        if tracked.is_empty() {
            // Entries may have arrived since the drain, they lower the interval again.
            shared.interval_ms.store(IDLE, Ordering::Release);
            if !intake.is_empty() {
                shared.interval_ms.store(MIN_INTERVAL.as_millis() as u64, Ordering::Release);
            }
        }
    }
}

/// Walk every tracked entry once
fn check_timeouts(tracked: &mut VecDeque<Arc<dyn TimeoutTracked>>, now: Instant) {
    for _ in 0..tracked.len() {
        if let Some(entry) = tracked.pop_front() {
            if !entry.check_timeout(now) {
                tracked.push_back(entry);
            }
        }
    }
}

const PENDING: u8 = 0;
const DONE: u8 = 1;
const EXPIRED: u8 = 2;

/// Deadline of one asynchronous attempt
///
/// The attempt and the queue race to settle the timer; whichever moves it
/// out of pending first wins.
pub struct AttemptTimer {
    deadline: Instant,
    state: AtomicU8,
    notify: Notify,
}

impl AttemptTimer {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            deadline: Instant::now() + timeout,
            state: AtomicU8::new(PENDING),
            notify: Notify::new(),
        })
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resolves once the queue expired this timer
    pub async fn expired(&self) {
        self.notify.notified().await;
    }

    /// Mark the attempt finished, returns `false` when the timer already expired
    pub fn complete(&self) -> bool {
        self.state
            .compare_exchange(PENDING, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXPIRED
    }
}

impl TimeoutTracked for AttemptTimer {
    fn check_timeout(&self, now: Instant) -> bool {
        match self.state.load(Ordering::Acquire) {
            PENDING if now >= self.deadline => {
                if self
                    .state
                    .compare_exchange(PENDING, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.notify.notify_one();
                }
                true
            }
            PENDING => false,
            _ => true,
        }
    }
}
