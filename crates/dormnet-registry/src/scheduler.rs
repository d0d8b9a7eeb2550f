//! Per-entity expiration timers
//!
//! One background thread keeps a deadline per entity id and runs a shared
//! callback when a deadline passes. Scheduling an id again replaces its timer.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Default)]
struct Timers {
    queue: BTreeSet<(Instant, u64)>,
    deadlines: HashMap<u64, Instant>,
    halted: bool,
}

impl Timers {
    fn remove(&mut self, id: u64) -> bool {
        match self.deadlines.remove(&id) {
            Some(at) => self.queue.remove(&(at, id)),
            None => false,
        }
    }
}

struct Shared {
    timers: Mutex<Timers>,
    wake: Condvar,
}

/// Runs a callback for each scheduled id once its time has come
pub struct ExpirationScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirationScheduler {
    /// Start the timer thread
    pub fn spawn<F>(callback: F) -> std::io::Result<Self>
    where
        F: Fn(u64) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            timers: Mutex::new(Timers::default()),
            wake: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("expiration-scheduler".into())
            .spawn(move || run(worker, callback))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Fire `id` at `at`. Past times fire immediately.
    pub fn schedule(&self, id: u64, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_after(id, delay);
    }

    /// Fire `id` after `delay`, replacing any pending timer for it
    pub fn schedule_after(&self, id: u64, delay: Duration) {
        let at = Instant::now() + delay;
        let mut timers = self.shared.timers.lock();
        timers.remove(id);
        timers.queue.insert((at, id));
        timers.deadlines.insert(id, at);
        debug!(id, ?delay, "expiration scheduled");
        self.shared.wake.notify_one();
    }

    /// Drop the pending timer for `id`. Returns whether one existed.
    pub fn cancel(&self, id: u64) -> bool {
        let removed = self.shared.timers.lock().remove(id);
        if removed {
            self.shared.wake.notify_one();
        }
        removed
    }

    /// Number of pending timers
    pub fn pending(&self) -> usize {
        self.shared.timers.lock().deadlines.len()
    }

    /// Stop the timer thread; pending timers never fire. Safe to call more than once.
    pub fn halt(&self) {
        self.shared.timers.lock().halted = true;
        self.shared.wake.notify_one();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!("expiration scheduler thread terminated abnormally");
            }
        }
    }
}

impl Drop for ExpirationScheduler {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run<F: Fn(u64)>(shared: Arc<Shared>, callback: F) {
    let mut timers = shared.timers.lock();
    while !timers.halted {
        let Some(&(at, id)) = timers.queue.first() else {
            shared.wake.wait(&mut timers);
            continue;
        };
        if at > Instant::now() {
            shared.wake.wait_until(&mut timers, at);
            continue;
        }
        timers.queue.remove(&(at, id));
        timers.deadlines.remove(&id);

        // The callback may schedule or cancel timers itself.
        MutexGuard::unlocked(&mut timers, || {
            if catch_unwind(AssertUnwindSafe(|| callback(id))).is_err() {
                error!(id, "expiration callback panicked");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, sync_channel};

    #[test]
    fn test_past_time_fires_immediately() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let scheduler = ExpirationScheduler::spawn(move |id| {
            let _ = tx.lock().send(id);
        })
        .unwrap();
        scheduler.schedule(7, Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let scheduler = ExpirationScheduler::spawn(move |id| {
            let _ = tx.lock().send(id);
        })
        .unwrap();
        scheduler.schedule_after(2, Duration::from_millis(120));
        scheduler.schedule_after(1, Duration::from_millis(40));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    }

    #[test]
    fn test_reschedule_replaces_timer() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let scheduler = ExpirationScheduler::spawn(move |id| {
            let _ = tx.lock().send((id, Instant::now()));
        })
        .unwrap();
        let start = Instant::now();
        scheduler.schedule_after(5, Duration::from_millis(30));
        scheduler.schedule_after(5, Duration::from_millis(250));
        assert_eq!(scheduler.pending(), 1);
        let (id, fired) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(id, 5);
        assert!(fired - start >= Duration::from_millis(250));
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_cancel_before_start_never_fires() {
        let (fired_tx, fired_rx) = channel();
        let (release_tx, release_rx) = sync_channel::<()>(0);
        let (started_tx, started_rx) = channel();
        let fired_tx = Mutex::new(fired_tx);
        let release_rx = Mutex::new(release_rx);
        let started_tx = Mutex::new(started_tx);

        let scheduler = ExpirationScheduler::spawn(move |id| {
            if id == 1 {
                let _ = started_tx.lock().send(());
                let _ = release_rx.lock().recv();
            }
            let _ = fired_tx.lock().send(id);
        })
        .unwrap();

        // Occupy the timer thread so id 42 cannot start.
        scheduler.schedule_after(1, Duration::ZERO);
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        scheduler.schedule(42, Utc::now() - chrono::Duration::seconds(5));
        assert!(scheduler.cancel(42));
        assert!(!scheduler.cancel(42));
        release_tx.send(()).unwrap();

        assert_eq!(fired_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert!(fired_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_panicking_callback_keeps_thread_alive() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let scheduler = ExpirationScheduler::spawn(move |id| {
            if id == 1 {
                panic!("boom");
            }
            let _ = tx.lock().send(id);
        })
        .unwrap();
        scheduler.schedule_after(1, Duration::ZERO);
        scheduler.schedule_after(2, Duration::from_millis(50));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    }

    #[test]
    fn test_halt_drops_pending() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let scheduler = ExpirationScheduler::spawn(move |id| {
            let _ = tx.lock().send(id);
        })
        .unwrap();
        scheduler.schedule_after(3, Duration::from_millis(100));
        scheduler.halt();
        scheduler.halt();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
