//! Coalescing change notifier
//!
//! Producers publish snapshots as fast as they like; a single consumer thread
//! delivers only the newest one and skips snapshots equal to the last delivery.
//! A slow listener therefore never sees a backlog, only the latest state.

use crate::FirewallError;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Callback receiving delivered snapshots
pub type Delivery<T> = Arc<dyn Fn(&T) -> Result<(), FirewallError> + Send + Sync>;

struct Shared<T> {
    latest: RwLock<Option<Arc<T>>>,
    listener: RwLock<Option<Delivery<T>>>,
    listener_changed: AtomicBool,
    overflow: AtomicBool,
    running: AtomicBool,
}

/// Delivers the latest published value to at most one listener
pub struct CoalescingNotifier<T> {
    shared: Arc<Shared<T>>,
    wake: SyncSender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: PartialEq + Send + Sync + 'static> CoalescingNotifier<T> {
    /// Spawn the delivery thread
    pub fn spawn(name: &str) -> Result<Self, FirewallError> {
        let shared = Arc::new(Shared {
            latest: RwLock::new(None),
            listener: RwLock::new(None),
            listener_changed: AtomicBool::new(false),
            overflow: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });
        let (wake, rx) = mpsc::sync_channel(1);

        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || deliver_loop(worker, rx))?;

        Ok(Self {
            shared,
            wake,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Record a new snapshot and wake the delivery thread
    pub fn publish(&self, value: T) {
        *self.shared.latest.write() = Some(Arc::new(value));
        self.wake();
    }

    /// Latest published snapshot
    pub fn current(&self) -> Option<Arc<T>> {
        self.shared.latest.read().clone()
    }

    /// Replace the listener. The new listener receives the current snapshot.
    pub fn set_listener(&self, listener: Option<Delivery<T>>) {
        *self.shared.listener.write() = listener;
        self.shared.listener_changed.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Stop the delivery thread. Safe to call more than once.
    pub fn halt(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.wake();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            // The listener itself may be shutting us down.
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!("notifier thread terminated abnormally");
            }
        }
    }

    fn wake(&self) {
        match self.wake.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => self.shared.overflow.store(true, Ordering::SeqCst),
            Err(TrySendError::Disconnected(())) => {}
        }
    }
}

impl<T> Drop for CoalescingNotifier<T> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.wake.try_send(());
    }
}

fn deliver_loop<T: PartialEq>(shared: Arc<Shared<T>>, rx: Receiver<()>) {
    let mut delivered: Option<Arc<T>> = None;

    while rx.recv().is_ok() {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        loop {
            shared.overflow.store(false, Ordering::SeqCst);
            let forced = shared.listener_changed.swap(false, Ordering::SeqCst);
            let latest = shared.latest.read().clone();
            let listener = shared.listener.read().clone();

            if let (Some(value), Some(listener)) = (latest, listener) {
                if forced || delivered.as_deref() != Some(&*value) {
                    match catch_unwind(AssertUnwindSafe(|| listener(&value))) {
                        Ok(Ok(())) => delivered = Some(value),
                        Ok(Err(e)) => warn!("listener failed: {}", e),
                        Err(_) => error!("listener panicked"),
                    }
                } else {
                    debug!("snapshot unchanged, skipping delivery");
                }
            }

            if !shared.overflow.swap(false, Ordering::SeqCst) || !shared.running.load(Ordering::SeqCst) {
                break;
            }
        }
    }
}
