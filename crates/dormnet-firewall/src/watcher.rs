//! Host discovery from the DHCP lease table
//!
//! ```text
//!   lease file ──inotify──► watch thread ──read until parseable──► notifier ──► listener
//! ```
//!
//! The DHCP server rewrites its lease table in place, so a read can observe a
//! partially written file. Every change notification triggers reads at a fixed
//! interval until one parses, and only that snapshot is published. A deleted
//! lease table publishes an empty host list.
//!
//! On Linux the watch thread blocks in `poll` on the inotify descriptor and a
//! wakeup socket that `halt` writes to.

use crate::leases::read_lease_file;
use crate::notifier::{CoalescingNotifier, Delivery};
use crate::FirewallError;
use dormnet_common::HostList;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receives host list snapshots
pub trait HostListener: Send + Sync {
    /// Called from the notifier thread with the newest distinct snapshot
    fn hosts_updated(&self, hosts: &HostList) -> Result<(), FirewallError>;
}

/// Anything able to answer with the hosts currently on the network
pub trait HostSnapshot: Send + Sync {
    /// Latest observed host list
    fn current_hosts(&self) -> HostList;
}

/// Watcher settings
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Lease table path
    pub lease_file: PathBuf,
    /// Retry interval for unparseable reads
    pub read_interval: Duration,
}

struct WatchState {
    config: WatcherConfig,
    notifier: CoalescingNotifier<HostList>,
    running: AtomicBool,
}

impl WatchState {
    /// Sleep, then read, until the file parses in one pass. A missing file
    /// reads as no hosts. `None` once the watcher is halted.
    fn read_until_stable(&self) -> Option<HostList> {
        loop {
            std::thread::sleep(self.config.read_interval);
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }
            match read_lease_file(&self.config.lease_file) {
                Ok(hosts) => return Some(hosts),
                Err(FirewallError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!("lease file removed, no hosts");
                    return Some(HostList::new());
                }
                Err(e) => debug!("lease file not readable yet: {}", e),
            }
        }
    }

    fn reload(&self) {
        if let Some(hosts) = self.read_until_stable() {
            debug!("lease table holds {} hosts", hosts.len());
            self.notifier.publish(hosts);
        }
    }
}

/// Watches the lease table and publishes host list snapshots
pub struct HostDiscoveryWatcher {
    state: Arc<WatchState>,
    thread: Mutex<Option<JoinHandle<()>>>,
    wakeup: Wakeup,
}

impl HostDiscoveryWatcher {
    /// Read the initial snapshot and start watching.
    ///
    /// A missing lease file starts the watcher with an empty host list.
    pub fn start(config: WatcherConfig) -> Result<Self, FirewallError> {
        let initial = match read_lease_file(&config.lease_file) {
            Ok(hosts) => hosts,
            Err(FirewallError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("lease file {} not found, starting empty", config.lease_file.display());
                HostList::new()
            }
            Err(e) => return Err(e),
        };

        let notifier = CoalescingNotifier::spawn("host-notifier")?;
        notifier.publish(initial);

        let state = Arc::new(WatchState {
            config,
            notifier,
            running: AtomicBool::new(true),
        });
        let (thread, wakeup) = spawn_watch_thread(state.clone())?;
        info!("watching lease table {}", state.config.lease_file.display());

        Ok(Self {
            state,
            thread: Mutex::new(Some(thread)),
            wakeup,
        })
    }

    /// Install or clear the listener. A new listener is sent the current snapshot.
    pub fn set_listener(&self, listener: Option<Arc<dyn HostListener>>) {
        let delivery = listener.map(|l| -> Delivery<HostList> { Arc::new(move |hosts| l.hosts_updated(hosts)) });
        self.state.notifier.set_listener(delivery);
    }

    /// Hosts from the newest parseable lease table
    pub fn hosts(&self) -> HostList {
        self.state
            .notifier
            .current()
            .map(|hosts| (*hosts).clone())
            .unwrap_or_default()
    }

    /// Stop watching and delivering. Safe to call more than once.
    pub fn halt(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.wakeup.wake();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!("lease watch thread terminated abnormally");
            }
        }
        self.state.notifier.halt();
        info!("lease watcher stopped");
    }
}

impl HostSnapshot for HostDiscoveryWatcher {
    fn current_hosts(&self) -> HostList {
        self.hosts()
    }
}

impl Drop for HostDiscoveryWatcher {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(target_os = "linux")]
fn watch_target(path: &Path) -> (PathBuf, std::ffi::OsString) {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    (dir, name)
}

/// Interrupts a watch thread blocked waiting for events
#[cfg(target_os = "linux")]
struct Wakeup(std::os::unix::net::UnixStream);

#[cfg(target_os = "linux")]
impl Wakeup {
    fn wake(&self) {
        use std::io::Write;
        if let Err(e) = (&self.0).write_all(&[1]) {
            warn!("failed to wake lease watch thread: {}", e);
        }
    }
}

#[cfg(target_os = "linux")]
fn spawn_watch_thread(state: Arc<WatchState>) -> Result<(JoinHandle<()>, Wakeup), FirewallError> {
    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    let (dir, name) = watch_target(&state.config.lease_file);
    let inotify = Inotify::init(InitFlags::IN_CLOEXEC)
        .map_err(|e| FirewallError::Watch(format!("inotify init failed: {e}")))?;
    inotify
        .add_watch(
            dir.as_path(),
            AddWatchFlags::IN_MODIFY
                | AddWatchFlags::IN_CLOSE_WRITE
                | AddWatchFlags::IN_MOVED_TO
                | AddWatchFlags::IN_CREATE
                | AddWatchFlags::IN_DELETE
                | AddWatchFlags::IN_MOVED_FROM,
        )
        .map_err(|e| FirewallError::Watch(format!("inotify add watch {} failed: {e}", dir.display())))?;
    let (wake_tx, wake_rx) = UnixStream::pair()?;

    let thread = std::thread::Builder::new().name("lease-watch".into()).spawn(move || {
        let inotify = inotify;
        while state.running.load(Ordering::SeqCst) {
            let mut fds = [
                PollFd::new(inotify.as_fd(), PollFlags::POLLIN),
                PollFd::new(wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("poll on lease watch failed, host discovery stopped: {}", e);
                    break;
                }
            }
            let ready = |fd: &PollFd| fd.revents().is_some_and(|r| !r.is_empty());
            if ready(&fds[1]) {
                debug!("lease watch thread woken");
                continue;
            }
            if !ready(&fds[0]) {
                continue;
            }

            let events = match inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("inotify read failed, host discovery stopped: {}", e);
                    break;
                }
            };
            let overflowed = events.iter().any(|e| e.mask.contains(AddWatchFlags::IN_Q_OVERFLOW));
            if overflowed || events.iter().any(|e| e.name.as_deref() == Some(name.as_os_str())) {
                state.reload();
            }
        }
    })?;
    Ok((thread, Wakeup(wake_tx)))
}

#[cfg(not(target_os = "linux"))]
struct Wakeup;

#[cfg(not(target_os = "linux"))]
impl Wakeup {
    fn wake(&self) {}
}

#[cfg(not(target_os = "linux"))]
fn spawn_watch_thread(state: Arc<WatchState>) -> Result<(JoinHandle<()>, Wakeup), FirewallError> {
    // No inotify: poll the modification time instead. The thread notices a
    // halt within one read interval.
    let thread = std::thread::Builder::new().name("lease-watch".into()).spawn(move || {
        let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
        let mut last = modified(&state.config.lease_file);
        while state.running.load(Ordering::SeqCst) {
            std::thread::sleep(state.config.read_interval);
            let now = modified(&state.config.lease_file);
            if now != last {
                last = now;
                state.reload();
            }
        }
    })?;
    Ok((thread, Wakeup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, Sender};

    struct Recorder(parking_lot::Mutex<Sender<HostList>>);

    impl HostListener for Recorder {
        fn hosts_updated(&self, hosts: &HostList) -> Result<(), FirewallError> {
            let _ = self.0.lock().send(hosts.clone());
            Ok(())
        }
    }

    fn config(path: &Path) -> WatcherConfig {
        WatcherConfig {
            lease_file: path.to_path_buf(),
            read_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_missing_lease_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = HostDiscoveryWatcher::start(config(&dir.path().join("leases"))).unwrap();
        assert!(watcher.hosts().is_empty());
        watcher.halt();
    }

    #[test]
    fn test_corrupt_lease_file_at_startup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");
        std::fs::write(&path, "not a lease line\n").unwrap();
        assert!(HostDiscoveryWatcher::start(config(&path)).is_err());
    }

    #[test]
    fn test_listener_sees_initial_and_updated_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");
        std::fs::write(&path, "1 00:00:00:00:00:01 10.1.105.5 first *\n").unwrap();

        let watcher = HostDiscoveryWatcher::start(config(&path)).unwrap();
        let (tx, rx) = channel();
        watcher.set_listener(Some(Arc::new(Recorder(parking_lot::Mutex::new(tx)))));

        let initial = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(initial.len(), 1);

        std::fs::write(
            &path,
            "1 00:00:00:00:00:01 10.1.105.5 first *\n1 00:00:00:00:00:02 10.1.106.5 second *\n",
        )
        .unwrap();

        // The truncating write may surface an intermediate empty table first.
        let mut updated = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        while updated.len() != 2 {
            updated = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(watcher.hosts(), updated);
        watcher.halt();
    }

    #[test]
    fn test_halt_twice() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = HostDiscoveryWatcher::start(config(&dir.path().join("leases"))).unwrap();
        watcher.halt();
        watcher.halt();
    }

    #[test]
    fn test_deleted_lease_file_publishes_empty_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");
        std::fs::write(&path, "1 00:00:00:00:00:01 10.1.105.5 first *\n").unwrap();

        let watcher = HostDiscoveryWatcher::start(config(&path)).unwrap();
        let (tx, rx) = channel();
        watcher.set_listener(Some(Arc::new(Recorder(parking_lot::Mutex::new(tx)))));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().len(), 1);

        std::fs::remove_file(&path).unwrap();
        let emptied = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(emptied.is_empty());
        assert!(watcher.hosts().is_empty());
        watcher.halt();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_halt_does_not_wait_for_read_interval() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = HostDiscoveryWatcher::start(WatcherConfig {
            lease_file: dir.path().join("leases"),
            read_interval: Duration::from_secs(5),
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = std::time::Instant::now();
        watcher.halt();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
