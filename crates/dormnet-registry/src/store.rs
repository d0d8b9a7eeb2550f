//! Directory snapshots on disk
//!
//! Same write discipline as the firewall's rules file: the snapshot goes to
//! `directory.temp.json`, is renamed over `directory.json` and then copied to
//! `directory.backup.json`.

use crate::directory::DirectoryState;
use crate::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Primary snapshot file
pub const DIRECTORY_FILE: &str = "directory.json";
/// Copy of the last successfully written snapshot
pub const DIRECTORY_BACKUP_FILE: &str = "directory.backup.json";
/// Staging file for atomic replacement
pub const DIRECTORY_TEMP_FILE: &str = "directory.temp.json";

const SNAPSHOT_VERSION: u32 = 1;

/// Durable home of the directory's records
pub trait DirectoryStore: Send + Sync {
    /// Last saved state, `None` if nothing was ever saved
    fn load(&self) -> RegistryResult<Option<DirectoryState>>;
    /// Replace the saved state
    fn save(&self, state: &DirectoryState) -> RegistryResult<()>;
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    version: u32,
    directory: &'a DirectoryState,
}

#[derive(Deserialize)]
struct Document {
    version: u32,
    directory: DirectoryState,
}

/// JSON snapshot files in one directory
#[derive(Debug, Clone)]
pub struct JsonDirectoryStore {
    primary: PathBuf,
    backup: PathBuf,
    temp: PathBuf,
}

impl JsonDirectoryStore {
    /// Store rooted at `dir`. Neither snapshot path may be a directory.
    pub fn new(dir: &Path) -> RegistryResult<Self> {
        let store = Self {
            primary: dir.join(DIRECTORY_FILE),
            backup: dir.join(DIRECTORY_BACKUP_FILE),
            temp: dir.join(DIRECTORY_TEMP_FILE),
        };
        if store.primary.is_dir() || store.backup.is_dir() {
            return Err(RegistryError::Persistence(
                "directory snapshot paths must not be directories".into(),
            ));
        }
        Ok(store)
    }

    /// Primary file path
    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    /// Backup file path
    pub fn backup_path(&self) -> &Path {
        &self.backup
    }
}

impl DirectoryStore for JsonDirectoryStore {
    fn load(&self) -> RegistryResult<Option<DirectoryState>> {
        if !self.primary.exists() {
            if self.backup.exists() {
                info!("directory snapshot missing, using backup");
                return read_snapshot(&self.backup).map(Some);
            }
            info!("no directory snapshot, starting empty");
            return Ok(None);
        }
        match read_snapshot(&self.primary) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("failed to load directory snapshot ({}), trying backup", e);
                read_snapshot(&self.backup).map(Some)
            }
        }
    }

    fn save(&self, state: &DirectoryState) -> RegistryResult<()> {
        let body = serde_json::to_vec(&DocumentRef {
            version: SNAPSHOT_VERSION,
            directory: state,
        })
        .map_err(|e| RegistryError::Persistence(e.to_string()))?;
        {
            let mut file = File::create(&self.temp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&self.temp, &self.primary)?;
        fs::copy(&self.primary, &self.backup)?;
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> RegistryResult<DirectoryState> {
    let body = fs::read(path)?;
    let document: Document =
        serde_json::from_slice(&body).map_err(|e| RegistryError::Persistence(format!("{}: {e}", path.display())))?;
    if document.version != SNAPSHOT_VERSION {
        return Err(RegistryError::Persistence(format!(
            "{}: unsupported snapshot version {}",
            path.display(),
            document.version
        )));
    }
    Ok(document.directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FirewallLink;
    use crate::directory::{Directory, DirectorySettings};
    use crate::pool::AddressPool;
    use dormnet_common::{HostList, VlanRuleset};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    struct Discard;

    impl FirewallLink for Discard {
        fn activate(&self, _rulesets: Vec<VlanRuleset>) {}
        fn start_batch(&self) {}
        fn finish_batch(&self) {}
        fn hosts(&self) -> HostList {
            HostList::new()
        }
    }

    fn populated() -> DirectoryState {
        let mut pool = AddressPool::new();
        pool.add(Ipv4Addr::new(137, 226, 10, 1));
        let directory = Directory::new(pool, Arc::new(Discard), DirectorySettings::default()).unwrap();
        directory.create_room("1105", Some(105)).unwrap();
        let tenant = directory.create_tenant("Alice", "alice@example.org").unwrap();
        directory.assign_room(tenant, "1105", None, false).unwrap();
        directory.snapshot()
    }

    fn json(state: &DirectoryState) -> serde_json::Value {
        serde_json::to_value(state).unwrap()
    }

    #[test]
    fn test_empty_dir_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirectoryStore::new(dir.path()).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_writes_primary_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirectoryStore::new(dir.path()).unwrap();
        let state = populated();
        store.save(&state).unwrap();

        assert!(store.primary_path().exists());
        assert!(store.backup_path().exists());
        assert!(!dir.path().join(DIRECTORY_TEMP_FILE).exists());
        assert_eq!(json(&store.load().unwrap().unwrap()), json(&state));
    }

    #[test]
    fn test_corrupt_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirectoryStore::new(dir.path()).unwrap();
        let state = populated();
        store.save(&state).unwrap();

        fs::write(store.primary_path(), b"{\"version\":1,\"dir").unwrap();
        assert_eq!(json(&store.load().unwrap().unwrap()), json(&state));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DIRECTORY_FILE), br#"{"version":9,"directory":{}}"#).unwrap();
        let store = JsonDirectoryStore::new(dir.path()).unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn test_directory_in_place_of_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(DIRECTORY_FILE)).unwrap();
        assert!(JsonDirectoryStore::new(dir.path()).is_err());
    }
}
