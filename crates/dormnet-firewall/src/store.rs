//! Crash-safe persistence of the active rulesets
//!
//! Writes go to `rules.temp.json`, are renamed over `rules.json` and finally
//! copied to `rules.backup.json`. At any instant at least one of the primary or
//! backup files holds a complete document.

use crate::FirewallError;
use dormnet_common::wire::{decode_batch, encode_batch};
use dormnet_common::{VlanId, VlanRuleset};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Primary rules file
pub const RULES_FILE: &str = "rules.json";
/// Copy of the last successfully written primary file
pub const RULES_BACKUP_FILE: &str = "rules.backup.json";
/// Staging file for atomic replacement
pub const RULES_TEMP_FILE: &str = "rules.temp.json";

/// Active ruleset per VLAN
pub type RulesetMap = BTreeMap<VlanId, VlanRuleset>;

/// On-disk ruleset store
#[derive(Debug, Clone)]
pub struct RulesetStore {
    primary: PathBuf,
    backup: PathBuf,
    temp: PathBuf,
}

impl RulesetStore {
    /// Store rooted at `dir`. Neither rules path may be a directory.
    pub fn new(dir: &Path) -> Result<Self, FirewallError> {
        let store = Self {
            primary: dir.join(RULES_FILE),
            backup: dir.join(RULES_BACKUP_FILE),
            temp: dir.join(RULES_TEMP_FILE),
        };
        if store.primary.is_dir() || store.backup.is_dir() {
            return Err(FirewallError::Persistence(
                "rules or backup rules path must not be a directory".into(),
            ));
        }
        Ok(store)
    }

    /// Recover the persisted map.
    ///
    /// Falls back to the backup when the primary is missing or unparsable, and
    /// starts empty when neither exists.
    pub fn load(&self) -> Result<RulesetMap, FirewallError> {
        if !self.primary.exists() {
            if self.backup.exists() {
                info!("main rules file missing, using backup");
                return read_map(&self.backup);
            }
            info!("no stored rules, starting with an empty ruleset map");
            return Ok(RulesetMap::new());
        }
        match read_map(&self.primary) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!("failed to load main rules file ({}), trying backup", e);
                read_map(&self.backup)
            }
        }
    }

    /// Persist the whole map
    pub fn save(&self, map: &RulesetMap) -> Result<(), FirewallError> {
        let rulesets: Vec<VlanRuleset> = map.values().cloned().collect();
        let body = encode_batch(&rulesets)?;
        {
            let mut file = File::create(&self.temp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&self.temp, &self.primary)?;
        fs::copy(&self.primary, &self.backup)?;
        Ok(())
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

fn read_map(path: &Path) -> Result<RulesetMap, FirewallError> {
    let body = fs::read(path)?;
    let rulesets = decode_batch(&body)?;
    Ok(rulesets.into_iter().map(|r| (r.vlan, r)).collect())
}
