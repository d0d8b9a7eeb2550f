//! Authoritative ruleset holder on the firewall side
//!
//! Activation order for a changed ruleset: persist the new map, run the
//! enforcement command, then commit to memory. A failed enforcement restores
//! the previous file contents and leaves memory untouched, so retrying the same
//! ruleset runs the command again. A crash anywhere in between is healed by the
//! startup pass that re-enforces every stored ruleset.

use crate::enforcer::RulesetEnforcer;
use crate::store::{RulesetMap, RulesetStore};
use crate::FirewallError;
use dormnet_common::{VlanId, VlanRuleset};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Receives, persists and enforces VLAN rulesets
pub struct RulesetController {
    rulesets: Mutex<RulesetMap>,
    store: RulesetStore,
    enforcer: Arc<dyn RulesetEnforcer>,
}

impl RulesetController {
    /// Recover the stored rulesets and enforce each of them again.
    ///
    /// Enforcement failures during recovery are logged per VLAN and do not fail
    /// startup.
    pub fn open(store: RulesetStore, enforcer: Arc<dyn RulesetEnforcer>) -> Result<Self, FirewallError> {
        let rulesets = store.load()?;
        info!("recovered {} stored rulesets", rulesets.len());
        for (vlan, ruleset) in &rulesets {
            if let Err(e) = enforcer.enforce(ruleset) {
                error!(vlan, "failed to activate stored ruleset: {}", e);
            }
        }
        Ok(Self {
            rulesets: Mutex::new(rulesets),
            store,
            enforcer,
        })
    }

    /// Activate rulesets in order. Stops at the first failure; rulesets before
    /// it stay applied. Returns how many rulesets actually changed.
    pub fn activate(&self, rulesets: &[VlanRuleset]) -> Result<usize, FirewallError> {
        let mut held = self.rulesets.lock();
        let mut changed = 0;
        for ruleset in rulesets {
            if self.activate_one(&mut held, ruleset)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn activate_one(&self, held: &mut RulesetMap, ruleset: &VlanRuleset) -> Result<bool, FirewallError> {
        let vlan = ruleset.vlan;
        if held.get(&vlan) == Some(ruleset) {
            debug!(vlan, "ruleset unchanged, command not executed");
            return Ok(false);
        }

        let previous = held.insert(vlan, ruleset.clone());
        let restore = |held: &mut RulesetMap| match &previous {
            Some(p) => {
                held.insert(vlan, p.clone());
            }
            None => {
                held.remove(&vlan);
            }
        };

        if let Err(e) = self.store.save(held) {
            restore(held);
            return Err(e);
        }
        if let Err(e) = self.enforcer.enforce(ruleset) {
            restore(held);
            if let Err(rollback) = self.store.save(held) {
                error!(vlan, "failed to roll back stored rules: {}", rollback);
            }
            return Err(e);
        }

        info!(vlan, blocked = ruleset.is_blocked(), "ruleset activated");
        Ok(true)
    }

    /// Active ruleset of a VLAN
    pub fn ruleset(&self, vlan: VlanId) -> Option<VlanRuleset> {
        self.rulesets.lock().get(&vlan).cloned()
    }

    /// All active rulesets
    pub fn rulesets(&self) -> RulesetMap {
        self.rulesets.lock().clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dormnet_common::MacAddress;
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Records enforced rulesets, fails for selected VLANs
    #[derive(Default)]
    pub(crate) struct RecordingEnforcer {
        pub(crate) applied: Mutex<Vec<VlanRuleset>>,
        pub(crate) failing: Mutex<HashSet<VlanId>>,
    }

    impl RulesetEnforcer for RecordingEnforcer {
        fn enforce(&self, ruleset: &VlanRuleset) -> Result<(), FirewallError> {
            if self.failing.lock().contains(&ruleset.vlan) {
                return Err(FirewallError::Enforcement {
                    vlan: ruleset.vlan,
                    reason: "exit status 1".into(),
                });
            }
            self.applied.lock().push(ruleset.clone());
            Ok(())
        }
    }

    fn allowing(vlan: VlanId, last: u8) -> VlanRuleset {
        let mut r = VlanRuleset::blocked(vlan);
        r.allowed_hosts.insert(MacAddress::new([2, 0, 0, 0, 0, last]));
        r
    }

    fn open(dir: &std::path::Path) -> (RulesetController, Arc<RecordingEnforcer>) {
        let enforcer = Arc::new(RecordingEnforcer::default());
        let controller = RulesetController::open(RulesetStore::new(dir).unwrap(), enforcer.clone()).unwrap();
        (controller, enforcer)
    }

    #[test]
    fn test_same_ruleset_enforced_once() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, enforcer) = open(dir.path());
        let ruleset = allowing(105, 1);

        assert_eq!(controller.activate(&[ruleset.clone()]).unwrap(), 1);
        assert_eq!(controller.activate(&[ruleset.clone()]).unwrap(), 0);
        assert_eq!(enforcer.applied.lock().len(), 1);
        assert_eq!(controller.ruleset(105), Some(ruleset));
    }

    #[test]
    fn test_replacing_ruleset_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _) = open(dir.path());
        controller.activate(&[allowing(105, 1)]).unwrap();
        controller.activate(&[allowing(105, 2), allowing(106, 3)]).unwrap();

        let stored = RulesetStore::new(dir.path()).unwrap().load().unwrap();
        assert_eq!(stored, controller.rulesets());
        assert_eq!(stored[&105], allowing(105, 2));
    }

    #[test]
    fn test_failed_enforcement_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, enforcer) = open(dir.path());
        controller.activate(&[allowing(105, 1)]).unwrap();

        enforcer.failing.lock().insert(105);
        let err = controller.activate(&[allowing(105, 2)]).unwrap_err();
        assert!(matches!(err, FirewallError::Enforcement { vlan: 105, .. }));
        assert_eq!(controller.ruleset(105), Some(allowing(105, 1)));
        let stored = RulesetStore::new(dir.path()).unwrap().load().unwrap();
        assert_eq!(stored[&105], allowing(105, 1));

        // A retry runs the command again.
        enforcer.failing.lock().clear();
        assert_eq!(controller.activate(&[allowing(105, 2)]).unwrap(), 1);
        assert_eq!(controller.ruleset(105), Some(allowing(105, 2)));
    }

    #[test]
    fn test_batch_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, enforcer) = open(dir.path());
        enforcer.failing.lock().insert(106);

        let result = controller.activate(&[allowing(105, 1), allowing(106, 1), allowing(107, 1)]);
        assert!(result.is_err());
        assert!(controller.ruleset(105).is_some());
        assert!(controller.ruleset(106).is_none());
        assert!(controller.ruleset(107).is_none());
    }

    #[test]
    fn test_startup_reenforces_stored_rulesets() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (controller, _) = open(dir.path());
            controller.activate(&[allowing(105, 1), allowing(200, 4)]).unwrap();
        }

        let enforcer = Arc::new(RecordingEnforcer::default());
        enforcer.failing.lock().insert(105);
        let controller = RulesetController::open(RulesetStore::new(dir.path()).unwrap(), enforcer.clone()).unwrap();

        let applied: Vec<VlanId> = enforcer.applied.lock().iter().map(|r| r.vlan).collect();
        assert_eq!(applied, vec![200]);
        assert_eq!(controller.rulesets().len(), 2);
    }

    fn allowing_all(vlan: VlanId, hosts: &[u8]) -> VlanRuleset {
        let mut r = VlanRuleset::blocked(vlan);
        r.allowed_hosts = hosts.iter().map(|b| MacAddress::new([2, 0, 0, 0, 0, *b])).collect();
        r
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_controller_persists_replayed_map(
            ops in prop::collection::vec((100i32..104, prop::collection::vec(0u8..4, 0..3), any::<bool>()), 1..12)
        ) {
            let dir = tempfile::tempdir().unwrap();
            let (controller, enforcer) = open(dir.path());
            let mut replay = RulesetMap::new();
            let mut changes = 0;
            for (vlan, hosts, repeat) in ops {
                let ruleset = allowing_all(vlan, &hosts);
                let changed = replay.get(&vlan) != Some(&ruleset);
                prop_assert_eq!(controller.activate(&[ruleset.clone()]).unwrap(), usize::from(changed));
                if repeat {
                    prop_assert_eq!(controller.activate(&[ruleset.clone()]).unwrap(), 0);
                }
                if changed {
                    changes += 1;
                    replay.insert(vlan, ruleset);
                }
            }
            prop_assert_eq!(enforcer.applied.lock().len(), changes);
            prop_assert_eq!(controller.rulesets(), replay.clone());
            prop_assert_eq!(RulesetStore::new(dir.path()).unwrap().load().unwrap(), replay);
        }
    }
}
