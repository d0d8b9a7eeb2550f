//! External enforcement commands

use crate::FirewallError;
use dormnet_common::VlanRuleset;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Applies a ruleset to the packet filter
pub trait RulesetEnforcer: Send + Sync {
    /// Apply one VLAN ruleset. An error means the packet filter state for the
    /// VLAN is unknown.
    fn enforce(&self, ruleset: &VlanRuleset) -> Result<(), FirewallError>;
}

/// Positional arguments of the VLAN command:
/// `<vlan> <true|false> <nat|none> <dns|none> <any|none|mac,mac,...>`
pub fn enforcement_args(ruleset: &VlanRuleset) -> Vec<String> {
    let or_none = |addr: Option<std::net::Ipv4Addr>| addr.map_or_else(|| "none".to_string(), |a| a.to_string());
    let hosts = if ruleset.allow_all_hosts {
        "any".to_string()
    } else if ruleset.allowed_hosts.is_empty() {
        "none".to_string()
    } else {
        ruleset
            .allowed_hosts
            .iter()
            .map(|mac| mac.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };
    vec![
        ruleset.vlan.to_string(),
        ruleset.access_admin_net.to_string(),
        or_none(ruleset.nat_address),
        or_none(ruleset.dns_override),
        hosts,
    ]
}

/// Runs a command per activated ruleset
#[derive(Debug, Clone)]
pub struct ExecEnforcer {
    command: PathBuf,
}

impl ExecEnforcer {
    /// Enforcer invoking `command`
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self { command: command.into() }
    }
}

impl RulesetEnforcer for ExecEnforcer {
    fn enforce(&self, ruleset: &VlanRuleset) -> Result<(), FirewallError> {
        let args = enforcement_args(ruleset);
        debug!(vlan = ruleset.vlan, ?args, "running vlan command");
        let output = Command::new(&self.command).args(&args).output()?;
        if !output.status.success() {
            return Err(FirewallError::Enforcement {
                vlan: ruleset.vlan,
                reason: format!(
                    "{} exited with {}: {}",
                    self.command.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// Run the one-shot init command
pub fn run_init_command(command: &Path) -> Result<(), FirewallError> {
    info!("running init command {}", command.display());
    let status = Command::new(command).status()?;
    if !status.success() {
        return Err(FirewallError::Config(format!(
            "init command {} exited with {}",
            command.display(),
            status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dormnet_common::MacAddress;

    #[test]
    fn test_blocked_args() {
        let args = enforcement_args(&VlanRuleset::blocked(105));
        assert_eq!(args, vec!["105", "false", "none", "none", "none"]);
    }

    #[test]
    fn test_allow_all_args() {
        let mut ruleset = VlanRuleset::blocked(200);
        ruleset.access_admin_net = true;
        ruleset.nat_address = Some([137, 226, 10, 7].into());
        ruleset.dns_override = Some([10, 0, 0, 53].into());
        ruleset.allow_all_hosts = true;
        ruleset.allowed_hosts.insert(MacAddress::new([1, 2, 3, 4, 5, 6]));
        let args = enforcement_args(&ruleset);
        assert_eq!(args, vec!["200", "true", "137.226.10.7", "10.0.0.53", "any"]);
    }

    #[test]
    fn test_mac_list_args() {
        let mut ruleset = VlanRuleset::blocked(150);
        ruleset.nat_address = Some([137, 226, 10, 8].into());
        ruleset.allowed_hosts.insert("aa-bb-cc-dd-ee-02".parse().unwrap());
        ruleset.allowed_hosts.insert("AA:BB:CC:DD:EE:01".parse().unwrap());
        let args = enforcement_args(&ruleset);
        assert_eq!(args[4], "aa:bb:cc:dd:ee:01,aa:bb:cc:dd:ee:02");
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_passes_arguments_and_exit_status() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let script = dir.path().join("vlan.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" > {}\n[ \"$1\" != 999 ]\n", out.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let enforcer = ExecEnforcer::new(&script);
        enforcer.enforce(&VlanRuleset::blocked(105)).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "105 false none none none");

        let err = enforcer.enforce(&VlanRuleset::blocked(999)).unwrap_err();
        assert!(matches!(err, FirewallError::Enforcement { vlan: 999, .. }));
    }

    #[test]
    fn test_missing_command_is_an_error() {
        let enforcer = ExecEnforcer::new("/nonexistent/dormnet-vlan");
        assert!(enforcer.enforce(&VlanRuleset::blocked(105)).is_err());
        assert!(run_init_command(Path::new("/nonexistent/dormnet-init")).is_err());
    }
}
