//! Agent configuration file. YAML, every field optional with defaults, so
//! an absent file runs the agent with stock behavior.
use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// network reconciliation switches
    pub network_interfaces: NetworkInterfaces,
    /// periodic diagnostics jobs
    pub diagnostics: Diagnostics,
    /// backend directory layout, overridable for tests and exotic distros
    pub paths: Paths,
}

/// `network_interfaces` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkInterfaces {
    /// master switch; when false the engine is a no-op
    pub setup: bool,
    /// when false the primary NIC is excluded from rendering
    pub manage_primary_nic: bool,
    /// gates VLAN rendering
    pub vlan_setup_enabled: bool,
    /// when non-empty the dhclient backend runs this verbatim instead of
    /// its normal per-interface flow
    pub dhcp_command: String,
    /// gates the Debian 12 default-netplan-file restore
    pub restore_debian12_netplan_config: bool,
}

impl Default for NetworkInterfaces {
    fn default() -> Self {
        Self {
            setup: true,
            manage_primary_nic: false,
            vlan_setup_enabled: false,
            dhcp_command: String::new(),
            restore_debian12_netplan_config: true,
        }
    }
}

/// `diagnostics` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Diagnostics {
    /// periodically log resolved link state
    pub link_state_log: bool,
    /// seconds between link-state logs
    pub link_state_interval_secs: u64,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            link_state_log: false,
            link_state_interval_secs: 300,
        }
    }
}

/// `paths` section. Defaults are the compatibility surface the native
/// tools read from; tests point these at temp dirs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    /// dhclient pid and lease files
    pub dhclient_dir: PathBuf,
    /// wicked `ifcfg-*` files
    pub wicked_dir: PathBuf,
    /// NetworkManager keyfiles
    pub network_manager_dir: PathBuf,
    /// netplan drop-ins
    pub netplan_dir: PathBuf,
    /// networkd override dirs written for netplan-generated units
    pub netplan_networkd_dir: PathBuf,
    /// systemd-networkd unit files
    pub networkd_dir: PathBuf,
    /// distro default netplan file restored on Debian 12
    pub netplan_default_file: PathBuf,
    /// os-release probe
    pub os_release: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            dhclient_dir: "/run".into(),
            wicked_dir: "/etc/sysconfig/network".into(),
            network_manager_dir: "/etc/NetworkManager/system-connections".into(),
            netplan_dir: "/run/netplan".into(),
            netplan_networkd_dir: "/run/systemd/network".into(),
            networkd_dir: "/usr/lib/systemd/network".into(),
            netplan_default_file: "/etc/netplan/90-default.yaml".into(),
            os_release: "/etc/os-release".into(),
        }
    }
}

impl AgentConfig {
    /// Parse a config file; the file must exist and be valid YAML
    pub fn parse(path: impl AsRef<Path>) -> Result<AgentConfig> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    /// Like [`AgentConfig::parse`] but an absent file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<AgentConfig> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(AgentConfig::default());
        }
        Self::parse(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static SAMPLE_YAML: &str = include_str!("../sample/config.yaml");

    // test we can encode/decode sample
    #[test]
    fn test_sample() {
        let cfg: AgentConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        println!("{:#?}", cfg);
        assert!(cfg.network_interfaces.vlan_setup_enabled);
        // back to yaml
        let s = serde_yaml::to_string(&cfg).unwrap();
        println!("{}", s);
    }

    #[test]
    fn empty_doc_is_all_defaults() {
        let cfg: AgentConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg, AgentConfig::default());
        assert!(cfg.network_interfaces.setup);
        assert!(!cfg.network_interfaces.manage_primary_nic);
        assert_eq!(cfg.paths.dhclient_dir, PathBuf::from("/run"));
    }

    #[test]
    fn unknown_fields_rejected() {
        let res: Result<AgentConfig, _> = serde_yaml::from_str("network_interfaces:\n  bogus: 1\n");
        assert!(res.is_err());
    }
}
