//! Network backends register with the engine by implementing this
//! capability set. The engine probes them in registration order and hands
//! all rendering to the first one that claims the primary interface.
use async_trait::async_trait;
use config::AgentConfig;

use crate::error::Result;
use crate::resolve::Interfaces;

/// Marker section name used in INI-style artifacts
pub const MARKER_SECTION: &str = "guest-agent";
/// Marker key inside [`MARKER_SECTION`]
pub const MARKER_KEY: &str = "managed_by_guest_agent";
/// Marker comment used as the first line of shell-style and YAML artifacts
pub const MARKER_COMMENT: &str = "# Added by Google Compute Engine Guest Agent.";

/// Prefix for VLAN interfaces created by the agent
pub const VLAN_INTERFACE_PREFIX: &str = "gcp.";

/// Interface name for an agent-managed VLAN: `gcp.<parent>.<vlan_id>`
pub fn vlan_interface_name(parent: &str, vlan_id: u16) -> String {
    format!("{VLAN_INTERFACE_PREFIX}{parent}.{vlan_id}")
}

/// True when `name` matches `gcp.<parent>.<digits>`. Interfaces that don't
/// match are user-created and must never be deleted.
pub fn is_agent_vlan_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(VLAN_INTERFACE_PREFIX) else {
        return false;
    };
    match rest.rsplit_once('.') {
        Some((parent, id)) => {
            !parent.is_empty() && !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// True when an INI-section or comment marker identifies `content` as
/// written by the agent. Files without the marker are never removed.
pub fn content_has_marker(content: &str) -> bool {
    if content.lines().next() == Some(MARKER_COMMENT) {
        return true;
    }
    let mut in_marker = false;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_marker = line == format!("[{MARKER_SECTION}]");
        } else if in_marker {
            let mut parts = line.splitn(2, '=');
            let key = parts.next().unwrap_or_default().trim();
            let val = parts.next().unwrap_or_default().trim();
            if key == MARKER_KEY && val == "true" {
                return true;
            }
        }
    }
    false
}

/// Capability set every network backend implements.
///
/// Backends are stateless between calls apart from their marker-tagged
/// files on disk; resolved interfaces are passed in by value for every
/// operation. Directory locations come from the [`AgentConfig`] the
/// backend was constructed with.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// stable identity, also used as the metrics label
    fn name(&self) -> &'static str;

    /// Adjust backend parameters from static config (e.g. distro-specific
    /// interface-name prefixes). Called once per reconciliation before
    /// setup.
    fn configure(&self, _cfg: &AgentConfig) {}

    /// Runtime probe: is this backend currently managing `iface`?
    ///
    /// A backend whose tooling is absent answers `Ok(false)`. A hard probe
    /// failure (malformed tool output) is an error and aborts detection.
    async fn is_managing(&self, iface: &str) -> Result<bool>;

    /// Idempotently render config for all valid ethernet interfaces and
    /// reload the backend.
    async fn setup_ethernet(&self, nics: &Interfaces) -> Result<()>;

    /// Idempotently render config for all VLAN sub-interfaces and reload.
    /// Also removes artifacts for VLANs no longer in the descriptor.
    async fn setup_vlan(&self, nics: &Interfaces) -> Result<()>;

    /// Delete every artifact this backend wrote (ethernet + VLAN) and
    /// reload. Files without the marker are left alone.
    async fn rollback(&self, nics: &Interfaces) -> Result<()>;

    /// Rollback only non-VLAN artifacts. Used when transferring ownership
    /// between backends without disturbing user VLANs.
    async fn rollback_nics(&self, nics: &Interfaces) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_names() {
        assert_eq!(vlan_interface_name("eth0", 5), "gcp.eth0.5");
        assert!(is_agent_vlan_name("gcp.eth0.5"));
        assert!(is_agent_vlan_name("gcp.ens4.4094"));
        assert!(!is_agent_vlan_name("eth0.5"));
        assert!(!is_agent_vlan_name("gcp.eth0"));
        assert!(!is_agent_vlan_name("gcp.eth0.5abc"));
        assert!(!is_agent_vlan_name("gcp..5"));
    }

    #[test]
    fn marker_detection() {
        let keyfile = "[connection]\nid=x\n\n[guest-agent]\nmanaged_by_guest_agent=true\n";
        assert!(content_has_marker(keyfile));
        let spaced = "[guest-agent]\nmanaged_by_guest_agent = true\n";
        assert!(content_has_marker(spaced));
        let comment = "# Added by Google Compute Engine Guest Agent.\nSTARTMODE=hotplug\n";
        assert!(content_has_marker(comment));
        assert!(!content_has_marker("[connection]\nid=x\n"));
        // marker key outside the marker section doesn't count
        assert!(!content_has_marker(
            "[connection]\nmanaged_by_guest_agent=true\n"
        ));
    }
}
