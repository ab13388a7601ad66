//! Serde model of the netplan drop-ins the agent owns. Parsing existing
//! files back through this model is what makes the pre-write deep-compare
//! insensitive to formatting.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// a whole netplan YAML document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Document {
    pub(crate) network: Network,
}

impl Document {
    pub(crate) fn new() -> Document {
        Document::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Network {
    pub(crate) version: u8,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) ethernets: BTreeMap<String, Ethernet>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) vlans: BTreeMap<String, Vlan>,
}

impl Default for Network {
    fn default() -> Self {
        Network {
            version: 2,
            ethernets: BTreeMap::new(),
            vlans: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Ethernet {
    #[serde(rename = "match")]
    pub(crate) matcher: Match,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mtu: Option<u32>,
    pub(crate) dhcp4: bool,
    #[serde(rename = "dhcp4-overrides", skip_serializing_if = "Option::is_none")]
    pub(crate) dhcp4_overrides: Option<Overrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) dhcp6: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Match {
    pub(crate) name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Overrides {
    #[serde(rename = "use-domains")]
    pub(crate) use_domains: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Vlan {
    pub(crate) id: u16,
    pub(crate) link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) macaddress: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) dhcp4: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) dhcp6: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) addresses: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_yaml() {
        let mut doc = Document::new();
        doc.network.ethernets.insert(
            "eth0".into(),
            Ethernet {
                matcher: Match {
                    name: "eth0".into(),
                },
                mtu: Some(1460),
                dhcp4: true,
                dhcp4_overrides: Some(Overrides { use_domains: true }),
                dhcp6: None,
            },
        );
        let s = serde_yaml::to_string(&doc).unwrap();
        let back: Document = serde_yaml::from_str(&s).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn leading_comment_is_ignored_on_parse() {
        let raw = "# Added by Google Compute Engine Guest Agent.\nnetwork:\n  version: 2\n";
        let doc: Document = serde_yaml::from_str(raw).unwrap();
        assert_eq!(doc.network.version, 2);
    }
}
