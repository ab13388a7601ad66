//! Descriptor model. The wire shapes mirror the metadata JSON; the public
//! model is the validated form the resolver and backends consume.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Error;

/// MTU used when the metadata entry omits one
const DEFAULT_MTU: u32 = 1460;

/// Immutable snapshot of the instance's intended network state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    /// ordered ethernet interfaces, index 0 is primary
    pub ethernet: Vec<EthernetSpec>,
    /// VLAN sub-interfaces keyed `parent_index -> vlan_id`
    pub vlans: BTreeMap<usize, BTreeMap<u16, VlanSpec>>,
}

/// One regular NIC from the descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetSpec {
    /// canonical lower-case colon-separated MAC
    pub mac: String,
    /// propagated verbatim into rendered configs
    pub mtu: u32,
    /// non-empty means the NIC is IPv6-capable
    pub dhcpv6_refresh: Option<String>,
    /// optional static IPv4
    pub ip: Option<String>,
    /// optional IPv4 gateway
    pub gateway: Option<String>,
}

impl EthernetSpec {
    /// an interface is ipv6-capable iff its DHCPv6-refresh token is non-empty
    pub fn ipv6_enabled(&self) -> bool {
        self.dhcpv6_refresh
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }
}

/// One 802.1Q sub-interface from the descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanSpec {
    /// MAC of the sub-interface; always differs from the parent's
    pub mac: String,
    /// positional index of the parent ethernet
    pub parent_index: usize,
    /// 802.1Q id, 1..=4094
    pub vlan_id: u16,
    /// propagated verbatim
    pub mtu: u32,
    /// optional static IPv4
    pub ip: Option<String>,
    /// optional IPv4 gateway
    pub gateway: Option<String>,
    /// static IPv6 addresses
    pub ipv6: Vec<String>,
    /// optional IPv6 gateway
    pub gateway_ipv6: Option<String>,
    /// non-empty means ipv6-capable
    pub dhcpv6_refresh: Option<String>,
}

impl VlanSpec {
    /// see [`EthernetSpec::ipv6_enabled`]
    pub fn ipv6_enabled(&self) -> bool {
        self.dhcpv6_refresh
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }
}

// -- wire shapes ------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetadataWire {
    instance: InstanceWire,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InstanceWire {
    network_interfaces: Vec<EthernetWire>,
    vlan_network_interfaces: BTreeMap<String, BTreeMap<String, VlanWire>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EthernetWire {
    mac: String,
    mtu: u32,
    dhcpv6_refresh: String,
    ip: String,
    gateway: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct VlanWire {
    mac: String,
    mtu: u32,
    ip: String,
    gateway: String,
    ipv6: Vec<String>,
    gateway_ipv6: String,
    dhcpv6_refresh: String,
}

fn opt(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

impl NetworkDescriptor {
    /// Parse a recursive metadata JSON body. Any shape or key problem is a
    /// [`Error::Unavailable`]; the caller skips the tick and waits for the
    /// next long-poll.
    pub fn parse(body: &[u8]) -> Result<NetworkDescriptor, Error> {
        let wire: MetadataWire =
            serde_json::from_slice(body).map_err(|err| Error::Unavailable(err.to_string()))?;

        let ethernet = wire
            .instance
            .network_interfaces
            .into_iter()
            .map(|eth| EthernetSpec {
                mac: eth.mac.to_ascii_lowercase(),
                mtu: if eth.mtu == 0 { DEFAULT_MTU } else { eth.mtu },
                dhcpv6_refresh: opt(eth.dhcpv6_refresh),
                ip: opt(eth.ip),
                gateway: opt(eth.gateway),
            })
            .collect();

        let mut vlans: BTreeMap<usize, BTreeMap<u16, VlanSpec>> = BTreeMap::new();
        for (parent_key, ids) in wire.instance.vlan_network_interfaces {
            let parent_index: usize = parent_key.parse().map_err(|_| {
                Error::Unavailable(format!("vlan parent key {parent_key:?} is not an index"))
            })?;
            for (id_key, vlan) in ids {
                let vlan_id: u16 = id_key.parse().map_err(|_| {
                    Error::Unavailable(format!("vlan id key {id_key:?} is not numeric"))
                })?;
                if !(1..=4094).contains(&vlan_id) {
                    return Err(Error::Unavailable(format!(
                        "vlan id {vlan_id} outside 1..=4094"
                    )));
                }
                if vlan.mac.is_empty() {
                    return Err(Error::Unavailable(format!(
                        "vlan {parent_index}/{vlan_id} is missing a mac"
                    )));
                }
                vlans.entry(parent_index).or_default().insert(
                    vlan_id,
                    VlanSpec {
                        mac: vlan.mac.to_ascii_lowercase(),
                        parent_index,
                        vlan_id,
                        mtu: if vlan.mtu == 0 { DEFAULT_MTU } else { vlan.mtu },
                        ip: opt(vlan.ip),
                        gateway: opt(vlan.gateway),
                        ipv6: vlan.ipv6,
                        gateway_ipv6: opt(vlan.gateway_ipv6),
                        dhcpv6_refresh: opt(vlan.dhcpv6_refresh),
                    },
                );
            }
        }

        Ok(NetworkDescriptor { ethernet, vlans })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SAMPLE: &str = r#"{
      "instance": {
        "networkInterfaces": [
          {"mac": "00:11:22:33:44:55", "mtu": 1460, "dhcpv6Refresh": "", "ip": "10.0.0.2", "gateway": "10.0.0.1"},
          {"mac": "00:11:22:33:44:66", "mtu": 1500, "dhcpv6Refresh": "1"}
        ],
        "vlanNetworkInterfaces": {
          "0": {
            "5": {"mac": "AA:BB:CC:DD:EE:FF", "mtu": 1500, "ip": "", "ipv6": ["fd00::2/64"], "gatewayIpv6": "fd00::1"}
          }
        }
      }
    }"#;

    #[test]
    fn parses_descriptor() {
        let desc = NetworkDescriptor::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(desc.ethernet.len(), 2);
        assert_eq!(desc.ethernet[0].mac, "00:11:22:33:44:55");
        assert_eq!(desc.ethernet[0].ip.as_deref(), Some("10.0.0.2"));
        assert!(!desc.ethernet[0].ipv6_enabled());
        assert!(desc.ethernet[1].ipv6_enabled());

        let vlan = &desc.vlans[&0][&5];
        assert_eq!(vlan.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(vlan.parent_index, 0);
        assert_eq!(vlan.vlan_id, 5);
        assert_eq!(vlan.ip, None);
        assert_eq!(vlan.ipv6, vec!["fd00::2/64"]);
        assert_eq!(vlan.gateway_ipv6.as_deref(), Some("fd00::1"));
    }

    #[test]
    fn zero_mtu_gets_default() {
        let body = r#"{"instance": {"networkInterfaces": [{"mac": "00:11:22:33:44:55"}]}}"#;
        let desc = NetworkDescriptor::parse(body.as_bytes()).unwrap();
        assert_eq!(desc.ethernet[0].mtu, 1460);
    }

    #[test]
    fn vlan_id_out_of_range_is_unavailable() {
        let body = r#"{"instance": {"vlanNetworkInterfaces": {"0": {"4095": {"mac": "aa:bb:cc:dd:ee:ff"}}}}}"#;
        assert!(matches!(
            NetworkDescriptor::parse(body.as_bytes()),
            Err(Error::Unavailable(_))
        ));
    }

    #[test]
    fn non_numeric_vlan_key_is_unavailable() {
        let body = r#"{"instance": {"vlanNetworkInterfaces": {"zero": {}}}}"#;
        assert!(matches!(
            NetworkDescriptor::parse(body.as_bytes()),
            Err(Error::Unavailable(_))
        ));
    }

    #[test]
    fn garbage_body_is_unavailable() {
        assert!(matches!(
            NetworkDescriptor::parse(b"not json"),
            Err(Error::Unavailable(_))
        ));
    }

    #[test]
    fn structural_equality_detects_changes() {
        let a = NetworkDescriptor::parse(SAMPLE.as_bytes()).unwrap();
        let b = NetworkDescriptor::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(a, b);
        let mut c = b.clone();
        c.ethernet[0].mtu = 9000;
        assert_ne!(a, c);
    }
}
