//! Maps descriptor MAC addresses onto local interface names and validates
//! VLAN parent references. Resolution runs once per reconciliation; the
//! resolved bundle is handed to the active backend by value.
use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use lazy_static::lazy_static;
use metadata::{EthernetSpec, NetworkDescriptor, VlanSpec};
use pnet::datalink::{self, NetworkInterface};
use tracing::warn;

use crate::{
    backend::vlan_interface_name,
    error::{Error, Result},
};

lazy_static! {
    // MACs we've already logged as unresolvable. Metadata descriptors repeat
    // on every long-poll timeout; without this a missing NIC floods the log.
    static ref UNRESOLVED_MACS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// An [`EthernetSpec`] bound to a local NIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetInterface {
    /// the descriptor entry
    pub spec: EthernetSpec,
    /// resolved local name, empty when no NIC carries the MAC
    pub name: String,
    /// descriptor index 0
    pub is_primary: bool,
    /// resolution succeeded; invalid interfaces are never touched
    pub is_valid: bool,
}

/// A [`VlanSpec`] bound to its parent's local name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanInterface {
    /// the descriptor entry
    pub spec: VlanSpec,
    /// local name of the ethernet at `spec.parent_index`
    pub parent_name: String,
}

impl VlanInterface {
    /// the `gcp.<parent>.<vlan_id>` name this sub-interface gets on the host
    pub fn interface_name(&self) -> String {
        vlan_interface_name(&self.parent_name, self.spec.vlan_id)
    }
}

/// Resolved view of a descriptor, passed into every backend call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interfaces {
    /// descriptor order, index 0 primary
    pub ethernet: Vec<EthernetInterface>,
    /// keyed by `(parent_index, vlan_id)`
    pub vlans: BTreeMap<(usize, u16), VlanInterface>,
}

impl Interfaces {
    /// the primary NIC, if it resolved
    pub fn primary(&self) -> Option<&EthernetInterface> {
        self.ethernet.first().filter(|eth| eth.is_valid)
    }

    /// valid ethernet interfaces in descriptor order
    pub fn valid_ethernet(&self) -> impl Iterator<Item = &EthernetInterface> {
        self.ethernet.iter().filter(|eth| eth.is_valid)
    }

    /// Partition interface names into (all-with-ipv4, ipv6-capable subset).
    /// An interface is ipv6-capable iff its DHCPv6-refresh token is non-empty.
    pub fn classify(&self) -> (Vec<&str>, Vec<&str>) {
        let mut ipv4 = Vec::new();
        let mut ipv6 = Vec::new();
        for eth in self.valid_ethernet() {
            ipv4.push(eth.name.as_str());
            if eth.spec.ipv6_enabled() {
                ipv6.push(eth.name.as_str());
            }
        }
        (ipv4, ipv6)
    }

    /// interface name -> MTU, skipping invalid entries
    pub fn mtu_map(&self) -> BTreeMap<String, u32> {
        self.valid_ethernet()
            .map(|eth| (eth.name.clone(), eth.spec.mtu))
            .collect()
    }

    /// Copy with the primary ethernet dropped. Used when the user has not
    /// opted into primary-NIC management.
    pub fn without_primary(&self) -> Interfaces {
        Interfaces {
            ethernet: self
                .ethernet
                .iter()
                .filter(|eth| !eth.is_primary)
                .cloned()
                .collect(),
            vlans: self.vlans.clone(),
        }
    }

    /// Copy holding only the primary ethernet and no VLANs. The engine
    /// feeds this to `rollback_nics` on inactive backends.
    pub fn primary_only(&self) -> Interfaces {
        Interfaces {
            ethernet: self.ethernet.first().cloned().into_iter().collect(),
            vlans: BTreeMap::new(),
        }
    }
}

/// Snapshot the host's interfaces
pub fn local_interfaces() -> Vec<NetworkInterface> {
    datalink::interfaces()
}

/// Resolve a descriptor against the live host NIC table
pub fn resolve(descriptor: &NetworkDescriptor) -> Result<Interfaces> {
    resolve_with(descriptor, &local_interfaces())
}

/// Resolve a descriptor against a caller-supplied NIC table
pub fn resolve_with(
    descriptor: &NetworkDescriptor,
    nics: &[NetworkInterface],
) -> Result<Interfaces> {
    let ethernet = resolve_ethernet(descriptor, nics);
    let vlans = resolve_vlans(descriptor, &ethernet)?;
    Ok(Interfaces { ethernet, vlans })
}

fn find_by_mac<'a>(nics: &'a [NetworkInterface], mac: &str) -> Option<&'a NetworkInterface> {
    let wanted = mac.to_ascii_lowercase();
    nics.iter().find(|nic| {
        nic.mac
            .map(|hw| hw.to_string().to_ascii_lowercase() == wanted)
            .unwrap_or(false)
    })
}

fn resolve_ethernet(
    descriptor: &NetworkDescriptor,
    nics: &[NetworkInterface],
) -> Vec<EthernetInterface> {
    descriptor
        .ethernet
        .iter()
        .enumerate()
        .map(|(i, spec)| match find_by_mac(nics, &spec.mac) {
            Some(nic) => EthernetInterface {
                spec: spec.clone(),
                name: nic.name.clone(),
                is_primary: i == 0,
                is_valid: true,
            },
            None => {
                if UNRESOLVED_MACS.lock().unwrap().insert(spec.mac.clone()) {
                    warn!(mac = %spec.mac, "no local interface matches MAC, skipping");
                }
                EthernetInterface {
                    spec: spec.clone(),
                    name: String::new(),
                    is_primary: i == 0,
                    is_valid: false,
                }
            }
        })
        .collect()
}

fn resolve_vlans(
    descriptor: &NetworkDescriptor,
    ethernet: &[EthernetInterface],
) -> Result<BTreeMap<(usize, u16), VlanInterface>> {
    let mut out = BTreeMap::new();
    for (&parent_index, vlans) in &descriptor.vlans {
        let parent = ethernet.get(parent_index).ok_or_else(|| {
            Error::MalformedDescriptor(format!(
                "vlan parent index {parent_index} out of range, descriptor has {} ethernet interfaces",
                ethernet.len()
            ))
        })?;
        if !parent.is_valid {
            warn!(
                parent_index,
                mac = %parent.spec.mac,
                "vlan parent did not resolve, skipping its vlans"
            );
            continue;
        }
        for (&vlan_id, spec) in vlans {
            out.insert(
                (parent_index, vlan_id),
                VlanInterface {
                    spec: spec.clone(),
                    parent_name: parent.name.clone(),
                },
            );
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use metadata::{EthernetSpec, VlanSpec};
    use pnet::{datalink::NetworkInterface, util::MacAddr};

    pub(crate) fn nic(name: &str, mac: &str) -> NetworkInterface {
        NetworkInterface {
            name: name.into(),
            description: String::new(),
            index: 1,
            mac: Some(mac.parse::<MacAddr>().unwrap()),
            ips: vec![],
            flags: 0,
        }
    }

    pub(crate) fn eth_spec(mac: &str, mtu: u32, dhcpv6: &str) -> EthernetSpec {
        EthernetSpec {
            mac: mac.into(),
            mtu,
            dhcpv6_refresh: if dhcpv6.is_empty() {
                None
            } else {
                Some(dhcpv6.into())
            },
            ip: None,
            gateway: None,
        }
    }

    pub(crate) fn vlan_spec(mac: &str, parent: usize, id: u16, mtu: u32) -> VlanSpec {
        VlanSpec {
            mac: mac.into(),
            parent_index: parent,
            vlan_id: id,
            mtu,
            ip: None,
            gateway: None,
            ipv6: vec![],
            gateway_ipv6: None,
            dhcpv6_refresh: None,
        }
    }

    fn descriptor(
        eth: Vec<EthernetSpec>,
        vlans: Vec<(usize, u16, VlanSpec)>,
    ) -> NetworkDescriptor {
        let mut map: BTreeMap<usize, BTreeMap<u16, VlanSpec>> = BTreeMap::new();
        for (parent, id, spec) in vlans {
            map.entry(parent).or_default().insert(id, spec);
        }
        NetworkDescriptor {
            ethernet: eth,
            vlans: map,
        }
    }

    #[test]
    fn resolves_by_mac_case_insensitive() {
        let nics = vec![nic("eth0", "00:11:22:33:44:55")];
        let desc = descriptor(vec![eth_spec("00:11:22:33:44:55", 1460, "")], vec![]);
        let resolved = resolve_with(&desc, &nics).unwrap();
        assert_eq!(resolved.ethernet[0].name, "eth0");
        assert!(resolved.ethernet[0].is_valid);
        assert!(resolved.ethernet[0].is_primary);

        let desc = descriptor(vec![eth_spec("00:11:22:33:44:55", 1460, "")], vec![]);
        let upper = NetworkDescriptor {
            ethernet: vec![EthernetSpec {
                mac: "00:11:22:33:44:55".to_ascii_uppercase(),
                ..desc.ethernet[0].clone()
            }],
            vlans: BTreeMap::new(),
        };
        let resolved = resolve_with(&upper, &nics).unwrap();
        assert!(resolved.ethernet[0].is_valid);
    }

    #[test]
    fn unresolved_mac_is_invalid_not_fatal() {
        let nics = vec![nic("eth0", "00:11:22:33:44:55")];
        let desc = descriptor(
            vec![
                eth_spec("00:11:22:33:44:55", 1460, ""),
                eth_spec("de:ad:be:ef:00:01", 1500, ""),
            ],
            vec![],
        );
        let resolved = resolve_with(&desc, &nics).unwrap();
        assert!(resolved.ethernet[0].is_valid);
        assert!(!resolved.ethernet[1].is_valid);
        assert_eq!(resolved.ethernet[1].name, "");
        // remembered in the process-wide set
        assert!(UNRESOLVED_MACS
            .lock()
            .unwrap()
            .contains("de:ad:be:ef:00:01"));
    }

    #[test]
    fn vlan_parent_out_of_range_rejects_descriptor() {
        let nics = vec![nic("eth0", "00:11:22:33:44:55")];
        let desc = descriptor(
            vec![eth_spec("00:11:22:33:44:55", 1460, "")],
            vec![(3, 5, vlan_spec("aa:bb:cc:dd:ee:ff", 3, 5, 1500))],
        );
        let err = resolve_with(&desc, &nics).unwrap_err();
        assert!(matches!(err, Error::MalformedDescriptor(_)));
    }

    #[test]
    fn vlan_binds_parent_name() {
        let nics = vec![nic("eth0", "00:11:22:33:44:55")];
        let desc = descriptor(
            vec![eth_spec("00:11:22:33:44:55", 1460, "")],
            vec![(0, 5, vlan_spec("aa:bb:cc:dd:ee:ff", 0, 5, 1500))],
        );
        let resolved = resolve_with(&desc, &nics).unwrap();
        let vlan = &resolved.vlans[&(0, 5)];
        assert_eq!(vlan.parent_name, "eth0");
        assert_eq!(vlan.interface_name(), "gcp.eth0.5");
    }

    #[test]
    fn classify_and_mtu_map() {
        let nics = vec![
            nic("eth0", "00:11:22:33:44:55"),
            nic("eth1", "00:11:22:33:44:66"),
        ];
        let desc = descriptor(
            vec![
                eth_spec("00:11:22:33:44:55", 1460, ""),
                eth_spec("00:11:22:33:44:66", 1500, "1"),
                eth_spec("de:ad:be:ef:00:02", 9000, "1"),
            ],
            vec![],
        );
        let resolved = resolve_with(&desc, &nics).unwrap();
        let (ipv4, ipv6) = resolved.classify();
        assert_eq!(ipv4, vec!["eth0", "eth1"]);
        assert_eq!(ipv6, vec!["eth1"]);
        let mtus = resolved.mtu_map();
        assert_eq!(mtus.len(), 2);
        assert_eq!(mtus["eth0"], 1460);
        assert_eq!(mtus["eth1"], 1500);
    }
}
