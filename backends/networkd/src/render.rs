//! Renderers for networkd unit files. The netplan backend reuses these for
//! its override drop-ins, so everything here is path-agnostic: callers
//! decide where the text lands.
use agent_core::backend::{MARKER_KEY, MARKER_SECTION};
use agent_core::prelude::*;

/// `DHCP=` value: `ipv4` for IPv4-only interfaces, `yes` once DHCPv6 is in
/// play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMode {
    /// DHCPv4 only
    Ipv4,
    /// DHCPv4 + DHCPv6
    Yes,
}

impl DhcpMode {
    fn as_str(self) -> &'static str {
        match self {
            DhcpMode::Ipv4 => "ipv4",
            DhcpMode::Yes => "yes",
        }
    }

    /// pick the mode for an interface by its IPv6 capability
    pub fn for_ipv6(ipv6_enabled: bool) -> DhcpMode {
        if ipv6_enabled { DhcpMode::Yes } else { DhcpMode::Ipv4 }
    }
}

/// One `.network` unit (or netplan override) before rendering
#[derive(Debug, Clone)]
pub struct NetworkUnit {
    /// interface the unit matches
    pub name: String,
    /// `None` renders no DHCP= line (static-only interfaces)
    pub dhcp: Option<DhcpMode>,
    /// only the primary NIC provides the default DNS route
    pub dns_default_route: bool,
    /// primary NIC also picks up DHCP-provided search domains
    pub use_domains: bool,
    /// secondaries drop DHCP-sourced DNS/NTP routes
    pub suppress_dns_ntp_routes: bool,
    /// propagated verbatim from the descriptor
    pub mtu: Option<u32>,
    /// static addresses, CIDR or bare
    pub addresses: Vec<String>,
    /// static gateways
    pub gateways: Vec<String>,
    /// VLAN sub-interfaces riding on this link
    pub vlans: Vec<String>,
}

impl NetworkUnit {
    /// unit for a regular NIC
    pub fn ethernet(eth: &EthernetInterface, vlans: Vec<String>) -> NetworkUnit {
        NetworkUnit {
            name: eth.name.clone(),
            dhcp: Some(DhcpMode::for_ipv6(eth.spec.ipv6_enabled())),
            dns_default_route: eth.is_primary,
            use_domains: eth.is_primary,
            suppress_dns_ntp_routes: !eth.is_primary,
            mtu: Some(eth.spec.mtu),
            addresses: vec![],
            gateways: vec![],
            vlans,
        }
    }

    /// unit for an agent-created VLAN sub-interface
    pub fn vlan(vlan: &VlanInterface) -> NetworkUnit {
        let spec = &vlan.spec;
        let mut addresses: Vec<String> = spec.ip.iter().cloned().collect();
        addresses.extend(spec.ipv6.iter().cloned());
        let gateways = spec
            .gateway
            .iter()
            .chain(spec.gateway_ipv6.iter())
            .cloned()
            .collect();
        NetworkUnit {
            name: vlan.interface_name(),
            // static addressing wins; DHCP only when nothing static is given
            dhcp: if spec.ip.is_none() && spec.ipv6.is_empty() {
                Some(DhcpMode::for_ipv6(spec.ipv6_enabled()))
            } else {
                None
            },
            dns_default_route: false,
            use_domains: false,
            suppress_dns_ntp_routes: true,
            mtu: Some(spec.mtu),
            addresses,
            gateways,
            vlans: vec![],
        }
    }

    /// Render the unit. `with_match` is false for netplan override
    /// drop-ins, which attach to an existing unit.
    pub fn render(&self, with_match: bool) -> String {
        let mut out = String::new();
        if with_match {
            out.push_str("[Match]\n");
            out.push_str(&format!("Name={}\n\n", self.name));
        }
        out.push_str("[Network]\n");
        if let Some(dhcp) = self.dhcp {
            out.push_str(&format!("DHCP={}\n", dhcp.as_str()));
        }
        out.push_str(&format!("DNSDefaultRoute={}\n", self.dns_default_route));
        for addr in &self.addresses {
            out.push_str(&format!("Address={addr}\n"));
        }
        for gw in &self.gateways {
            out.push_str(&format!("Gateway={gw}\n"));
        }
        for vlan in &self.vlans {
            out.push_str(&format!("VLAN={vlan}\n"));
        }
        if self.dhcp.is_some() && (self.use_domains || self.suppress_dns_ntp_routes) {
            out.push_str("\n[DHCPv4]\n");
            if self.use_domains {
                out.push_str("UseDomains=true\n");
            }
            if self.suppress_dns_ntp_routes {
                out.push_str("RoutesToDNS=false\n");
                out.push_str("RoutesToNTP=false\n");
            }
        }
        if let Some(mtu) = self.mtu {
            out.push_str(&format!("\n[Link]\nMTUBytes={mtu}\n"));
        }
        out.push_str(&marker());
        out
    }
}

/// Render the `.netdev` companion an agent VLAN needs to exist
pub fn render_netdev(vlan: &VlanInterface) -> String {
    let mut out = String::new();
    out.push_str("[NetDev]\n");
    out.push_str(&format!("Name={}\n", vlan.interface_name()));
    out.push_str("Kind=vlan\n");
    // explicit override, never inherit the parent MAC
    out.push_str(&format!("MACAddress={}\n", vlan.spec.mac));
    out.push_str(&format!("MTUBytes={}\n", vlan.spec.mtu));
    out.push_str(&format!("\n[VLAN]\nId={}\n", vlan.spec.vlan_id));
    out.push_str(&marker());
    out
}

fn marker() -> String {
    format!("\n[{MARKER_SECTION}]\n{MARKER_KEY} = true\n")
}
