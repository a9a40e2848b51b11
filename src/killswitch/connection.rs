//! Dummy connection descriptors
//!
//! Three well-known profiles make up the kill switch: a full block covering
//! both address families, a routed block whose IPv4 address list leaves a
//! hole for exactly one server, and a standalone IPv6 blackhole for leak
//! protection. Route metric 97 places them above every physical interface
//! while staying below the VPN tunnel itself.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::nm::{ConnectionSpec, IpFamilyConfig};

pub const FULL_CONNECTION_ID: &str = "nmguard-killswitch";
pub const FULL_INTERFACE: &str = "nmguardks0";
pub const ROUTED_CONNECTION_ID: &str = "nmguard-killswitch-routed";
pub const ROUTED_INTERFACE: &str = "nmguardrt0";
pub const IPV6_CONNECTION_ID: &str = "nmguard-killswitch-ipv6";
pub const IPV6_INTERFACE: &str = "nmguardv60";

/// Above physical interfaces (100+), below the tunnel.
const ROUTE_METRIC: u32 = 97;
/// Wins against every real resolver entry.
const DNS_PRIORITY: i32 = -1400;

const IPV4_ADDRESS: Ipv4Addr = Ipv4Addr::new(100, 85, 0, 1);
const IPV4_PREFIX: u8 = 24;
const IPV6_ADDRESS: Ipv6Addr = Ipv6Addr::new(0xfdeb, 0x446c, 0x912d, 0x08da, 0, 0, 0, 0);
const IPV6_PREFIX: u8 = 64;
const IPV6_GATEWAY: Ipv6Addr = Ipv6Addr::new(0xfdeb, 0x446c, 0x912d, 0x08da, 0, 0, 0, 1);

/// Identity half of a dummy connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSwitchGeneralConfig {
    pub id: String,
    pub interface: String,
}

/// Static descriptor of one dummy connection. Constructed fresh per call;
/// immutable except that the routed variant narrows the IPv4 address list
/// around a single server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSwitchConfig {
    pub general: KillSwitchGeneralConfig,
    pub ipv4: Option<IpFamilyConfig>,
    pub ipv6: Option<IpFamilyConfig>,
}

impl KillSwitchConfig {
    /// Blackhole for both address families.
    pub fn full_block() -> Self {
        Self {
            general: KillSwitchGeneralConfig {
                id: FULL_CONNECTION_ID.to_string(),
                interface: FULL_INTERFACE.to_string(),
            },
            ipv4: Some(blackhole_ipv4()),
            ipv6: Some(blackhole_ipv6()),
        }
    }

    /// Full block with an IPv4 hole for `server_ip`. IPv6 stays blackholed.
    pub fn routed_block(server_ip: Ipv4Addr) -> Self {
        let mut ipv4 = blackhole_ipv4();
        ipv4.addresses = subnets_excluding(server_ip)
            .into_iter()
            .map(IpNet::V4)
            .collect();

        Self {
            general: KillSwitchGeneralConfig {
                id: ROUTED_CONNECTION_ID.to_string(),
                interface: ROUTED_INTERFACE.to_string(),
            },
            ipv4: Some(ipv4),
            ipv6: Some(blackhole_ipv6()),
        }
    }

    /// IPv6 blackhole on its own connection, for use alongside IPv4-only
    /// tunnels.
    pub fn ipv6_leak_protection() -> Self {
        Self {
            general: KillSwitchGeneralConfig {
                id: IPV6_CONNECTION_ID.to_string(),
                interface: IPV6_INTERFACE.to_string(),
            },
            ipv4: None,
            ipv6: Some(blackhole_ipv6()),
        }
    }

    pub fn to_spec(&self, persist: bool) -> ConnectionSpec {
        ConnectionSpec {
            id: self.general.id.clone(),
            interface: self.general.interface.clone(),
            persist,
            ipv4: self.ipv4.clone(),
            ipv6: self.ipv6.clone(),
        }
    }
}

fn blackhole_ipv4() -> IpFamilyConfig {
    IpFamilyConfig {
        addresses: vec![IpNet::V4(ipv4_net(IPV4_ADDRESS, IPV4_PREFIX))],
        gateway: Some(IpAddr::V4(IPV4_ADDRESS)),
        dns: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
        dns_priority: DNS_PRIORITY,
        ignore_auto_dns: true,
        route_metric: ROUTE_METRIC,
    }
}

fn blackhole_ipv6() -> IpFamilyConfig {
    IpFamilyConfig {
        addresses: vec![IpNet::V6(ipv6_net(IPV6_ADDRESS, IPV6_PREFIX))],
        gateway: Some(IpAddr::V6(IPV6_GATEWAY)),
        dns: vec![IpAddr::V6(Ipv6Addr::LOCALHOST)],
        dns_priority: DNS_PRIORITY,
        ignore_auto_dns: true,
        route_metric: ROUTE_METRIC,
    }
}

/// The 32 subnets that together cover all of IPv4 space except `server`.
///
/// Walks from /1 down to /32, at each depth keeping the half that does not
/// contain the server. The last entry is the server's /32 sibling.
pub fn subnets_excluding(server: Ipv4Addr) -> Vec<Ipv4Net> {
    let ip = u32::from(server);
    (1..=32u8)
        .map(|prefix| {
            let flipped = ip ^ (1u32 << (32 - u32::from(prefix)));
            let network = flipped & prefix_mask(prefix);
            ipv4_net(Ipv4Addr::from(network), prefix)
        })
        .collect()
}

fn prefix_mask(prefix: u8) -> u32 {
    u32::MAX << (32 - u32::from(prefix))
}

fn ipv4_net(addr: Ipv4Addr, prefix: u8) -> Ipv4Net {
    // Prefix lengths here are fixed at compile time and never exceed 32
    Ipv4Net::new(addr, prefix).unwrap()
}

fn ipv6_net(addr: Ipv6Addr, prefix: u8) -> Ipv6Net {
    Ipv6Net::new(addr, prefix).unwrap()
}
