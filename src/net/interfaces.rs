//! Interface enumeration and broadcast address math.
//!
//! Beacons advertise on the directed broadcast address of each outbound
//! interface (`ip | !netmask`); the data listener binds the configured
//! inbound interface's IPv4 address. Interfaces without a usable IPv4
//! address (or netmask) are skipped.

use std::net::Ipv4Addr;

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};

use crate::error::{Error, Result};

/// Directed broadcast address of a subnet.
pub fn directed_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

fn enumerate() -> Result<Vec<NetworkInterface>> {
    NetworkInterface::show()
        .map_err(|e| Error::Discovery(format!("failed to enumerate network interfaces: {e}")))
}

fn first_ipv4(interface: &NetworkInterface) -> Option<(Ipv4Addr, Option<Ipv4Addr>)> {
    interface.addr.iter().find_map(|addr| match addr {
        Addr::V4(v4) => Some((v4.ip, v4.broadcast.or_else(|| v4.netmask.map(|m| directed_broadcast(v4.ip, m))))),
        Addr::V6(_) => None,
    })
}

/// IPv4 address of a named interface.
pub fn ipv4_of(name: &str) -> Result<Ipv4Addr> {
    enumerate()?
        .iter()
        .filter(|iface| iface.name == name)
        .find_map(|iface| first_ipv4(iface).map(|(ip, _)| ip))
        .ok_or_else(|| Error::Discovery(format!("interface `{name}` has no IPv4 address")))
}

/// First interface with a non-loopback IPv4 address, falling back to
/// loopback when the host has nothing else.
pub fn default_ipv4() -> Result<Ipv4Addr> {
    let interfaces = enumerate()?;
    let mut loopback = None;
    for iface in &interfaces {
        if let Some((ip, _)) = first_ipv4(iface) {
            if ip.is_loopback() {
                loopback.get_or_insert(ip);
            } else {
                return Ok(ip);
            }
        }
    }
    loopback.ok_or_else(|| Error::Discovery("no interface with an IPv4 address".into()))
}

/// `(local, broadcast)` address pairs for the given interfaces, or for every
/// broadcast-capable non-loopback interface when `names` is `None`.
/// Interfaces with no usable IPv4 address are skipped; an empty result is an
/// error.
pub fn broadcast_addrs(names: Option<&[String]>) -> Result<Vec<(Ipv4Addr, Ipv4Addr)>> {
    let interfaces = enumerate()?;
    let mut pairs = Vec::new();
    for iface in &interfaces {
        let selected = match names {
            Some(names) => names.iter().any(|n| *n == iface.name),
            None => true,
        };
        if !selected {
            continue;
        }
        let Some((ip, Some(broadcast))) = first_ipv4(iface) else {
            continue;
        };
        if names.is_none() && ip.is_loopback() {
            continue;
        }
        pairs.push((ip, broadcast));
    }
    if pairs.is_empty() {
        return Err(Error::Discovery(
            "no broadcast-capable interface available".into(),
        ));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directed_broadcast() {
        assert_eq!(
            directed_broadcast("192.168.4.17".parse().unwrap(), "255.255.255.0".parse().unwrap()),
            "192.168.4.255".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            directed_broadcast("10.1.2.3".parse().unwrap(), "255.0.0.0".parse().unwrap()),
            "10.255.255.255".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_default_ipv4_resolves() {
        // Every host running the tests has at least a loopback interface.
        assert!(default_ipv4().is_ok());
    }
}
