use ipnetwork::{IpNetwork, Ipv4Network};
use log::debug;
use std::collections::BTreeMap;

use crate::virtualbox::errors::{Result, VBoxError};
use crate::virtualbox::models::HostOnlyNetwork;

/// One network interface of the host and the networks assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub addrs: Vec<IpNetwork>,
}

pub trait HostInterfaces: Send + Sync {
    fn interfaces(&self) -> Result<Vec<HostInterface>>;
}

pub struct SystemHostInterfaces;

#[cfg(unix)]
impl HostInterfaces for SystemHostInterfaces {
    fn interfaces(&self) -> Result<Vec<HostInterface>> {
        use ipnetwork::Ipv6Network;
        use nix::ifaddrs::getifaddrs;
        use nix::net::if_::InterfaceFlags;
        use std::net::Ipv4Addr;

        let mut ifaces: Vec<HostInterface> = Vec::new();

        for ifa in getifaddrs().map_err(std::io::Error::from)? {
            let idx = match ifaces.iter().position(|i| i.name == ifa.interface_name) {
                Some(idx) => idx,
                None => {
                    ifaces.push(HostInterface {
                        name: ifa.interface_name.clone(),
                        up: ifa.flags.contains(InterfaceFlags::IFF_UP),
                        loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                        addrs: Vec::new(),
                    });
                    ifaces.len() - 1
                }
            };

            let (Some(addr), Some(mask)) = (ifa.address, ifa.netmask) else {
                continue;
            };

            if let (Some(a), Some(m)) = (addr.as_sockaddr_in(), mask.as_sockaddr_in()) {
                if let Ok(net) = Ipv4Network::with_netmask(Ipv4Addr::from(a.ip()), Ipv4Addr::from(m.ip())) {
                    ifaces[idx].addrs.push(IpNetwork::V4(net));
                }
            } else if let (Some(a), Some(m)) = (addr.as_sockaddr_in6(), mask.as_sockaddr_in6()) {
                if let Ok(net) = Ipv6Network::with_netmask(a.ip(), m.ip()) {
                    ifaces[idx].addrs.push(IpNetwork::V6(net));
                }
            }
        }

        Ok(ifaces)
    }
}

#[cfg(windows)]
const GET_NET_IP_ADDRESS: &str = "ConvertTo-Json -Compress -InputObject @(Get-NetIPAddress | \
Select-Object InterfaceAlias,IPAddress,PrefixLength,@{n='AddressState';e={[string]$_.AddressState}})";

#[cfg(windows)]
impl HostInterfaces for SystemHostInterfaces {
    fn interfaces(&self) -> Result<Vec<HostInterface>> {
        let output = std::process::Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", GET_NET_IP_ADDRESS])
            .output()?;

        if !output.status.success() {
            log::warn!(
                "Unable to list host interfaces ({}), skipping the host-only network collision check: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(Vec::new());
        }

        parse_net_ip_addresses(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(not(any(unix, windows)))]
impl HostInterfaces for SystemHostInterfaces {
    fn interfaces(&self) -> Result<Vec<HostInterface>> {
        log::warn!("Host interface enumeration is not available on this platform, skipping the host-only network collision check");
        Ok(Vec::new())
    }
}

#[cfg(any(windows, test))]
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetIpAddress {
    interface_alias: String,
    #[serde(rename = "IPAddress")]
    ip_address: String,
    prefix_length: u8,
    address_state: String,
}

/// Group `Get-NetIPAddress` JSON records by interface. Only addresses in the
/// `Preferred` state count as up.
#[cfg(any(windows, test))]
fn parse_net_ip_addresses(json: &str) -> Result<Vec<HostInterface>> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }

    let records: Vec<NetIpAddress> = serde_json::from_str(json)?;
    let mut ifaces: Vec<HostInterface> = Vec::new();

    for record in records {
        // Link-local IPv6 addresses carry a `%<zone>` suffix.
        let addr = record.ip_address.split('%').next().unwrap_or_default();
        let Ok(ip) = addr.parse::<std::net::IpAddr>() else {
            debug!("Skipping unparsable address {:?}", record.ip_address);
            continue;
        };
        let Ok(net) = IpNetwork::new(ip, record.prefix_length) else {
            debug!("Skipping {}/{}", ip, record.prefix_length);
            continue;
        };

        let up = record.address_state == "Preferred";
        match ifaces.iter_mut().find(|i| i.name == record.interface_alias) {
            Some(iface) => {
                iface.up |= up;
                iface.loopback &= ip.is_loopback();
                iface.addrs.push(net);
            }
            None => ifaces.push(HostInterface {
                name: record.interface_alias,
                up,
                loopback: ip.is_loopback(),
                addrs: vec![net],
            }),
        }
    }

    Ok(ifaces)
}

/// Networks of the host interfaces that are up, not loopback, and not one of
/// the VirtualBox host-only networks in `exclude`.
pub fn list_host_interfaces(
    hif: &dyn HostInterfaces,
    exclude: &[IpNetwork],
) -> Result<Vec<IpNetwork>> {
    let mut nets = Vec::new();

    for iface in hif.interfaces()? {
        let excluded = iface.addrs.iter().any(|a| exclude.contains(a));
        if excluded || !iface.up || iface.loopback {
            continue;
        }
        nets.extend(iface.addrs.iter().copied());
    }

    Ok(nets)
}

/// True when any host interface sits on the same network as `host_only`.
/// Works for both IPv4 and IPv6.
pub fn check_ip_net_collision(host_only: &IpNetwork, host_ifaces: &[IpNetwork]) -> bool {
    host_ifaces
        .iter()
        .any(|iface| host_only.network() == iface.network())
}

/// Fail when the host-only network we are about to use is already routed
/// through one of the host's own interfaces.
pub fn validate_no_ip_collisions(
    hif: &dyn HostInterfaces,
    host_only: Ipv4Network,
    current: &BTreeMap<String, HostOnlyNetwork>,
) -> Result<()> {
    let exclude: Vec<IpNetwork> = current
        .values()
        .filter_map(|n| match (n.ip, n.netmask) {
            (Some(ip), Some(mask)) => Ipv4Network::with_netmask(ip, mask).ok().map(IpNetwork::V4),
            _ => None,
        })
        .collect();

    let host_nets = list_host_interfaces(hif, &exclude)?;
    debug!("Host interface networks: {:?}", host_nets);

    if check_ip_net_collision(&IpNetwork::V4(host_only), &host_nets) {
        return Err(VBoxError::NetworkAddrCollision);
    }

    Ok(())
}
