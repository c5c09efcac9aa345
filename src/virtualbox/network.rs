use ipnetwork::Ipv4Network;
use log::{debug, warn};
use regex::Regex;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::LazyLock;
use std::time::Duration;

use crate::virtualbox::errors::{Result, VBoxError};
use crate::virtualbox::models::{DhcpServer, HostOnlyNetwork};
use crate::virtualbox::parse::{parse_key_values, RE_COLON_LINE};
use crate::virtualbox::util::{RandomInter, Sleeper};
use crate::virtualbox::vbm::VBoxManager;

/// Mask VirtualBox sometimes reports for an adapter it has just created.
pub const BUGGY_NETMASK: Ipv4Addr = Ipv4Addr::new(15, 0, 0, 0);
pub const DHCP_PREFIX: &str = "HostInterfaceNetworking-";

const NEW_ADAPTER_POLLS: usize = 10;
const NEW_ADAPTER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RANDOM_IP_ATTEMPTS: usize = 5;

static RE_HOST_ONLY_ADAPTER_CREATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Interface '(.+)' was successfully created").expect("valid regex")
});

pub type HostOnlyNetworks = BTreeMap<String, HostOnlyNetwork>;

impl HostOnlyNetwork {
    /// Push the IPv4 configuration, then ask for DHCP when the record wants it.
    pub async fn save(&self, vbox: &dyn VBoxManager) -> Result<()> {
        self.save_ipv4(vbox).await?;

        if self.dhcp {
            // Not implemented by every VirtualBox release.
            if let Err(e) = vbox.vbm(&["hostonlyif", "ipconfig", &self.name, "--dhcp"]).await {
                debug!("Unable to enable DHCP on {}: {}", self.name, e);
            }
        }

        Ok(())
    }

    pub async fn save_ipv4(&self, vbox: &dyn VBoxManager) -> Result<()> {
        let (Some(ip), Some(mask)) = (self.ip, self.netmask) else {
            return Ok(());
        };

        if cfg!(windows) {
            warn!("Windows might ask for the permission to configure a network adapter. Sometimes, such confirmation window is minimized in the taskbar.");
        }

        let ip = ip.to_string();
        let mask = mask.to_string();
        vbox.vbm(&["hostonlyif", "ipconfig", &self.name, "--ip", &ip, "--netmask", &mask])
            .await
    }
}

/// All host-only adapters keyed by their VirtualBox network name.
pub async fn list_host_only_adapters(vbox: &dyn VBoxManager) -> Result<HostOnlyNetworks> {
    let out = vbox.vbm_out(&["list", "hostonlyifs"]).await?;

    let mut by_name = HostOnlyNetworks::new();
    let mut by_ip: BTreeMap<Ipv4Addr, String> = BTreeMap::new();
    let mut n = HostOnlyNetwork::default();

    parse_key_values(&out, &RE_COLON_LINE, |key, val| {
        match key {
            "Name" => n.name = val.to_string(),
            "GUID" => n.guid = val.to_string(),
            "DHCP" => n.dhcp = val != "Disabled",
            "IPAddress" => n.ip = val.parse().ok(),
            "NetworkMask" => n.netmask = val.parse().ok(),
            "HardwareAddress" => n.hw_addr = val.to_string(),
            "MediumType" => n.medium = val.to_string(),
            "Status" => n.status = val.to_string(),
            // Last key of each record.
            "VBoxNetworkName" => {
                n.network_name = val.to_string();
                let done = std::mem::take(&mut n);

                if by_name.contains_key(&done.network_name) {
                    return Err(VBoxError::DuplicateAdapterName(done.network_name));
                }

                if let Some(ip) = done.ip {
                    if by_ip.contains_key(&ip) {
                        return Err(VBoxError::DuplicateAdapterIp(ip.to_string()));
                    }
                    by_ip.insert(ip, done.network_name.clone());
                }

                by_name.insert(done.network_name.clone(), done);
            }
            _ => {}
        }
        Ok(())
    })?;

    Ok(by_name)
}

/// The adapter already configured with `host_ip`/`netmask`, tolerating the
/// mask VirtualBox misreports for fresh adapters.
pub fn get_host_only_adapter<'a>(
    nets: &'a HostOnlyNetworks,
    host_ip: Ipv4Addr,
    netmask: Ipv4Addr,
) -> Option<&'a HostOnlyNetwork> {
    let found = nets.values().find(|n| {
        n.ip == Some(host_ip) && (n.netmask == Some(netmask) || n.netmask == Some(BUGGY_NETMASK))
    });

    match found {
        Some(n) => debug!("Found: {}", n.name),
        None => debug!("Not found"),
    }

    found
}

pub async fn create_host_only_adapter(vbox: &dyn VBoxManager) -> Result<HostOnlyNetwork> {
    if cfg!(windows) {
        warn!("Windows might ask for the permission to create a network adapter. Sometimes, such confirmation window is minimized in the taskbar.");
    }

    let out = vbox.vbm_out(&["hostonlyif", "create"]).await?;

    let caps = RE_HOST_ONLY_ADAPTER_CREATED
        .captures(&out)
        .ok_or(VBoxError::HostOnlyAdapterCreate)?;

    Ok(HostOnlyNetwork {
        name: caps[1].to_string(),
        ..Default::default()
    })
}

/// Poll until an adapter absent from `old_nets` shows up.
pub async fn wait_for_new_host_only_network(
    old_nets: &HostOnlyNetworks,
    vbox: &dyn VBoxManager,
    sleeper: &dyn Sleeper,
) -> Result<HostOnlyNetwork> {
    for _ in 0..NEW_ADAPTER_POLLS {
        sleeper.sleep(NEW_ADAPTER_POLL_INTERVAL).await;

        let new_nets = list_host_only_adapters(vbox).await?;
        if let Some((_, n)) = new_nets
            .into_iter()
            .find(|(name, _)| !old_nets.contains_key(name))
        {
            return Ok(n);
        }
    }

    Err(VBoxError::HostOnlyAdapterNotVisible)
}

pub async fn get_or_create_host_only_network(
    host_ip: Ipv4Addr,
    netmask: Ipv4Addr,
    nets: &HostOnlyNetworks,
    vbox: &dyn VBoxManager,
    sleeper: &dyn Sleeper,
) -> Result<HostOnlyNetwork> {
    if let Some(n) = get_host_only_adapter(nets, host_ip, netmask) {
        return Ok(n.clone());
    }

    // Creation can report a failure yet still produce the adapter a moment later.
    if let Err(e) = create_host_only_adapter(vbox).await {
        warn!("Creating a new host-only adapter produced an error: {}", e);
        warn!("This is a known VirtualBox bug. Let's try to recover anyway...");
    }

    let mut adapter = wait_for_new_host_only_network(nets, vbox, sleeper)
        .await
        .map_err(|_| VBoxError::HostOnlyAdapterNotVisible)?;

    warn!("Found a new host-only adapter: {:?}", adapter.name);

    adapter.ip = Some(host_ip);
    adapter.netmask = Some(netmask);
    adapter.save(vbox).await?;

    Ok(adapter)
}

/// All DHCP servers keyed by network name.
pub async fn list_dhcp_servers(vbox: &dyn VBoxManager) -> Result<BTreeMap<String, DhcpServer>> {
    let out = vbox.vbm_out(&["list", "dhcpservers"]).await?;

    let mut servers: BTreeMap<String, DhcpServer> = BTreeMap::new();
    let mut current: Option<String> = None;

    parse_key_values(&out, &RE_COLON_LINE, |key, val| {
        if key == "NetworkName" {
            servers.insert(
                val.to_string(),
                DhcpServer {
                    network_name: val.to_string(),
                    ..Default::default()
                },
            );
            current = Some(val.to_string());
            return Ok(());
        }

        let Some(dhcp) = current.as_ref().and_then(|name| servers.get_mut(name)) else {
            return Ok(());
        };

        match key {
            "IP" => dhcp.ip = val.parse().ok(),
            "NetworkMask" => dhcp.netmask = val.parse().ok(),
            "lowerIPAddress" => dhcp.lower_ip = val.parse().ok(),
            "upperIPAddress" => dhcp.upper_ip = val.parse().ok(),
            "Enabled" => dhcp.enabled = val == "Yes",
            _ => {}
        }
        Ok(())
    })?;

    Ok(servers)
}

/// Drop DHCP servers left behind by host-only adapters that no longer exist.
pub async fn remove_orphan_dhcp_servers(vbox: &dyn VBoxManager) -> Result<()> {
    let dhcps = list_dhcp_servers(vbox).await?;
    if dhcps.is_empty() {
        return Ok(());
    }

    debug!("Removing orphan DHCP servers...");

    let nets = list_host_only_adapters(vbox).await?;

    for name in dhcps.keys() {
        if name.starts_with(DHCP_PREFIX) && !nets.contains_key(name) {
            if let Err(e) = vbox.vbm(&["dhcpserver", "remove", "--netname", name]).await {
                warn!("Unable to remove orphan dhcp server {:?}: {}", name, e);
            }
        }
    }

    Ok(())
}

/// Add or update the DHCP server of host-only adapter `ifname`. Nothing is
/// sent when the existing server already matches.
pub async fn add_host_only_dhcp_server(
    ifname: &str,
    dhcp: &DhcpServer,
    vbox: &dyn VBoxManager,
) -> Result<()> {
    let name = format!("{DHCP_PREFIX}{ifname}");

    let dhcps = list_dhcp_servers(vbox).await?;

    // Some platforms attach a default server to every new adapter.
    let command = match dhcps.get(&name) {
        Some(existing) => {
            if existing.ip == dhcp.ip
                && existing.netmask == dhcp.netmask
                && existing.lower_ip == dhcp.lower_ip
                && existing.upper_ip == dhcp.upper_ip
                && existing.enabled == dhcp.enabled
            {
                return Ok(());
            }
            "modify"
        }
        None => "add",
    };

    let addr = |ip: Option<Ipv4Addr>| ip.map(|ip| ip.to_string()).unwrap_or_default();
    let ip = addr(dhcp.ip);
    let netmask = addr(dhcp.netmask);
    let lower = addr(dhcp.lower_ip);
    let upper = addr(dhcp.upper_ip);

    let args = [
        "dhcpserver",
        command,
        "--netname",
        name.as_str(),
        "--ip",
        ip.as_str(),
        "--netmask",
        netmask.as_str(),
        "--lowerip",
        lower.as_str(),
        "--upperip",
        upper.as_str(),
        if dhcp.enabled { "--enable" } else { "--disable" },
    ];

    if cfg!(windows) {
        warn!("Windows might ask for the permission to configure a dhcp server. Sometimes, such confirmation window is minimized in the taskbar.");
    }

    vbox.vbm(&args).await
}

/// Lease range handed out by the DHCP server at `dhcp_addr`.
///
/// Networks of /24 or wider keep the historical `.100`-`.254` range. Narrower
/// networks lease everything between the server and the broadcast address.
pub fn dhcp_address_range(dhcp_addr: Ipv4Addr, network: Ipv4Network) -> (Ipv4Addr, Ipv4Addr) {
    let net = network.network().octets();

    if network.prefix() <= 24 {
        return (
            Ipv4Addr::new(net[0], net[1], net[2], 100),
            Ipv4Addr::new(net[0], net[1], net[2], 254),
        );
    }

    // /31 and /32 have no room for leases; the range collapses onto the network address.
    let size = 1u32 << (32 - network.prefix());
    let lower = Ipv4Addr::new(net[0], net[1], net[2], dhcp_addr.octets()[3].saturating_add(1));
    let upper = Ipv4Addr::new(net[0], net[1], net[2], net[3] + size.saturating_sub(2) as u8);
    (lower, upper)
}

/// A pseudo-random address in `network` for the DHCP server, never `host_ip`.
pub fn random_ip_in_subnet(
    random: &dyn RandomInter,
    host_ip: Ipv4Addr,
    network: Ipv4Network,
) -> Result<Ipv4Addr> {
    let host = host_ip.octets();
    let net = network.network().octets();

    if network.prefix() <= 24 {
        for _ in 0..RANDOM_IP_ATTEMPTS {
            let last = (random.random_int(24) + 1) as u8;
            if last != host[3] {
                return Ok(Ipv4Addr::new(host[0], host[1], host[2], last));
            }
        }
        return Err(VBoxError::UnableToGenerateRandomIp);
    }

    // Leave room above the server for at least one lease before the broadcast.
    let size = 1u32 << (32 - network.prefix());
    let max_offset = size.saturating_sub(4).min(24);
    if max_offset == 0 {
        return Err(VBoxError::UnableToGenerateRandomIp);
    }

    for _ in 0..RANDOM_IP_ATTEMPTS {
        let last = net[3] + (random.random_int(max_offset) + 1) as u8;
        if last != host[3] {
            return Ok(Ipv4Addr::new(net[0], net[1], net[2], last));
        }
    }

    Err(VBoxError::UnableToGenerateRandomIp)
}

/// Parse a host-only CIDR such as `192.168.99.1/24`. The address part must be
/// a host address, not the network address.
pub fn parse_and_validate_cidr(cidr: &str) -> Result<Ipv4Network> {
    if !cidr.contains('/') {
        return Err(VBoxError::InvalidCidr(cidr.to_string()));
    }

    let network: Ipv4Network = cidr
        .parse()
        .map_err(|_| VBoxError::InvalidCidr(cidr.to_string()))?;

    if network.ip() == network.network() {
        return Err(VBoxError::NetworkAddrCidr);
    }

    Ok(network)
}
