use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_CPU: i32 = 1;
pub const DEFAULT_MEMORY: u32 = 1024;
pub const DEFAULT_DISK_SIZE: u64 = 20000;
pub const DEFAULT_HOST_ONLY_CIDR: &str = "192.168.99.1/24";
pub const DEFAULT_NIC_TYPE: &str = "82540EM";
pub const DEFAULT_HOST_ONLY_PROMISC_MODE: &str = "deny";
pub const DEFAULT_SSH_USER: &str = "docker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    None,
    Running,
    Paused,
    Saved,
    Stopped,
    Error,
}

impl VmState {
    /// Map the `VMState` field of `showvminfo --machinereadable`.
    pub fn from_vbox(value: &str) -> Self {
        match value {
            "running" => VmState::Running,
            "paused" => VmState::Paused,
            "saved" => VmState::Saved,
            "poweroff" | "aborted" => VmState::Stopped,
            _ => VmState::None,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::None => "",
            VmState::Running => "Running",
            VmState::Paused => "Paused",
            VmState::Saved => "Saved",
            VmState::Stopped => "Stopped",
            VmState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiType {
    Gui,
    Sdl,
    #[default]
    Headless,
    Separate,
}

impl UiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UiType::Gui => "gui",
            UiType::Sdl => "sdl",
            UiType::Headless => "headless",
            UiType::Separate => "separate",
        }
    }
}

impl FromStr for UiType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gui" => Ok(UiType::Gui),
            "sdl" => Ok(UiType::Sdl),
            "headless" => Ok(UiType::Headless),
            "separate" => Ok(UiType::Separate),
            other => Err(format!(
                "invalid UI type {:?} (expected gui|sdl|headless|separate)",
                other
            )),
        }
    }
}

/// Persistent configuration of one managed VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDescriptor {
    pub machine_name: String,
    pub store_path: PathBuf,
    /// `-1` means "as many as the host has".
    pub cpu: i32,
    pub memory: u32,
    pub disk_size: u64,
    pub nat_nic_type: String,
    pub boot2docker_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot2docker_import_vm: Option<String>,
    pub host_dns_resolver: bool,
    pub host_only_cidr: String,
    pub host_only_nic_type: String,
    pub host_only_promisc_mode: String,
    pub ui_type: UiType,
    pub host_only_no_dhcp: bool,
    pub no_share: bool,
    pub dns_proxy: bool,
    pub no_vtx_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_folder: Option<String>,
    pub ssh_user: String,
    pub ssh_port: u16,
    #[serde(default)]
    pub ip_address: String,
}

impl VmDescriptor {
    pub fn new(machine_name: &str, store_path: impl Into<PathBuf>) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            store_path: store_path.into(),
            cpu: DEFAULT_CPU,
            memory: DEFAULT_MEMORY,
            disk_size: DEFAULT_DISK_SIZE,
            nat_nic_type: DEFAULT_NIC_TYPE.to_string(),
            boot2docker_url: String::new(),
            boot2docker_import_vm: None,
            host_dns_resolver: false,
            host_only_cidr: DEFAULT_HOST_ONLY_CIDR.to_string(),
            host_only_nic_type: DEFAULT_NIC_TYPE.to_string(),
            host_only_promisc_mode: DEFAULT_HOST_ONLY_PROMISC_MODE.to_string(),
            ui_type: UiType::Headless,
            host_only_no_dhcp: false,
            no_share: false,
            dns_proxy: true,
            no_vtx_check: false,
            share_folder: None,
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh_port: 0,
            ip_address: String::new(),
        }
    }

    /// `<store>/machines/<name>`
    pub fn machine_dir(&self) -> PathBuf {
        self.store_path.join("machines").join(&self.machine_name)
    }

    pub fn resolve_store_path(&self, file: &str) -> PathBuf {
        self.machine_dir().join(file)
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.resolve_store_path("id_rsa")
    }

    pub fn public_ssh_key_path(&self) -> PathBuf {
        self.resolve_store_path("id_rsa.pub")
    }

    pub fn disk_path(&self) -> PathBuf {
        self.resolve_store_path("disk.vmdk")
    }

    pub fn raw_disk_path(&self) -> PathBuf {
        self.resolve_store_path(&format!("{}.rawdisk", self.machine_name))
    }

    pub fn iso_path(&self) -> PathBuf {
        self.resolve_store_path("boot2docker.iso")
    }

    /// VirtualBox keeps its own per-VM folder (and `Logs/VBox.log`) under the base folder.
    pub fn vbox_log_path(&self) -> PathBuf {
        self.resolve_store_path(&self.machine_name)
            .join("Logs")
            .join("VBox.log")
    }
}

/// A host-only interface as reported by `VBoxManage list hostonlyifs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOnlyNetwork {
    pub name: String,
    pub guid: String,
    pub dhcp: bool,
    pub ip: Option<Ipv4Addr>,
    /// Kept as an address rather than a prefix: VirtualBox sometimes reports
    /// a non-contiguous mask for freshly created adapters.
    pub netmask: Option<Ipv4Addr>,
    pub hw_addr: String,
    pub medium: String,
    pub status: String,
    /// Referenced by `DhcpServer::network_name`.
    pub network_name: String,
}

/// A DHCP server as reported by `VBoxManage list dhcpservers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpServer {
    pub network_name: String,
    pub ip: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub lower_ip: Option<Ipv4Addr>,
    pub upper_ip: Option<Ipv4Addr>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub name: String,
    pub protocol: String,
    pub host_port: u16,
    pub guest_port: u16,
    pub interface: u8,
}

impl PortForward {
    /// The `--natpfN` rule body: `name,proto,host-ip,host-port,guest-ip,guest-port`.
    pub fn rule(&self) -> String {
        format!(
            "{},{},127.0.0.1,{},,{}",
            self.name, self.protocol, self.host_port, self.guest_port
        )
    }
}

/// Disk of an existing VM, from `showvminfo --machinereadable`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualDisk {
    pub uuid: String,
    pub path: String,
}

/// CPU/memory of an existing VM, from `showvminfo --machinereadable`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmInfo {
    pub cpus: i32,
    pub memory: u32,
}
