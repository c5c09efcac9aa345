use std::io;
use thiserror::Error;

/// Substring VBoxManage prints when an object it was asked to touch is still
/// being set up by the VirtualBox service.
pub const OBJECT_NOT_READY: &str = "error: The object is not ready";

#[derive(Debug, Error)]
pub enum VBoxError {
    #[error("VBoxManage not found. Make sure VirtualBox is installed and VBoxManage is in the path")]
    VBoxManageNotFound,

    #[error("We support Virtualbox starting with version 5. Your VirtualBox install is {0:?}. Please upgrade at https://www.virtualbox.org")]
    UnsupportedVersion(String),

    #[error("This computer doesn't have VT-X/AMD-v enabled. Enabling it in the BIOS is mandatory")]
    VtxDisabled,

    #[error("This computer is running Hyper-V. VirtualBox won't boot a 64bits VM when Hyper-V is activated. Either use Hyper-V as a driver, or disable the Hyper-V hypervisor. (To skip this check, use --virtualbox-no-vtx-check)")]
    HyperVConflict,

    #[error("machine does not exist")]
    MachineNotExist,

    #[error("Host is not running")]
    HostNotRunning,

    #[error("The host-only adapter we just created is not visible. This is a well known VirtualBox bug. You might want to uninstall it and reinstall at least version 5.0.12 that is is supposed to fix this issue")]
    HostOnlyAdapterNotVisible,

    #[error("Failed to create host-only adapter")]
    HostOnlyAdapterCreate,

    #[error("VirtualBox is configured with multiple host-only adapters with the same name {0:?}. Please remove one")]
    DuplicateAdapterName(String),

    #[error("VirtualBox is configured with multiple host-only adapters with the same IP {0:?}. Please remove one")]
    DuplicateAdapterIp(String),

    #[error("host-only cidr must be specified with a host address, not a network address")]
    NetworkAddrCidr,

    #[error("host-only cidr conflicts with the network address of a host interface")]
    NetworkAddrCollision,

    #[error("invalid CIDR address: {0}")]
    InvalidCidr(String),

    #[error("unable to generate random IP")]
    UnableToGenerateRandomIp,

    #[error("unable to allocate tcp port")]
    PortUnavailable,

    #[error("Too many retries waiting for an IP address")]
    IpUnavailable,

    #[error("Machine does not have a host-only adapter")]
    NoHostOnlyAdapter,

    #[error("Could not find MAC address for adapter {0}")]
    MacAddressNotFound(String),

    #[error("Could not find matching IP for MAC address {0}")]
    IpForMacNotFound(String),

    #[error("Unable to start the VM: {reason}{}", .details.as_ref().map(|d| format!("\nDetails: {d}")).unwrap_or_default())]
    StartFailed {
        reason: String,
        details: Option<String>,
    },

    #[error("{command} failed:\n{stderr}")]
    Command { command: String, stderr: String },

    #[error("{command} exited with {status}")]
    ExitStatus {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("unable to parse VBoxManage output: {0}")]
    Parse(String),

    #[error("download error: {0}")]
    Download(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl VBoxError {
    /// Stderr captured from a failed VBoxManage run, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            VBoxError::Command { stderr, .. } | VBoxError::ExitStatus { stderr, .. } => {
                Some(stderr)
            }
            _ => None,
        }
    }

    pub fn is_object_not_ready(&self) -> bool {
        self.stderr()
            .map(|stderr| stderr.contains(OBJECT_NOT_READY))
            .unwrap_or(false)
    }
}

pub type Result<T> = std::result::Result<T, VBoxError>;
