use async_trait::async_trait;
use log::debug;
use std::path::Path;

use crate::virtualbox::errors::Result;

/// Host-side check for hardware virtualization. Only answers "disabled" when
/// the host says so; anything it cannot check is left to the VM log scan.
#[async_trait]
pub trait VirtualizationCheck: Send + Sync {
    async fn is_vtx_disabled(&self) -> bool;
    async fn is_hyperv_installed(&self) -> bool;
}

pub struct HostVirtualizationCheck;

#[async_trait]
impl VirtualizationCheck for HostVirtualizationCheck {
    #[cfg(target_os = "linux")]
    async fn is_vtx_disabled(&self) -> bool {
        match tokio::fs::read_to_string("/proc/cpuinfo").await {
            Ok(cpuinfo) => !cpuinfo_has_virtualization(&cpuinfo),
            Err(e) => {
                debug!("Couldn't check that VT-X/AMD-v is enabled. Will check that the vm is properly created: {}", e);
                false
            }
        }
    }

    #[cfg(target_os = "macos")]
    async fn is_vtx_disabled(&self) -> bool {
        match command_output("sysctl", &["machdep.cpu.features"]).await {
            Some(features) => !features.contains("VMX"),
            None => false,
        }
    }

    #[cfg(windows)]
    async fn is_vtx_disabled(&self) -> bool {
        match command_output("wmic", &["cpu", "get", "VirtualizationFirmwareEnabled"]).await {
            Some(out) => out.contains("FALSE"),
            None => false,
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    async fn is_vtx_disabled(&self) -> bool {
        false
    }

    #[cfg(windows)]
    async fn is_hyperv_installed(&self) -> bool {
        if which::which("vmms.exe").is_err() {
            return false;
        }

        match command_output("wmic", &["computersystem", "get", "hypervisorpresent"]).await {
            Some(out) => out.contains("TRUE"),
            None => false,
        }
    }

    #[cfg(not(windows))]
    async fn is_hyperv_installed(&self) -> bool {
        false
    }
}

#[cfg(any(target_os = "macos", windows))]
async fn command_output(program: &str, args: &[&str]) -> Option<String> {
    match tokio::process::Command::new(program).args(args).output().await {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).to_string()),
        Ok(out) => {
            debug!("{} {:?} exited with {}", program, args, out.status);
            None
        }
        Err(e) => {
            debug!("Unable to run {}: {}", program, e);
            None
        }
    }
}

pub fn cpuinfo_has_virtualization(cpuinfo: &str) -> bool {
    cpuinfo.contains("vmx") || cpuinfo.contains("svm")
}

/// Reads the log VirtualBox writes for a VM.
pub trait LogsReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<String>>;
}

pub struct FileLogsReader;

impl LogsReader for FileLogsReader {
    /// Localized host names and paths can put non-UTF-8 bytes in the log;
    /// those are replaced rather than failing the read.
    fn read(&self, path: &Path) -> Result<Vec<String>> {
        let content = std::fs::read(path)?;
        Ok(String::from_utf8_lossy(&content)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

/// True when the VM log shows VirtualBox could not use VT-x/AMD-v.
pub fn is_vtx_disabled_in_log(lines: &[String]) -> bool {
    lines.iter().any(|line| {
        (line.contains("VT-x is disabled")
            && !line.contains("Falling back to raw-mode: VT-x is disabled in the BIOS for all CPU modes"))
            || line.contains("the host CPU does NOT support HW virtualization")
            || line.contains("VERR_VMX_UNABLE_TO_START_VM")
            || (line.contains("Power up failed") && line.contains("VERR_VMX_NO_VMX"))
    })
}
