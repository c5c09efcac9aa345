use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use log::debug;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::virtualbox::errors::{Result, VBoxError};

const VBOX_MANAGE: &str = "VBoxManage";
const NOT_READY_ATTEMPTS: usize = 5;
const NOT_READY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VBoxOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `VBoxManage` with an argument vector. Everything the driver does to
/// VirtualBox goes through this seam.
#[async_trait]
pub trait VBoxManager: Send + Sync {
    async fn vbm_out_err(&self, args: &[&str]) -> Result<VBoxOutput>;

    async fn vbm(&self, args: &[&str]) -> Result<()> {
        self.vbm_out_err(args).await.map(|_| ())
    }

    async fn vbm_out(&self, args: &[&str]) -> Result<String> {
        self.vbm_out_err(args).await.map(|out| out.stdout)
    }
}

pub struct VBoxCmdManager {
    command: PathBuf,
}

impl VBoxCmdManager {
    pub fn new() -> Self {
        Self {
            command: detect_vboxmanage_cmd(),
        }
    }

    pub fn with_command(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run_once(&self, args: &[&str]) -> Result<VBoxOutput> {
        let command_line = format!("{} {}", self.command.display(), args.join(" "));
        debug!("COMMAND: {}", command_line);

        let output = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => VBoxError::VBoxManageNotFound,
                _ => VBoxError::Io(e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!("STDOUT:\n{{\n{}}}", stdout);
        debug!("STDERR:\n{{\n{}}}", stderr);

        // VBoxManage sometimes exits 0 after printing a fatal error such as
        // "VBoxManage.exe: error: VT-x is not available. (VERR_VMX_NO_VMX)".
        if stderr.contains("error:") {
            return Err(VBoxError::Command {
                command: command_line,
                stderr,
            });
        }

        if !output.status.success() {
            return Err(VBoxError::ExitStatus {
                command: command_line,
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(VBoxOutput { stdout, stderr })
    }
}

impl Default for VBoxCmdManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VBoxManager for VBoxCmdManager {
    async fn vbm_out_err(&self, args: &[&str]) -> Result<VBoxOutput> {
        let run = || self.run_once(args);

        run.retry(
            ConstantBuilder::default()
                .with_delay(NOT_READY_DELAY)
                .with_max_times(NOT_READY_ATTEMPTS - 1),
        )
        .sleep(tokio::time::sleep)
        .when(|e: &VBoxError| e.is_object_not_ready())
        .notify(|_, dur| debug!("VBoxManage object not ready, retrying after {:?}", dur))
        .await
    }
}

/// Locate the VBoxManage binary. Falls back to the bare command name so the
/// spawn error surfaces as `VBoxManageNotFound`.
pub fn detect_vboxmanage_cmd() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(path) = windows::detect() {
            return path;
        }
    }

    which::which(VBOX_MANAGE).unwrap_or_else(|_| PathBuf::from(VBOX_MANAGE))
}

#[cfg(windows)]
mod windows {
    use log::debug;
    use std::path::PathBuf;
    use winreg::enums::HKEY_LOCAL_MACHINE;
    use winreg::RegKey;

    const EXE: &str = "VBoxManage.exe";
    const DEFAULT_INSTALL_DIR: &str = r"C:\Program Files\Oracle\VirtualBox";

    pub(super) fn detect() -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = ["VBOX_INSTALL_PATH", "VBOX_MSI_INSTALL_PATH"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .flat_map(|value| {
                value
                    .split(';')
                    .filter(|dir| !dir.is_empty())
                    .map(|dir| PathBuf::from(dir).join(EXE))
                    .collect::<Vec<_>>()
            })
            .collect();

        candidates.push(PathBuf::from(DEFAULT_INSTALL_DIR).join(EXE));

        if let Some(dir) = install_dir_from_registry() {
            candidates.push(PathBuf::from(dir).join(EXE));
        }

        let found = candidates.into_iter().find(|p| p.is_file());
        debug!("VBoxManage candidate on Windows: {:?}", found);
        found
    }

    fn install_dir_from_registry() -> Option<String> {
        RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey(r"SOFTWARE\Oracle\VirtualBox")
            .and_then(|key| key.get_value::<String, _>("InstallDir"))
            .ok()
    }
}
