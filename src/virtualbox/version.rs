use log::warn;
use regex::Regex;
use std::sync::LazyLock;

use crate::virtualbox::errors::{Result, VBoxError};
use crate::virtualbox::vbm::VBoxManager;

static RE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)\.(.*)$").expect("valid regex"));

/// Ask VBoxManage for its version and reject anything that can't drive the VM.
pub async fn check_vboxmanage(vbox: &dyn VBoxManager) -> Result<String> {
    let version = vbox.vbm_out(&["--version"]).await?;
    let version = version.trim().to_string();
    check_vboxmanage_version(&version)?;
    Ok(version)
}

/// VirtualBox 4.2 and older are refused; 4.3 is tolerated with a warning.
pub fn check_vboxmanage_version(version: &str) -> Result<()> {
    let caps = RE_VERSION
        .captures(version)
        .ok_or_else(|| VBoxError::UnsupportedVersion(version.to_string()))?;

    let major: u32 = caps[1]
        .parse()
        .map_err(|_| VBoxError::UnsupportedVersion(version.to_string()))?;
    let minor: u32 = caps[2]
        .parse()
        .map_err(|_| VBoxError::UnsupportedVersion(version.to_string()))?;

    if major < 4 || (major == 4 && minor <= 2) {
        return Err(VBoxError::UnsupportedVersion(version.to_string()));
    }

    if major < 5 {
        warn!(
            "You are using version {} of VirtualBox. If you encounter issues, you might want to upgrade to version 5 at https://www.virtualbox.org",
            version
        );
    }

    Ok(())
}
