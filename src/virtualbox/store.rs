use log::debug;
use std::path::{Path, PathBuf};

use crate::virtualbox::errors::{Result, VBoxError};
use crate::virtualbox::models::VmDescriptor;

pub const CONFIG_FILE: &str = "config.json";

pub fn config_path(store_path: &Path, machine_name: &str) -> PathBuf {
    store_path
        .join("machines")
        .join(machine_name)
        .join(CONFIG_FILE)
}

pub fn exists(store_path: &Path, machine_name: &str) -> bool {
    config_path(store_path, machine_name).is_file()
}

pub fn load(store_path: &Path, machine_name: &str) -> Result<VmDescriptor> {
    let path = config_path(store_path, machine_name);
    debug!("Loading machine config from {}", path.display());

    let data = std::fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => VBoxError::MachineNotExist,
        _ => VBoxError::Io(e),
    })?;

    let mut config: VmDescriptor = serde_json::from_slice(&data)?;
    config.store_path = store_path.to_path_buf();
    Ok(config)
}

/// Write the descriptor atomically next to the machine's other files.
pub fn save(config: &VmDescriptor) -> Result<()> {
    let dir = config.machine_dir();
    std::fs::create_dir_all(&dir)?;

    let data = serde_json::to_vec_pretty(config)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    std::io::Write::write_all(&mut tmp, &data)?;
    tmp.persist(dir.join(CONFIG_FILE))
        .map_err(|e| VBoxError::Io(e.error))?;

    debug!("Saved machine config for {}", config.machine_name);
    Ok(())
}

pub fn remove(config: &VmDescriptor) -> Result<()> {
    let dir = config.machine_dir();
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}
