use async_trait::async_trait;
use log::{debug, info};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tar::{Builder, EntryType, Header};
use tokio::process::Command;

use crate::virtualbox::errors::{Result, VBoxError};
use crate::virtualbox::vbm::VBoxManager;

/// First entry of the seed archive. The boot2docker automount script formats
/// any disk that starts with it.
pub const FORMAT_ME_MAGIC: &str = "boot2docker, please format-me";

const BYTES_PER_MB: u64 = 1024 * 1024;

#[async_trait]
pub trait SshKeyGenerator: Send + Sync {
    /// Write a new private key at `path` and its public half at `path.pub`.
    async fn generate(&self, path: &Path) -> Result<()>;
}

pub struct SshKeygen;

#[async_trait]
impl SshKeyGenerator for SshKeygen {
    async fn generate(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        let args = ["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f", path_str.as_str()];
        debug!("Generating SSH key at {}", path.display());

        let output = Command::new("ssh-keygen")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(VBoxError::ExitStatus {
                command: format!("ssh-keygen {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
pub trait DiskCreator: Send + Sync {
    /// Build the boot disk at `disk` from a raw image of `size_mb` MB seeded
    /// with the key at `public_key`. `raw` is scratch space.
    async fn create(&self, size_mb: u64, public_key: &Path, raw: &Path, disk: &Path) -> Result<()>;
}

pub struct VBoxDiskCreator {
    vbox: Arc<dyn VBoxManager>,
}

impl VBoxDiskCreator {
    pub fn new(vbox: Arc<dyn VBoxManager>) -> Self {
        Self { vbox }
    }
}

#[async_trait]
impl DiskCreator for VBoxDiskCreator {
    async fn create(&self, size_mb: u64, public_key: &Path, raw: &Path, disk: &Path) -> Result<()> {
        let seed = make_disk_image(public_key)?;
        write_raw_disk(raw, &seed, size_mb)?;

        let raw_str = raw.to_string_lossy();
        let disk_str = disk.to_string_lossy();
        info!("Converting raw disk to {}", disk.display());
        self.vbox
            .vbm(&["convertfromraw", &raw_str, &disk_str, "--format", "VMDK"])
            .await?;

        std::fs::remove_file(raw)?;

        if let Some(dir) = disk.parent() {
            fix_machine_dir_ownership(dir)?;
        }

        Ok(())
    }
}

/// Tar stream holding the format-me marker and `.ssh/authorized_keys{,2}`.
pub fn make_disk_image(public_key: &Path) -> Result<Vec<u8>> {
    let pub_key = std::fs::read(public_key)?;
    let mut builder = Builder::new(Vec::new());

    debug!("Writing magic tar header");
    let mut header = Header::new_gnu();
    header.set_size(FORMAT_ME_MAGIC.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, FORMAT_ME_MAGIC, FORMAT_ME_MAGIC.as_bytes())?;

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o700);
    builder.append_data(&mut header, ".ssh", std::io::empty())?;

    debug!("Writing SSH key tar header");
    for name in [".ssh/authorized_keys", ".ssh/authorized_keys2"] {
        let mut header = Header::new_gnu();
        header.set_size(pub_key.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, pub_key.as_slice())?;
    }

    Ok(builder.into_inner()?)
}

/// Write `seed` at the start of a new file and size it to `size_mb` MB.
/// Fails if `path` already exists.
pub fn write_raw_disk(path: &Path, seed: &[u8], size_mb: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;

    file.write_all(seed)?;
    file.set_len(size_mb * BYTES_PER_MB)?;
    file.sync_all()?;

    Ok(())
}

/// Hand the machine directory and its direct children to the current user.
#[cfg(unix)]
pub fn fix_machine_dir_ownership(dir: &Path) -> Result<()> {
    use nix::unistd::{chown, Gid, Uid};

    let uid = Some(Uid::current());
    let gid = Some(Gid::current());

    chown(dir, uid, gid).map_err(std::io::Error::from)?;
    for entry in std::fs::read_dir(dir)? {
        chown(&entry?.path(), uid, gid).map_err(std::io::Error::from)?;
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn fix_machine_dir_ownership(_dir: &Path) -> Result<()> {
    Ok(())
}
