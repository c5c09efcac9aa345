use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use url::Url;

use crate::virtualbox::errors::{Result, VBoxError};

pub const ISO_FILENAME: &str = "boot2docker.iso";
pub const DEFAULT_BOOT2DOCKER_URL: &str =
    "https://github.com/boot2docker/boot2docker/releases/download/v19.03.12/boot2docker.iso";

const DOWNLOAD_TIMEOUT: u64 = 1800;
const CONNECT_TIMEOUT: u64 = 30;

/// Boot ISO handling: a shared cache under the store plus a per-machine copy.
#[async_trait]
pub trait IsoCache: Send + Sync {
    /// Make sure the default ISO is cached. A no-op when `iso_url` is set,
    /// since explicit ISOs are never cached.
    async fn update_iso_cache(&self, store_path: &Path, iso_url: &str) -> Result<()>;

    /// Put `boot2docker.iso` in the machine directory.
    async fn copy_iso_to_machine_dir(
        &self,
        store_path: &Path,
        machine_name: &str,
        iso_url: &str,
    ) -> Result<()>;
}

pub struct B2dIsoCache {
    client: Client,
    default_url: String,
}

impl B2dIsoCache {
    pub fn new() -> Result<Self> {
        Self::with_default_url(DEFAULT_BOOT2DOCKER_URL)
    }

    pub fn with_default_url(default_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT))
            .build()?;

        Ok(Self {
            client,
            default_url: default_url.to_string(),
        })
    }

    /// Fetch `iso_url` into `dir/file`. Lands in a temp file first so a
    /// failed download never leaves a partial ISO behind.
    async fn download(&self, dir: &Path, file: &str, iso_url: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let dest = dir.join(file);
        let mut tmp = NamedTempFile::new_in(dir)?;

        match local_source(iso_url)? {
            Some(src) => {
                info!("Copying {} to {}...", src.display(), dest.display());
                let mut reader = std::fs::File::open(&src)?;
                std::io::copy(&mut reader, tmp.as_file_mut())?;
            }
            None => {
                info!("Downloading {} from {}...", dest.display(), iso_url);
                let mut response = self.client.get(iso_url).send().await?.error_for_status()?;
                while let Some(chunk) = response.chunk().await? {
                    tmp.write_all(&chunk)?;
                }
            }
        }

        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| VBoxError::Io(e.error))?;
        debug!("Saved {}", dest.display());

        Ok(())
    }
}

#[async_trait]
impl IsoCache for B2dIsoCache {
    async fn update_iso_cache(&self, store_path: &Path, iso_url: &str) -> Result<()> {
        let cache_dir = cache_dir(store_path);
        if !cache_dir.exists() {
            info!(
                "Image cache directory does not exist, creating it at {}...",
                cache_dir.display()
            );
            std::fs::create_dir_all(&cache_dir)?;
        }

        let cached = cache_dir.join(ISO_FILENAME);

        if !iso_url.is_empty() {
            if cached.exists() {
                warn!(
                    "Boot2Docker URL was explicitly set to {:?} at create time, so the cached ISO will not be used.",
                    iso_url
                );
            }
            return Ok(());
        }

        if !cached.exists() {
            info!("No default Boot2Docker ISO found locally, downloading it...");
            self.download(&cache_dir, ISO_FILENAME, &self.default_url)
                .await?;
        }

        Ok(())
    }

    async fn copy_iso_to_machine_dir(
        &self,
        store_path: &Path,
        machine_name: &str,
        iso_url: &str,
    ) -> Result<()> {
        self.update_iso_cache(store_path, iso_url).await?;

        let machine_dir = store_path.join("machines").join(machine_name);
        std::fs::create_dir_all(&machine_dir)?;

        if iso_url.is_empty() {
            let src = cache_dir(store_path).join(ISO_FILENAME);
            let dest = machine_dir.join(ISO_FILENAME);
            info!("Copying {} to {}...", src.display(), dest.display());
            std::fs::copy(&src, &dest)?;
            return Ok(());
        }

        self.download(&machine_dir, ISO_FILENAME, iso_url).await
    }
}

pub fn cache_dir(store_path: &Path) -> PathBuf {
    store_path.join("cache")
}

/// `Some(path)` for `file://` URLs and bare paths, `None` for anything to fetch.
fn local_source(iso_url: &str) -> Result<Option<PathBuf>> {
    match Url::parse(iso_url) {
        Ok(url) if url.scheme() == "file" => Ok(Some(
            url.to_file_path()
                .unwrap_or_else(|_| PathBuf::from(url.path())),
        )),
        // `C:\...` parses with a one-letter scheme.
        Ok(url) if url.scheme().len() == 1 => Ok(Some(PathBuf::from(iso_url))),
        Ok(_) => Ok(None),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Some(PathBuf::from(iso_url))),
        Err(e) => Err(e.into()),
    }
}
