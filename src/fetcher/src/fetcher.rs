//! The fetch cycle: retrieve the signed manifest, verify it, pick the
//! image this node is rolled out to, download and hash-verify it, and
//! atomically repoint "current". Any failure abandons the cycle cleanly;
//! nothing is persisted and no partial file is ever visible at a final
//! path.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use manifest::{select_image, Image, Manifest, ManifestError, SignedEnvelope, Verifier};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{FetchError, Result};
use crate::state::FetcherState;

const STATE_NAME: &str = "state.json";
const CURRENT_NAME: &str = "current";

pub struct FetcherConfig {
    /// Base URL of this node's image-type directory on the distribution
    /// server, e.g. `https://server/image/mytype`.
    pub base_url: String,
    pub image_dir: PathBuf,
    /// Identity fed into the rollout hash; defaults to the hostname.
    pub node_identity: String,
    /// Trust anchor for manifest envelopes (PEM).
    pub ca_cert: PathBuf,
    /// Extra root CA for the HTTPS transport, if not publicly trusted.
    pub https_ca_cert: Option<PathBuf>,
    /// Combined PEM (key + cert) presented as the HTTPS client identity.
    pub https_identity: Option<PathBuf>,
    /// How many images to keep on disk after a successful cycle.
    pub retain_images: usize,
    pub request_timeout: Duration,
}

/// What a successful cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// "current" now points at a different image than before.
    Updated(u64),
    /// The selected image was already current.
    AlreadyCurrent(u64),
    /// No image is rolled out to this node yet. Not a fault.
    NotRolledOut,
}

pub struct Fetcher {
    base_url: String,
    image_dir: PathBuf,
    node_identity: String,
    verifier: Verifier,
    retain_images: usize,
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let verifier = Verifier::from_pem_file(&config.ca_cert)?;

        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10));
        if let Some(ca_path) = &config.https_ca_cert {
            let ca = reqwest::Certificate::from_pem(&std::fs::read(ca_path)?)?;
            builder = builder.add_root_certificate(ca);
        }
        if let Some(identity_path) = &config.https_identity {
            let identity = reqwest::Identity::from_pem(&std::fs::read(identity_path)?)?;
            builder = builder.identity(identity);
        }

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            image_dir: config.image_dir,
            node_identity: config.node_identity,
            verifier,
            retain_images: config.retain_images,
            client: builder.build()?,
        })
    }

    pub fn node_identity(&self) -> &str {
        &self.node_identity
    }

    /// One full fetch cycle. Errors are contained by the caller; this
    /// method guarantees that on any error path the persisted state, the
    /// "current" pointer, and every final image path are untouched.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let mut state = FetcherState::load(&self.state_path());

        let envelope = self.fetch_manifest().await?;
        let inner = self.verifier.unwrap(&envelope)?;
        let manifest = Manifest::from_json(&inner)?;

        if manifest.timestamp < state.last_verified_timestamp {
            return Err(FetchError::ManifestTimeRegressed {
                last: state.last_verified_timestamp,
                got: manifest.timestamp,
            });
        }

        let image = match select_image(&self.node_identity, &manifest) {
            Ok(image) => image,
            Err(ManifestError::NoValidImage) => {
                debug!(
                    "No image rolled out to {} in manifest {}",
                    self.node_identity, manifest.timestamp
                );
                return Ok(CycleOutcome::NotRolledOut);
            }
            Err(e) => return Err(e.into()),
        };

        self.download_if_missing(image).await?;
        let changed = self.publish_current(image)?;
        self.prune_old(image.timestamp)?;

        state.last_verified_timestamp = manifest.timestamp;
        state.current_image = Some(image.timestamp);
        state.store(&self.state_path())?;

        Ok(if changed {
            CycleOutcome::Updated(image.timestamp)
        } else {
            CycleOutcome::AlreadyCurrent(image.timestamp)
        })
    }

    fn state_path(&self) -> PathBuf {
        self.image_dir.join(STATE_NAME)
    }

    async fn fetch_manifest(&self) -> Result<SignedEnvelope> {
        let url = format!("{}/manifest.json", self.base_url);
        let text = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Stream the image into a temp file in the destination directory,
    /// hashing as it arrives; only a hash-verified file is renamed into
    /// its final path.
    async fn download_if_missing(&self, image: &Image) -> Result<()> {
        let path = self.image_dir.join(image.filename());
        if path.exists() {
            debug!("Image already present: {}", path.display());
            return Ok(());
        }

        let url = format!("{}/{}", self.base_url, image.filename());
        info!("Fetching: {}", url);
        let mut response = self.client.get(&url).send().await?.error_for_status()?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.image_dir)?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            temp.write_all(&chunk)?;
        }

        let actual = hex::encode(hasher.finalize());
        if actual != image.hash {
            // Dropping the temp file unlinks it; nothing reaches `path`.
            return Err(FetchError::InvalidHash {
                timestamp: image.timestamp,
                expected: image.hash.clone(),
                actual,
            });
        }

        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;
        info!("Downloaded {} ({} verified)", path.display(), image.hash);
        Ok(())
    }

    /// Repoint "current" at the image via symlink-then-rename, skipping the
    /// rename when it already points there. Returns whether it changed.
    fn publish_current(&self, image: &Image) -> Result<bool> {
        let filename = image.filename();
        let current = self.image_dir.join(CURRENT_NAME);

        match std::fs::read_link(&current) {
            Ok(existing) if existing == Path::new(&filename) => return Ok(false),
            Ok(_) | Err(_) => {}
        }

        let temp = self
            .image_dir
            .join(format!(".{}.{}", CURRENT_NAME, std::process::id()));
        // A leftover temp link from a crashed run would make symlink() fail.
        let _ = std::fs::remove_file(&temp);
        std::os::unix::fs::symlink(&filename, &temp)?;
        if let Err(e) = std::fs::rename(&temp, &current) {
            let _ = std::fs::remove_file(&temp);
            return Err(e.into());
        }

        info!("Changed current link to: {}", filename);
        Ok(true)
    }

    /// Keep the newest `retain_images` files; never delete the image
    /// "current" points at.
    fn prune_old(&self, current_timestamp: u64) -> Result<()> {
        let mut timestamps = Vec::new();
        for entry in std::fs::read_dir(&self.image_dir)? {
            let entry = entry?;
            if let Some(ts) =
                manifest::builder::parse_image_filename(&entry.file_name().to_string_lossy())
            {
                timestamps.push(ts);
            }
        }
        timestamps.sort_unstable_by(|a, b| b.cmp(a));

        for ts in timestamps.iter().skip(self.retain_images) {
            if *ts == current_timestamp {
                continue;
            }
            let path = self.image_dir.join(format!("{}.iso", ts));
            match std::fs::remove_file(&path) {
                Ok(()) => info!("Pruned old image {}", path.display()),
                Err(e) => warn!("Cannot prune {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}
