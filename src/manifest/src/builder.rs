//! Scans an image store and produces a manifest. Hashes are computed once,
//! when an image first appears; later builds carry the recorded hash and
//! rollout fraction forward from the previous manifest.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::Result;
use crate::image::{Image, Manifest};
use crate::util::unix_now;

const HASH_BUF_SIZE: usize = 1 << 16;

pub struct ManifestBuilder {
    image_dir: PathBuf,
    default_rollout: u16,
    max_images: Option<usize>,
}

impl ManifestBuilder {
    pub fn new(image_dir: impl Into<PathBuf>, default_rollout: u16, max_images: Option<usize>) -> Self {
        Self {
            image_dir: image_dir.into(),
            default_rollout,
            max_images,
        }
    }

    /// Build a manifest from the store contents. `previous` is a carry-forward
    /// cache for hashes and rollout fractions of already-published images;
    /// files not matching `<timestamp>.iso` are ignored.
    pub fn build(&self, previous: Option<&Manifest>) -> Result<Manifest> {
        let mut images = Vec::new();

        for entry in std::fs::read_dir(&self.image_dir)? {
            let entry = entry?;
            let filename = entry.file_name();
            let Some(timestamp) = parse_image_filename(&filename.to_string_lossy()) else {
                continue;
            };

            let image = match previous.and_then(|m| m.find(timestamp)) {
                // Write-once: never recompute the hash of a published image.
                Some(known) => known.clone(),
                None => {
                    debug!("Hashing new image {}", entry.path().display());
                    Image {
                        timestamp,
                        hash: hash_file(&entry.path())?,
                        rollout: self.default_rollout,
                    }
                }
            };
            images.push(image);
        }

        images.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        if let Some(max) = self.max_images {
            while images.len() > max {
                let expired = images.pop().unwrap();
                let path = self.image_dir.join(expired.filename());
                info!("Deleting expired image {}", path.display());
                std::fs::remove_file(&path)?;
            }
        }

        Ok(Manifest {
            timestamp: unix_now(),
            images,
        })
    }
}

/// `<timestamp>.iso` filenames only; everything else is not an image.
pub fn parse_image_filename(name: &str) -> Option<u64> {
    name.strip_suffix(".iso")?.parse().ok()
}

/// Streamed SHA-256 of a file, lowercase hex.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
