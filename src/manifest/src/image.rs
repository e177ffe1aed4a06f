//! Manifest data model. An image is identified by its build timestamp; the
//! content hash is a write-once fact recorded at first manifest inclusion.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Highest rollout fraction, in permyriad (ten-thousandths).
pub const MAX_ROLLOUT: u16 = 10_000;

/// One distributable image as recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Build timestamp, unique per image type; also the filename stem
    /// (`<timestamp>.iso`).
    pub timestamp: u64,
    /// Lowercase hex SHA-256 of the image file, computed once and carried
    /// forward thereafter.
    pub hash: String,
    /// Staged-rollout fraction in [0, 10000].
    #[serde(rename = "rollout_‱")]
    pub rollout: u16,
}

impl Image {
    pub fn filename(&self) -> String {
        format!("{}.iso", self.timestamp)
    }
}

/// An ordered list of images plus its generation timestamp. Images are kept
/// sorted by descending timestamp; consumers rely on that order for
/// newest-first rollout selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Generation time (unix seconds). Must be non-decreasing across
    /// manifests observed by a single consumer.
    pub timestamp: u64,
    pub images: Vec<Image>,
}

impl Manifest {
    /// Look up an image by its identity.
    pub fn find(&self, timestamp: u64) -> Option<&Image> {
        self.images.iter().find(|i| i.timestamp == timestamp)
    }

    /// Serialize to the canonical wire JSON. The returned text is what gets
    /// signed; verification is byte-exact against it.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a previously-built unsigned manifest, treated strictly as a
    /// cache: a missing or unreadable file yields `None`, never an error.
    pub fn load_cached(path: &Path) -> Option<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Cannot read previous manifest {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unparsable previous manifest {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}
