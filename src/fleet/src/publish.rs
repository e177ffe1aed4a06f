//! Manifest publication: build, sign, and atomically install. The unsigned
//! manifest doubles as the next build's carry-forward cache; both files are
//! written via a temp file in the same directory plus rename, so consumers
//! (and the store watch) only ever observe complete files.

use std::path::PathBuf;

use manifest::util::write_atomic;
use manifest::{Manifest, ManifestBuilder, Wrapper};
use tracing::info;

use crate::error::Result;

pub const UNSIGNED_NAME: &str = "manifest.json.unsigned";
pub const SIGNED_NAME: &str = "manifest.json";

pub struct Publisher {
    image_dir: PathBuf,
    builder: ManifestBuilder,
    wrapper: Wrapper,
}

impl Publisher {
    pub fn new(
        image_dir: impl Into<PathBuf>,
        default_rollout: u16,
        max_images: Option<usize>,
        wrapper: Wrapper,
    ) -> Self {
        let image_dir = image_dir.into();
        let builder = ManifestBuilder::new(&image_dir, default_rollout, max_images);
        Self {
            image_dir,
            builder,
            wrapper,
        }
    }

    /// One publish pass: rebuild from the store (carrying rollout fractions
    /// and hashes forward), install the unsigned manifest, then the signed
    /// envelope. The signed install is the event fetchers get notified on.
    pub fn publish(&self) -> Result<Manifest> {
        let unsigned_path = self.image_dir.join(UNSIGNED_NAME);
        let previous = Manifest::load_cached(&unsigned_path);

        let built = self.builder.build(previous.as_ref())?;
        let inner = built.to_json()?;
        write_atomic(&unsigned_path, inner.as_bytes())?;

        let envelope = self.wrapper.wrap(&inner);
        let wire = serde_json::to_string(&envelope)?;
        write_atomic(&self.image_dir.join(SIGNED_NAME), wire.as_bytes())?;

        info!(
            "Published manifest for {} ({} images, generated {})",
            self.image_dir.display(),
            built.images.len(),
            built.timestamp
        );
        Ok(built)
    }
}
