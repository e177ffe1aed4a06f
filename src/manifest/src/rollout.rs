//! Staged-rollout selection. Each (node, image) pair maps to a deterministic
//! bucket in [0, 10000); an image's rollout fraction is the threshold below
//! which a node is eligible for it.

use sha2::{Digest, Sha256};

use crate::error::{ManifestError, Result};
use crate::image::{Image, Manifest, MAX_ROLLOUT};

/// Deterministic bucket for a node/image pair:
/// `BE32(last 4 bytes of SHA256(node || BE32(timestamp))) % 10000`.
///
/// Buckets are independent per image timestamp; a node's position for one
/// image says nothing about its position for another.
pub fn bucket(node_identity: &str, image_timestamp: u64) -> u16 {
    let mut hasher = Sha256::new();
    hasher.update(node_identity.as_bytes());
    hasher.update((image_timestamp as u32).to_be_bytes());
    let digest = hasher.finalize();
    let tail: [u8; 4] = digest[digest.len() - 4..].try_into().unwrap();
    (u32::from_be_bytes(tail) % MAX_ROLLOUT as u32) as u16
}

/// Whether `node_identity` falls inside the image's rollout fraction.
pub fn eligible(node_identity: &str, image_timestamp: u64, rollout: u16) -> bool {
    bucket(node_identity, image_timestamp) < rollout
}

/// Pick the newest image the node is eligible for, walking the manifest
/// in its descending-timestamp order. A node may skip an eligible older
/// image in favor of a newer one; that non-monotonic history is intended.
pub fn select_image<'a>(node_identity: &str, manifest: &'a Manifest) -> Result<&'a Image> {
    manifest
        .images
        .iter()
        .find(|image| eligible(node_identity, image.timestamp, image.rollout))
        .ok_or(ManifestError::NoValidImage)
}
