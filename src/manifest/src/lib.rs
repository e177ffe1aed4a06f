pub mod builder;
pub mod envelope;
pub mod error;
pub mod image;
pub mod protocol;
pub mod rollout;
pub mod util;

pub use builder::ManifestBuilder;
pub use envelope::{SignedEnvelope, Verifier, Wrapper};
pub use error::{ManifestError, Result};
pub use image::{Image, Manifest};
pub use protocol::HubMessage;
pub use rollout::{bucket, eligible, select_image};
