//! Node-side agent: periodically fetches the signed manifest for this
//! node's image type, verifies it, downloads the image it is rolled out
//! to, and maintains the "current" boot pointer. Optionally holds a
//! slave connection to the fleet hub for reports and operator commands.

pub mod client;
pub mod error;
pub mod fetcher;
pub mod state;

pub use client::{HubClient, HubClientConfig};
pub use error::{FetchError, Result};
pub use fetcher::{CycleOutcome, Fetcher, FetcherConfig};
pub use state::FetcherState;
