pub mod error;
pub mod hub;
pub mod publish;
pub mod registry;
pub mod server;
pub mod tls;
pub mod watch;

pub use error::{HubError, Result};
pub use manifest::protocol::HubMessage;
pub use publish::Publisher;
pub use registry::Registry;
pub use server::{build_router, serve, serve_on_listener, AppState};
