//! Iconograph distribution server: serves image files and the signed
//! manifest over (mutually-authenticated) HTTPS, runs the fleet hub
//! websockets, and broadcasts manifest installs observed on disk.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fleet::server::AppState;
use fleet::{watch, Registry};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "icon-server", version, about = "Iconograph distribution server")]
struct Args {
    #[arg(long = "listen", default_value = "[::]:443")]
    listen: SocketAddr,

    /// Image store root; one subdirectory per image type.
    #[arg(long = "image-path")]
    image_path: PathBuf,

    /// Image type to track; repeatable.
    #[arg(long = "image-type", required = true)]
    image_types: Vec<String>,

    #[arg(long = "server-cert", requires_all = ["server_key", "ca_cert"])]
    server_cert: Option<PathBuf>,

    #[arg(long = "server-key")]
    server_key: Option<PathBuf>,

    /// CA that client certificates must chain to.
    #[arg(long = "ca-cert")]
    ca_cert: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> fleet::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let registry = Arc::new(Registry::new(args.image_types.clone()));
    let state = AppState {
        registry: registry.clone(),
        image_path: args.image_path.clone(),
    };

    // Kept alive for the life of the server; dropping it stops the watch.
    let _watcher = watch::spawn_manifest_watch(&args.image_path, registry)?;

    let tls = match (&args.server_cert, &args.server_key, &args.ca_cert) {
        (Some(cert), Some(key), Some(ca)) => {
            Some(fleet::tls::server_tls_config(cert, key, ca).await?)
        }
        _ => {
            info!("No TLS configured; serving plain HTTP");
            None
        }
    };

    fleet::serve(args.listen, state, tls).await
}
