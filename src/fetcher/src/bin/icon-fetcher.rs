//! Iconograph node agent: keeps this node on the image the fleet's
//! signed manifest rolls out to it, and reports status to the hub.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fetcher::{Fetcher, FetcherConfig, HubClient, HubClientConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "icon-fetcher", version, about = "Iconograph node agent")]
struct Args {
    /// Distribution server host[:port].
    #[arg(long = "server")]
    server: String,

    /// Image type this node boots.
    #[arg(long = "image-type")]
    image_type: String,

    /// Local image store; holds downloaded images and the "current" link.
    #[arg(long = "image-dir")]
    image_dir: PathBuf,

    /// Trust anchor for manifest signatures (PEM).
    #[arg(long = "ca-cert")]
    ca_cert: PathBuf,

    /// Extra root CA for the transport, if the server certificate is not
    /// publicly trusted (PEM).
    #[arg(long = "https-ca-cert")]
    https_ca_cert: Option<PathBuf>,

    /// Combined key + certificate PEM presented as the HTTPS client
    /// identity.
    #[arg(long = "https-client-identity")]
    https_client_identity: Option<PathBuf>,

    /// Client certificate for the hub websocket (PEM).
    #[arg(long = "client-cert", requires = "client_key")]
    client_cert: Option<PathBuf>,

    #[arg(long = "client-key")]
    client_key: Option<PathBuf>,

    /// Node identity fed into the rollout bucket; defaults to hostname.
    #[arg(long = "identity")]
    identity: Option<String>,

    /// Seconds between fetch cycles.
    #[arg(long = "interval", default_value_t = 300)]
    interval: u64,

    /// Seconds between hub status reports.
    #[arg(long = "report-interval", default_value_t = 60)]
    report_interval: u64,

    /// Downloaded images to keep on disk.
    #[arg(long = "retain-images", default_value_t = 2)]
    retain_images: usize,

    /// Use plain http/ws instead of https/wss.
    #[arg(long = "insecure")]
    insecure: bool,
}

#[tokio::main]
async fn main() -> fetcher::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    let args = Args::parse();

    let identity = match args.identity {
        Some(identity) => identity,
        None => nix::unistd::gethostname()
            .map_err(std::io::Error::from)?
            .to_string_lossy()
            .into_owned(),
    };
    info!("Node identity: {}", identity);

    let (http_scheme, ws_scheme) = if args.insecure {
        ("http", "ws")
    } else {
        ("https", "wss")
    };

    std::fs::create_dir_all(&args.image_dir)?;

    let fetcher = Arc::new(Fetcher::new(FetcherConfig {
        base_url: format!("{}://{}/image/{}", http_scheme, args.server, args.image_type),
        image_dir: args.image_dir.clone(),
        node_identity: identity,
        ca_cert: args.ca_cert,
        https_ca_cert: args.https_ca_cert.clone(),
        https_identity: args.https_client_identity,
        retain_images: args.retain_images,
        request_timeout: Duration::from_secs(600),
    })?);

    let hub = HubClient::new(
        HubClientConfig {
            url: format!("{}://{}/ws/slave", ws_scheme, args.server),
            image_type: args.image_type,
            fetch_interval: Duration::from_secs(args.interval),
            report_interval: Duration::from_secs(args.report_interval),
            tls_ca_cert: args.https_ca_cert,
            tls_identity: args.client_cert.zip(args.client_key),
        },
        fetcher,
        args.image_dir,
    );

    hub.run().await
}
