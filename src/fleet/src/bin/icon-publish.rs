//! Build, sign, and atomically install the manifest for one image-type
//! directory. Run after dropping a new image into the store, or from cron.

use std::path::PathBuf;

use clap::Parser;
use fleet::Publisher;
use manifest::Wrapper;

#[derive(Parser, Debug)]
#[command(name = "icon-publish", version, about = "Publish a signed image manifest")]
struct Args {
    /// Per-image-type store directory containing `<timestamp>.iso` files.
    #[arg(long = "image-dir")]
    image_dir: PathBuf,

    /// PEM PKCS#8 Ed25519 signing key.
    #[arg(long = "key")]
    key: PathBuf,

    /// PEM signing certificate matching the key.
    #[arg(long = "cert")]
    cert: PathBuf,

    /// Intermediate certificate shipped in the envelope; repeatable.
    #[arg(long = "other-cert")]
    other_certs: Vec<PathBuf>,

    /// Rollout fraction (permyriad) assigned to newly seen images.
    #[arg(long = "default-rollout", default_value_t = 0)]
    default_rollout: u16,

    /// Delete the oldest images beyond this count.
    #[arg(long = "max-images")]
    max_images: Option<usize>,
}

fn main() -> fleet::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let wrapper = Wrapper::from_pem_files(&args.key, &args.cert, &args.other_certs)?;
    let publisher = Publisher::new(
        &args.image_dir,
        args.default_rollout,
        args.max_images,
        wrapper,
    );
    let published = publisher.publish()?;
    println!(
        "Published {} images (generated {})",
        published.images.len(),
        published.timestamp
    );
    Ok(())
}
