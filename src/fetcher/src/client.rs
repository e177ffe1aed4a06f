//! Hub slave connection: a long-lived websocket to the coordination hub
//! carrying periodic status reports one way and operator commands the
//! other. The connection is best-effort; fetch cycles keep running on
//! their own timer whether or not the hub is reachable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use manifest::HubMessage;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, error, info, warn};

use crate::error::{FetchError, Result};
use crate::fetcher::{CycleOutcome, Fetcher};

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

pub struct HubClientConfig {
    /// Websocket endpoint, e.g. `wss://server/ws/slave`.
    pub url: String,
    pub image_type: String,
    /// How often to run a fetch cycle.
    pub fetch_interval: Duration,
    /// How often to send a status report over the hub connection.
    pub report_interval: Duration,
    /// Root CA for the wss transport, if not publicly trusted (PEM).
    pub tls_ca_cert: Option<PathBuf>,
    /// Client certificate and key presented to the hub (PEM files).
    pub tls_identity: Option<(PathBuf, PathBuf)>,
}

pub struct HubClient {
    config: HubClientConfig,
    fetcher: Arc<Fetcher>,
    image_dir: PathBuf,
}

impl HubClient {
    pub fn new(config: HubClientConfig, fetcher: Arc<Fetcher>, image_dir: PathBuf) -> Self {
        Self {
            config,
            fetcher,
            image_dir,
        }
    }

    /// Run forever: connect, serve the session, reconnect with doubling
    /// backoff on any failure. Fetch cycles run inside the session loop
    /// and also once per reconnect attempt, so an unreachable hub never
    /// stalls updates.
    pub async fn run(&self) -> ! {
        let mut backoff = RECONNECT_MIN;
        loop {
            match self.session().await {
                Ok(()) => {
                    info!("Hub closed the connection, reconnecting");
                    backoff = RECONNECT_MIN;
                }
                Err(e) => {
                    warn!("Hub session failed: {}, retrying in {:?}", e, backoff);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
            self.run_cycle_logged().await;
        }
    }

    async fn session(&self) -> Result<()> {
        let connector = self.tls_connector()?;
        let (socket, _) = tokio_tungstenite::connect_async_tls_with_config(
            self.config.url.as_str(),
            None,
            false,
            connector,
        )
        .await?;
        info!("Connected to hub at {}", self.config.url);
        let (mut sink, mut stream) = socket.split();

        // Catch up immediately on connect, then settle into the timers.
        self.run_cycle_logged().await;
        sink.send(Message::Text(self.report())).await?;

        let mut report_timer = tokio::time::interval(self.config.report_interval);
        report_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        report_timer.reset();
        let mut fetch_timer = tokio::time::interval(self.config.fetch_interval);
        fetch_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        fetch_timer.reset();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_frame(&text).await {
                                self.run_cycle_logged().await;
                                sink.send(Message::Text(self.report())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            sink.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                _ = report_timer.tick() => {
                    sink.send(Message::Text(self.report())).await?;
                }
                _ = fetch_timer.tick() => {
                    self.run_cycle_logged().await;
                }
            }
        }
    }

    /// Returns whether the frame asks for an immediate fetch cycle.
    async fn handle_frame(&self, text: &str) -> bool {
        let msg = match HubMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed hub frame: {}", e);
                return false;
            }
        };
        match msg {
            HubMessage::NewManifest { data } => {
                if data.image_type == self.config.image_type {
                    info!("Hub announced new manifest for {}", data.image_type);
                    true
                } else {
                    false
                }
            }
            HubMessage::Command { data, .. } => self.handle_command(&data),
            HubMessage::ImageTypes { data } => {
                debug!("Hub serves image types: {:?}", data.image_types);
                false
            }
            other => {
                debug!("Ignoring hub message: {}", other.kind());
                false
            }
        }
    }

    fn handle_command(&self, data: &serde_json::Value) -> bool {
        match data.get("command").and_then(|c| c.as_str()) {
            Some("fetch") => {
                info!("Fetch requested by operator");
                true
            }
            Some("reboot") => {
                info!("Reboot requested by operator");
                tokio::spawn(async {
                    if let Err(e) = tokio::process::Command::new("reboot").status().await {
                        error!("Cannot reboot: {}", e);
                    }
                });
                false
            }
            other => {
                warn!("Unknown command: {:?}", other);
                false
            }
        }
    }

    async fn run_cycle_logged(&self) {
        match self.fetcher.run_cycle().await {
            Ok(CycleOutcome::Updated(ts)) => info!("Current image is now {}", ts),
            Ok(CycleOutcome::AlreadyCurrent(ts)) => debug!("Image {} already current", ts),
            Ok(CycleOutcome::NotRolledOut) => debug!("Nothing rolled out to this node"),
            Err(e) => warn!("Fetch cycle failed: {}", e),
        }
    }

    fn report(&self) -> String {
        let msg = HubMessage::Report {
            relay: None,
            data: json!({
                "hostname": self.fetcher.node_identity(),
                "image_type": self.config.image_type,
                "uptime_seconds": uptime_seconds(),
                "next_timestamp": current_timestamp(&self.image_dir),
            }),
        };
        msg.to_json()
    }

    fn tls_connector(&self) -> Result<Option<Connector>> {
        if self.config.tls_ca_cert.is_none() && self.config.tls_identity.is_none() {
            return Ok(None);
        }

        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca_path) = &self.config.tls_ca_cert {
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| FetchError::Tls(format!("bad CA certificate: {}", e)))?;
            }
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let config = match &self.config.tls_identity {
            Some((cert_path, key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
                    std::fs::File::open(key_path)?,
                ))?
                .ok_or_else(|| FetchError::Tls(format!("no key in {}", key_path.display())))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| FetchError::Tls(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };
        Ok(Some(Connector::Rustls(Arc::new(config))))
    }
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(Into::into)
}

fn uptime_seconds() -> u64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split('.').next().and_then(|n| n.parse().ok()))
        .unwrap_or(0)
}

/// Timestamp of the image "current" points at, if any.
fn current_timestamp(image_dir: &Path) -> Option<u64> {
    let target = std::fs::read_link(image_dir.join("current")).ok()?;
    manifest::builder::parse_image_filename(&target.to_string_lossy())
}
