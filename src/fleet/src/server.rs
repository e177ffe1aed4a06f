//! HTTP/websocket front of the distribution server: streams image-store
//! files and upgrades the two hub connection roles.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::Result;
use crate::hub::{handle_master, handle_slave};
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub image_path: PathBuf,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/image/:image_type/:file", get(get_image_file))
        .route("/ws/slave", get(ws_slave))
        .route("/ws/master", get(ws_master))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve on `addr`, with mutual TLS when a rustls config is given, plain
/// HTTP otherwise.
pub async fn serve(addr: SocketAddr, state: AppState, tls: Option<RustlsConfig>) -> Result<()> {
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    match tls {
        Some(config) => {
            info!("Serving HTTPS on {}", addr);
            axum_server::bind_rustls(addr, config).serve(app).await?;
        }
        None => {
            info!("Serving HTTP on {}", addr);
            axum_server::bind(addr).serve(app).await?;
        }
    }
    Ok(())
}

/// Serve on an already-bound listener (tests bind port 0 and read it back).
pub async fn serve_on_listener(listener: std::net::TcpListener, state: AppState) -> Result<()> {
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum_server::from_tcp(listener).serve(app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

/// Path components must name plain files: no separators, no dot-prefixed
/// names, and the image type must be one this server tracks.
fn sanitize_component(component: &str) -> bool {
    !component.is_empty()
        && !component.starts_with('.')
        && !component.contains('/')
        && !component.contains('\\')
}

fn content_type_for(file: &str) -> &'static str {
    if file.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

async fn get_image_file(
    State(state): State<AppState>,
    Path((image_type, file)): Path<(String, String)>,
) -> Response {
    if !sanitize_component(&image_type)
        || !sanitize_component(&file)
        || !state.registry.serves_image_type(&image_type)
    {
        debug!("Rejecting image request {}/{}", image_type, file);
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }

    let path = state.image_path.join(&image_type).join(&file);
    match tokio::fs::File::open(&path).await {
        Ok(handle) => {
            let stream = ReaderStream::new(handle);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type_for(&file))
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(_) => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

async fn ws_slave(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_slave(socket, addr, state.registry))
}

async fn ws_master(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_master(socket, addr, state.registry))
}
