//! Image store HTTP surface: file streaming, content types, and the
//! rejection of anything that is not a plain file in a tracked type.

use std::net::SocketAddr;
use std::sync::Arc;

use fleet::server::AppState;
use fleet::Registry;

fn spawn_server(image_types: Vec<String>) -> (SocketAddr, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState {
        registry: Arc::new(Registry::new(image_types)),
        image_path: root.path().to_path_buf(),
    };
    tokio::spawn(async move {
        fleet::server::serve_on_listener(listener, state).await.unwrap();
    });
    (addr, root)
}

#[tokio::test]
async fn serves_image_files_with_content_types() {
    let (addr, root) = spawn_server(vec!["mytype".into()]);
    let dir = root.path().join("mytype");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("1000.iso"), b"image bytes").unwrap();
    std::fs::write(dir.join("manifest.json"), b"{}").unwrap();

    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{}/image/mytype/1000.iso", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"],
        "application/octet-stream"
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"image bytes");

    let resp = client
        .get(format!("http://{}/image/mytype/manifest.json", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/json");
}

#[tokio::test]
async fn missing_files_and_unknown_types_are_404() {
    let (addr, root) = spawn_server(vec!["mytype".into()]);
    std::fs::create_dir(root.path().join("mytype")).unwrap();
    let secret = root.path().join("secret");
    std::fs::create_dir(&secret).unwrap();
    std::fs::write(secret.join("key.pem"), b"private").unwrap();

    let client = reqwest::Client::new();
    for path in [
        "/image/mytype/2000.iso",
        "/image/secret/key.pem",
        "/image/mytype/.hidden",
    ] {
        let resp = client
            .get(format!("http://{}{}", addr, path))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404, "{}", path);
    }
}

#[tokio::test]
async fn health_endpoint_answers() {
    let (addr, _root) = spawn_server(vec!["mytype".into()]);
    let body = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}
