//! Interface abstractions over the opaque remote collaborators (§9,
//! "Implicit global clients become interface abstractions"): the upstream
//! generative service, the face detector, the spatial analyzer, and the two
//! gallery-backing stores. Production wirings hit real HTTP/WS endpoints;
//! fakes back the test suite.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use lumen_media::{DetectorError, FaceDetector, FaceRect};
use lumen_protocol::{BlobReference, GalleryRecord, UpstreamEvent, UpstreamRequest};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream connect failed: {0}")]
    Connect(String),
    #[error("upstream send failed: {0}")]
    Send(String),
    #[error("upstream recv failed: {0}")]
    Recv(String),
    #[error("upstream connection closed")]
    Closed,
}

/// A live, bidirectional session with the upstream generative service.
#[async_trait]
pub trait UpstreamSession: Send {
    async fn send(&mut self, req: UpstreamRequest) -> Result<(), UpstreamError>;
    /// Returns `Ok(None)` when the upstream closes the stream cleanly.
    async fn recv(&mut self) -> Result<Option<UpstreamEvent>, UpstreamError>;
    async fn close(&mut self);
}

/// Factory for `UpstreamSession`s, one per client `Session` (§4.6).
#[async_trait]
pub trait UpstreamLiveClient: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, UpstreamError>;
}

/// Production client: opens one websocket per session to the configured
/// Live endpoint, framing every request/event as a JSON text message.
pub struct WsUpstreamClient {
    endpoint: String,
    api_key: Option<String>,
}

impl WsUpstreamClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self { endpoint: endpoint.into(), api_key }
    }
}

#[async_trait]
impl UpstreamLiveClient for WsUpstreamClient {
    async fn connect(&self) -> Result<Box<dyn UpstreamSession>, UpstreamError> {
        let mut request = self
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        if let Some(key) = &self.api_key {
            request.headers_mut().insert(
                "authorization",
                format!("Bearer {key}")
                    .parse()
                    .map_err(|_| UpstreamError::Connect("invalid api key header".into()))?,
            );
        }
        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        Ok(Box::new(WsUpstreamSession { stream }))
    }
}

use tokio_tungstenite::tungstenite::client::IntoClientRequest;

struct WsUpstreamSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl UpstreamSession for WsUpstreamSession {
    async fn send(&mut self, req: UpstreamRequest) -> Result<(), UpstreamError> {
        let json = serde_json::to_string(&req).map_err(|e| UpstreamError::Send(e.to_string()))?;
        self.stream
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| UpstreamError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<UpstreamEvent>, UpstreamError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let event = serde_json::from_str(&text).map_err(|e| UpstreamError::Recv(e.to_string()))?;
                    return Ok(Some(event));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(UpstreamError::Recv(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer request failed: {0}")]
    Request(String),
}

/// Spatial/surface analyzer collaborator (§4.8 `/spatial`).
#[async_trait]
pub trait SurfaceAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        jpeg: &[u8],
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<lumen_protocol::SurfaceAttributes, AnalyzerError>;
}

pub struct HttpSurfaceAnalyzer {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSurfaceAnalyzer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl SurfaceAnalyzer for HttpSurfaceAnalyzer {
    async fn analyze(
        &self,
        jpeg: &[u8],
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<lumen_protocol::SurfaceAttributes, AnalyzerError> {
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(jpeg);
        let body = serde_json::json!({ "image": image_b64, "x": x, "y": y, "width": width, "height": height });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalyzerError::Request(e.to_string()))?;
        response
            .json::<lumen_protocol::SurfaceAttributes>()
            .await
            .map_err(|e| AnalyzerError::Request(e.to_string()))
    }
}

/// HTTP-backed face detector (§4.5). Production collaborator for
/// `lumen_media::FaceDetector`.
pub struct HttpFaceDetector {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpFaceDetector {
    pub fn new(endpoint: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap_or_default();
        Self { endpoint: endpoint.into(), client }
    }
}

#[derive(serde::Deserialize)]
struct DetectedFace {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    async fn detect(&self, jpeg: &[u8]) -> Result<Vec<FaceRect>, DetectorError> {
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(jpeg);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "image": image_b64 }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DetectorError::Timeout
                } else {
                    DetectorError::Unavailable(e.to_string())
                }
            })?;
        let faces: Vec<DetectedFace> = response
            .json()
            .await
            .map_err(|e| DetectorError::Unavailable(e.to_string()))?;
        Ok(faces
            .into_iter()
            .map(|f| FaceRect { x: f.x, y: f.y, width: f.width, height: f.height })
            .collect())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob store failure: {0}")]
    Blob(String),
    #[error("record store failure: {0}")]
    Record(String),
    #[error("not found")]
    NotFound,
}

/// Opaque object store collaborator (§3, out of scope beyond this interface).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<BlobReference, StoreError>;
    async fn delete(&self, reference: &BlobReference) -> Result<(), StoreError>;
    /// Mint a time-bounded download URL for a stored blob.
    fn sign_url(&self, reference: &BlobReference, ttl_secs: u64) -> String;
}

/// Opaque document store collaborator (§3, out of scope beyond this interface).
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put(&self, record: GalleryRecord) -> Result<(), StoreError>;
    async fn get(&self, id: uuid::Uuid) -> Result<Option<GalleryRecord>, StoreError>;
    async fn list_public(&self, limit: usize) -> Result<Vec<GalleryRecord>, StoreError>;
    async fn update(&self, record: GalleryRecord) -> Result<(), StoreError>;
}

/// Filesystem-backed `BlobStore`: content-addressed by the SHA-256 of the
/// bytes, stored under `root/{hash[..2]}/{hash}{ext}`. The caller's logical
/// `key` only supplies the extension (so `sign_url`/local serving keeps a
/// content-type hint); the physical location is the hash, so two calls with
/// identical bytes collapse to one write.
pub struct FsBlobStore {
    root: PathBuf,
    bucket: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self { root: root.into(), bucket: bucket.into() }
    }

    fn content_key(bytes: &[u8], logical_key: &str) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(bytes);
        let hex = format!("{digest:x}");
        let ext = std::path::Path::new(logical_key).extension().and_then(|e| e.to_str());
        match ext {
            Some(ext) => format!("{}/{}.{ext}", &hex[..2], hex),
            None => format!("{}/{}", &hex[..2], hex),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<BlobReference, StoreError> {
        let content_key = Self::content_key(bytes, key);
        let path = self.root.join(&content_key);

        match tokio::fs::read(&path).await {
            Ok(existing) if existing == bytes => {
                return Ok(BlobReference::new(self.bucket.clone(), content_key));
            }
            Ok(_) => {
                return Err(StoreError::Blob(format!("sha-256 collision on content key {content_key}")));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Blob(e.to_string())),
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Blob(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| StoreError::Blob(e.to_string()))?;
        Ok(BlobReference::new(self.bucket.clone(), content_key))
    }

    async fn delete(&self, reference: &BlobReference) -> Result<(), StoreError> {
        let path = self.root.join(&reference.key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    fn sign_url(&self, reference: &BlobReference, ttl_secs: u64) -> String {
        format!("https://blobs.local/{}/{}?ttl={ttl_secs}", reference.store, reference.key)
    }
}

/// Filesystem-backed `RecordStore`: one JSON file per record under `root/{ns}/{id}.json`.
pub struct FsRecordStore {
    root: PathBuf,
    namespace: String,
    index: tokio::sync::RwLock<()>,
}

impl FsRecordStore {
    pub fn new(root: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self { root: root.into(), namespace: namespace.into(), index: tokio::sync::RwLock::new(()) }
    }

    fn dir(&self) -> PathBuf {
        self.root.join(&self.namespace)
    }
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn put(&self, record: GalleryRecord) -> Result<(), StoreError> {
        let _guard = self.index.write().await;
        let dir = self.dir();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| StoreError::Record(e.to_string()))?;
        let path = dir.join(format!("{}.json", record.id));
        let json = serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Record(e.to_string()))?;
        tokio::fs::write(path, json).await.map_err(|e| StoreError::Record(e.to_string()))
    }

    async fn get(&self, id: uuid::Uuid) -> Result<Option<GalleryRecord>, StoreError> {
        let path = self.dir().join(format!("{id}.json"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| StoreError::Record(e.to_string()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Record(e.to_string())),
        }
    }

    async fn list_public(&self, limit: usize) -> Result<Vec<GalleryRecord>, StoreError> {
        let _guard = self.index.read().await;
        let dir = self.dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Record(e.to_string())),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::Record(e.to_string()))? {
            let bytes = tokio::fs::read(entry.path()).await.map_err(|e| StoreError::Record(e.to_string()))?;
            if let Ok(record) = serde_json::from_slice::<GalleryRecord>(&bytes)
                && record.visibility == lumen_protocol::Visibility::Public
            {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn update(&self, record: GalleryRecord) -> Result<(), StoreError> {
        self.put(record).await
    }
}

/// Handy bundle of the collaborators `GalleryStore` dispatches to.
pub struct Collaborators {
    pub upstream: Arc<dyn UpstreamLiveClient>,
    pub analyzer: Arc<dyn SurfaceAnalyzer>,
    pub blob_store: Arc<dyn BlobStore>,
    pub record_store: Arc<dyn RecordStore>,
}

#[cfg(test)]
mod fs_blob_store_tests {
    use super::*;

    fn temp_store() -> FsBlobStore {
        let dir = std::env::temp_dir().join(format!("lumen-blob-test-{}", uuid::Uuid::new_v4()));
        FsBlobStore::new(dir, "test-bucket")
    }

    #[tokio::test]
    async fn identical_bytes_dedup_to_the_same_key() {
        let store = temp_store();
        let a = store.put("snapshots/owner/1/before.jpg", b"same bytes").await.unwrap();
        let b = store.put("snapshots/owner/2/before.jpg", b"same bytes").await.unwrap();
        assert_eq!(a.key, b.key);
        assert!(a.key.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn different_bytes_get_different_keys() {
        let store = temp_store();
        let a = store.put("a.jpg", b"one").await.unwrap();
        let b = store.put("a.jpg", b"two").await.unwrap();
        assert_ne!(a.key, b.key);
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeUpstreamClient;

    struct FakeSession;

    #[async_trait]
    impl UpstreamSession for FakeSession {
        async fn send(&mut self, _req: UpstreamRequest) -> Result<(), UpstreamError> {
            Ok(())
        }
        async fn recv(&mut self) -> Result<Option<UpstreamEvent>, UpstreamError> {
            Ok(None)
        }
        async fn close(&mut self) {}
    }

    #[async_trait]
    impl UpstreamLiveClient for FakeUpstreamClient {
        async fn connect(&self) -> Result<Box<dyn UpstreamSession>, UpstreamError> {
            Ok(Box::new(FakeSession))
        }
    }

    #[derive(Default)]
    pub struct InMemoryRecordStore {
        records: Mutex<Vec<GalleryRecord>>,
    }

    #[async_trait]
    impl RecordStore for InMemoryRecordStore {
        async fn put(&self, record: GalleryRecord) -> Result<(), StoreError> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }
        async fn get(&self, id: uuid::Uuid) -> Result<Option<GalleryRecord>, StoreError> {
            Ok(self.records.lock().unwrap().iter().find(|r| r.id == id).cloned())
        }
        async fn list_public(&self, limit: usize) -> Result<Vec<GalleryRecord>, StoreError> {
            let mut records: Vec<_> = self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.visibility == lumen_protocol::Visibility::Public)
                .cloned()
                .collect();
            records.sort_by_key(|r| std::cmp::Reverse(r.created_at));
            records.truncate(limit);
            Ok(records)
        }
        async fn update(&self, record: GalleryRecord) -> Result<(), StoreError> {
            let mut records = self.records.lock().unwrap();
            if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
                *existing = record;
            } else {
                records.push(record);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeFaceDetector {
        pub faces: Mutex<Vec<FaceRect>>,
    }

    #[async_trait]
    impl FaceDetector for FakeFaceDetector {
        async fn detect(&self, _jpeg: &[u8]) -> Result<Vec<FaceRect>, DetectorError> {
            Ok(self.faces.lock().unwrap().clone())
        }
    }

    pub struct FakeSurfaceAnalyzer;

    #[async_trait]
    impl SurfaceAnalyzer for FakeSurfaceAnalyzer {
        async fn analyze(&self, _jpeg: &[u8], _x: u32, _y: u32, _width: u32, _height: u32) -> Result<lumen_protocol::SurfaceAttributes, AnalyzerError> {
            Ok(lumen_protocol::SurfaceAttributes {
                kind: "countertop".to_string(),
                material: "granite".to_string(),
                color: "black".to_string(),
                bounding_box: [100, 100, 400, 400],
                reasoning: "test fixture".to_string(),
            })
        }
    }

    #[derive(Default)]
    pub struct InMemoryBlobStore {
        blobs: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl BlobStore for InMemoryBlobStore {
        async fn put(&self, key: &str, bytes: &[u8]) -> Result<BlobReference, StoreError> {
            self.blobs.lock().unwrap().insert(key.to_string(), bytes.to_vec());
            Ok(BlobReference::new("test-bucket", key.to_string()))
        }
        async fn delete(&self, reference: &BlobReference) -> Result<(), StoreError> {
            self.blobs.lock().unwrap().remove(&reference.key);
            Ok(())
        }
        fn sign_url(&self, reference: &BlobReference, ttl_secs: u64) -> String {
            format!("https://test.local/{}?ttl={ttl_secs}", reference.key)
        }
    }
}
