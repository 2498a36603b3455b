use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store identifier + object key. Never a raw URL (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobReference {
    pub store: String,
    pub key: String,
}

impl BlobReference {
    pub fn new(store: impl Into<String>, key: impl Into<String>) -> Self {
        Self { store: store.into(), key: key.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub surface_type: String,
    pub material: String,
    pub color: String,
    /// `[ymin, xmin, ymax, xmax]` normalized to 0..1000.
    pub bounding_box: [u32; 4],
}

/// Persisted analysis artifact (§3). Either both blob refs are present or the
/// record is rejected by `GalleryStore::save`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryRecord {
    pub id: Uuid,
    pub owner_token: String,
    pub title: String,
    pub description: String,
    pub before_blob_ref: BlobReference,
    pub after_blob_ref: BlobReference,
    pub thumbnail_ref: BlobReference,
    pub metadata: RecordMetadata,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub likes: u64,
    pub views: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// `GalleryRecord` as returned to clients, with minted download URLs
/// substituted for the raw blob references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryRecordView {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub before_url: String,
    pub after_url: String,
    pub thumbnail_url: String,
    pub metadata: RecordMetadata,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub likes: u64,
    pub views: u64,
    pub created_at: u64,
    pub updated_at: u64,
}
