//! GalleryStore (C9, §4.9): translates gallery domain operations onto the
//! `BlobStore` + `RecordStore` collaborators and mints time-bounded download
//! URLs. Stateless by construction — every operation dispatches straight to
//! the two stores behind `Collaborators`.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use uuid::Uuid;

use lumen_protocol::{GalleryRecord, GalleryRecordView, RecordMetadata, Visibility};

use crate::collaborators::{BlobStore, RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record not found")]
    NotFound,
}

pub struct GalleryStore<'a> {
    blobs: &'a dyn BlobStore,
    records: &'a dyn RecordStore,
    signed_url_ttl_secs: u64,
}

/// Input to `save`: the two still frames the caller wants persisted plus the
/// metadata the spatial analyzer produced for them.
pub struct NewGalleryEntry {
    pub owner_token: String,
    pub title: String,
    pub description: String,
    pub before_jpeg: Vec<u8>,
    pub after_jpeg: Vec<u8>,
    pub thumbnail_jpeg: Vec<u8>,
    pub metadata: RecordMetadata,
    pub tags: Vec<String>,
    pub visibility: Visibility,
}

impl<'a> GalleryStore<'a> {
    pub fn new(blobs: &'a dyn BlobStore, records: &'a dyn RecordStore, signed_url_ttl_secs: u64) -> Self {
        Self { blobs, records, signed_url_ttl_secs }
    }

    /// Writes both image blobs, then the record. If the record write fails
    /// after blobs were written, schedules the blobs for deletion
    /// (compensating cleanup, at-least-once per §4.9).
    pub async fn save(&self, entry: NewGalleryEntry) -> Result<GalleryRecord, GalleryError> {
        let id = Uuid::new_v4();
        let before_key = format!("snapshots/{}/{id}/before.jpg", entry.owner_token);
        let after_key = format!("snapshots/{}/{id}/after.jpg", entry.owner_token);
        let thumb_key = format!("snapshots/{}/{id}/thumbnail.jpg", entry.owner_token);

        let before_ref = self.blobs.put(&before_key, &entry.before_jpeg).await?;
        let after_ref = self.blobs.put(&after_key, &entry.after_jpeg).await?;
        let thumbnail_ref = self.blobs.put(&thumb_key, &entry.thumbnail_jpeg).await?;

        let now = now_secs();
        let record = GalleryRecord {
            id,
            owner_token: entry.owner_token,
            title: entry.title,
            description: entry.description,
            before_blob_ref: before_ref.clone(),
            after_blob_ref: after_ref.clone(),
            thumbnail_ref: thumbnail_ref.clone(),
            metadata: entry.metadata,
            tags: entry.tags,
            visibility: entry.visibility,
            likes: 0,
            views: 0,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.records.put(record.clone()).await {
            tracing::warn!(%id, "record write failed after blobs were written, scheduling cleanup: {e}");
            for reference in [&before_ref, &after_ref, &thumbnail_ref] {
                let _ = self.blobs.delete(reference).await;
            }
            return Err(e.into());
        }

        Ok(record)
    }

    pub async fn list_public(&self, limit: usize) -> Result<Vec<GalleryRecordView>, GalleryError> {
        let records = self.records.list_public(limit).await?;
        Ok(records.into_iter().map(|r| self.to_view(r)).collect())
    }

    pub async fn get(&self, id: Uuid) -> Result<GalleryRecordView, GalleryError> {
        let record = self.records.get(id).await?.ok_or(GalleryError::NotFound)?;
        Ok(self.to_view(record))
    }

    /// Monotone non-decreasing counter bump (§3 invariant).
    pub async fn increment_views(&self, id: Uuid) -> Result<u64, GalleryError> {
        let mut record = self.records.get(id).await?.ok_or(GalleryError::NotFound)?;
        record.views = record.views.saturating_add(1);
        record.updated_at = now_secs();
        let views = record.views;
        self.records.update(record).await?;
        Ok(views)
    }

    /// Monotone non-decreasing counter bump (§3 invariant); likes never
    /// decrease here, matching the spec's "must be monotone non-decreasing".
    pub async fn toggle_like(&self, id: Uuid) -> Result<u64, GalleryError> {
        let mut record = self.records.get(id).await?.ok_or(GalleryError::NotFound)?;
        record.likes = record.likes.saturating_add(1);
        record.updated_at = now_secs();
        let likes = record.likes;
        self.records.update(record).await?;
        Ok(likes)
    }

    fn to_view(&self, record: GalleryRecord) -> GalleryRecordView {
        GalleryRecordView {
            id: record.id,
            title: record.title,
            description: record.description,
            before_url: self.blobs.sign_url(&record.before_blob_ref, self.signed_url_ttl_secs),
            after_url: self.blobs.sign_url(&record.after_blob_ref, self.signed_url_ttl_secs),
            thumbnail_url: self.blobs.sign_url(&record.thumbnail_ref, self.signed_url_ttl_secs),
            metadata: record.metadata,
            tags: record.tags,
            visibility: record.visibility,
            likes: record.likes,
            views: record.views,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{InMemoryBlobStore, InMemoryRecordStore};

    fn sample_entry() -> NewGalleryEntry {
        NewGalleryEntry {
            owner_token: "owner-1".to_string(),
            title: "Oak countertop".to_string(),
            description: "kitchen counter".to_string(),
            before_jpeg: vec![1, 2, 3],
            after_jpeg: vec![4, 5, 6],
            thumbnail_jpeg: vec![7, 8, 9],
            metadata: RecordMetadata {
                surface_type: "countertop".to_string(),
                material: "oak".to_string(),
                color: "brown".to_string(),
                bounding_box: [0, 0, 500, 500],
            },
            tags: vec!["kitchen".to_string()],
            visibility: Visibility::Public,
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let blobs = InMemoryBlobStore::default();
        let records = InMemoryRecordStore::default();
        let store = GalleryStore::new(&blobs, &records, 900);

        let saved = store.save(sample_entry()).await.unwrap();
        let view = store.get(saved.id).await.unwrap();
        assert_eq!(view.title, "Oak countertop");
        assert_eq!(view.views, 0);
    }

    #[tokio::test]
    async fn increment_views_is_monotone() {
        let blobs = InMemoryBlobStore::default();
        let records = InMemoryRecordStore::default();
        let store = GalleryStore::new(&blobs, &records, 900);

        let saved = store.save(sample_entry()).await.unwrap();
        let first = store.increment_views(saved.id).await.unwrap();
        let second = store.increment_views(saved.id).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let blobs = InMemoryBlobStore::default();
        let records = InMemoryRecordStore::default();
        let store = GalleryStore::new(&blobs, &records, 900);
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GalleryError::NotFound));
    }

    #[tokio::test]
    async fn list_public_excludes_private_records() {
        let blobs = InMemoryBlobStore::default();
        let records = InMemoryRecordStore::default();
        let store = GalleryStore::new(&blobs, &records, 900);

        let mut private_entry = sample_entry();
        private_entry.visibility = Visibility::Private;
        store.save(private_entry).await.unwrap();
        store.save(sample_entry()).await.unwrap();

        let listed = store.list_public(10).await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
