// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File attachments: out-of-band blobs with their own lifetime, stored in an
//! object store and referenced from messages only once scanned CLEAN.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use couriercommon::{MAX_ATTACHMENT_SIZE, identifiers::AttachmentId, messages::ScanVerdict};
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    backend_service::BackendService,
    errors::{ServiceCreationError, StorageError},
    settings::StorageSettings,
};

mod persistence;
mod s3;

pub use s3::S3Storage;

/// How long an attachment outlives its creation, independent of any message
/// that references it.
const ATTACHMENT_TTL_DAYS: i64 = 7;

/// Metadata of one uploaded (or inbound-fetched) blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub file_id: AttachmentId,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub object_key: String,
    pub verdict: ScanVerdict,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AttachmentRecord {
    fn new(filename: &str, size: u64, mime_type: &str) -> Self {
        let now = Utc::now();
        Self {
            file_id: AttachmentId::random(),
            filename: filename.to_owned(),
            size,
            mime_type: mime_type.to_owned(),
            object_key: Uuid::new_v4().as_simple().to_string(),
            verdict: ScanVerdict::Pending,
            created_at: now,
            expires_at: now + Duration::days(ATTACHMENT_TTL_DAYS),
        }
    }

    /// Whether a message may reference this attachment.
    pub fn is_referenceable(&self, now: DateTime<Utc>) -> bool {
        self.verdict == ScanVerdict::Clean && now < self.expires_at
    }
}

#[derive(Debug, thiserror::Error, Display)]
pub enum FileServiceError {
    /// Attachments are not supported
    AttachmentsDisabled,
    /// File exceeds the maximum attachment size
    TooLarge,
    /// File not found
    NotFound,
    /// Object storage error: {0}
    ObjectStorage(String),
    /// Storage error: {0}
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for FileServiceError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.into())
    }
}

#[async_trait]
pub trait FileStore: Send + Sync + std::fmt::Debug + 'static {
    async fn insert(&self, record: &AttachmentRecord) -> Result<(), FileServiceError>;
    async fn get(
        &self,
        file_id: &AttachmentId,
    ) -> Result<Option<AttachmentRecord>, FileServiceError>;
    async fn set_verdict(
        &self,
        file_id: &AttachmentId,
        verdict: ScanVerdict,
    ) -> Result<(), FileServiceError>;
}

/// The grant returned by an upload initiation: where to PUT the blob, and
/// until when.
#[derive(Debug, Clone)]
pub struct UploadGrant {
    pub file_id: AttachmentId,
    pub upload_url: String,
    pub upload_headers: Vec<(String, String)>,
    pub expires_at: DateTime<Utc>,
}

/// Attachment metadata plus presigned object-store access.
#[derive(Debug, Clone)]
pub struct FileService {
    store: Arc<dyn FileStore>,
    storage: Option<S3Storage>,
}

impl FileService {
    pub fn new(store: Arc<dyn FileStore>, storage: Option<S3Storage>) -> Self {
        Self { store, storage }
    }

    /// Registers an upload and returns a presigned PUT grant. The record
    /// starts PENDING; it becomes referenceable once scanned CLEAN.
    pub async fn initiate_upload(
        &self,
        filename: &str,
        size: u64,
        mime_type: &str,
    ) -> Result<UploadGrant, FileServiceError> {
        if size > MAX_ATTACHMENT_SIZE {
            return Err(FileServiceError::TooLarge);
        }
        let storage = self
            .storage
            .as_ref()
            .ok_or(FileServiceError::AttachmentsDisabled)?;
        let record = AttachmentRecord::new(filename, size, mime_type);
        self.store.insert(&record).await?;
        let (upload_url, upload_headers, expires_at) =
            storage.presign_put(&record.object_key).await?;
        Ok(UploadGrant {
            file_id: record.file_id,
            upload_url,
            upload_headers,
            expires_at,
        })
    }

    pub async fn get(
        &self,
        file_id: &AttachmentId,
    ) -> Result<Option<AttachmentRecord>, FileServiceError> {
        self.store.get(file_id).await
    }

    /// Records the scan verdict of an uploaded blob.
    pub async fn mark_scanned(
        &self,
        file_id: &AttachmentId,
        verdict: ScanVerdict,
    ) -> Result<(), FileServiceError> {
        self.store.set_verdict(file_id, verdict).await
    }

    /// Whether a message may reference the attachment right now.
    pub async fn is_referenceable(
        &self,
        file_id: &AttachmentId,
    ) -> Result<bool, FileServiceError> {
        Ok(self
            .store
            .get(file_id)
            .await?
            .is_some_and(|record| record.is_referenceable(Utc::now())))
    }

    /// Presigned download URL for a stored attachment, if object storage is
    /// configured.
    pub async fn download_url(
        &self,
        file_id: &AttachmentId,
    ) -> Result<Option<String>, FileServiceError> {
        let Some(storage) = self.storage.as_ref() else {
            return Ok(None);
        };
        let record = self
            .store
            .get(file_id)
            .await?
            .ok_or(FileServiceError::NotFound)?;
        Ok(Some(storage.presign_get(&record.object_key).await?))
    }

    /// Stores a blob fetched from a platform (inbound attachment path).
    /// Platform-fetched blobs are recorded CLEAN.
    pub async fn store_inbound(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<AttachmentId, FileServiceError> {
        let mut record = AttachmentRecord::new(filename, bytes.len() as u64, mime_type);
        record.verdict = ScanVerdict::Clean;
        if let Some(storage) = self.storage.as_ref() {
            storage.put_object(&record.object_key, bytes).await?;
        }
        self.store.insert(&record).await?;
        Ok(record.file_id)
    }
}

/// In-memory attachment metadata store for tests and dev mode.
#[derive(Debug, Default, Clone)]
pub struct MemoryFileStore {
    records: Arc<Mutex<HashMap<AttachmentId, AttachmentRecord>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: registers a CLEAN attachment and returns its id.
    pub fn insert_clean(&self, filename: &str, size: u64, mime_type: &str) -> AttachmentId {
        let mut record = AttachmentRecord::new(filename, size, mime_type);
        record.verdict = ScanVerdict::Clean;
        let file_id = record.file_id;
        self.records.lock().unwrap().insert(file_id, record);
        file_id
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn insert(&self, record: &AttachmentRecord) -> Result<(), FileServiceError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.file_id, record.clone());
        Ok(())
    }

    async fn get(
        &self,
        file_id: &AttachmentId,
    ) -> Result<Option<AttachmentRecord>, FileServiceError> {
        Ok(self.records.lock().unwrap().get(file_id).cloned())
    }

    async fn set_verdict(
        &self,
        file_id: &AttachmentId,
        verdict: ScanVerdict,
    ) -> Result<(), FileServiceError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(file_id).ok_or(FileServiceError::NotFound)?;
        record.verdict = verdict;
        Ok(())
    }
}

/// Postgres-backed attachment metadata store.
#[derive(Debug, Clone)]
pub struct PgFileStore {
    db_pool: PgPool,
}

#[async_trait]
impl BackendService for PgFileStore {
    async fn initialize(db_pool: PgPool) -> Result<Self, ServiceCreationError> {
        Ok(Self { db_pool })
    }
}

/// Builds the optional S3 storage from settings.
pub async fn storage_from_settings(
    settings: Option<&StorageSettings>,
) -> Result<Option<S3Storage>, FileServiceError> {
    match settings {
        Some(settings) => Ok(Some(S3Storage::new(settings).await?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initiate_requires_storage() {
        let service = FileService::new(Arc::new(MemoryFileStore::new()), None);
        let result = service.initiate_upload("a.pdf", 10, "application/pdf").await;
        assert!(matches!(result, Err(FileServiceError::AttachmentsDisabled)));
    }

    #[tokio::test]
    async fn pending_attachments_are_unreferenceable() -> anyhow::Result<()> {
        let store = MemoryFileStore::new();
        let service = FileService::new(Arc::new(store.clone()), None);
        let mut record = AttachmentRecord::new("a.pdf", 10, "application/pdf");
        record.verdict = ScanVerdict::Pending;
        store.insert(&record).await?;
        assert!(!service.is_referenceable(&record.file_id).await?);

        service
            .mark_scanned(&record.file_id, ScanVerdict::Clean)
            .await?;
        assert!(service.is_referenceable(&record.file_id).await?);

        service
            .mark_scanned(&record.file_id, ScanVerdict::Rejected)
            .await?;
        assert!(!service.is_referenceable(&record.file_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn size_boundary_is_enforced_on_initiate() {
        let service = FileService::new(Arc::new(MemoryFileStore::new()), None);
        // One over the cap is rejected before anything else happens.
        let result = service
            .initiate_upload("big.bin", MAX_ATTACHMENT_SIZE + 1, "video/mp4")
            .await;
        assert!(matches!(result, Err(FileServiceError::TooLarge)));
        // At the cap the size check passes; without storage the request then
        // fails as disabled.
        let result = service
            .initiate_upload("big.bin", MAX_ATTACHMENT_SIZE, "video/mp4")
            .await;
        assert!(matches!(result, Err(FileServiceError::AttachmentsDisabled)));
    }

    #[tokio::test]
    async fn expired_attachments_are_unreferenceable() -> anyhow::Result<()> {
        let store = MemoryFileStore::new();
        let service = FileService::new(Arc::new(store.clone()), None);
        let mut record = AttachmentRecord::new("a.pdf", 10, "application/pdf");
        record.verdict = ScanVerdict::Clean;
        record.expires_at = Utc::now() - Duration::seconds(1);
        store.insert(&record).await?;
        assert!(!service.is_referenceable(&record.file_id).await?);
        Ok(())
    }
}
