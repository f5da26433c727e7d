// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Duplicate-detection cache keyed by message id.
//!
//! Writes are best-effort and reads are advisory: the authoritative
//! duplicate detector is the message store's uniqueness constraint. The
//! cache short-circuits the common case without a store round-trip, so
//! nothing in the pipeline blocks on it and errors are logged and tolerated.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use couriercommon::identifiers::MessageId;
use sqlx::PgPool;
use thiserror::Error;

use crate::{
    backend_service::BackendService,
    errors::{ServiceCreationError, StorageError},
};

/// Marker TTL must outlive the worst-case retry window.
pub const DEFAULT_MARKER_TTL_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.into())
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync + std::fmt::Debug + 'static {
    /// Best-effort marker write.
    async fn observe(&self, message_id: &MessageId) -> Result<(), IdempotencyError>;

    /// Advisory read; a `false` answer proves nothing.
    async fn seen(&self, message_id: &MessageId) -> Result<bool, IdempotencyError>;
}

/// In-memory marker cache with TTL-based expiry.
#[derive(Debug)]
pub struct MemoryIdempotencyStore {
    markers: Arc<Mutex<HashMap<MessageId, DateTime<Utc>>>>,
    ttl: Duration,
}

impl MemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            markers: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    fn sweep(markers: &mut HashMap<MessageId, DateTime<Utc>>, now: DateTime<Utc>) {
        // Amortised cleanup; the map stays small in practice.
        if markers.len() % 1024 == 0 {
            markers.retain(|_, expires_at| *expires_at > now);
        }
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_MARKER_TTL_HOURS))
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn observe(&self, message_id: &MessageId) -> Result<(), IdempotencyError> {
        let now = Utc::now();
        let mut markers = self.markers.lock().unwrap();
        Self::sweep(&mut markers, now);
        markers.insert(*message_id, now + self.ttl);
        Ok(())
    }

    async fn seen(&self, message_id: &MessageId) -> Result<bool, IdempotencyError> {
        let now = Utc::now();
        Ok(self
            .markers
            .lock()
            .unwrap()
            .get(message_id)
            .is_some_and(|expires_at| *expires_at > now))
    }
}

/// Postgres-backed marker cache.
#[derive(Debug, Clone)]
pub struct PgIdempotencyStore {
    db_pool: PgPool,
    ttl: Duration,
}

impl PgIdempotencyStore {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl BackendService for PgIdempotencyStore {
    async fn initialize(db_pool: PgPool) -> Result<Self, ServiceCreationError> {
        Ok(Self {
            db_pool,
            ttl: Duration::hours(DEFAULT_MARKER_TTL_HOURS),
        })
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn observe(&self, message_id: &MessageId) -> Result<(), IdempotencyError> {
        sqlx::query(
            "INSERT INTO idempotency_markers (message_id, expires_at)
                VALUES ($1, $2)
                ON CONFLICT (message_id) DO UPDATE SET expires_at = $2",
        )
        .bind(message_id)
        .bind(Utc::now() + self.ttl)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn seen(&self, message_id: &MessageId) -> Result<bool, IdempotencyError> {
        let seen: Option<bool> = sqlx::query_scalar(
            "SELECT expires_at > now() FROM idempotency_markers WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.db_pool)
        .await?;
        Ok(seen.unwrap_or(false))
    }
}
