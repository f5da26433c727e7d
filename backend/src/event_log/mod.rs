// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Partitioned, append-only event log used for handoff and ordering.
//!
//! Records are keyed; the partitioner is a pure function of the key and the
//! partition count, so a conversation always lands on the same partition.
//! Consumers are organised in groups with durable per-partition offsets and
//! single-owner partition leases. Delivery is at-least-once; consumers
//! deduplicate.

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::errors::StorageError;

mod consumer;
pub mod memory;
mod postgres;

pub use consumer::{HandlerOutcome, RecordHandler, spawn_partition_workers};
pub use postgres::PostgresEventLog;

/// Newly accepted messages, keyed by conversation id.
pub const CHAT_EVENTS: &str = "chat-events";
/// Status transitions, keyed by conversation id so they interleave in order
/// with their messages.
pub const STATUS_UPDATES: &str = "status-updates";
/// Dead letters of terminally failed messages.
pub const CHAT_EVENTS_DLQ: &str = "chat-events-dlq";

pub const STREAMS: [&str; 3] = [CHAT_EVENTS, STATUS_UPDATES, CHAT_EVENTS_DLQ];

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Unknown stream: {0}")]
    UnknownStream(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for EventLogError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.into())
    }
}

/// One record as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: i64,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Stable partitioner: a pure function of key and partition count.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % partitions.max(1)
}

#[async_trait]
pub trait EventLog: Send + Sync + std::fmt::Debug + 'static {
    fn partition_count(&self, stream: &str) -> u32;

    /// Appends a record to the partition its key maps to.
    async fn publish(&self, stream: &str, key: &str, payload: Vec<u8>)
    -> Result<(), EventLogError>;

    /// Returns records after the group's committed offset, oldest first.
    /// Waits up to `wait` for new records before returning empty.
    async fn fetch(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        max_records: usize,
        wait: Duration,
    ) -> Result<Vec<LogRecord>, EventLogError>;

    /// Durably commits the group's offset for a partition. Never moves the
    /// offset backwards.
    async fn commit(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), EventLogError>;

    /// Tries to take (or renew) the single-owner lease of a partition.
    /// Ownership moves only through expiry or release, never splits.
    async fn try_acquire_partition(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, EventLogError>;

    async fn release_partition(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        owner: &str,
    ) -> Result<(), EventLogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitioner_is_stable() {
        let p1 = partition_for_key("conversation-1", 10);
        let p2 = partition_for_key("conversation-1", 10);
        assert_eq!(p1, p2);
        assert!(p1 < 10);
    }

    #[test]
    fn partitioner_spreads_keys() {
        let partitions = 10;
        let hit: std::collections::HashSet<u32> = (0..1000)
            .map(|i| partition_for_key(&format!("conversation-{i}"), partitions))
            .collect();
        // With 1000 keys over 10 partitions every partition is hit.
        assert_eq!(hit.len(), partitions as usize);
    }

    #[test]
    fn single_partition_maps_everything_to_zero() {
        assert_eq!(partition_for_key("anything", 1), 0);
    }
}
