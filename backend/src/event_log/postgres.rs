// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Postgres-backed event log. Offsets are dense per (stream, partition) and
//! assigned inside the publish transaction, which gives per-partition total
//! order. Consumers poll with a bounded wait.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::info;

use crate::{backend_service::BackendService, errors::ServiceCreationError};

use super::{EventLog, EventLogError, LogRecord, STREAMS, partition_for_key};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct PostgresEventLog {
    db_pool: PgPool,
    partitions: u32,
}

impl PostgresEventLog {
    /// Partition count of a stream. The dead-letter stream runs on a single
    /// partition.
    fn partitions_of(&self, stream: &str) -> u32 {
        if stream == super::CHAT_EVENTS_DLQ {
            1
        } else {
            self.partitions
        }
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    fn check_stream(stream: &str) -> Result<(), EventLogError> {
        if STREAMS.contains(&stream) {
            Ok(())
        } else {
            Err(EventLogError::UnknownStream(stream.to_owned()))
        }
    }

    async fn committed_offset(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
    ) -> Result<i64, EventLogError> {
        let committed: Option<i64> = sqlx::query_scalar(
            "SELECT committed_offset FROM el_offsets
                WHERE stream = $1 AND consumer_group = $2 AND partition = $3",
        )
        .bind(stream)
        .bind(group)
        .bind(partition as i32)
        .fetch_optional(&self.db_pool)
        .await?;
        Ok(committed.unwrap_or(-1))
    }
}

#[async_trait]
impl BackendService for PostgresEventLog {
    async fn initialize(db_pool: PgPool) -> Result<Self, ServiceCreationError> {
        info!("Event log ready");
        Ok(Self {
            db_pool,
            partitions: 10,
        })
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    fn partition_count(&self, stream: &str) -> u32 {
        self.partitions_of(stream)
    }

    async fn publish(
        &self,
        stream: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<(), EventLogError> {
        Self::check_stream(stream)?;
        let partition = partition_for_key(key, self.partitions_of(stream)) as i32;
        let mut transaction = self.db_pool.begin().await?;
        sqlx::query(
            "INSERT INTO el_partitions (stream, partition) VALUES ($1, $2)
                ON CONFLICT DO NOTHING",
        )
        .bind(stream)
        .bind(partition)
        .execute(&mut *transaction)
        .await?;
        // Take the next offset and append the record in one statement.
        sqlx::query(
            r#"
            WITH updated_sequence AS (
                UPDATE el_partitions
                SET next_offset = next_offset + 1
                WHERE stream = $1 AND partition = $2
                RETURNING next_offset - 1 AS record_offset
            )
            INSERT INTO el_records (stream, partition, record_offset, record_key, payload)
            SELECT $1, $2, record_offset, $3, $4 FROM updated_sequence
            "#,
        )
        .bind(stream)
        .bind(partition)
        .bind(key)
        .bind(&payload)
        .execute(&mut *transaction)
        .await?;
        transaction.commit().await?;
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        max_records: usize,
        wait: Duration,
    ) -> Result<Vec<LogRecord>, EventLogError> {
        Self::check_stream(stream)?;
        let deadline = Instant::now() + wait;
        loop {
            let committed = self.committed_offset(stream, group, partition).await?;
            let rows = sqlx::query(
                "SELECT record_offset, record_key, payload FROM el_records
                    WHERE stream = $1 AND partition = $2 AND record_offset > $3
                    ORDER BY record_offset ASC
                    LIMIT $4",
            )
            .bind(stream)
            .bind(partition as i32)
            .bind(committed)
            .bind(max_records as i64)
            .fetch_all(&self.db_pool)
            .await?;
            if !rows.is_empty() || Instant::now() >= deadline {
                return rows
                    .into_iter()
                    .map(|row| {
                        Ok(LogRecord {
                            partition,
                            offset: row.try_get("record_offset")?,
                            key: row.try_get("record_key")?,
                            payload: row.try_get("payload")?,
                        })
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()
                    .map_err(Into::into);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    async fn commit(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), EventLogError> {
        Self::check_stream(stream)?;
        sqlx::query(
            "INSERT INTO el_offsets (stream, consumer_group, partition, committed_offset)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (stream, consumer_group, partition)
                DO UPDATE SET committed_offset = GREATEST(el_offsets.committed_offset, $4)",
        )
        .bind(stream)
        .bind(group)
        .bind(partition as i32)
        .bind(offset)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn try_acquire_partition(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, EventLogError> {
        Self::check_stream(stream)?;
        let lease_secs = lease.as_secs_f64();
        let row = sqlx::query(
            r#"
            INSERT INTO el_leases (stream, consumer_group, partition, owner, lease_until)
            VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5))
            ON CONFLICT (stream, consumer_group, partition) DO UPDATE
                SET owner = $4, lease_until = now() + make_interval(secs => $5)
                WHERE el_leases.owner = $4 OR el_leases.lease_until < now()
            RETURNING owner
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(partition as i32)
        .bind(owner)
        .bind(lease_secs)
        .fetch_optional(&self.db_pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release_partition(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        owner: &str,
    ) -> Result<(), EventLogError> {
        Self::check_stream(stream)?;
        sqlx::query(
            "DELETE FROM el_leases
                WHERE stream = $1 AND consumer_group = $2 AND partition = $3 AND owner = $4",
        )
        .bind(stream)
        .bind(group)
        .bind(partition as i32)
        .bind(owner)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }
}
