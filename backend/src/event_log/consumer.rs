// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Partition workers: one task per partition, strictly sequential within a
//! partition, offset committed only after a record's terminal outcome.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{EventLog, LogRecord};

/// What a handler decided about a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The record reached its terminal outcome; commit the offset.
    Commit,
    /// A dependency failed; leave the offset, back off and refetch.
    Retry,
}

#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    async fn handle(&self, record: &LogRecord) -> HandlerOutcome;
}

#[derive(Debug, Clone)]
pub(crate) struct WorkerConfig {
    pub(crate) fetch_wait: Duration,
    pub(crate) lease: Duration,
    pub(crate) max_records: usize,
    pub(crate) retry_pause: Duration,
}

impl WorkerConfig {
    pub(crate) fn new(fetch_wait: Duration, lease: Duration) -> Self {
        Self {
            fetch_wait,
            lease,
            max_records: 32,
            retry_pause: Duration::from_millis(200),
        }
    }
}

/// Spawns one worker per partition of the stream. Workers compete for
/// partition leases, so several processes can run the same group; each
/// partition is processed by exactly one worker at a time.
pub fn spawn_partition_workers(
    log: Arc<dyn EventLog>,
    stream: &'static str,
    group: &'static str,
    handler: Arc<dyn RecordHandler>,
    fetch_wait: Duration,
    lease: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let config = WorkerConfig::new(fetch_wait, lease);
    let owner = format!("{group}-{}", Uuid::new_v4().as_simple());
    (0..log.partition_count(stream))
        .map(|partition| {
            let log = log.clone();
            let handler = handler.clone();
            let config = config.clone();
            let owner = owner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_partition(log, stream, group, partition, owner, handler, config, shutdown)
                    .await;
            })
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn run_partition(
    log: Arc<dyn EventLog>,
    stream: &'static str,
    group: &'static str,
    partition: u32,
    owner: String,
    handler: Arc<dyn RecordHandler>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    info!(stream, group, partition, "partition worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let leased = log
            .try_acquire_partition(stream, group, partition, &owner, config.lease)
            .await
            .unwrap_or_else(|error| {
                warn!(%error, stream, partition, "lease acquisition failed");
                false
            });
        if !leased {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.lease / 2) => continue,
            }
        }
        process_while_leased(
            &log, stream, group, partition, &owner, &handler, &config, &shutdown,
        )
        .await;
    }
    if let Err(error) = log.release_partition(stream, group, partition, &owner).await {
        debug!(%error, stream, partition, "releasing partition failed");
    }
    info!(stream, group, partition, "partition worker stopped");
}

#[allow(clippy::too_many_arguments)]
async fn process_while_leased(
    log: &Arc<dyn EventLog>,
    stream: &'static str,
    group: &'static str,
    partition: u32,
    owner: &str,
    handler: &Arc<dyn RecordHandler>,
    config: &WorkerConfig,
    shutdown: &CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        // Renew the lease; losing it hands the partition to the new owner.
        let renewed = log
            .try_acquire_partition(stream, group, partition, owner, config.lease)
            .await
            .unwrap_or(false);
        if !renewed {
            warn!(stream, group, partition, "partition lease lost");
            return;
        }

        let records = tokio::select! {
            _ = shutdown.cancelled() => return,
            records = log.fetch(stream, group, partition, config.max_records, config.fetch_wait) => records,
        };
        let records = match records {
            Ok(records) => records,
            Err(error) => {
                error!(%error, stream, partition, "fetch failed");
                tokio::time::sleep(config.retry_pause).await;
                continue;
            }
        };

        for record in records {
            // Cancellation before the terminal outcome must not commit; the
            // record replays under the next owner and is deduplicated there.
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => return,
                outcome = handler.handle(&record) => outcome,
            };
            match outcome {
                HandlerOutcome::Commit => {
                    if let Err(error) =
                        log.commit(stream, group, partition, record.offset).await
                    {
                        error!(%error, stream, partition, offset = record.offset, "commit failed");
                        break;
                    }
                }
                HandlerOutcome::Retry => {
                    debug!(stream, partition, offset = record.offset, "record deferred");
                    tokio::time::sleep(config.retry_pause).await;
                    break;
                }
            }
        }
    }
}
