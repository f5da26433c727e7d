// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory event log for tests and single-process deployments.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    CHAT_EVENTS, CHAT_EVENTS_DLQ, EventLog, EventLogError, LogRecord, STATUS_UPDATES,
    partition_for_key,
};

#[derive(Debug)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct MemoryStream {
    partitions: Vec<Mutex<Vec<StoredRecord>>>,
    notify: Notify,
}

impl MemoryStream {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Mutex::new(Vec::new())).collect(),
            notify: Notify::new(),
        }
    }
}

#[derive(Debug)]
struct Lease {
    owner: String,
    until: Instant,
}

/// In-process partitioned log. The dead-letter stream runs on a single
/// partition.
#[derive(Debug)]
pub struct MemoryEventLog {
    streams: HashMap<&'static str, MemoryStream>,
    offsets: Mutex<HashMap<(String, String, u32), i64>>,
    leases: Mutex<HashMap<(String, String, u32), Lease>>,
}

impl MemoryEventLog {
    pub fn new(partitions: u32) -> Self {
        let mut streams = HashMap::new();
        streams.insert(CHAT_EVENTS, MemoryStream::new(partitions));
        streams.insert(STATUS_UPDATES, MemoryStream::new(partitions));
        streams.insert(CHAT_EVENTS_DLQ, MemoryStream::new(1));
        Self {
            streams,
            offsets: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn stream(&self, stream: &str) -> Result<&MemoryStream, EventLogError> {
        self.streams
            .get(stream)
            .ok_or_else(|| EventLogError::UnknownStream(stream.to_owned()))
    }

    /// Records currently stored on a partition, for assertions in tests.
    pub fn partition_len(&self, stream: &str, partition: u32) -> usize {
        self.streams
            .get(stream)
            .and_then(|s| s.partitions.get(partition as usize))
            .map(|p| p.lock().unwrap().len())
            .unwrap_or_default()
    }

    /// Total number of records on a stream, for assertions in tests.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .get(stream)
            .map(|s| {
                s.partitions
                    .iter()
                    .map(|p| p.lock().unwrap().len())
                    .sum()
            })
            .unwrap_or_default()
    }

    fn read_after(
        &self,
        stream: &MemoryStream,
        committed: i64,
        partition: u32,
        max_records: usize,
    ) -> Vec<LogRecord> {
        let records = stream.partitions[partition as usize].lock().unwrap();
        records
            .iter()
            .enumerate()
            .skip((committed + 1) as usize)
            .take(max_records)
            .map(|(offset, record)| LogRecord {
                partition,
                offset: offset as i64,
                key: record.key.clone(),
                payload: record.payload.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    fn partition_count(&self, stream: &str) -> u32 {
        self.streams
            .get(stream)
            .map(|s| s.partitions.len() as u32)
            .unwrap_or_default()
    }

    async fn publish(
        &self,
        stream: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<(), EventLogError> {
        let memory_stream = self.stream(stream)?;
        let partition = partition_for_key(key, memory_stream.partitions.len() as u32);
        memory_stream.partitions[partition as usize]
            .lock()
            .unwrap()
            .push(StoredRecord {
                key: key.to_owned(),
                payload,
            });
        memory_stream.notify.notify_waiters();
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
        let memory_stream = self.stream(stream)?;
        let deadline = Instant::now() + wait;
        loop {
            let committed = *self
                .offsets
                .lock()
                .unwrap()
                .get(&(stream.to_owned(), group.to_owned(), partition))
                .unwrap_or(&-1);
            let records = self.read_after(memory_stream, committed, partition, max_records);
            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(records);
            }
            tokio::select! {
                _ = memory_stream.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn commit(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), EventLogError> {
        self.stream(stream)?;
        let mut offsets = self.offsets.lock().unwrap();
        let entry = offsets
            .entry((stream.to_owned(), group.to_owned(), partition))
            .or_insert(-1);
        *entry = (*entry).max(offset);
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
        self.stream(stream)?;
        let mut leases = self.leases.lock().unwrap();
        let key = (stream.to_owned(), group.to_owned(), partition);
        let now = Instant::now();
        match leases.get_mut(&key) {
            Some(existing) if existing.owner != owner && existing.until > now => Ok(false),
            Some(existing) => {
                existing.owner = owner.to_owned();
                existing.until = now + lease;
                Ok(true)
            }
            None => {
                leases.insert(
                    key,
                    Lease {
                        owner: owner.to_owned(),
                        until: now + lease,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_partition(
        &self,
        stream: &str,
        group: &str,
        partition: u32,
        owner: &str,
    ) -> Result<(), EventLogError> {
        self.stream(stream)?;
        let mut leases = self.leases.lock().unwrap();
        let key = (stream.to_owned(), group.to_owned(), partition);
        if leases.get(&key).is_some_and(|lease| lease.owner == owner) {
            leases.remove(&key);
        }
        Ok(())
    }
}
