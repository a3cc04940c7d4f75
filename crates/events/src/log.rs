//! Append-only log trait and implementations.
//!
//! The log is the pipeline's only persistent collaborator. Entries are
//! envelope bytes grouped by [`PartitionKey`]; offsets are per partition,
//! start at 0, and read back in append order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::RwLock;

use crate::error::LogError;
use crate::types::{LogEntry, Offset, PartitionKey};

/// Trait for append-only log backends.
#[async_trait]
pub trait AppendLog: Send + Sync {
    /// Append bytes to a partition, returning their offset.
    async fn append(&self, partition: &PartitionKey, bytes: Vec<u8>) -> Result<Offset, LogError>;

    /// Lazily read a partition starting at `from`.
    fn read(
        &self,
        partition: &PartitionKey,
        from: Offset,
    ) -> BoxStream<'static, Result<LogEntry, LogError>>;

    /// Every partition that holds at least one entry.
    async fn partitions(&self) -> Result<Vec<PartitionKey>, LogError>;
}

type Partitions = HashMap<PartitionKey, Vec<Vec<u8>>>;

/// In-memory log for tests and one-shot CLI runs.
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLog {
    partitions: Arc<RwLock<Partitions>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryLog {
    /// Create an empty in-memory log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty in-memory log wrapped in an Arc.
    #[must_use]
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Refuse further appends with [`LogError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Number of entries in one partition.
    pub async fn len(&self, partition: &PartitionKey) -> usize {
        self.partitions
            .read()
            .await
            .get(partition)
            .map_or(0, Vec::len)
    }

    /// Number of entries across all partitions.
    pub async fn total_len(&self) -> usize {
        self.partitions.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl AppendLog for InMemoryLog {
    async fn append(&self, partition: &PartitionKey, bytes: Vec<u8>) -> Result<Offset, LogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        let mut partitions = self.partitions.write().await;
        let entries = partitions.entry(partition.clone()).or_default();
        let offset = Offset::new(u64::try_from(entries.len()).unwrap_or(u64::MAX));
        entries.push(bytes);
        Ok(offset)
    }

    fn read(
        &self,
        partition: &PartitionKey,
        from: Offset,
    ) -> BoxStream<'static, Result<LogEntry, LogError>> {
        let partitions = Arc::clone(&self.partitions);
        let partition = partition.clone();

        stream::unfold(from, move |offset| {
            let partitions = Arc::clone(&partitions);
            let partition = partition.clone();
            async move {
                let index = usize::try_from(offset.value()).ok()?;
                let bytes = partitions.read().await.get(&partition)?.get(index)?.clone();
                let entry = LogEntry {
                    partition,
                    offset,
                    bytes,
                };
                Some((Ok(entry), offset.next()))
            }
        })
        .boxed()
    }

    async fn partitions(&self) -> Result<Vec<PartitionKey>, LogError> {
        let mut keys: Vec<PartitionKey> = self
            .partitions
            .read()
            .await
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// A wrapper that adds tracing to a log.
pub struct TracingLog<L: AppendLog> {
    inner: L,
}

impl<L: AppendLog> TracingLog<L> {
    /// Create a new tracing log.
    pub const fn new(inner: L) -> Self {
        Self { inner }
    }

    pub const fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: AppendLog> AppendLog for TracingLog<L> {
    async fn append(&self, partition: &PartitionKey, bytes: Vec<u8>) -> Result<Offset, LogError> {
        let len = bytes.len();
        tracing::debug!(partition = %partition, bytes = len, "Appending entry");
        let result = self.inner.append(partition, bytes).await;
        match &result {
            Ok(offset) => tracing::trace!(partition = %partition, offset = %offset, "Entry appended"),
            Err(e) => tracing::warn!(partition = %partition, error = %e, "Append failed"),
        }
        result
    }

    fn read(
        &self,
        partition: &PartitionKey,
        from: Offset,
    ) -> BoxStream<'static, Result<LogEntry, LogError>> {
        tracing::debug!(partition = %partition, from = %from, "Reading partition");
        self.inner.read(partition, from)
    }

    async fn partitions(&self) -> Result<Vec<PartitionKey>, LogError> {
        self.inner.partitions().await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use futures::TryStreamExt;
    use mlens_proto::ExperimentId;

    use super::*;

    fn experiment(id: &str) -> PartitionKey {
        PartitionKey::Experiment(ExperimentId::parse(id).unwrap())
    }

    #[tokio::test]
    async fn test_offsets_are_per_partition() {
        let log = InMemoryLog::new();
        let a = experiment("a");
        let b = experiment("b");

        assert_eq!(log.append(&a, vec![1]).await.unwrap(), Offset::new(0));
        assert_eq!(log.append(&a, vec![2]).await.unwrap(), Offset::new(1));
        assert_eq!(log.append(&b, vec![3]).await.unwrap(), Offset::new(0));
        assert_eq!(log.total_len().await, 3);
    }

    #[tokio::test]
    async fn test_read_from_offset_in_append_order() {
        let log = InMemoryLog::new();
        let key = experiment("a");
        for byte in 0..5_u8 {
            log.append(&key, vec![byte]).await.unwrap();
        }

        let entries: Vec<LogEntry> = log.read(&key, Offset::new(2)).try_collect().await.unwrap();
        let bytes: Vec<u8> = entries.iter().map(|e| e.bytes[0]).collect();
        assert_eq!(bytes, vec![2, 3, 4]);
        assert_eq!(entries[0].offset, Offset::new(2));
    }

    #[tokio::test]
    async fn test_read_is_lazy() {
        let log = InMemoryLog::new();
        let key = experiment("a");
        let mut stream = log.read(&key, Offset::ZERO);

        log.append(&key, vec![9]).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.bytes, vec![9]);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_log_rejects_appends() {
        let log = InMemoryLog::new();
        log.close();
        assert_eq!(
            log.append(&PartitionKey::Opaque, vec![1]).await,
            Err(LogError::Closed)
        );
    }

    #[tokio::test]
    async fn test_partitions_sorted_and_traced_log_delegates() {
        let log = TracingLog::new(InMemoryLog::new());
        log.append(&PartitionKey::Opaque, vec![0]).await.unwrap();
        log.append(&experiment("z"), vec![0]).await.unwrap();
        log.append(&experiment("m"), vec![0]).await.unwrap();

        assert_eq!(
            log.partitions().await.unwrap(),
            vec![experiment("m"), experiment("z"), PartitionKey::Opaque]
        );
        assert_eq!(log.inner().len(&PartitionKey::Opaque).await, 1);
    }
}
