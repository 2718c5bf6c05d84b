//! Messages confirmed eligible for deletion, drained in batches

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use tracing::{info, warn};

use crate::client::MailboxClient;
use crate::error::Result;
use crate::models::{MessageMetadata, MessageRef, RunCounters};

/// Buffer of eligible messages; order carries no meaning
///
/// Entries leave only through a successful batch delete. A failed delete puts
/// its whole batch back. Each id is held at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "VecDeque<MessageMetadata>", into = "VecDeque<MessageMetadata>")]
pub struct DeletionQueue {
    entries: VecDeque<MessageMetadata>,
    /// Ids of `entries`
    queued: BTreeSet<MessageRef>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `metadata`; false if its id is already queued
    pub fn push(&mut self, metadata: MessageMetadata) -> bool {
        if !self.queued.insert(metadata.id.clone()) {
            return false;
        }
        self.entries.push_back(metadata);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageMetadata> {
        self.entries.iter()
    }

    pub fn contains(&self, id: &MessageRef) -> bool {
        self.queued.contains(id)
    }

    /// Remove up to `max` entries from the back
    fn take_batch(&mut self, max: usize) -> Vec<MessageMetadata> {
        let mut batch = Vec::with_capacity(max.min(self.entries.len()));
        while batch.len() < max {
            match self.entries.pop_back() {
                Some(entry) => {
                    self.queued.remove(&entry.id);
                    batch.push(entry);
                }
                None => break,
            }
        }
        batch
    }

    fn restore(&mut self, batch: Vec<MessageMetadata>) {
        for entry in batch {
            self.push(entry);
        }
    }

    /// Delete up to `max_batch` queued messages with one batch call
    ///
    /// Returns the number deleted. On failure every entry of the batch is back
    /// in the queue before the error is returned.
    pub async fn drain(
        &mut self,
        client: &dyn MailboxClient,
        max_batch: usize,
        counters: &mut RunCounters,
    ) -> Result<usize> {
        let batch = self.take_batch(max_batch);
        if batch.is_empty() {
            return Ok(0);
        }

        for entry in &batch {
            info!(
                "delete {} {}",
                entry.header("Date").unwrap_or("-"),
                entry.header("Subject").unwrap_or("(no subject)")
            );
        }

        let ids: Vec<MessageRef> = batch.iter().map(|entry| entry.id.clone()).collect();
        match client.batch_delete(&ids).await {
            Ok(()) => {
                counters.deleted += ids.len() as u64;
                Ok(ids.len())
            }
            Err(e) => {
                warn!("Delete error, requeueing {} messages: {}", batch.len(), e);
                self.restore(batch);
                Err(e)
            }
        }
    }
}

impl From<VecDeque<MessageMetadata>> for DeletionQueue {
    fn from(entries: VecDeque<MessageMetadata>) -> Self {
        let mut queue = Self::new();
        for entry in entries {
            queue.push(entry);
        }
        queue
    }
}

impl From<DeletionQueue> for VecDeque<MessageMetadata> {
    fn from(queue: DeletionQueue) -> Self {
        queue.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailboxError;
    use crate::models::{FetchOutcome, ListFilter, ListPage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct DeleteClient {
        fail: bool,
        calls: Mutex<Vec<Vec<MessageRef>>>,
    }

    #[async_trait]
    impl MailboxClient for DeleteClient {
        async fn list_messages(&self, _: &ListFilter, _: Option<String>, _: u32) -> Result<ListPage> {
            unreachable!()
        }

        async fn batch_get_metadata(&self, _: &[MessageRef], _: &[String]) -> Result<Vec<FetchOutcome>> {
            unreachable!()
        }

        async fn batch_delete(&self, ids: &[MessageRef]) -> Result<()> {
            self.calls.lock().unwrap().push(ids.to_vec());
            if self.fail {
                Err(MailboxError::ServerError {
                    status: 500,
                    message: "backend error".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn queue_of(n: usize) -> DeletionQueue {
        let mut queue = DeletionQueue::new();
        for i in 0..n {
            queue.push(MessageMetadata::new(format!("m{}", i)).with_header("Subject", "autosave"));
        }
        queue
    }

    #[tokio::test]
    async fn test_drain_deletes_one_batch() {
        let client = DeleteClient::default();
        let mut queue = queue_of(5);
        let mut counters = RunCounters::default();

        let deleted = queue.drain(&client, 3, &mut counters).await.unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(counters.deleted, 3);
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_failure_restores_whole_batch() {
        let client = DeleteClient {
            fail: true,
            ..Default::default()
        };
        let mut queue = queue_of(4);
        let before: Vec<MessageRef> = queue.iter().map(|m| m.id.clone()).collect();
        let mut counters = RunCounters::default();

        assert!(queue.drain(&client, 3, &mut counters).await.is_err());

        assert_eq!(queue.len(), 4);
        assert_eq!(counters.deleted, 0);
        for id in &before {
            assert!(queue.contains(id));
        }
    }

    #[tokio::test]
    async fn test_drain_empty_queue_issues_no_call() {
        let client = DeleteClient::default();
        let mut queue = DeletionQueue::new();
        let mut counters = RunCounters::default();

        assert_eq!(queue.drain(&client, 45, &mut counters).await.unwrap(), 0);
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_push_rejects_queued_id() {
        let mut queue = DeletionQueue::new();
        assert!(queue.push(MessageMetadata::new("m1")));
        assert!(!queue.push(MessageMetadata::new("m1").with_header("Subject", "again")));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_drained_id_can_be_queued_again() {
        let client = DeleteClient::default();
        let mut queue = queue_of(1);
        let mut counters = RunCounters::default();

        queue.drain(&client, 45, &mut counters).await.unwrap();

        assert!(!queue.contains(&MessageRef::from("m0")));
        assert!(queue.push(MessageMetadata::new("m0")));
    }

    #[test]
    fn test_deserialized_queue_keeps_index() {
        let json = serde_json::to_string(&queue_of(3)).unwrap();
        assert!(json.starts_with('['));

        let mut loaded: DeletionQueue = serde_json::from_str(&json).unwrap();

        assert_eq!(loaded, queue_of(3));
        assert!(loaded.contains(&MessageRef::from("m2")));
        assert!(!loaded.push(MessageMetadata::new("m2")));
    }

    #[test]
    fn test_large_queue_membership() {
        let mut queue = queue_of(100_000);
        assert_eq!(queue.len(), 100_000);
        assert!(queue.contains(&MessageRef::from("m99999")));
        assert!(!queue.push(MessageMetadata::new("m50000")));
        assert_eq!(queue.take_batch(1000).len(), 1000);
        assert!(!queue.contains(&MessageRef::from("m99999")));
        assert_eq!(queue.len(), 99_000);
    }
}
