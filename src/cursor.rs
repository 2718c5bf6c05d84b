//! Pagination over the remote listing and the set of ids awaiting a fetch

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::client::MailboxClient;
use crate::error::Result;
use crate::models::{ListFilter, MessageRef};

/// Where the listing stands
///
/// `Exhausted` only means no pages remain; pending fetches and queued
/// deletes may still be outstanding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "token", rename_all = "snake_case")]
pub enum CursorPosition {
    #[default]
    NotStarted,
    Next(String),
    Exhausted,
}

impl CursorPosition {
    pub fn has_more(&self) -> bool {
        !matches!(self, CursorPosition::Exhausted)
    }

    /// Token to send with the next listing call
    pub fn token(&self) -> Option<String> {
        match self {
            CursorPosition::Next(token) => Some(token.clone()),
            _ => None,
        }
    }
}

/// Ids discovered by listing and not yet resolved by a fetch
///
/// Ordered so batches are drawn deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingSet {
    ids: BTreeSet<MessageRef>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already pending
    pub fn insert(&mut self, id: MessageRef) -> bool {
        self.ids.insert(id)
    }

    /// Up to `limit` ids for the next fetch; they stay pending until resolved
    pub fn peek_batch(&self, limit: usize) -> Vec<MessageRef> {
        self.ids.iter().take(limit).cloned().collect()
    }

    /// Remove an id after its fetch completed
    pub fn resolve(&mut self, id: &MessageRef) -> bool {
        self.ids.remove(id)
    }

    pub fn contains(&self, id: &MessageRef) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageRef> {
        self.ids.iter()
    }
}

/// Result of one listing step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStep {
    /// Ids on the page that were not already pending
    pub ids: Vec<MessageRef>,
    /// Ids on the page, including ones already pending
    pub received: usize,
    pub has_more: bool,
}

/// Issues one listing request per step against a fixed filter and page size
#[derive(Debug, Clone)]
pub struct EnumerationCursor {
    filter: ListFilter,
    page_size: u32,
}

impl EnumerationCursor {
    pub fn new(filter: ListFilter, page_size: u32) -> Self {
        Self { filter, page_size }
    }

    pub fn filter(&self) -> &ListFilter {
        &self.filter
    }

    /// Fetch the next page and merge its ids into `pending`
    ///
    /// On error neither `position` nor `pending` is touched, so the same page
    /// is requested again next time.
    pub async fn next(
        &self,
        client: &dyn MailboxClient,
        position: &mut CursorPosition,
        pending: &mut PendingSet,
    ) -> Result<PageStep> {
        let page = client
            .list_messages(&self.filter, position.token(), self.page_size)
            .await?;

        let received = page.ids.len();
        let ids: Vec<MessageRef> = page
            .ids
            .into_iter()
            .filter(|id| pending.insert(id.clone()))
            .collect();

        *position = match page.next_page_token {
            Some(token) => CursorPosition::Next(token),
            None => CursorPosition::Exhausted,
        };

        debug!(
            "Listed page: {} ids ({} new), more pages: {}",
            received,
            ids.len(),
            position.has_more()
        );

        Ok(PageStep {
            ids,
            received,
            has_more: position.has_more(),
        })
    }
}
