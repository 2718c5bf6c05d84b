//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use gmail_cleanup::classifier::{Classifier, APPLE_AUTO_SAVE_HEADER};
use gmail_cleanup::client::MailboxClient;
use gmail_cleanup::cursor::EnumerationCursor;
use gmail_cleanup::engine::{CleanupEngine, EngineSettings};
use gmail_cleanup::error::{MailboxError, Result};
use gmail_cleanup::models::{FetchOutcome, ListFilter, ListPage, MessageMetadata, MessageRef};
use mockall::mock;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Message carrying the autosave marker
pub fn marked(id: &str) -> MessageMetadata {
    MessageMetadata::new(id)
        .with_header("Subject", format!("Draft {}", id))
        .with_header("Date", "Mon, 1 Jan 2024 10:00:00 +0000")
        .with_header(APPLE_AUTO_SAVE_HEADER, "1")
}

/// Ordinary message without the marker
pub fn plain(id: &str) -> MessageMetadata {
    MessageMetadata::new(id)
        .with_header("Subject", format!("Mail {}", id))
        .with_header("Date", "Mon, 1 Jan 2024 10:00:00 +0000")
}

/// Copy of a message sharing `message_id` with others
pub fn copy_of(id: &str, message_id: &str, date: &str) -> MessageMetadata {
    MessageMetadata::new(id)
        .with_header("Subject", "Quarterly report")
        .with_header("Message-ID", message_id)
        .with_header("Date", date)
}

pub fn ids(values: &[&str]) -> BTreeSet<MessageRef> {
    values.iter().map(|v| MessageRef::from(*v)).collect()
}

/// Remote operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Get,
    Delete,
}

/// Error a scripted call fails with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    RateLimited,
    Unavailable,
    BadRequest,
    Forbidden,
}

impl Fault {
    pub fn to_error(self) -> MailboxError {
        match self {
            Fault::RateLimited => MailboxError::RateLimitExceeded { retry_after: 1 },
            Fault::Unavailable => MailboxError::ServerError {
                status: 503,
                message: "backend unavailable".to_string(),
            },
            Fault::BadRequest => MailboxError::BadRequest("precondition check failed".to_string()),
            Fault::Forbidden => MailboxError::Forbidden("insufficient permission".to_string()),
        }
    }
}

/// One recorded call against the fake
#[derive(Debug, Clone)]
pub struct Call {
    pub op: Op,
    pub at: Instant,
    pub ids: Vec<MessageRef>,
    pub page_token: Option<String>,
    pub ok: bool,
}

#[derive(Default)]
pub struct FakeState {
    pub pages: Vec<Vec<MessageRef>>,
    pub messages: HashMap<MessageRef, MessageMetadata>,
    /// Consumed one per call; `None` or an empty plan means success
    pub faults: HashMap<Op, VecDeque<Option<Fault>>>,
    /// Applied to every call of that kind
    pub persistent: HashMap<Op, Fault>,
    /// Remaining per-item failures
    pub item_faults: HashMap<MessageRef, u32>,
    pub item_always_fail: HashSet<MessageRef>,
    pub calls: Vec<Call>,
    pub listed: BTreeSet<MessageRef>,
    pub served: BTreeSet<MessageRef>,
    pub deleted: BTreeSet<MessageRef>,
}

/// Scripted in-memory mailbox
///
/// Pages are addressed by `page-N` tokens. Deleting an id twice succeeds.
#[derive(Default)]
pub struct FakeMailbox {
    state: Mutex<FakeState>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailbox whose listing returns `pages` in order
    pub fn with_pages(pages: Vec<Vec<MessageMetadata>>) -> Self {
        let fake = Self::new();
        {
            let mut state = fake.state();
            for page in pages {
                let mut refs = Vec::with_capacity(page.len());
                for metadata in page {
                    refs.push(metadata.id.clone());
                    state.messages.insert(metadata.id.clone(), metadata);
                }
                state.pages.push(refs);
            }
        }
        fake
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn script(&self, op: Op, plan: impl IntoIterator<Item = Option<Fault>>) {
        self.state().faults.entry(op).or_default().extend(plan);
    }

    pub fn fail_always(&self, op: Op, fault: Fault) {
        self.state().persistent.insert(op, fault);
    }

    pub fn fail_item(&self, id: &str, times: u32) {
        self.state().item_faults.insert(MessageRef::from(id), times);
    }

    pub fn fail_item_always(&self, id: &str) {
        self.state().item_always_fail.insert(MessageRef::from(id));
    }

    pub fn calls(&self, op: Op) -> Vec<Call> {
        self.state().calls.iter().filter(|c| c.op == op).cloned().collect()
    }

    pub fn call_count(&self, op: Op) -> usize {
        self.calls(op).len()
    }

    /// Admission times of the limiter-gated calls (list and batch get)
    ///
    /// Batch deletes are left out: they are not admitted themselves but ride
    /// on an iteration that was, at most one per iteration.
    pub fn gated_call_times(&self) -> Vec<Instant> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op != Op::Delete)
            .map(|c| c.at)
            .collect()
    }

    pub fn deleted(&self) -> BTreeSet<MessageRef> {
        self.state().deleted.clone()
    }

    pub fn listed(&self) -> BTreeSet<MessageRef> {
        self.state().listed.clone()
    }

    pub fn served(&self) -> BTreeSet<MessageRef> {
        self.state().served.clone()
    }

    /// Id lists of successful delete calls
    pub fn delete_batches(&self) -> Vec<Vec<MessageRef>> {
        self.calls(Op::Delete)
            .into_iter()
            .filter(|c| c.ok)
            .map(|c| c.ids)
            .collect()
    }

    fn next_fault(state: &mut FakeState, op: Op) -> Option<Fault> {
        if let Some(fault) = state.persistent.get(&op) {
            return Some(*fault);
        }
        state.faults.get_mut(&op).and_then(|plan| plan.pop_front()).flatten()
    }

    fn record(state: &mut FakeState, op: Op, ids: Vec<MessageRef>, page_token: Option<String>, ok: bool) {
        state.calls.push(Call {
            op,
            at: Instant::now(),
            ids,
            page_token,
            ok,
        });
    }
}

fn page_index(token: Option<&str>) -> usize {
    token
        .and_then(|t| t.strip_prefix("page-"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    async fn list_messages(&self, _filter: &ListFilter, page_token: Option<String>, _page_size: u32) -> Result<ListPage> {
        let mut guard = self.state();
        let state = &mut *guard;
        if let Some(fault) = Self::next_fault(state, Op::List) {
            Self::record(state, Op::List, Vec::new(), page_token, false);
            return Err(fault.to_error());
        }

        let index = page_index(page_token.as_deref());
        let ids = state.pages.get(index).cloned().unwrap_or_default();
        let next_page_token = if index + 1 < state.pages.len() {
            Some(format!("page-{}", index + 1))
        } else {
            None
        };
        state.listed.extend(ids.iter().cloned());
        Self::record(state, Op::List, ids.clone(), page_token, true);

        Ok(ListPage { ids, next_page_token })
    }

    async fn batch_get_metadata(&self, ids: &[MessageRef], _header_allowlist: &[String]) -> Result<Vec<FetchOutcome>> {
        let mut guard = self.state();
        let state = &mut *guard;
        if let Some(fault) = Self::next_fault(state, Op::Get) {
            Self::record(state, Op::Get, ids.to_vec(), None, false);
            return Err(fault.to_error());
        }

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = if state.item_always_fail.contains(id) {
                Err(Fault::RateLimited.to_error())
            } else if let Some(remaining) = state.item_faults.get_mut(id).filter(|n| **n > 0) {
                *remaining -= 1;
                Err(Fault::RateLimited.to_error())
            } else if let Some(metadata) = state.messages.get(id).cloned() {
                state.served.insert(id.clone());
                Ok(metadata)
            } else {
                Err(MailboxError::MessageNotFound(id.to_string()))
            };
            outcomes.push((id.clone(), outcome));
        }
        Self::record(state, Op::Get, ids.to_vec(), None, true);

        Ok(outcomes)
    }

    async fn batch_delete(&self, ids: &[MessageRef]) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        if let Some(fault) = Self::next_fault(state, Op::Delete) {
            Self::record(state, Op::Delete, ids.to_vec(), None, false);
            return Err(fault.to_error());
        }

        state.deleted.extend(ids.iter().cloned());
        Self::record(state, Op::Delete, ids.to_vec(), None, true);
        Ok(())
    }
}

mock! {
    pub Mailbox {}

    #[async_trait::async_trait]
    impl MailboxClient for Mailbox {
        async fn list_messages(&self, filter: &ListFilter, page_token: Option<String>, page_size: u32) -> Result<ListPage>;
        async fn batch_get_metadata(&self, ids: &[MessageRef], header_allowlist: &[String]) -> Result<Vec<FetchOutcome>>;
        async fn batch_delete(&self, ids: &[MessageRef]) -> Result<()>;
    }
}

/// Defaults with a fast limiter; tests run on paused time anyway
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        cooldown: Duration::from_millis(200),
        ..EngineSettings::default()
    }
}

pub fn engine_for(
    client: Box<dyn MailboxClient>,
    classifier: Box<dyn Classifier>,
    settings: EngineSettings,
) -> CleanupEngine {
    CleanupEngine::new(
        client,
        classifier,
        EnumerationCursor::new(ListFilter::query("-label:INBOX"), 100),
        settings,
    )
}

pub fn engine_on(fake: &Arc<FakeMailbox>, classifier: Box<dyn Classifier>, settings: EngineSettings) -> CleanupEngine {
    engine_for(Box::new(Arc::clone(fake)), classifier, settings)
}
