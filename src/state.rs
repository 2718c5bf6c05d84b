use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::classifier::DuplicateGroups;
use crate::cursor::{CursorPosition, PendingSet};
use crate::error::{MailboxError, Result};
use crate::models::{ListFilter, MessageRef, RunCounters};
use crate::queue::DeletionQueue;

/// What a run deletes and which listing it walks
///
/// Fixed for the life of a checkpoint: the cursor token belongs to `filter`,
/// and queued messages were judged under `policy` and `parameter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScope {
    pub policy: String,
    /// Policy setting that changes eligibility, such as the marker header
    #[serde(default)]
    pub parameter: Option<String>,
    pub filter: ListFilter,
}

impl RunScope {
    pub fn new(policy: impl Into<String>, parameter: Option<String>, filter: ListFilter) -> Self {
        Self {
            policy: policy.into(),
            parameter,
            filter,
        }
    }

    /// Header names compare case-insensitively
    fn same_parameter(&self, other: &RunScope) -> bool {
        match (&self.parameter, &other.parameter) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Everything a cleanup run owns, in one serializable value
///
/// The engine mutates this in place; a checkpoint is this value written as
/// JSON, and resuming is loading it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Policy and listing this state was built under
    #[serde(default)]
    pub scope: Option<RunScope>,
    pub cursor: CursorPosition,
    pub pending: PendingSet,
    pub queue: DeletionQueue,
    #[serde(default)]
    pub groups: DuplicateGroups,
    pub counters: RunCounters,
    /// Ignorable fetch failures per id
    #[serde(default)]
    pub item_failures: BTreeMap<MessageRef, u32>,
    /// Ids dropped after too many failed fetches; never deleted
    #[serde(default)]
    pub abandoned: BTreeSet<MessageRef>,
    /// Policy finalization already ran
    #[serde(default)]
    pub finalized: bool,
    pub completed: bool,
    pub checkpoint_count: usize,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
            scope: None,
            cursor: CursorPosition::NotStarted,
            pending: PendingSet::new(),
            queue: DeletionQueue::new(),
            groups: DuplicateGroups::new(),
            counters: RunCounters::default(),
            item_failures: BTreeMap::new(),
            abandoned: BTreeSet::new(),
            finalized: false,
            completed: false,
            checkpoint_count: 0,
        }
    }

    /// Record the scope on a fresh state, or check it on a resumed one
    pub fn bind_scope(&mut self, scope: RunScope) -> Result<()> {
        let existing = match &self.scope {
            None => {
                self.scope = Some(scope);
                return Ok(());
            }
            Some(existing) => existing,
        };

        if existing.policy != scope.policy {
            return Err(MailboxError::StateError(format!(
                "Checkpoint was created with policy '{}', cannot resume with '{}'",
                existing.policy, scope.policy
            )));
        }
        if !existing.same_parameter(&scope) {
            return Err(MailboxError::StateError(format!(
                "Checkpoint was created with {} setting '{}', cannot resume with '{}'",
                existing.policy,
                existing.parameter.as_deref().unwrap_or("-"),
                scope.parameter.as_deref().unwrap_or("-")
            )));
        }
        if existing.filter != scope.filter {
            return Err(MailboxError::StateError(format!(
                "Checkpoint was created for listing '{}', cannot resume with '{}'",
                existing.filter, scope.filter
            )));
        }
        Ok(())
    }

    /// Name of the policy the state is bound to
    pub fn policy_name(&self) -> Option<&str> {
        self.scope.as_ref().map(|scope| scope.policy.as_str())
    }

    /// No pages left, nothing pending, nothing queued, policy finalized
    pub fn is_drained(&self) -> bool {
        !self.cursor.has_more() && self.pending.is_empty() && self.queue.is_empty() && self.finalized
    }

    /// Count an ignorable fetch failure for `id`, returning the new total
    pub fn record_item_failure(&mut self, id: &MessageRef) -> u32 {
        let failures = self.item_failures.entry(id.clone()).or_insert(0);
        *failures += 1;
        *failures
    }

    /// Give up on `id`: out of the pending set, never deleted
    pub fn abandon(&mut self, id: &MessageRef) {
        self.pending.resolve(id);
        self.item_failures.remove(id);
        if self.abandoned.insert(id.clone()) {
            self.counters.skipped += 1;
        }
    }

    /// Save state to disk
    ///
    /// Writes to a sibling temp file and renames it over the target, so a
    /// crash mid-write leaves the previous checkpoint readable.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        tracing::debug!("Saved engine state to {:?}", path);
        Ok(())
    }

    /// Load state from disk, or start fresh if there is none
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No existing state file found, starting fresh");
            return Ok(Self::new());
        }

        let json = tokio::fs::read_to_string(path).await?;
        let state: Self = serde_json::from_str(&json)?;

        tracing::info!(
            "Loaded engine state: run_id={}, pending={}, queued={}, {}",
            state.run_id,
            state.pending.len(),
            state.queue.len(),
            state.counters
        );

        Ok(state)
    }

    /// Save state as a numbered checkpoint
    pub async fn checkpoint(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        self.checkpoint_count += 1;
        self.save(path).await?;
        tracing::debug!(
            "Checkpoint #{}: pending={}, queued={}, {}",
            self.checkpoint_count,
            self.pending.len(),
            self.queue.len(),
            self.counters
        );
        Ok(())
    }

    /// Check if the run can be resumed
    pub fn can_resume(&self) -> bool {
        !self.completed
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DuplicateEntry;
    use crate::models::MessageMetadata;
    use tempfile::TempDir;

    #[test]
    fn test_new_state_is_not_drained() {
        let state = EngineState::new();
        assert!(!state.is_drained());
        assert!(state.can_resume());
        assert_eq!(state.counters, RunCounters::default());
    }

    #[test]
    fn test_drained_requires_finalization() {
        let mut state = EngineState::new();
        state.cursor = CursorPosition::Exhausted;
        assert!(!state.is_drained());

        state.finalized = true;
        assert!(state.is_drained());

        state.pending.insert("m1".into());
        assert!(!state.is_drained());
    }

    fn marker_scope(header: &str, query: &str) -> RunScope {
        RunScope::new("marker_header", Some(header.to_string()), ListFilter::query(query))
    }

    #[test]
    fn test_bind_scope() {
        let mut state = EngineState::new();
        state.bind_scope(marker_scope("X-Apple-Auto-Saved", "-label:INBOX")).unwrap();
        state.bind_scope(marker_scope("X-Apple-Auto-Saved", "-label:INBOX")).unwrap();
        // Header names are case-insensitive
        state.bind_scope(marker_scope("x-apple-auto-saved", "-label:INBOX")).unwrap();

        let other_policy = RunScope::new("duplicate_message_id", None, ListFilter::query("-label:INBOX"));
        let err = state.bind_scope(other_policy).unwrap_err();
        assert!(matches!(err, MailboxError::StateError(_)));
        assert_eq!(state.policy_name(), Some("marker_header"));
    }

    #[test]
    fn test_bind_scope_refuses_other_header() {
        let mut state = EngineState::new();
        state.bind_scope(marker_scope("X-Apple-Auto-Saved", "-label:INBOX")).unwrap();

        let err = state.bind_scope(marker_scope("X-Draft-Copy", "-label:INBOX")).unwrap_err();

        assert!(err.to_string().contains("X-Draft-Copy"));
        assert_eq!(state.scope, Some(marker_scope("X-Apple-Auto-Saved", "-label:INBOX")));
    }

    #[test]
    fn test_bind_scope_refuses_other_filter() {
        let mut state = EngineState::new();
        state.bind_scope(marker_scope("X-Apple-Auto-Saved", "-label:INBOX")).unwrap();

        assert!(state.bind_scope(marker_scope("X-Apple-Auto-Saved", "in:sent")).is_err());

        let labelled = RunScope::new(
            "marker_header",
            Some("X-Apple-Auto-Saved".to_string()),
            ListFilter {
                query: Some("-label:INBOX".to_string()),
                label_ids: vec!["Label_7".to_string()],
            },
        );
        assert!(state.bind_scope(labelled).is_err());
    }

    #[test]
    fn test_abandon_counts_once() {
        let mut state = EngineState::new();
        let id = MessageRef::from("m1");
        state.pending.insert(id.clone());

        assert_eq!(state.record_item_failure(&id), 1);
        assert_eq!(state.record_item_failure(&id), 2);

        state.abandon(&id);
        state.abandon(&id);

        assert!(!state.pending.contains(&id));
        assert!(state.abandoned.contains(&id));
        assert!(state.item_failures.is_empty());
        assert_eq!(state.counters.skipped, 1);
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("state.json");

        let mut state = EngineState::new();
        state
            .bind_scope(RunScope::new("duplicate_message_id", None, ListFilter::query("-label:INBOX")))
            .unwrap();
        state.cursor = CursorPosition::Next("token-2".to_string());
        state.pending.insert("p1".into());
        state.queue.push(MessageMetadata::new("q1").with_header("Subject", "draft"));
        state.groups.insert(
            "<a@example.com>",
            DuplicateEntry {
                date: None,
                metadata: MessageMetadata::new("g1"),
            },
        );
        state.counters.listed = 7;
        state.counters.deleted = 3;
        state.record_item_failure(&"p1".into());

        state.checkpoint(&path).await.unwrap();
        let loaded = EngineState::load(&path).await.unwrap();

        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.scope, state.scope);
        assert_eq!(loaded.cursor, state.cursor);
        assert_eq!(loaded.pending, state.pending);
        assert_eq!(loaded.queue, state.queue);
        assert_eq!(loaded.groups, state.groups);
        assert_eq!(loaded.counters, state.counters);
        assert_eq!(loaded.item_failures.get(&MessageRef::from("p1")), Some(&1));
        assert_eq!(loaded.checkpoint_count, 1);
    }

    #[tokio::test]
    async fn test_load_missing_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let state = EngineState::load(&dir.path().join("missing.json")).await.unwrap();
        assert_eq!(state.cursor, CursorPosition::NotStarted);
        assert!(state.scope.is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = EngineState::load(&path).await.unwrap_err();
        assert!(matches!(err, MailboxError::SerializationError(_)));
    }
}
