//! Deletion policies
//!
//! A classifier looks at the metadata of one message and decides whether it
//! is eligible for deletion. Two policies exist:
//!
//! - [`MarkerHeaderPolicy`] decides on arrival: a message carrying the marker
//!   header (Apple Mail's `X-Apple-Auto-Saved` by default) goes straight to
//!   the deletion queue.
//! - [`DuplicateMessageIdPolicy`] defers every decision. It groups messages by
//!   their `Message-ID` header and only after the whole listing has been
//!   fetched marks all but the newest member of each group as eligible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::models::MessageMetadata;

pub const APPLE_AUTO_SAVE_HEADER: &str = "X-Apple-Auto-Saved";
pub const MESSAGE_ID_HEADER: &str = "Message-ID";
pub const DATE_HEADER: &str = "Date";

/// What the classifier decided for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Eligible now, queue for deletion
    Delete,
    /// Not eligible
    Keep,
    /// Held until [`Classifier::finalize`]
    Deferred,
}

/// A pluggable deletion policy
///
/// Policies never talk to the remote service. Any state a policy needs lives
/// in the [`DuplicateGroups`] owned by the engine state, so it is checkpointed
/// with everything else.
pub trait Classifier: Send + Sync {
    /// Stable name, recorded in checkpoints
    fn name(&self) -> &'static str;

    /// Setting that changes which messages are eligible, recorded in checkpoints
    fn parameter(&self) -> Option<String> {
        None
    }

    /// Headers the metadata fetch must request for this policy
    fn required_headers(&self) -> Vec<String>;

    /// Classify one message
    fn classify(&self, metadata: MessageMetadata, groups: &mut DuplicateGroups) -> Classified;

    /// Messages that became eligible once enumeration is complete
    fn finalize(&self, _groups: &mut DuplicateGroups) -> Vec<MessageMetadata> {
        Vec::new()
    }
}

/// Verdict plus the metadata to enqueue when the verdict is `Delete`
#[derive(Debug)]
pub struct Classified {
    pub verdict: Verdict,
    pub eligible: Option<MessageMetadata>,
}

impl Classified {
    fn delete(metadata: MessageMetadata) -> Self {
        Self {
            verdict: Verdict::Delete,
            eligible: Some(metadata),
        }
    }

    fn keep() -> Self {
        Self {
            verdict: Verdict::Keep,
            eligible: None,
        }
    }

    fn deferred() -> Self {
        Self {
            verdict: Verdict::Deferred,
            eligible: None,
        }
    }
}

/// Eligible iff the configured header is present, whatever its value
#[derive(Debug, Clone)]
pub struct MarkerHeaderPolicy {
    header_name: String,
}

impl MarkerHeaderPolicy {
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    pub fn accepts(&self, metadata: &MessageMetadata) -> bool {
        metadata.has_header(&self.header_name)
    }
}

impl Default for MarkerHeaderPolicy {
    fn default() -> Self {
        Self::new(APPLE_AUTO_SAVE_HEADER)
    }
}

impl Classifier for MarkerHeaderPolicy {
    fn name(&self) -> &'static str {
        "marker_header"
    }

    fn parameter(&self) -> Option<String> {
        Some(self.header_name.clone())
    }

    fn required_headers(&self) -> Vec<String> {
        vec![self.header_name.clone()]
    }

    fn classify(&self, metadata: MessageMetadata, _groups: &mut DuplicateGroups) -> Classified {
        if self.accepts(&metadata) {
            Classified::delete(metadata)
        } else {
            Classified::keep()
        }
    }
}

/// One member of a duplicate group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateEntry {
    /// Parsed `Date` header; `None` sorts before every dated entry
    pub date: Option<DateTime<Utc>>,
    pub metadata: MessageMetadata,
}

/// Messages grouped by their `Message-ID` header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DuplicateGroups {
    groups: BTreeMap<String, Vec<DuplicateEntry>>,
}

impl DuplicateGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message to its group, keeping the group sorted oldest first
    ///
    /// Returns false if the same remote id is already in the group.
    pub fn insert(&mut self, message_id: &str, entry: DuplicateEntry) -> bool {
        let group = self.groups.entry(message_id.to_string()).or_default();
        if group.iter().any(|existing| existing.metadata.id == entry.metadata.id) {
            return false;
        }
        let position = group.partition_point(|existing| sort_key(existing) <= sort_key(&entry));
        group.insert(position, entry);
        true
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, message_id: &str) -> Option<&[DuplicateEntry]> {
        self.groups.get(message_id).map(Vec::as_slice)
    }

    /// Number of messages held across all groups
    pub fn message_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Empty the groups, returning every member except the newest of each
    fn take_superseded(&mut self) -> Vec<MessageMetadata> {
        let groups = std::mem::take(&mut self.groups);
        let mut superseded = Vec::new();
        for (message_id, mut entries) in groups {
            if entries.len() < 2 {
                continue;
            }
            let kept = entries.pop();
            debug!(
                "Message-ID {}: keeping {}, {} superseded",
                message_id,
                kept.map(|entry| entry.metadata.id.to_string()).unwrap_or_default(),
                entries.len()
            );
            superseded.extend(entries.into_iter().map(|entry| entry.metadata));
        }
        superseded
    }
}

fn sort_key(entry: &DuplicateEntry) -> (Option<DateTime<Utc>>, &str) {
    (entry.date, entry.metadata.id.as_str())
}

/// Keep only the newest copy of each Message-ID
#[derive(Debug, Clone, Default)]
pub struct DuplicateMessageIdPolicy;

impl DuplicateMessageIdPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl Classifier for DuplicateMessageIdPolicy {
    fn name(&self) -> &'static str {
        "duplicate_message_id"
    }

    fn required_headers(&self) -> Vec<String> {
        vec![MESSAGE_ID_HEADER.to_string(), DATE_HEADER.to_string()]
    }

    fn classify(&self, metadata: MessageMetadata, groups: &mut DuplicateGroups) -> Classified {
        let message_id = match metadata.header(MESSAGE_ID_HEADER) {
            Some(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => return Classified::keep(),
        };

        let date = metadata.header(DATE_HEADER).and_then(parse_email_date);
        groups.insert(&message_id, DuplicateEntry { date, metadata });
        Classified::deferred()
    }

    fn finalize(&self, groups: &mut DuplicateGroups) -> Vec<MessageMetadata> {
        groups.take_superseded()
    }
}

/// Parse a `Date` header (RFC 2822, falling back to RFC 3339)
pub fn parse_email_date(date_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str.trim()) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(date_str.trim()) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
