use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;

/// Opaque identifier of a remote message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageRef(String);

impl MessageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageRef {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageRef {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Headers of one message as returned by a metadata fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: MessageRef,
    /// Header name (as returned, case preserved) to value
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

impl MessageMetadata {
    pub fn new(id: impl Into<MessageRef>) -> Self {
        Self {
            id: id.into(),
            headers: BTreeMap::new(),
            size_hint: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header value
    ///
    /// An exact name match wins; otherwise the first ASCII case-insensitive
    /// match is returned (the remote side reports `Message-Id` for some senders).
    pub fn header(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.headers.get(name) {
            return Some(value);
        }
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

/// Fixed filter applied to every listing call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub query: Option<String>,
    pub label_ids: Vec<String>,
}

impl ListFilter {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            label_ids: Vec::new(),
        }
    }

    pub fn label(label_id: impl Into<String>) -> Self {
        Self {
            query: None,
            label_ids: vec![label_id.into()],
        }
    }
}

impl fmt::Display for ListFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.query, self.label_ids.is_empty()) {
            (Some(q), true) => write!(f, "q={}", q),
            (Some(q), false) => write!(f, "q={} labels={}", q, self.label_ids.join(",")),
            (None, false) => write!(f, "labels={}", self.label_ids.join(",")),
            (None, true) => write!(f, "all messages"),
        }
    }
}

/// One page of a remote listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub ids: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

/// Per-item result of a batched metadata fetch
pub type FetchOutcome = (MessageRef, Result<MessageMetadata>);

/// Process-lifetime counters, used for reporting only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Distinct ids added to the pending set by listing
    pub listed: u64,
    /// Messages whose metadata reached the classifier
    pub classified: u64,
    /// Messages removed by successful batch deletes
    pub deleted: u64,
    /// Ids given up on after repeated ignorable fetch failures
    pub skipped: u64,
}

impl fmt::Display for RunCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listed: {} classified: {} deleted: {} skipped: {}",
            self.listed, self.classified, self.deleted, self.skipped
        )
    }
}
