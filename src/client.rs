//! Remote mailbox client: the three calls the cleanup engine issues

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use google_gmail1::api::{BatchDeleteMessagesRequest, Message};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::GmailHub;
use crate::error::{MailboxError, Result};
use crate::models::{FetchOutcome, ListFilter, ListPage, MessageMetadata, MessageRef};

const MAIL_SCOPE: &str = "https://mail.google.com/";
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations against the remote store that the engine depends on
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// List one page of message ids matching `filter`
    async fn list_messages(
        &self,
        filter: &ListFilter,
        page_token: Option<String>,
        page_size: u32,
    ) -> Result<ListPage>;

    /// Fetch header metadata for a batch of messages
    ///
    /// A call-level `Err` means the whole batch was rejected. Otherwise every
    /// element carries its own outcome.
    async fn batch_get_metadata(
        &self,
        ids: &[MessageRef],
        header_allowlist: &[String],
    ) -> Result<Vec<FetchOutcome>>;

    /// Delete a batch of messages, all or nothing
    ///
    /// Deleting an id that no longer exists is a success.
    async fn batch_delete(&self, ids: &[MessageRef]) -> Result<()>;
}

#[async_trait]
impl<T: MailboxClient + ?Sized> MailboxClient for Arc<T> {
    async fn list_messages(
        &self,
        filter: &ListFilter,
        page_token: Option<String>,
        page_size: u32,
    ) -> Result<ListPage> {
        self.as_ref().list_messages(filter, page_token, page_size).await
    }

    async fn batch_get_metadata(
        &self,
        ids: &[MessageRef],
        header_allowlist: &[String],
    ) -> Result<Vec<FetchOutcome>> {
        self.as_ref().batch_get_metadata(ids, header_allowlist).await
    }

    async fn batch_delete(&self, ids: &[MessageRef]) -> Result<()> {
        self.as_ref().batch_delete(ids).await
    }
}

/// Gmail-backed client for user `me`
pub struct GmailMailboxClient {
    hub: GmailHub,
    max_concurrent: usize,
}

impl GmailMailboxClient {
    /// # Arguments
    /// * `hub` - Authenticated Gmail hub
    /// * `max_concurrent` - Parallel `messages.get` requests inside one batch
    pub fn new(hub: GmailHub, max_concurrent: usize) -> Self {
        Self {
            hub,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Resolve a label name such as `[Gmail]/All Mail` to its id
    pub async fn find_label_id(&self, name: &str) -> Result<Option<String>> {
        let (_, response) = with_timeout("labels.list", async {
            self.hub
                .users()
                .labels_list("me")
                .add_scope(MAIL_SCOPE)
                .doit()
                .await
                .map_err(MailboxError::from)
        })
        .await?;

        let labels = response.labels.unwrap_or_default();
        if labels.is_empty() {
            return Err(MailboxError::LabelError("No labels found".to_string()));
        }
        debug!("Fetched {} labels", labels.len());

        Ok(labels
            .into_iter()
            .find(|label| label.name.as_deref() == Some(name))
            .and_then(|label| label.id))
    }

    async fn get_metadata(&self, id: &MessageRef, header_allowlist: &[String]) -> Result<MessageMetadata> {
        let mut call = self
            .hub
            .users()
            .messages_get("me", id.as_str())
            .format("metadata");
        for header in header_allowlist {
            call = call.add_metadata_headers(header);
        }

        let (_, message) = with_timeout("messages.get", async {
            call.add_scope(MAIL_SCOPE).doit().await.map_err(MailboxError::from)
        })
        .await?;

        parse_message_metadata(message)
    }
}

/// Run a remote call with the standard timeout
async fn with_timeout<T, F>(operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(CALL_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Gmail API {} call timed out after {:?}", operation, CALL_TIMEOUT);
            Err(MailboxError::NetworkError(format!(
                "{} timed out after {:?}",
                operation, CALL_TIMEOUT
            )))
        }
    }
}

/// Parse a Gmail API Message into MessageMetadata
fn parse_message_metadata(msg: Message) -> Result<MessageMetadata> {
    let id = msg
        .id
        .ok_or_else(|| MailboxError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let mut metadata = MessageMetadata::new(id);
    metadata.size_hint = msg.size_estimate.and_then(|size| u64::try_from(size).ok());

    let headers = msg
        .payload
        .and_then(|payload| payload.headers)
        .unwrap_or_default();
    for header in headers {
        if let (Some(name), Some(value)) = (header.name, header.value) {
            metadata.headers.entry(name).or_insert(value);
        }
    }

    Ok(metadata)
}

#[async_trait]
impl MailboxClient for GmailMailboxClient {
    async fn list_messages(
        &self,
        filter: &ListFilter,
        page_token: Option<String>,
        page_size: u32,
    ) -> Result<ListPage> {
        let mut call = self.hub.users().messages_list("me").max_results(page_size);
        if let Some(query) = filter.query.as_deref() {
            call = call.q(query);
        }
        for label_id in &filter.label_ids {
            call = call.add_label_ids(label_id);
        }
        if let Some(token) = page_token.as_deref() {
            call = call.page_token(token);
        }

        let (_, response) = with_timeout("messages.list", async {
            call.add_scope(MAIL_SCOPE).doit().await.map_err(MailboxError::from)
        })
        .await?;

        let ids = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|msg_ref| msg_ref.id.map(MessageRef::from))
            .collect();

        Ok(ListPage {
            ids,
            next_page_token: response.next_page_token.filter(|token| !token.is_empty()),
        })
    }

    async fn batch_get_metadata(
        &self,
        ids: &[MessageRef],
        header_allowlist: &[String],
    ) -> Result<Vec<FetchOutcome>> {
        let outcomes: Vec<FetchOutcome> = stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let result = self.get_metadata(&id, header_allowlist).await;
                (id, result)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        // A batch where nothing got through is a connection problem, not a
        // set of per-message problems.
        let all_disconnected = !outcomes.is_empty()
            && outcomes
                .iter()
                .all(|(_, result)| matches!(result, Err(MailboxError::NetworkError(_))));
        if all_disconnected {
            let message = outcomes
                .into_iter()
                .find_map(|(_, result)| result.err())
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(MailboxError::NetworkError(message));
        }

        Ok(outcomes)
    }

    async fn batch_delete(&self, ids: &[MessageRef]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let request = BatchDeleteMessagesRequest {
            ids: Some(ids.iter().map(|id| id.as_str().to_string()).collect()),
        };

        let result = with_timeout("messages.batchDelete", async {
            self.hub
                .users()
                .messages_batch_delete(request, "me")
                .add_scope(MAIL_SCOPE)
                .doit()
                .await
                .map_err(MailboxError::from)
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            // Already gone
            Err(MailboxError::MessageNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Forwards reads, logs deletes instead of issuing them
pub struct DryRunMailboxClient<C> {
    inner: C,
}

impl<C> DryRunMailboxClient<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: MailboxClient> MailboxClient for DryRunMailboxClient<C> {
    async fn list_messages(
        &self,
        filter: &ListFilter,
        page_token: Option<String>,
        page_size: u32,
    ) -> Result<ListPage> {
        self.inner.list_messages(filter, page_token, page_size).await
    }

    async fn batch_get_metadata(
        &self,
        ids: &[MessageRef],
        header_allowlist: &[String],
    ) -> Result<Vec<FetchOutcome>> {
        self.inner.batch_get_metadata(ids, header_allowlist).await
    }

    async fn batch_delete(&self, ids: &[MessageRef]) -> Result<()> {
        info!("[dry run] would delete {} messages", ids.len());
        Ok(())
    }
}
