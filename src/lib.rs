//! Gmail Cleanup
//!
//! Bulk removal of unwanted messages from a Gmail mailbox: autosaved drafts
//! flagged by a marker header, or duplicate copies of the same message.
//!
//! # Overview
//!
//! The [`engine::CleanupEngine`] drives one loop until the mailbox is drained:
//! - **Listing**: pages through `messages.list` with a fixed query or label
//! - **Fetching**: batched metadata fetches for ids still pending
//! - **Classifying**: a pluggable [`classifier::Classifier`] decides eligibility
//! - **Deleting**: eligible messages are removed with `messages.batchDelete`
//!
//! Every outbound list and fetch passes a shared sliding-window
//! [`rate_limiter::RateLimiter`] so the per-user quota is never exceeded.
//! Transient remote failures are absorbed up to a per-phase ceiling, and the
//! whole run state can be checkpointed and resumed.
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_cleanup::client::GmailMailboxClient;
//! use gmail_cleanup::cursor::EnumerationCursor;
//! use gmail_cleanup::engine::{CleanupEngine, EngineSettings};
//! use gmail_cleanup::models::ListFilter;
//! use gmail_cleanup::shutdown::ShutdownListener;
//! use gmail_cleanup::{auth, Config, EngineState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!
//!     let hub = auth::initialize_gmail_hub(
//!         "credentials.json".as_ref(),
//!         ".gmail-cleanup/token.json".as_ref(),
//!     )
//!     .await?;
//!     let client = GmailMailboxClient::new(hub, config.limits.max_concurrent_fetches);
//!
//!     let engine = CleanupEngine::new(
//!         Box::new(client),
//!         config.policy.build(),
//!         EnumerationCursor::new(ListFilter::query("-label:INBOX"), 100),
//!         EngineSettings::from(&config),
//!     );
//!
//!     let mut state = EngineState::new();
//!     let report = engine.run(&mut state, &ShutdownListener::never()).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`client`] - Remote mailbox trait, Gmail implementation, dry-run wrapper
//! - [`classifier`] - Deletion policies
//! - [`cli`] - Command-line interface and run wiring
//! - [`config`] - Configuration management
//! - [`cursor`] - Listing pagination and the pending set
//! - [`engine`] - The cleanup loop
//! - [`error`] - Error types and result aliases
//! - [`models`] - Core data structures
//! - [`queue`] - Deletion queue
//! - [`rate_limiter`] - Client-side admission gate
//! - [`retry`] - Backoff over client-side throttling
//! - [`shutdown`] - Cancellation
//! - [`state`] - Run state with checkpointing

pub mod auth;
pub mod classifier;
pub mod cli;
pub mod client;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod models;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod shutdown;
pub mod state;

// Re-export commonly used types for convenience
pub use error::{ErrorClass, MailboxError, Phase, Result};

// Core data models
pub use models::{FetchOutcome, ListFilter, ListPage, MessageMetadata, MessageRef, RunCounters};

// Policies
pub use classifier::{
    Classifier, DuplicateGroups, DuplicateMessageIdPolicy, MarkerHeaderPolicy, Verdict,
};

// Config types
pub use config::{Config, LimitsConfig, PolicyKind};

// Client traits
pub use client::{DryRunMailboxClient, GmailMailboxClient, MailboxClient};

// Engine
pub use engine::{CleanupEngine, EngineSettings, RunOutcome, RunReport};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use state::{EngineState, RunScope};
