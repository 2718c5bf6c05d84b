//! The cleanup loop
//!
//! One iteration lists at most one page, fetches at most one batch of pending
//! metadata, and drains at most one batch of deletions. All progress lives in
//! [`EngineState`], so the loop can stop after any iteration and pick up again
//! from a checkpoint.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, Verdict};
use crate::client::MailboxClient;
use crate::config::{merge_headers, Config};
use crate::cursor::EnumerationCursor;
use crate::error::{MailboxError, Phase, Result};
use crate::models::{MessageMetadata, MessageRef, RunCounters};
use crate::rate_limiter::{RateLimiter, RatePermit};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownListener;
use crate::state::{EngineState, RunScope};

/// Called after every iteration with the running counters
pub type ProgressCallback = Arc<dyn Fn(&RunCounters) + Send + Sync>;

/// Tunables for one engine instance
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch_get_size: usize,
    pub batch_delete_size: usize,
    pub calls_per_second: u32,
    pub max_consecutive_failures: u32,
    pub max_rate_limit_retries: u32,
    pub max_item_retries: u32,
    /// Base pause after a failure; doubles with each consecutive call failure
    pub cooldown: Duration,
    /// Headers requested on top of what the policy needs
    pub header_allowlist: Vec<String>,
    /// Iterations between checkpoint writes
    pub checkpoint_interval: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        let limits = &config.limits;
        Self {
            batch_get_size: limits.batch_get_size,
            batch_delete_size: limits.batch_delete_size,
            calls_per_second: limits.calls_per_second,
            max_consecutive_failures: limits.max_consecutive_failures,
            max_rate_limit_retries: limits.max_rate_limit_retries,
            max_item_retries: limits.max_item_retries,
            cooldown: limits.cooldown(),
            header_allowlist: config.fetch.header_allowlist.clone(),
            checkpoint_interval: config.checkpoint.interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing left to list, fetch or delete
    Completed,
    /// Stopped on request; state is intact and resumable
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of a finished or cancelled run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub counters: RunCounters,
    /// Ids still waiting for a metadata fetch
    pub pending: usize,
    /// Eligible messages not yet deleted
    pub queued: usize,
    pub abandoned: Vec<MessageRef>,
    pub iterations: u64,
    pub elapsed: Duration,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} after {} iterations ({:.1}s)", self.outcome, self.iterations, self.elapsed.as_secs_f64())?;
        writeln!(f, "  {}", self.counters)?;
        write!(f, "  pending: {} queued: {} abandoned: {}", self.pending, self.queued, self.abandoned.len())
    }
}

/// Consecutive call failures per phase
#[derive(Debug, Default)]
struct PhaseFailures {
    listing: u32,
    fetching: u32,
    deleting: u32,
}

impl PhaseFailures {
    fn slot(&mut self, phase: Phase) -> &mut u32 {
        match phase {
            Phase::Listing => &mut self.listing,
            Phase::Fetching => &mut self.fetching,
            Phase::Deleting => &mut self.deleting,
        }
    }

    fn record(&mut self, phase: Phase) -> u32 {
        let slot = self.slot(phase);
        *slot += 1;
        *slot
    }

    fn reset(&mut self, phase: Phase) {
        *self.slot(phase) = 0;
    }
}

/// Orchestrates listing, fetching, classification and deletion
pub struct CleanupEngine {
    client: Box<dyn MailboxClient>,
    classifier: Box<dyn Classifier>,
    cursor: EnumerationCursor,
    limiter: RateLimiter,
    retry: RetryPolicy,
    settings: EngineSettings,
    header_allowlist: Vec<String>,
    checkpoint: Option<PathBuf>,
    on_progress: Option<ProgressCallback>,
}

impl CleanupEngine {
    pub fn new(
        client: Box<dyn MailboxClient>,
        classifier: Box<dyn Classifier>,
        cursor: EnumerationCursor,
        settings: EngineSettings,
    ) -> Self {
        let header_allowlist = merge_headers(&settings.header_allowlist, &classifier.required_headers());
        Self {
            client,
            classifier,
            cursor,
            limiter: RateLimiter::per_second(settings.calls_per_second),
            retry: RetryPolicy::new(settings.max_rate_limit_retries),
            settings,
            header_allowlist,
            checkpoint: None,
            on_progress: None,
        }
    }

    /// Share an existing limiter instead of creating one
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Write the state to `path` periodically and whenever the run stops
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn header_allowlist(&self) -> &[String] {
        &self.header_allowlist
    }

    /// Run until everything is drained, cancellation, or a fatal error
    ///
    /// `state` is updated in place and holds the accumulated counters even
    /// when an error is returned.
    pub async fn run(&self, state: &mut EngineState, shutdown: &ShutdownListener) -> Result<RunReport> {
        state.bind_scope(RunScope::new(
            self.classifier.name(),
            self.classifier.parameter(),
            self.cursor.filter().clone(),
        ))?;

        info!(
            "Starting cleanup: policy={}, filter={}, headers={:?}",
            self.classifier.name(),
            self.cursor.filter(),
            self.header_allowlist
        );

        let started = Instant::now();
        let mut shutdown = shutdown.clone();
        let mut failures = PhaseFailures::default();
        let mut cooldown: Option<Duration> = None;
        let mut iterations: u64 = 0;

        let result = loop {
            if shutdown.is_triggered() {
                info!("Cancellation requested, stopping");
                break Ok(RunOutcome::Cancelled);
            }
            if state.is_drained() {
                state.completed = true;
                break Ok(RunOutcome::Completed);
            }

            if let Err(e) = self
                .iterate(state, &mut failures, &mut cooldown, &mut shutdown)
                .await
            {
                break Err(e);
            }
            iterations += 1;

            info!("listed: {} deleted: {}", state.counters.listed, state.counters.deleted);
            if let Some(callback) = &self.on_progress {
                callback(&state.counters);
            }

            if let Some(path) = &self.checkpoint {
                if iterations % self.settings.checkpoint_interval.max(1) == 0 {
                    if let Err(e) = state.checkpoint(path).await {
                        break Err(e);
                    }
                }
            }
        };

        if let Some(path) = &self.checkpoint {
            if let Err(e) = state.checkpoint(path).await {
                if result.is_ok() {
                    return Err(e);
                }
                warn!("Failed to write final checkpoint: {}", e);
            }
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Cleanup aborted: {} ({})", e, state.counters);
                return Err(e);
            }
        };

        let report = RunReport {
            outcome,
            counters: state.counters,
            pending: state.pending.len(),
            queued: state.queue.len(),
            abandoned: state.abandoned.iter().cloned().collect(),
            iterations,
            elapsed: started.elapsed(),
        };
        info!("Cleanup {}: {}", report.outcome, report.counters);
        Ok(report)
    }

    /// One pass of list, fetch, cool down, drain
    async fn iterate(
        &self,
        state: &mut EngineState,
        failures: &mut PhaseFailures,
        cooldown: &mut Option<Duration>,
        shutdown: &mut ShutdownListener,
    ) -> Result<()> {
        let mut gated = false;

        if state.cursor.has_more() {
            if !self.cool_down(cooldown, shutdown).await {
                return Ok(());
            }
            gated = true;
            let Some(_permit) = self.admit("messages.list", shutdown).await? else {
                return Ok(());
            };
            match self.list_page(state).await {
                Ok(()) => failures.reset(Phase::Listing),
                Err(e) => self.absorb_call_failure(failures, Phase::Listing, e, cooldown)?,
            }
        }

        if !state.pending.is_empty() {
            if !self.cool_down(cooldown, shutdown).await {
                return Ok(());
            }
            gated = true;
            let Some(_permit) = self.admit("messages.batchGet", shutdown).await? else {
                return Ok(());
            };
            self.fetch_batch(state, failures, cooldown).await?;
        }

        if !state.cursor.has_more() && state.pending.is_empty() && !state.finalized {
            self.finalize(state);
        }

        if !state.queue.is_empty() {
            if !self.cool_down(cooldown, shutdown).await {
                return Ok(());
            }
            // Keep drain-only iterations paced by the same gate
            if !gated && self.admit("messages.batchDelete", shutdown).await?.is_none() {
                return Ok(());
            }
            match state
                .queue
                .drain(self.client.as_ref(), self.settings.batch_delete_size, &mut state.counters)
                .await
            {
                Ok(_) => failures.reset(Phase::Deleting),
                Err(e) => self.absorb_call_failure(failures, Phase::Deleting, e, cooldown)?,
            }
        }

        Ok(())
    }

    async fn list_page(&self, state: &mut EngineState) -> Result<()> {
        let step = self
            .cursor
            .next(self.client.as_ref(), &mut state.cursor, &mut state.pending)
            .await?;
        state.counters.listed += step.ids.len() as u64;
        Ok(())
    }

    async fn fetch_batch(
        &self,
        state: &mut EngineState,
        failures: &mut PhaseFailures,
        cooldown: &mut Option<Duration>,
    ) -> Result<()> {
        let batch = state.pending.peek_batch(self.settings.batch_get_size);

        let fetched = self.client.batch_get_metadata(&batch, &self.header_allowlist).await;
        let outcomes = match fetched {
            Ok(outcomes) => {
                failures.reset(Phase::Fetching);
                outcomes
            }
            Err(e) => return self.absorb_call_failure(failures, Phase::Fetching, e, cooldown),
        };

        let requested: HashSet<&MessageRef> = batch.iter().collect();
        let mut answered: HashSet<MessageRef> = HashSet::with_capacity(batch.len());
        let mut item_failed = false;

        for (id, outcome) in outcomes {
            if !requested.contains(&id) {
                warn!("Ignoring metadata for unrequested message {}", id);
                continue;
            }
            if !answered.insert(id.clone()) {
                continue;
            }

            match outcome {
                Ok(mut metadata) => {
                    metadata.id = id;
                    self.accept(state, metadata);
                }
                Err(MailboxError::MessageNotFound(_)) => {
                    debug!("Message {} no longer exists", id);
                    state.pending.resolve(&id);
                    state.item_failures.remove(&id);
                }
                Err(e) if e.is_transient() => {
                    item_failed = true;
                    self.record_item_failure(state, &id, &e.to_string());
                }
                Err(e) => {
                    return Err(MailboxError::MessageFetchFailed {
                        id: id.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        for id in batch.iter().filter(|id| !answered.contains(*id)) {
            item_failed = true;
            self.record_item_failure(state, id, "missing from batch response");
        }

        if item_failed {
            *cooldown = Some(cooldown.unwrap_or_default().max(self.settings.cooldown));
        }
        Ok(())
    }

    /// Resolve a fetched message and route it through the classifier
    fn accept(&self, state: &mut EngineState, metadata: MessageMetadata) {
        let id = metadata.id.clone();
        state.pending.resolve(&id);
        state.item_failures.remove(&id);
        state.counters.classified += 1;

        let classified = self.classifier.classify(metadata, &mut state.groups);
        if classified.verdict == Verdict::Delete {
            if let Some(eligible) = classified.eligible {
                state.queue.push(eligible);
            }
        }
    }

    fn record_item_failure(&self, state: &mut EngineState, id: &MessageRef, reason: &str) {
        let failures = state.record_item_failure(id);
        if failures > self.settings.max_item_retries {
            warn!("Giving up on message {} after {} failed fetches: {}", id, failures, reason);
            state.abandon(id);
        } else {
            debug!("Fetch of {} failed ({}/{}), leaving pending: {}", id, failures, self.settings.max_item_retries, reason);
        }
    }

    fn finalize(&self, state: &mut EngineState) {
        let eligible = self.classifier.finalize(&mut state.groups);
        if !eligible.is_empty() {
            info!("Enumeration complete, {} messages superseded", eligible.len());
        }
        for metadata in eligible {
            state.queue.push(metadata);
        }
        state.finalized = true;
    }

    /// Count a failed call against its phase
    ///
    /// Non-transient listing and fetching errors are fatal at once. Delete
    /// failures always count, since the batch is already back in the queue.
    fn absorb_call_failure(
        &self,
        failures: &mut PhaseFailures,
        phase: Phase,
        error: MailboxError,
        cooldown: &mut Option<Duration>,
    ) -> Result<()> {
        if phase != Phase::Deleting && !error.is_transient() {
            return Err(error);
        }

        let attempts = failures.record(phase);
        if attempts >= self.settings.max_consecutive_failures {
            return Err(MailboxError::RetriesExhausted {
                phase,
                attempts,
                last_error: error.to_string(),
            });
        }

        let delay = backoff_delay(self.settings.cooldown, attempts);
        warn!(
            "{} failed ({}/{}): {}; cooling down for {:?}",
            phase, attempts, self.settings.max_consecutive_failures, error, delay
        );
        *cooldown = Some(cooldown.unwrap_or_default().max(delay));
        Ok(())
    }

    /// Wait for the limiter to admit one call; `None` if cancelled meanwhile
    async fn admit(&self, operation: &str, shutdown: &mut ShutdownListener) -> Result<Option<RatePermit>> {
        tokio::select! {
            admitted = self.retry.admit(&self.limiter, operation) => admitted.map(Some),
            _ = shutdown.notified() => {
                info!("Cancelled while waiting to admit {}", operation);
                Ok(None)
            }
        }
    }

    /// Sleep off a flagged cool-down; false if cancelled meanwhile
    async fn cool_down(&self, cooldown: &mut Option<Duration>, shutdown: &mut ShutdownListener) -> bool {
        if let Some(delay) = cooldown.take() {
            info!("Sleeping {:?} before the next call", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.notified() => {}
            }
        }
        !shutdown.is_triggered()
    }
}

/// `base * 2^(attempt - 1)`
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}
