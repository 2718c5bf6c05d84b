//! Command-line interface

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth;
use crate::client::{DryRunMailboxClient, GmailMailboxClient, MailboxClient};
use crate::config::{Config, PolicyKind};
use crate::cursor::EnumerationCursor;
use crate::engine::{CleanupEngine, EngineSettings, ProgressCallback, RunReport};
use crate::error::MailboxError;
use crate::models::{ListFilter, RunCounters};
use crate::shutdown::ShutdownListener;
use crate::state::EngineState;

#[derive(Parser, Debug)]
#[command(name = "gmail-cleanup")]
#[command(version)]
#[command(about = "Bulk cleanup of autosaved drafts and duplicate messages in Gmail", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Path to OAuth2 credentials file
    #[arg(long, default_value = "credentials.json")]
    pub credentials: PathBuf,

    /// Path to token cache file
    #[arg(long, default_value = ".gmail-cleanup/token.json")]
    pub token_cache: PathBuf,

    /// Checkpoint file (overrides checkpoint.path from the config)
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with Gmail API
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// List, classify and delete matching messages
    Run {
        /// Classify and log, but don't delete anything
        #[arg(long)]
        dry_run: bool,

        /// Resume from the last checkpoint
        #[arg(long)]
        resume: bool,

        /// Deletion policy (overrides policy.kind)
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Marker header name (overrides policy.header_name)
        #[arg(long)]
        header: Option<String>,

        /// Listing query (overrides source.query)
        #[arg(long)]
        query: Option<String>,

        /// Label name to restrict the listing to (overrides source.label)
        #[arg(long)]
        label: Option<String>,
    },

    /// Show the last checkpoint
    Status,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyArg {
    /// Delete messages carrying the marker header
    Marker,
    /// Keep only the newest copy per Message-ID
    Duplicates,
}

impl From<PolicyArg> for PolicyKind {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Marker => PolicyKind::MarkerHeader,
            PolicyArg::Duplicates => PolicyKind::DuplicateMessageId,
        }
    }
}

/// Flags of the `run` subcommand
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub resume: bool,
    pub policy: Option<PolicyArg>,
    pub header: Option<String>,
    pub query: Option<String>,
    pub label: Option<String>,
}

impl RunOptions {
    /// Fold command-line overrides into the loaded configuration
    pub fn apply(&self, config: &mut Config) -> crate::error::Result<()> {
        if self.dry_run {
            config.execution.dry_run = true;
        }
        if let Some(policy) = self.policy {
            config.policy.kind = policy.into();
        }
        if let Some(header) = &self.header {
            config.policy.header_name = header.clone();
        }
        if let Some(query) = &self.query {
            config.source.query = Some(query.clone());
        }
        if let Some(label) = &self.label {
            config.source.label = Some(label.clone());
        }
        config.validate()
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share a MultiProgress with the log writer so lines print above the spinner
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        Self {
            multi,
            spinner_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }

    /// Callback that mirrors the engine counters onto `pb`
    pub fn counters_callback(pb: &ProgressBar) -> ProgressCallback {
        let pb = pb.clone();
        Arc::new(move |counters: &RunCounters| pb.set_message(counters.to_string()))
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Listing filter from the source section, with the label already resolved
pub fn build_filter(config: &Config, label_id: Option<String>) -> ListFilter {
    ListFilter {
        query: config
            .source
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string),
        label_ids: label_id.into_iter().collect(),
    }
}

/// Checkpoint path: `--state-file` wins over the config
pub fn checkpoint_path(cli: &Cli, config: &Config) -> PathBuf {
    cli.state_file
        .clone()
        .unwrap_or_else(|| config.checkpoint.path.clone())
}

/// Load a resumable checkpoint, or start fresh
pub async fn prepare_state(path: &std::path::Path, resume: bool) -> crate::error::Result<EngineState> {
    if !resume {
        if path.exists() {
            info!("Ignoring existing checkpoint at {:?}; pass --resume to continue it", path);
        }
        return Ok(EngineState::new());
    }

    let state = EngineState::load(path).await?;
    if !state.can_resume() {
        info!("Checkpoint run {} already completed, starting fresh", state.run_id);
        return Ok(EngineState::new());
    }
    Ok(state)
}

/// Wire configuration, authentication and the engine together, then run it
pub async fn run_cleanup(
    cli: &Cli,
    options: &RunOptions,
    shutdown: ShutdownListener,
    multi: MultiProgress,
) -> anyhow::Result<RunReport> {
    let reporter = ProgressReporter::with_multi_progress(multi);

    // Step 1: Load configuration
    let config_spinner = reporter.add_spinner("Loading configuration...");
    let mut config = Config::load(&cli.config).await?;
    options.apply(&mut config)?;
    reporter.finish_spinner(&config_spinner, &format!("Configuration loaded from {:?}", cli.config));

    // Step 2: Initialize Gmail API
    let auth_spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let hub = auth::initialize_gmail_hub(&cli.credentials, &cli.token_cache).await?;
    let gmail = GmailMailboxClient::new(hub, config.limits.max_concurrent_fetches);
    reporter.finish_spinner(&auth_spinner, "Gmail API authenticated successfully");

    // Step 3: Resolve the label filter
    let label_id = match config.source.label.as_deref() {
        Some(name) => {
            let id = gmail
                .find_label_id(name)
                .await?
                .ok_or_else(|| MailboxError::LabelError(format!("Label '{}' not found", name)))?;
            info!("Resolved label '{}' to {}", name, id);
            Some(id)
        }
        None => None,
    };
    let filter = build_filter(&config, label_id);

    // Step 4: Build the engine
    let client: Box<dyn MailboxClient> = if config.execution.dry_run {
        let _ = reporter
            .multi_progress()
            .println("Running in DRY RUN mode - nothing will be deleted");
        Box::new(DryRunMailboxClient::new(gmail))
    } else {
        Box::new(gmail)
    };

    let classifier = config.policy.build();
    let cursor = EnumerationCursor::new(filter, config.source.page_size);
    let run_spinner = reporter.add_spinner("Cleaning up...");
    let mut engine = CleanupEngine::new(client, classifier, cursor, EngineSettings::from(&config))
        .with_progress(ProgressReporter::counters_callback(&run_spinner));

    // A dry run must not leave a checkpoint that looks like real progress
    let state_path = checkpoint_path(cli, &config);
    if config.execution.dry_run {
        if options.resume {
            warn!("--resume is ignored in dry run mode");
        }
    } else {
        engine = engine.with_checkpoint(&state_path);
    }

    // Step 5: Load or create state
    let mut state = if config.execution.dry_run {
        EngineState::new()
    } else {
        prepare_state(&state_path, options.resume).await?
    };
    info!("Run {} starting ({})", state.run_id, state.counters);

    // Step 6: Run
    let result = engine.run(&mut state, &shutdown).await;
    run_spinner.finish_and_clear();

    result.with_context(|| format!("Cleanup aborted ({})", state.counters))
}

/// Human-readable checkpoint summary for `status`
pub fn format_status(state: &EngineState) -> String {
    let mut out = String::new();
    out.push_str("========================================\n");
    out.push_str("Checkpoint\n");
    out.push_str("========================================\n");
    out.push_str(&format!("Run ID: {}\n", state.run_id));
    match &state.scope {
        Some(scope) => {
            out.push_str(&format!("Policy: {}\n", scope.policy));
            if let Some(parameter) = &scope.parameter {
                out.push_str(&format!("Policy setting: {}\n", parameter));
            }
            out.push_str(&format!("Listing: {}\n", scope.filter));
        }
        None => out.push_str("Policy: -\n"),
    }
    out.push_str(&format!("Started: {}\n", state.started_at.format("%Y-%m-%d %H:%M:%S")));
    out.push_str(&format!("Updated: {}\n", state.updated_at.format("%Y-%m-%d %H:%M:%S")));
    out.push_str(&format!("Completed: {}\n", state.completed));
    out.push_str(&format!("More pages: {}\n", state.cursor.has_more()));
    out.push_str(&format!("Pending fetches: {}\n", state.pending.len()));
    out.push_str(&format!("Queued deletions: {}\n", state.queue.len()));
    out.push_str(&format!("Duplicate groups: {}\n", state.groups.len()));
    out.push_str(&format!("Abandoned: {}\n", state.abandoned.len()));
    out.push_str(&format!("Counters: {}\n", state.counters));
    out.push_str(&format!("Checkpoints: {}\n", state.checkpoint_count));
    out.push_str("========================================");
    out
}
