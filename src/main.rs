use anyhow::Result;
use clap::Parser;
use gmail_cleanup::auth::REQUIRED_SCOPES;
use gmail_cleanup::cli::{self, Cli, Commands, RunOptions};
use gmail_cleanup::config::Config;
use gmail_cleanup::error::MailboxError;
use gmail_cleanup::shutdown::{self, Shutdown};
use gmail_cleanup::state::EngineState;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "log buffer poisoned"))?;
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        eprintln!("\nFor help, run: gmail-cleanup --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Several dependencies pull in rustls; pick one crypto provider up front
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gmail_cleanup=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gmail_cleanup=info,warn"))
    };

    // Logs print above the progress spinner
    let multi_progress = Arc::new(MultiProgress::new());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MultiProgressMakeWriter {
            multi: Arc::clone(&multi_progress),
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match &cli.command {
        Commands::Auth { force } => {
            tracing::info!("Authenticating with Gmail API...");

            if let Some(parent) = cli.token_cache.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            if *force && cli.token_cache.exists() {
                tokio::fs::remove_file(&cli.token_cache).await?;
                tracing::info!("Removed existing token cache");
            }

            let hub = gmail_cleanup::auth::initialize_gmail_hub(&cli.credentials, &cli.token_cache).await?;

            println!("Successfully authenticated with Gmail API");
            println!("Token cached at: {:?}", cli.token_cache);

            // Same scope as the token, so no second consent prompt
            let (_, profile) = hub
                .users()
                .get_profile("me")
                .add_scope(REQUIRED_SCOPES[0])
                .doit()
                .await?;
            println!("Connected to account: {}", profile.email_address.unwrap_or_default());

            Ok(())
        }

        Commands::Run {
            dry_run,
            resume,
            policy,
            header,
            query,
            label,
        } => {
            let options = RunOptions {
                dry_run: *dry_run,
                resume: *resume,
                policy: *policy,
                header: header.clone(),
                query: query.clone(),
                label: label.clone(),
            };

            if let Some(parent) = cli.token_cache.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let (shutdown, listener) = Shutdown::new();
            shutdown::install_signal_handlers(shutdown);

            let report = cli::run_cleanup(&cli, &options, listener, (*multi_progress).clone()).await?;

            println!("\n========================================");
            println!("Cleanup Summary");
            println!("========================================");
            println!("{}", report);
            if !report.abandoned.is_empty() {
                println!("\nAbandoned messages (fetch kept failing):");
                for id in &report.abandoned {
                    println!("  - {}", id);
                }
            }
            println!("========================================");

            Ok(())
        }

        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            let path = cli::checkpoint_path(&cli, &config);

            if path.exists() {
                let state = EngineState::load(&path).await?;
                println!("{}", cli::format_status(&state));
            } else {
                println!("No checkpoint found.");
                println!("State file: {:?}", path);
            }

            Ok(())
        }

        Commands::InitConfig { output, force } => {
            tracing::info!("Generating example configuration file");

            if output.exists() && !*force {
                return Err(MailboxError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - source.query / source.label: which messages are listed");
            println!("  - policy.kind: 'marker_header' or 'duplicate_message_id'");
            println!("  - policy.header_name: marker header for the marker policy");
            println!("  - limits.*: batch sizes and rate limits (must fit the quota budget)");

            Ok(())
        }
    }
}
