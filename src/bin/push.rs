//! ChunkVault Push
//!
//! Uploads files to a ChunkVault server, resuming where an earlier run
//! stopped.
//!
//! ```text
//! chunkvault-push <file>...        upload files one after another
//! chunkvault-push --status <file>  show what the server has of a file
//! chunkvault-push --history        list finished uploads
//! chunkvault-push --clear-history  forget finished uploads
//! ```
//!
//! Ctrl+C pauses the running upload; run the same command again to resume.

use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{HumanBytes, ProgressBar, ProgressState, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunkvault::client::{
    HttpTransport, JsonFileStore, KeyValueStore, OrchestratorConfig, ProgressSnapshot,
    UploadControl, UploadOrchestrator, UploadOutcome, UploadTransport,
};
use chunkvault::config::ClientConfig;

#[derive(Parser, Debug)]
#[command(name = "chunkvault-push")]
#[command(about = "Upload files to a ChunkVault server, resuming interrupted transfers", long_about = None)]
struct Cli {
    /// Files to upload, one after another
    #[arg(required_unless_present_any = ["status", "history", "clear_history"])]
    files: Vec<PathBuf>,

    /// Show what the server has of a file
    #[arg(long, value_name = "FILE", conflicts_with_all = ["files", "history", "clear_history"])]
    status: Option<PathBuf>,

    /// List finished uploads
    #[arg(long, conflicts_with_all = ["files", "clear_history"])]
    history: bool,

    /// Forget finished uploads
    #[arg(long, conflicts_with = "files")]
    clear_history: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Upload(Vec<PathBuf>),
    Status(PathBuf),
    History,
    ClearHistory,
}

impl From<Cli> for Command {
    fn from(cli: Cli) -> Self {
        if let Some(path) = cli.status {
            Command::Status(path)
        } else if cli.history {
            Command::History
        } else if cli.clear_history {
            Command::ClearHistory
        } else {
            Command::Upload(cli.files)
        }
    }
}

/// Everything needed to build an orchestrator per file
struct Client {
    server_url: String,
    transport: Arc<dyn UploadTransport>,
    store: Arc<dyn KeyValueStore>,
    config: OrchestratorConfig,
}

impl Client {
    fn orchestrator(&self) -> UploadOrchestrator {
        UploadOrchestrator::new(self.transport.clone(), self.store.clone(), self.config.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "chunkvault=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let command = Command::from(Cli::parse());
    let config = ClientConfig::from_env().context("Invalid client configuration")?;

    let transport = HttpTransport::new(&config.server_url).context("Failed to build HTTP client")?;
    let client = Client {
        server_url: config.server_url.trim_end_matches('/').to_string(),
        transport: Arc::new(transport),
        store: Arc::new(JsonFileStore::new(&config.state_dir)),
        config: OrchestratorConfig {
            concurrency: config.concurrency,
            chunk_size: config.chunk_size,
            ..OrchestratorConfig::default()
        },
    };

    match command {
        Command::History => print_history(&client).await,
        Command::ClearHistory => {
            client.orchestrator().clear_history().await?;
            println!("History cleared");
            Ok(())
        }
        Command::Status(path) => print_status(&client, &path).await,
        Command::Upload(paths) => upload_all(&client, &paths).await,
    }
}

async fn upload_all(client: &Client, paths: &[PathBuf]) -> Result<()> {
    let mut failures = 0usize;

    for path in paths {
        let control = UploadControl::new();
        let ctrl_c = {
            let control = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    control.pause();
                }
            })
        };

        let bar = progress_bar(path)?;
        let sink = bar.clone();
        let orchestrator = client.orchestrator().with_progress(Arc::new(move |snap: &ProgressSnapshot| {
            sink.set_length(snap.total_bytes);
            sink.set_position(snap.bytes_confirmed);
        }));

        let result = orchestrator.upload_file(path, &control).await;
        ctrl_c.abort();
        bar.finish_and_clear();

        match result {
            Ok(UploadOutcome::Completed {
                session_id,
                digest,
                download_url,
                already_complete,
                ..
            }) => {
                let note = if already_complete { " (already on server)" } else { "" };
                println!("{}: completed{}", path.display(), note);
                println!("  session  {}", session_id);
                if let Some(digest) = digest {
                    println!("  sha256   {}", digest);
                }
                println!("  download {}{}", client.server_url, download_url);
            }
            Ok(UploadOutcome::Paused { .. }) => {
                println!("{}: paused, run again to resume", path.display());
                return Ok(());
            }
            Ok(UploadOutcome::Cancelled { .. }) => {
                println!("{}: cancelled", path.display());
            }
            Err(e) => {
                eprintln!("{}: failed: {}", path.display(), e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} upload(s) failed", failures, paths.len());
    }
    Ok(())
}

fn progress_bar(path: &Path) -> Result<ProgressBar> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let template = format!(
        "{{spinner}} {: <20.20} {{bar:40.green/blue}} {{human_bytes:10}} ({{average_speed}})",
        name,
    );
    let style = ProgressStyle::with_template(&template)
        .context("Invalid progress template")?
        .progress_chars("██ ")
        .with_key("human_bytes", |state: &ProgressState, w: &mut dyn Write| {
            let _ = write!(w, "{}", HumanBytes(state.pos()));
        })
        .with_key(
            "average_speed",
            |state: &ProgressState, w: &mut dyn Write| match (state.pos(), state.elapsed()) {
                (pos, elapsed) if elapsed > Duration::ZERO => {
                    let bytes_per_sec = pos as f64 / elapsed.as_secs_f64();
                    let _ = write!(w, "{}/s", HumanBytes(bytes_per_sec as u64));
                }
                _ => {
                    let _ = write!(w, "-");
                }
            },
        );

    let bar = ProgressBar::new(0);
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    Ok(bar)
}

async fn print_status(client: &Client, path: &Path) -> Result<()> {
    let status = client.orchestrator().remote_status(path).await?;
    let missing = status.missing_chunks();

    println!("{}", path.display());
    println!("  session  {}", status.session_id);
    println!("  state    {}", status.state);
    println!(
        "  chunks   {}/{} received",
        status.received_chunks.len(),
        status.total_chunks
    );
    if !missing.is_empty() && missing.len() <= 32 {
        println!("  missing  {:?}", missing);
    }
    if let Some(digest) = &status.session.final_digest {
        println!("  sha256   {}", digest);
    }
    Ok(())
}

async fn print_history(client: &Client) -> Result<()> {
    let entries = client.orchestrator().history().await?;
    if entries.is_empty() {
        println!("No uploads yet");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{}  {:<9}  {:>10}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", entry.status).to_uppercase(),
            HumanBytes(entry.size).to_string(),
            entry.filename,
        );
        if let Some(error) = entry.error {
            println!("    {}", error);
        }
    }
    Ok(())
}
