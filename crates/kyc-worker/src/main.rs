use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kyc_core::review::DEFAULT_SOURCE_LANGUAGE;
use kyc_core::{KycStatus, RejectionCategory, SubmissionDraft, TranslationRequest};
use kyc_pipeline::SUPPORTED_LANGUAGES;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

mod app;

use app::{App, load_config};

#[derive(Parser)]
#[command(name = "kyc", about = "KYC intake worker: enriches queued submissions and runs reviewer actions")]
struct Cli {
    /// Path to a TOML config file (default: ~/.kyc/config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the submission queue until interrupted
    Work,
    /// Validate a submission and enqueue it for enrichment
    Submit {
        /// Submitting user's id
        #[arg(long)]
        user: String,
        /// JSON submission file, or `-` for stdin
        file: PathBuf,
    },
    /// Approve a pending record
    Approve {
        id: Uuid,
        #[arg(long, default_value = "admin")]
        reviewer: String,
    },
    /// Reject a pending record with a generated notice
    Reject {
        id: Uuid,
        #[arg(long, default_value = "admin")]
        reviewer: String,
        /// Rejection category (see `kyc categories`); unknown values mean `other`
        #[arg(long)]
        category: Option<String>,
        /// Free-text reason passed to the notice
        #[arg(long)]
        reason: Option<String>,
    },
    /// Translate text into a supported language
    Translate {
        #[arg(long)]
        to: String,
        #[arg(long, default_value = DEFAULT_SOURCE_LANGUAGE)]
        from: String,
        text: String,
    },
    /// List records with a given status
    List {
        #[arg(long, value_enum, default_value_t = StatusArg::Pending)]
        status: StatusArg,
    },
    /// Print the supported translation languages
    Languages,
    /// Print the rejection categories
    Categories,
    /// Print record counts and queue depth
    Stats,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StatusArg {
    Pending,
    Approved,
    Rejected,
}

impl From<StatusArg> for KycStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Pending => KycStatus::Pending,
            StatusArg::Approved => KycStatus::Approved,
            StatusArg::Rejected => KycStatus::Rejected,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; command output goes to stdout.
    fmt()
        .with_env_filter(EnvFilter::from_env("KYC_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Languages => {
            for language in SUPPORTED_LANGUAGES {
                println!("{language}");
            }
            Ok(())
        }
        Command::Categories => {
            for category in RejectionCategory::ALL {
                println!("{category}");
            }
            Ok(())
        }
        command => {
            let app = App::new(load_config(cli.config.as_deref())?)?;
            run(app, command).await
        }
    }
}

async fn run(app: App, command: Command) -> Result<()> {
    match command {
        Command::Work => work(app).await,
        Command::Submit { user, file } => {
            let draft = read_draft(&file)?;
            let intake = app.intake(app.queue()).await?;
            let receipt = intake.submit(&user, draft).await?;
            if !receipt.accepted {
                bail!("submission {} was not accepted by the queue", receipt.message_id);
            }
            println!("{}", receipt.message_id);
            Ok(())
        }
        Command::Approve { id, reviewer } => {
            let record = app.review().await?.approve(id, &reviewer).await?;
            print_json(&record)
        }
        Command::Reject {
            id,
            reviewer,
            category,
            reason,
        } => {
            let category = category.as_deref().map(RejectionCategory::parse);
            let record = app
                .review()
                .await?
                .reject(id, &reviewer, category, reason)
                .await?;
            print_json(&record)
        }
        Command::Translate { to, from, text } => {
            let request = TranslationRequest::new(text, to).with_source(from);
            let translated = app.translator.translate(&request).await?;
            println!("{translated}");
            Ok(())
        }
        Command::List { status } => {
            let records = app.review().await?.list(status.into()).await?;
            print_json(&records)
        }
        Command::Stats => {
            let stats = app.review().await?.stats().await?;
            let depth = app.queue().depth().await?;
            print_json(&serde_json::json!({ "records": stats, "queue": depth }))
        }
        Command::Languages | Command::Categories => Ok(()),
    }
}

async fn work(app: App) -> Result<()> {
    let queue = app.queue();
    queue
        .connect()
        .await
        .with_context(|| format!("queue at {} is unavailable", queue.base_dir().display()))?;

    let worker = Arc::new(app.worker().await?);
    queue.subscribe(worker).await?;

    tracing::info!(
        queue = %app.config.queue.dir.display(),
        store = %app.config.store.dir.display(),
        "KYC worker running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    queue.close().await;

    let snapshot = app.metrics.snapshot();
    tracing::info!(
        received = snapshot.messages_received,
        created = snapshot.records_created,
        failed = snapshot.submissions_failed,
        dead_lettered = snapshot.messages_dead_lettered,
        "KYC worker stopped"
    );
    Ok(())
}

fn read_draft(path: &Path) -> Result<SubmissionDraft> {
    let content = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("reading submission from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("reading submission from {}", path.display()))?
    };
    serde_json::from_str(&content).context("parsing submission JSON")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
