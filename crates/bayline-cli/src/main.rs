use std::path::PathBuf;
use std::sync::Once;

use anyhow::{bail, Context, Result};
use bayline_square::{check_signature, compute_signature, SignatureCheck};
use bayline_sync::{maybe_build_scheduler, SyncConfig, SyncServices};
use bayline_web::AppState;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bayline-cli")]
#[command(about = "Bayline detailing job tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API, plus the reconcile scheduler when enabled.
    Serve {
        #[arg(long, env = "BAYLINE_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// One reconciliation pass over the booking window; prints the summary as JSON.
    Reconcile {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        days_back: Option<i64>,
        #[arg(long)]
        days_ahead: Option<i64>,
    },
    /// Re-fetch a single booking and merge it into its job.
    Resync {
        #[arg(long)]
        booking_id: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Check (or, without --signature, compute) a webhook signature for a saved body.
    VerifySignature {
        #[arg(long)]
        url: String,
        #[arg(long)]
        body_file: PathBuf,
        #[arg(long)]
        signature: Option<String>,
        #[arg(long, env = "SQUARE_WEBHOOK_SIGNATURE_KEY", hide_env_values = true)]
        key: String,
    },
}

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(fmt::layer().json()).init();
        } else {
            registry.with(fmt::layer()).init();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { port: 8000 }) {
        Commands::Serve { port } => {
            let config = SyncConfig::from_env();
            let services = SyncServices::from_config(&config)?;
            let scheduler = maybe_build_scheduler(&config, services.reconcile.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.reconcile_cron, "reconcile scheduler started");
            }
            bayline_web::serve(AppState::new(services, &config), port).await?;
        }
        Commands::Reconcile {
            dry_run,
            days_back,
            days_ahead,
        } => {
            let config = SyncConfig::from_env();
            let services = SyncServices::from_config(&config)?;
            let engine = &services.reconcile;
            let window = engine.window(Utc::now(), days_back, days_ahead)?;
            let summary = engine.run(window, dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Resync {
            booking_id,
            dry_run,
        } => {
            let config = SyncConfig::from_env();
            let services = SyncServices::from_config(&config)?;
            let change = services
                .reconcile
                .reconcile_booking_id(&booking_id, dry_run)
                .await?;
            match change.job_id() {
                Some(job_id) => println!(
                    "resync complete: booking_id={booking_id} job_id={job_id} change={change:?}"
                ),
                None => println!("resync complete: booking_id={booking_id} change={change:?}"),
            }
        }
        Commands::VerifySignature {
            url,
            body_file,
            signature,
            key,
        } => {
            let body = tokio::fs::read(&body_file)
                .await
                .with_context(|| format!("reading {}", body_file.display()))?;
            match signature {
                None => {
                    let computed = compute_signature(&key, &url, &body)
                        .context("signature key is not usable as an HMAC key")?;
                    println!("{computed}");
                }
                Some(signature) => match check_signature(&body, Some(&signature), &key, &url) {
                    SignatureCheck::Valid => println!("signature valid"),
                    SignatureCheck::Invalid => bail!("signature does not match body and url"),
                    SignatureCheck::Missing => bail!("signature is empty"),
                },
            }
        }
    }

    Ok(())
}
