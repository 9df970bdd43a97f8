//! Booking sync: field-provenance merge, webhook ingestion, and scheduled reconciliation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bayline_square::{
    BookingsClient, CachedCatalog, CatalogClient, CustomerClient, SquareClient, SquareConfig,
};
use bayline_storage::{FileJobStore, JobStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

mod ingest;
mod merger;
mod reconcile;

pub use ingest::{
    IngestAction, IngestError, IngestOutcome, WebhookConfig, WebhookIngestPipeline,
    WEBHOOK_CREATOR,
};
pub use merger::{apply_booking, AppliedChange, FieldProvenanceMerger, SyncPlan};
pub use reconcile::{
    ReconcileConfig, ReconcileError, ReconcileFailure, ReconcileSummary, ReconciliationEngine,
    RECONCILE_CREATOR,
};

pub const CRATE_NAME: &str = "bayline-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub square: SquareConfig,
    pub webhook: WebhookConfig,
    /// Notification URL registered with the platform; the signature covers it verbatim.
    pub webhook_url: Option<String>,
    pub reconcile: ReconcileConfig,
    pub cron_secret: Option<String>,
    pub scheduler_enabled: bool,
    pub reconcile_cron: String,
    pub data_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            square: SquareConfig::default(),
            webhook: WebhookConfig::default(),
            webhook_url: None,
            reconcile: ReconcileConfig::default(),
            cron_secret: None,
            scheduler_enabled: false,
            reconcile_cron: "0 */15 * * * *".to_string(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let location_id = non_empty_env("SQUARE_LOCATION_ID");
        Self {
            square: SquareConfig::from_env(),
            webhook: WebhookConfig {
                signature_key: non_empty_env("SQUARE_WEBHOOK_SIGNATURE_KEY"),
                strict_signatures: std::env::var("APP_ENV")
                    .map(|v| v.eq_ignore_ascii_case("production"))
                    .unwrap_or(false),
                location_id: location_id.clone(),
            },
            webhook_url: non_empty_env("SQUARE_WEBHOOK_URL"),
            reconcile: ReconcileConfig {
                lookback_days: parsed_env("RECONCILE_LOOKBACK_DAYS")
                    .unwrap_or(defaults.reconcile.lookback_days),
                lookahead_days: parsed_env("RECONCILE_LOOKAHEAD_DAYS")
                    .unwrap_or(defaults.reconcile.lookahead_days),
                max_pages: parsed_env("RECONCILE_MAX_PAGES")
                    .unwrap_or(defaults.reconcile.max_pages),
                location_id,
            },
            cron_secret: non_empty_env("CRON_SECRET"),
            scheduler_enabled: std::env::var("BAYLINE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            reconcile_cron: std::env::var("RECONCILE_CRON").unwrap_or(defaults.reconcile_cron),
            data_dir: std::env::var("BAYLINE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// The long-lived components a process wires together once at startup.
#[derive(Clone)]
pub struct SyncServices {
    pub store: Arc<dyn JobStore>,
    pub ingest: Arc<WebhookIngestPipeline>,
    pub reconcile: Arc<ReconciliationEngine>,
}

impl SyncServices {
    /// Platform-backed clients and the file job store under `data_dir`.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let client = SquareClient::new(config.square.clone()).context("building square client")?;
        let catalog = Arc::new(CachedCatalog::with_default_cache(client.clone()));
        let client = Arc::new(client);
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(config.data_dir.clone()));
        Ok(Self::assemble(config, store, client.clone(), client, catalog))
    }

    pub fn assemble(
        config: &SyncConfig,
        store: Arc<dyn JobStore>,
        bookings: Arc<dyn BookingsClient>,
        customers: Arc<dyn CustomerClient>,
        catalog: Arc<dyn CatalogClient>,
    ) -> Self {
        let merger = Arc::new(FieldProvenanceMerger::new(customers, catalog));
        let ingest = Arc::new(WebhookIngestPipeline::new(
            config.webhook.clone(),
            store.clone(),
            merger.clone(),
        ));
        let reconcile = Arc::new(ReconciliationEngine::new(
            config.reconcile.clone(),
            bookings,
            store.clone(),
            merger,
        ));
        Self {
            store,
            ingest,
            reconcile,
        }
    }
}

/// Cron-driven reconciliation over the default window, or `None` when disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    engine: Arc<ReconciliationEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.reconcile_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        Box::pin(async move {
            match engine.run_default(false).await {
                Ok(summary) => info!(
                    scanned = summary.scanned,
                    created = summary.created,
                    updated = summary.updated,
                    errors = summary.errors.len(),
                    "scheduled reconciliation complete"
                ),
                Err(err) => warn!(error = %err, "scheduled reconciliation failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
