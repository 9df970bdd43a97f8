use std::sync::Arc;

use bayline_core::{JobUpdate, ParsedBooking};
use bayline_square::{
    is_valid_booking, list_all_bookings, missing_booking_fields, parse_booking, BookingWindow,
    BookingsClient, SquareBooking, SquareError, WindowError,
};
use bayline_storage::{JobStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::merger::{apply_booking, AppliedChange, FieldProvenanceMerger};

pub const RECONCILE_CREATOR: &str = "square-reconcile";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("listing bookings failed: {0}")]
    Listing(#[from] SquareError),
    #[error("booking {0} not found upstream")]
    BookingNotFound(String),
    #[error("booking {booking_id} cannot be reconciled: {message}")]
    Booking { booking_id: String, message: String },
    #[error("invalid reconciliation window: {0}")]
    InvalidWindow(#[from] WindowError),
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub lookback_days: i64,
    pub lookahead_days: i64,
    pub max_pages: usize,
    pub location_id: Option<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            lookback_days: 1,
            lookahead_days: 30,
            max_pages: 20,
            location_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileFailure {
    pub booking_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub created: usize,
    pub updated: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub errors: Vec<ReconcileFailure>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub dry_run: bool,
    pub truncated: bool,
    pub window: BookingWindow,
}

/// Per-booking outcome inside a run.
enum Tally {
    Created,
    Updated,
    Cancelled,
    Skipped,
}

pub struct ReconciliationEngine {
    config: ReconcileConfig,
    bookings: Arc<dyn BookingsClient>,
    store: Arc<dyn JobStore>,
    merger: Arc<FieldProvenanceMerger>,
}

impl ReconciliationEngine {
    pub fn new(
        config: ReconcileConfig,
        bookings: Arc<dyn BookingsClient>,
        store: Arc<dyn JobStore>,
        merger: Arc<FieldProvenanceMerger>,
    ) -> Self {
        Self {
            config,
            bookings,
            store,
            merger,
        }
    }

    pub fn default_window(&self, now: DateTime<Utc>) -> Result<BookingWindow, WindowError> {
        self.window(now, None, None)
    }

    /// `[now - days_back, now + days_ahead]`, falling back to the configured spans.
    pub fn window(
        &self,
        now: DateTime<Utc>,
        days_back: Option<i64>,
        days_ahead: Option<i64>,
    ) -> Result<BookingWindow, WindowError> {
        BookingWindow::around(
            now,
            days_back.unwrap_or(self.config.lookback_days),
            days_ahead.unwrap_or(self.config.lookahead_days),
        )
    }

    pub async fn run_default(&self, dry_run: bool) -> Result<ReconcileSummary, ReconcileError> {
        let window = self.default_window(Utc::now())?;
        self.run(window, dry_run).await
    }

    /// Scan every booking in `window`. Only a listing failure aborts the run.
    pub async fn run(
        &self,
        window: BookingWindow,
        dry_run: bool,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let span = info_span!(
            "reconcile",
            start_at_min = %window.start_at_min,
            start_at_max = %window.start_at_max,
            dry_run
        );
        async move {
            let start_time = Utc::now();
            let listing = list_all_bookings(
                self.bookings.as_ref(),
                &window,
                self.config.location_id.as_deref(),
                self.config.max_pages,
            )
            .await?;

            let mut summary = ReconcileSummary {
                scanned: 0,
                created: 0,
                updated: 0,
                cancelled: 0,
                skipped: 0,
                errors: Vec::new(),
                start_time,
                end_time: start_time,
                duration_ms: 0,
                dry_run,
                truncated: listing.truncated,
                window,
            };

            for raw in &listing.bookings {
                summary.scanned += 1;
                match self.reconcile_one(raw, dry_run).await {
                    Ok(Tally::Created) => summary.created += 1,
                    Ok(Tally::Updated) => summary.updated += 1,
                    Ok(Tally::Cancelled) => summary.cancelled += 1,
                    Ok(Tally::Skipped) => summary.skipped += 1,
                    Err(err) => {
                        let booking_id = raw.id.clone().unwrap_or_default();
                        warn!(%booking_id, error = %err, "booking reconciliation failed");
                        summary.errors.push(ReconcileFailure {
                            booking_id,
                            error: err.to_string(),
                        });
                    }
                }
            }

            summary.end_time = Utc::now();
            summary.duration_ms = (summary.end_time - start_time).num_milliseconds();
            info!(
                scanned = summary.scanned,
                created = summary.created,
                updated = summary.updated,
                cancelled = summary.cancelled,
                skipped = summary.skipped,
                errors = summary.errors.len(),
                truncated = summary.truncated,
                "reconciliation finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Re-derive one job from the platform's current copy of its booking.
    pub async fn reconcile_booking_id(
        &self,
        booking_id: &str,
        dry_run: bool,
    ) -> Result<AppliedChange, ReconcileError> {
        let raw = self
            .bookings
            .retrieve_booking(booking_id)
            .await?
            .ok_or_else(|| ReconcileError::BookingNotFound(booking_id.to_string()))?;
        let booking = parse_booking(&raw);
        if !cancellation_only(&booking) && !is_valid_booking(&booking) {
            return Err(ReconcileError::Booking {
                booking_id: booking_id.to_string(),
                message: format!("missing fields {:?}", missing_booking_fields(&booking)),
            });
        }
        apply_booking(
            self.store.as_ref(),
            &self.merger,
            &booking,
            RECONCILE_CREATOR,
            dry_run,
        )
        .await
        .map_err(|err| ReconcileError::Booking {
            booking_id: booking_id.to_string(),
            message: err.to_string(),
        })
    }

    async fn reconcile_one(
        &self,
        raw: &SquareBooking,
        dry_run: bool,
    ) -> Result<Tally, BookingFailure> {
        let booking = parse_booking(raw);
        if cancellation_only(&booking) {
            let Some(job) = self.store.get_job_by_booking_id(&booking.booking_id).await? else {
                return Ok(Tally::Skipped);
            };
            let patch = FieldProvenanceMerger::cancellation_patch(&job);
            if patch.has_changes() && !dry_run {
                self.store
                    .update_job(job.job_id, JobUpdate::Booking(patch))
                    .await?;
                info!(
                    booking_id = %booking.booking_id,
                    job_id = %job.job_id,
                    "job marked cancelled upstream"
                );
            }
            return Ok(Tally::Cancelled);
        }

        if !is_valid_booking(&booking) {
            return Err(BookingFailure::Invalid(missing_booking_fields(&booking)));
        }

        let change = apply_booking(
            self.store.as_ref(),
            &self.merger,
            &booking,
            RECONCILE_CREATOR,
            dry_run,
        )
        .await?;
        Ok(match change {
            AppliedChange::Created(_) => Tally::Created,
            AppliedChange::Updated(_) => Tally::Updated,
            AppliedChange::Unchanged(_) | AppliedChange::SkippedCancelled => Tally::Skipped,
        })
    }
}

/// A cancelled booking only needs its id; the upstream copy may have dropped `start_at`.
fn cancellation_only(booking: &ParsedBooking) -> bool {
    booking.is_cancelled() && !booking.booking_id.is_empty()
}

#[derive(Debug, Error)]
enum BookingFailure {
    #[error("invalid booking, missing {0:?}")]
    Invalid(Vec<&'static str>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{WebhookConfig, WebhookIngestPipeline};
    use crate::testing::{square_booking, webhook_body, FakeBookings, FakeCatalog, FakeCustomers};
    use bayline_core::{BookingStatus, WorkStatus};
    use bayline_storage::InMemoryJobStore;
    use chrono::TimeZone;

    fn window() -> BookingWindow {
        BookingWindow::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).single().unwrap(),
        )
    }

    fn merger() -> Arc<FieldProvenanceMerger> {
        Arc::new(FieldProvenanceMerger::new(
            Arc::new(FakeCustomers::with_dana()),
            Arc::new(FakeCatalog::default()),
        ))
    }

    fn engine(store: Arc<InMemoryJobStore>, bookings: FakeBookings) -> ReconciliationEngine {
        ReconciliationEngine::new(ReconcileConfig::default(), Arc::new(bookings), store, merger())
    }

    #[tokio::test]
    async fn first_run_creates_and_second_run_converges() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(
            store.clone(),
            FakeBookings::new(vec![square_booking("bk_1"), square_booking("bk_2")]),
        );

        let first = engine.run(window(), false).await.unwrap();
        assert_eq!((first.scanned, first.created, first.skipped), (2, 2, 0));
        assert!(first.errors.is_empty());

        let writes = store.write_count();
        let second = engine.run(window(), false).await.unwrap();
        assert_eq!((second.scanned, second.created, second.updated, second.skipped), (2, 0, 0, 2));
        assert_eq!(store.write_count(), writes);

        let job = store.get_job_by_booking_id("bk_1").await.unwrap().unwrap();
        assert_eq!(job.created_by, RECONCILE_CREATOR);
        assert_eq!(job.work_status, WorkStatus::Scheduled);
    }

    #[tokio::test]
    async fn webhook_then_reconcile_converges_to_same_fields() {
        let via_webhook = Arc::new(InMemoryJobStore::new());
        let pipeline =
            WebhookIngestPipeline::new(WebhookConfig::default(), via_webhook.clone(), merger());
        let body = webhook_body("booking.created", "bk_1", "2026-03-04T15:00:00Z", "ACCEPTED");
        pipeline
            .ingest(&body, None, "https://bay.example.com/hook")
            .await
            .unwrap();

        let writes = via_webhook.write_count();
        let summary = engine(via_webhook.clone(), FakeBookings::new(vec![square_booking("bk_1")]))
            .run(window(), false)
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(via_webhook.write_count(), writes);

        let via_reconcile = Arc::new(InMemoryJobStore::new());
        engine(via_reconcile.clone(), FakeBookings::new(vec![square_booking("bk_1")]))
            .run(window(), false)
            .await
            .unwrap();

        let a = via_webhook.get_job_by_booking_id("bk_1").await.unwrap().unwrap();
        let b = via_reconcile.get_job_by_booking_id("bk_1").await.unwrap().unwrap();
        assert_eq!(a.appointment_time, b.appointment_time);
        assert_eq!(a.service_type, b.service_type);
        assert_eq!(a.customer_id, b.customer_id);
        assert_eq!(a.customer_name, b.customer_name);
        assert_eq!(a.customer_email, b.customer_email);
        assert_eq!(a.customer_phone, b.customer_phone);
        assert_eq!(a.cancelled_upstream, b.cancelled_upstream);
    }

    #[tokio::test]
    async fn cancelled_bookings_are_marked_not_deleted() {
        let store = Arc::new(InMemoryJobStore::new());
        engine(store.clone(), FakeBookings::new(vec![square_booking("bk_1")]))
            .run(window(), false)
            .await
            .unwrap();

        let mut cancelled = square_booking("bk_1");
        cancelled.status = Some(BookingStatus::CancelledByCustomer);
        let mut never_seen = square_booking("bk_9");
        never_seen.status = Some(BookingStatus::Declined);
        let engine = engine(store.clone(), FakeBookings::new(vec![cancelled, never_seen]));

        let summary = engine.run(window(), false).await.unwrap();
        assert_eq!((summary.cancelled, summary.skipped), (1, 1));
        let job = store.get_job_by_booking_id("bk_1").await.unwrap().unwrap();
        assert!(job.cancelled_upstream);
        assert_eq!(job.work_status, WorkStatus::Scheduled);
        assert!(store.get_job_by_booking_id("bk_9").await.unwrap().is_none());

        let writes = store.write_count();
        let again = engine.run(window(), false).await.unwrap();
        assert_eq!(again.cancelled, 1);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn cancelled_bookings_without_start_time_still_take_the_cancel_path() {
        let store = Arc::new(InMemoryJobStore::new());
        engine(store.clone(), FakeBookings::new(vec![square_booking("bk_1")]))
            .run(window(), false)
            .await
            .unwrap();

        let mut cancelled = square_booking("bk_1");
        cancelled.status = Some(BookingStatus::CancelledBySeller);
        cancelled.start_at = None;
        let mut declined = square_booking("bk_2");
        declined.status = Some(BookingStatus::Declined);
        declined.start_at = None;
        let engine = engine(store.clone(), FakeBookings::new(vec![cancelled, declined]));

        let summary = engine.run(window(), false).await.unwrap();
        assert!(summary.errors.is_empty(), "{:?}", summary.errors);
        assert_eq!((summary.cancelled, summary.skipped), (1, 1));
        let job = store.get_job_by_booking_id("bk_1").await.unwrap().unwrap();
        assert!(job.cancelled_upstream);
        assert!(job.appointment_time.is_some());
        assert!(store.get_job_by_booking_id("bk_2").await.unwrap().is_none());
    }

    #[test]
    fn window_overrides_are_validated() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).single().unwrap();
        let engine = engine(Arc::new(InMemoryJobStore::new()), FakeBookings::new(Vec::new()));

        let window = engine.window(now, None, Some(7)).unwrap();
        assert_eq!(window.start_at_min, now - chrono::Duration::days(1));
        assert_eq!(window.start_at_max, now + chrono::Duration::days(7));

        assert!(matches!(
            engine.window(now, Some(100_000_000_000), None),
            Err(WindowError::DaysOutOfRange { field: "daysBack", .. })
        ));
        assert!(matches!(
            engine.window(now, Some(-10), Some(-10)),
            Err(WindowError::DaysOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_bookings_are_isolated() {
        let store = Arc::new(InMemoryJobStore::new());
        let mut broken = square_booking("bk_bad");
        broken.start_at = None;
        let engine = engine(
            store.clone(),
            FakeBookings::new(vec![broken, square_booking("bk_ok")]),
        );

        let summary = engine.run(window(), false).await.unwrap();
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].booking_id, "bk_bad");
        assert!(summary.errors[0].error.contains("appointmentTime"));
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store.clone(), FakeBookings::new(vec![square_booking("bk_1")]));
        let summary = engine.run(window(), true).await.unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.created, 1);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn listing_failure_aborts_the_run() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store, FakeBookings::failing());
        assert!(matches!(
            engine.run(window(), false).await,
            Err(ReconcileError::Listing(_))
        ));
    }

    #[tokio::test]
    async fn single_booking_resync() {
        let store = Arc::new(InMemoryJobStore::new());
        let engine = engine(store.clone(), FakeBookings::new(vec![square_booking("bk_1")]));
        let change = engine.reconcile_booking_id("bk_1", false).await.unwrap();
        assert!(matches!(change, AppliedChange::Created(_)));
        assert!(matches!(
            engine.reconcile_booking_id("bk_missing", false).await,
            Err(ReconcileError::BookingNotFound(_))
        ));
    }

    #[test]
    fn summary_serializes_camel_case() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let summary = ReconcileSummary {
            scanned: 1,
            created: 1,
            updated: 0,
            cancelled: 0,
            skipped: 0,
            errors: Vec::new(),
            start_time: now,
            end_time: now,
            duration_ms: 0,
            dry_run: false,
            truncated: false,
            window: window(),
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["durationMs"], 0);
        assert_eq!(value["dryRun"], false);
        assert!(value["window"]["startAtMin"].is_string());
    }
}
