use std::sync::Arc;

use bayline_core::{BookingPatch, CustomerCache, Job, JobUpdate, ParsedBooking};
use bayline_square::{CatalogClient, CustomerClient};
use bayline_storage::{JobStore, StoreError};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a sync path should do with one booking observation.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPlan {
    /// No job exists yet; insert this one.
    Create(Box<Job>),
    /// A job exists; apply this booking-derived patch (possibly empty).
    Update { job_id: Uuid, patch: BookingPatch },
    /// Cancelled booking that never became a job.
    SkipCancelled,
}

/// Result of running a plan against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedChange {
    Created(Uuid),
    Updated(Uuid),
    Unchanged(Uuid),
    SkippedCancelled,
}

impl AppliedChange {
    pub fn job_id(self) -> Option<Uuid> {
        match self {
            Self::Created(id) | Self::Updated(id) | Self::Unchanged(id) => Some(id),
            Self::SkippedCancelled => None,
        }
    }
}

/// Derives booking-only writes from a booking observation.
///
/// Whatever the enrichment clients return, the output of [`plan`](Self::plan) for an
/// existing job is a [`BookingPatch`], which cannot name a staff-derived field.
pub struct FieldProvenanceMerger {
    customers: Arc<dyn CustomerClient>,
    catalog: Arc<dyn CatalogClient>,
}

impl FieldProvenanceMerger {
    pub fn new(customers: Arc<dyn CustomerClient>, catalog: Arc<dyn CatalogClient>) -> Self {
        Self { customers, catalog }
    }

    pub async fn plan(
        &self,
        existing: Option<&Job>,
        booking: &ParsedBooking,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> SyncPlan {
        match existing {
            None if booking.is_cancelled() => SyncPlan::SkipCancelled,
            None => {
                let job = self.creation_record(booking, created_by, now).await;
                SyncPlan::Create(Box::new(job))
            }
            Some(job) if booking.is_cancelled() => SyncPlan::Update {
                job_id: job.job_id,
                patch: Self::cancellation_patch(job),
            },
            Some(job) => SyncPlan::Update {
                job_id: job.job_id,
                patch: self.booking_patch(job, booking, now).await,
            },
        }
    }

    pub async fn creation_record(
        &self,
        booking: &ParsedBooking,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Job {
        let mut job = Job::from_booking(booking, created_by, now);
        if let Some(variation_id) = booking.service_type.as_deref() {
            job.service_type = Some(self.resolve_service_name(variation_id).await);
        }
        if let Some(customer_id) = booking.customer_id.as_deref() {
            if let Some(snapshot) = self.fetch_customer_snapshot(customer_id, now).await {
                BookingPatch {
                    customer: Some(snapshot),
                    ..BookingPatch::default()
                }
                .apply_to(&mut job);
            }
        }
        job
    }

    /// Booking-derived differences between `job` and `booking`, in rule order.
    pub async fn booking_patch(
        &self,
        job: &Job,
        booking: &ParsedBooking,
        now: DateTime<Utc>,
    ) -> BookingPatch {
        let mut patch = BookingPatch::default();

        if booking.appointment_time.is_some() && booking.appointment_time != job.appointment_time {
            patch.appointment_time = booking.appointment_time;
        }

        if let Some(customer_id) = booking.customer_id.as_deref() {
            if job.customer_id.as_deref() != Some(customer_id) {
                patch.customer_id = Some(customer_id.to_string());
            }
            let needs_refresh = match &job.customer_cached {
                None => true,
                Some(cache) => cache.id != customer_id || cache.is_stale_at(now),
            };
            if needs_refresh {
                patch.customer = self.fetch_customer_snapshot(customer_id, now).await;
            }
        }

        if let Some(variation_id) = booking.service_type.as_deref() {
            let service_name = self.resolve_service_name(variation_id).await;
            if job.service_type.as_deref() != Some(service_name.as_str()) {
                patch.service_type = Some(service_name);
            }
        }

        if booking.is_cancelled() != job.cancelled_upstream {
            patch.cancelled_upstream = Some(booking.is_cancelled());
        }

        patch
    }

    /// Cancellation never touches anything beyond the upstream mark.
    pub fn cancellation_patch(job: &Job) -> BookingPatch {
        BookingPatch {
            cancelled_upstream: (!job.cancelled_upstream).then_some(true),
            ..BookingPatch::default()
        }
    }

    async fn resolve_service_name(&self, variation_id: &str) -> String {
        match self.catalog.service_name(variation_id).await {
            Ok(name) => name,
            Err(err) => {
                warn!(variation_id, error = %err, "catalog lookup failed; keeping variation id");
                variation_id.to_string()
            }
        }
    }

    async fn fetch_customer_snapshot(
        &self,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> Option<CustomerCache> {
        match self.customers.fetch_customer(customer_id).await {
            Ok(Some(customer)) => Some(CustomerCache {
                id: customer_id.to_string(),
                name: customer.display_name(),
                email: customer.email_address.clone(),
                phone: customer.phone_number.clone(),
                cached_at: now,
            }),
            Ok(None) => {
                warn!(customer_id, "customer not found; enrichment skipped");
                None
            }
            Err(err) => {
                warn!(customer_id, error = %err, "customer fetch failed; enrichment skipped");
                None
            }
        }
    }
}

/// Idempotent create-or-update of one booking, shared by webhook and reconciliation.
///
/// A create that loses the race on the booking-id index re-reads the winner and
/// takes the update path once. With `dry_run` the plan is computed but not written.
pub async fn apply_booking(
    store: &dyn JobStore,
    merger: &FieldProvenanceMerger,
    booking: &ParsedBooking,
    created_by: &str,
    dry_run: bool,
) -> Result<AppliedChange, StoreError> {
    let now = Utc::now();
    let existing = store.get_job_by_booking_id(&booking.booking_id).await?;
    let plan = merger.plan(existing.as_ref(), booking, created_by, now).await;

    match plan {
        SyncPlan::SkipCancelled => Ok(AppliedChange::SkippedCancelled),
        SyncPlan::Update { job_id, patch } => write_patch(store, job_id, patch, dry_run).await,
        SyncPlan::Create(job) if dry_run => Ok(AppliedChange::Created(job.job_id)),
        SyncPlan::Create(job) => match store.create_job(*job).await {
            Ok(created) => {
                info!(
                    booking_id = %created.booking_id,
                    job_id = %created.job_id,
                    created_by,
                    "job created"
                );
                Ok(AppliedChange::Created(created.job_id))
            }
            Err(StoreError::Conflict { booking_id, job_id }) => {
                debug!(%booking_id, %job_id, "lost create race; falling back to update");
                let winner = store
                    .get_job_by_booking_id(&booking.booking_id)
                    .await?
                    .ok_or(StoreError::Conflict { booking_id, job_id })?;
                let patch = if booking.is_cancelled() {
                    FieldProvenanceMerger::cancellation_patch(&winner)
                } else {
                    merger.booking_patch(&winner, booking, Utc::now()).await
                };
                write_patch(store, winner.job_id, patch, false).await
            }
            Err(err) => Err(err),
        },
    }
}

async fn write_patch(
    store: &dyn JobStore,
    job_id: Uuid,
    patch: BookingPatch,
    dry_run: bool,
) -> Result<AppliedChange, StoreError> {
    if !patch.has_changes() {
        return Ok(AppliedChange::Unchanged(job_id));
    }
    let fields = patch.changed_fields();
    if !dry_run {
        store.update_job(job_id, JobUpdate::Booking(patch)).await?;
    }
    info!(%job_id, ?fields, dry_run, "booking-derived fields updated");
    Ok(AppliedChange::Updated(job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{booking, FakeCatalog, FakeCustomers};
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use bayline_core::{Actor, HistoryEvent, Role, StaffPatch, StatusHistoryEntry, WorkStatus};
    use bayline_storage::InMemoryJobStore;
    use chrono::Duration;

    fn merger(customers: FakeCustomers, catalog: FakeCatalog) -> FieldProvenanceMerger {
        FieldProvenanceMerger::new(Arc::new(customers), Arc::new(catalog))
    }

    fn checked_in_with_notes() -> JobUpdate {
        let mut staff = StaffPatch::new(
            WorkStatus::Scheduled,
            StatusHistoryEntry {
                from: Some(WorkStatus::Scheduled),
                to: Some(WorkStatus::CheckedIn),
                event: HistoryEvent::StatusChanged,
                changed_by: Actor::new("u1", "Tech", Role::Technician),
                changed_at: Utc::now(),
                reason: None,
            },
        );
        staff.work_status = Some(WorkStatus::CheckedIn);
        staff.notes = Some("keys in lockbox".into());
        JobUpdate::Staff(staff)
    }

    /// Misses the first booking-id lookup, as if another writer created the job in between.
    struct LateWinnerStore {
        inner: InMemoryJobStore,
        hide_next_lookup: AtomicBool,
    }

    #[async_trait]
    impl JobStore for LateWinnerStore {
        async fn create_job(&self, job: Job) -> Result<Job, StoreError> {
            self.inner.create_job(job).await
        }

        async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
            self.inner.get_job(job_id).await
        }

        async fn get_job_by_booking_id(&self, booking_id: &str) -> Result<Option<Job>, StoreError> {
            if self.hide_next_lookup.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.get_job_by_booking_id(booking_id).await
        }

        async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<Job, StoreError> {
            self.inner.update_job(job_id, update).await
        }

        async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
            self.inner.list_jobs().await
        }
    }

    #[tokio::test]
    async fn creation_record_is_enriched_and_defaulted() {
        let merger = merger(FakeCustomers::with_dana(), FakeCatalog::default());
        let now = Utc::now();
        let job = merger.creation_record(&booking("bk_1"), "square-webhook", now).await;
        assert_eq!(job.work_status, WorkStatus::Scheduled);
        assert_eq!(job.service_type.as_deref(), Some("Full Detail"));
        assert_eq!(job.customer_name.as_deref(), Some("Dana Reyes"));
        assert_eq!(job.customer_cached.as_ref().map(|c| c.cached_at), Some(now));
        assert_eq!(job.created_by, "square-webhook");
        assert_eq!(job.status_history.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_booking_yields_empty_patch() {
        let merger = merger(FakeCustomers::with_dana(), FakeCatalog::default());
        let now = Utc::now();
        let job = merger.creation_record(&booking("bk_1"), "square-webhook", now).await;
        let patch = merger.booking_patch(&job, &booking("bk_1"), now).await;
        assert!(!patch.has_changes(), "{patch:?}");
    }

    #[tokio::test]
    async fn stale_or_foreign_customer_cache_is_refreshed() {
        let merger = merger(FakeCustomers::with_dana(), FakeCatalog::default());
        let now = Utc::now();
        let mut job = merger.creation_record(&booking("bk_1"), "square-webhook", now).await;

        let later = now + Duration::hours(25);
        let patch = merger.booking_patch(&job, &booking("bk_1"), later).await;
        assert_eq!(
            patch.changed_fields(),
            vec!["customerCached", "customerName", "customerEmail", "customerPhone"]
        );

        if let Some(cache) = job.customer_cached.as_mut() {
            cache.id = "someone_else".into();
        }
        let patch = merger.booking_patch(&job, &booking("bk_1"), now).await;
        assert!(patch.customer.is_some());
    }

    #[tokio::test]
    async fn enrichment_failures_never_block_the_merge() {
        let merger = merger(FakeCustomers::failing(), FakeCatalog::failing());
        let now = Utc::now();
        let job = merger.creation_record(&booking("bk_1"), "square-reconcile", now).await;
        assert_eq!(job.service_type.as_deref(), Some("VAR_FULL"));
        assert!(job.customer_cached.is_none());

        let mut moved = booking("bk_1");
        moved.appointment_time = moved.appointment_time.map(|t| t + Duration::hours(2));
        let patch = merger.booking_patch(&job, &moved, now).await;
        assert_eq!(patch.changed_fields(), vec!["appointmentTime"]);
    }

    #[tokio::test]
    async fn cancelled_booking_only_marks_the_job() {
        let merger = merger(FakeCustomers::with_dana(), FakeCatalog::default());
        let now = Utc::now();
        let job = merger.creation_record(&booking("bk_1"), "square-webhook", now).await;
        let mut cancelled = booking("bk_1");
        cancelled.status = Some(bayline_core::BookingStatus::CancelledByCustomer);
        cancelled.appointment_time = None;

        match merger.plan(Some(&job), &cancelled, "square-webhook", now).await {
            SyncPlan::Update { patch, .. } => {
                assert_eq!(patch.changed_fields(), vec!["cancelledUpstream"]);
            }
            other => panic!("unexpected plan {other:?}"),
        }
        assert_eq!(
            merger.plan(None, &cancelled, "square-webhook", now).await,
            SyncPlan::SkipCancelled
        );
    }

    #[tokio::test]
    async fn apply_booking_preserves_staff_work() {
        let store = InMemoryJobStore::new();
        let merger = merger(FakeCustomers::with_dana(), FakeCatalog::default());
        let created = apply_booking(&store, &merger, &booking("bk_1"), "square-webhook", false)
            .await
            .unwrap();
        let job_id = created.job_id().unwrap();

        store.update_job(job_id, checked_in_with_notes()).await.unwrap();
        let before = store.get_job(job_id).await.unwrap().unwrap();

        let mut moved = booking("bk_1");
        moved.appointment_time = moved.appointment_time.map(|t| t + Duration::days(1));
        let change = apply_booking(&store, &merger, &moved, "square-reconcile", false)
            .await
            .unwrap();
        assert_eq!(change, AppliedChange::Updated(job_id));

        let after = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.appointment_time, moved.appointment_time);
        assert_eq!(after.work_status, before.work_status);
        assert_eq!(after.notes, before.notes);
        assert_eq!(after.status_history, before.status_history);
    }

    #[tokio::test]
    async fn lost_create_race_updates_the_winner_with_booking_fields_only() {
        let merger = merger(FakeCustomers::with_dana(), FakeCatalog::default());
        let inner = InMemoryJobStore::new();
        let winner = merger
            .creation_record(&booking("bk_1"), "square-webhook", Utc::now())
            .await;
        let job_id = inner.create_job(winner).await.unwrap().job_id;
        inner.update_job(job_id, checked_in_with_notes()).await.unwrap();
        let before = inner.get_job(job_id).await.unwrap().unwrap();

        let store = LateWinnerStore {
            inner,
            hide_next_lookup: AtomicBool::new(true),
        };
        let mut moved = booking("bk_1");
        moved.appointment_time = moved.appointment_time.map(|t| t + Duration::days(2));
        let change = apply_booking(&store, &merger, &moved, "square-reconcile", false)
            .await
            .unwrap();
        assert_eq!(change, AppliedChange::Updated(job_id));

        let jobs = store.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        let after = &jobs[0];
        assert_eq!(after.job_id, job_id);
        assert_eq!(after.appointment_time, moved.appointment_time);
        assert_eq!(after.work_status, WorkStatus::CheckedIn);
        assert_eq!(after.notes, before.notes);
        assert_eq!(after.checklist, before.checklist);
        assert_eq!(after.status_history, before.status_history);
        assert_eq!(after.created_by, "square-webhook");
    }

    #[tokio::test]
    async fn dry_run_plans_without_writing() {
        let store = InMemoryJobStore::new();
        let merger = merger(FakeCustomers::with_dana(), FakeCatalog::default());
        let change = apply_booking(&store, &merger, &booking("bk_1"), "square-reconcile", true)
            .await
            .unwrap();
        assert!(matches!(change, AppliedChange::Created(_)));
        assert_eq!(store.write_count(), 0);
        assert!(store.get_job_by_booking_id("bk_1").await.unwrap().is_none());
    }
}
