//! Core domain model for Bayline: jobs, normalized bookings, and provenance-typed writes.
//!
//! A [`Job`] owns two disjoint field classes. Booking-derived fields are written only
//! through a [`BookingPatch`]; staff-derived fields are written only through a
//! [`StaffPatch`]. [`JobUpdate`] is the single write shape a job store accepts, so a
//! write that crosses the two classes cannot be expressed.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod workflow;

pub use workflow::{JobCommand, JobError, JobStateMachine, PhotoUpload};

pub const CRATE_NAME: &str = "bayline-core";

/// Customer snapshots older than this are refreshed on the next sync observation.
pub const CUSTOMER_CACHE_TTL_HOURS: i64 = 24;

/// Job fields the booking sync paths may overwrite.
pub const BOOKING_DERIVED_FIELDS: &[&str] = &[
    "bookingId",
    "appointmentTime",
    "serviceType",
    "customerId",
    "customerName",
    "customerEmail",
    "customerPhone",
    "customerCached",
    "cancelledUpstream",
];

/// Job fields only an explicit staff action may change.
pub const STAFF_DERIVED_FIELDS: &[&str] = &[
    "workStatus",
    "checklist",
    "photosMeta",
    "receiptPhotos",
    "postCompletionIssue",
    "payment",
    "vehicleInfo",
    "notes",
    "statusHistory",
    "noShow",
];

/// Booking status in the booking platform's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Accepted,
    CancelledByCustomer,
    CancelledBySeller,
    Declined,
    NoShow,
    #[serde(other)]
    Unknown,
}

impl BookingStatus {
    /// True for statuses after which the appointment will not happen.
    pub fn is_cancelled(self) -> bool {
        matches!(
            self,
            Self::CancelledByCustomer | Self::CancelledBySeller | Self::Declined | Self::NoShow
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::CancelledByCustomer => "CANCELLED_BY_CUSTOMER",
            Self::CancelledBySeller => "CANCELLED_BY_SELLER",
            Self::Declined => "DECLINED",
            Self::NoShow => "NO_SHOW",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized projection of a platform booking, produced fresh per event or scan.
///
/// `service_type` holds the raw service-variation id; the merger resolves it to a
/// human-readable name before it reaches a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedBooking {
    pub booking_id: String,
    pub customer_id: Option<String>,
    pub service_type: Option<String>,
    pub appointment_time: Option<DateTime<Utc>>,
    pub status: Option<BookingStatus>,
    pub location_id: Option<String>,
    pub notes: Option<String>,
    pub version: Option<i64>,
}

impl ParsedBooking {
    pub fn is_cancelled(&self) -> bool {
        self.status.is_some_and(BookingStatus::is_cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Technician,
    Manager,
    Admin,
    System,
}

impl Role {
    pub fn is_manager(self) -> bool {
        matches!(self, Self::Manager | Self::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Technician => "TECHNICIAN",
            Self::Manager => "MANAGER",
            Self::Admin => "ADMIN",
            Self::System => "SYSTEM",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity attached to every audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: String,
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            role,
        }
    }

    /// Non-human writer, e.g. `square-webhook`.
    pub fn system(tag: &str) -> Self {
        Self::new(tag, tag, Role::System)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    Scheduled,
    CheckedIn,
    InProgress,
    QcReady,
    WorkCompleted,
    NoShow,
    NoShowResolved,
}

impl WorkStatus {
    /// The correctable working states, `SCHEDULED` through `QC_READY`.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::CheckedIn | Self::InProgress | Self::QcReady
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::WorkCompleted)
    }

    pub fn allows_no_show(self) -> bool {
        matches!(self, Self::Scheduled | Self::CheckedIn | Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::CheckedIn => "CHECKED_IN",
            Self::InProgress => "IN_PROGRESS",
            Self::QcReady => "QC_READY",
            Self::WorkCompleted => "WORK_COMPLETED",
            Self::NoShow => "NO_SHOW",
            Self::NoShowResolved => "NO_SHOW_RESOLVED",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerCache {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub cached_at: DateTime<Utc>,
}

impl CustomerCache {
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now - self.cached_at > Duration::hours(CUSTOMER_CACHE_TTL_HOURS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoMeta {
    /// Object-storage key of the committed upload.
    pub key: String,
    pub content_type: Option<String>,
    pub caption: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: Actor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleInfo {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<u16>,
    pub color: Option<String>,
    pub plate: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    Paid,
}

/// Payment bookkeeping only; no money moves through this system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub status: PaymentStatus,
    pub method: Option<String>,
    pub reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<Actor>,
}

/// Issue categories. Unknown wire values decode as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    Damage,
    QualityComplaint,
    MissedArea,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCompletionIssue {
    pub is_open: bool,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub notes: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub opened_by: Actor,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Actor>,
    pub resolution_notes: Option<String>,
}

/// No-show categories. Unknown wire values decode as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoShowReason {
    CustomerDidNotArrive,
    LateCancellation,
    VehicleUnavailable,
    #[serde(other)]
    Other,
}

impl NoShowReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CustomerDidNotArrive => "CUSTOMER_DID_NOT_ARRIVE",
            Self::LateCancellation => "LATE_CANCELLATION",
            Self::VehicleUnavailable => "VEHICLE_UNAVAILABLE",
            Self::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoShowResolution {
    /// The customer turned up after all; the job returns to its prior status.
    Reinstated,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoShow {
    pub is_open: bool,
    pub reason: NoShowReason,
    pub notes: Option<String>,
    pub previous_status: WorkStatus,
    pub marked_at: DateTime<Utc>,
    pub marked_by: Actor,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Actor>,
    pub resolution: Option<NoShowResolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryEvent {
    JobCreated,
    StatusChanged,
    NoShowMarked,
    NoShowResolved,
    IssueOpened,
    IssueResolved,
    PaymentMarkedPaid,
    PaymentMarkedUnpaid,
    ReceiptPhotoAdded,
    PhotoAdded,
    ChecklistUpdated,
    VehicleInfoUpdated,
    NotesUpdated,
}

/// Append-only audit record. `from`/`to` are set only when `workStatus` changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub from: Option<WorkStatus>,
    pub to: Option<WorkStatus>,
    pub event: HistoryEvent,
    pub changed_by: Actor,
    pub changed_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,

    // booking-derived
    pub booking_id: String,
    pub appointment_time: Option<DateTime<Utc>>,
    pub service_type: Option<String>,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_cached: Option<CustomerCache>,
    #[serde(default)]
    pub cancelled_upstream: bool,

    // staff-derived
    pub work_status: WorkStatus,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub photos_meta: Vec<PhotoMeta>,
    #[serde(default)]
    pub receipt_photos: Vec<PhotoMeta>,
    pub post_completion_issue: Option<PostCompletionIssue>,
    #[serde(default)]
    pub payment: Payment,
    pub vehicle_info: Option<VehicleInfo>,
    pub notes: Option<String>,
    #[serde(default)]
    pub status_history: Vec<StatusHistoryEntry>,
    pub no_show: Option<NoShow>,
}

impl Job {
    /// Fresh job for a booking seen for the first time: booking-derived fields copied
    /// from the booking, staff-derived fields defaulted, one `JOB_CREATED` audit entry.
    pub fn from_booking(booking: &ParsedBooking, created_by: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            created_by: created_by.to_string(),
            booking_id: booking.booking_id.clone(),
            appointment_time: booking.appointment_time,
            service_type: booking.service_type.clone(),
            customer_id: booking.customer_id.clone(),
            customer_name: None,
            customer_email: None,
            customer_phone: None,
            customer_cached: None,
            cancelled_upstream: booking.is_cancelled(),
            work_status: WorkStatus::Scheduled,
            checklist: Vec::new(),
            photos_meta: Vec::new(),
            receipt_photos: Vec::new(),
            post_completion_issue: None,
            payment: Payment::default(),
            vehicle_info: None,
            notes: booking.notes.clone(),
            status_history: vec![StatusHistoryEntry {
                from: None,
                to: Some(WorkStatus::Scheduled),
                event: HistoryEvent::JobCreated,
                changed_by: Actor::system(created_by),
                changed_at: now,
                reason: None,
            }],
            no_show: None,
        }
    }

    pub fn has_open_issue(&self) -> bool {
        self.post_completion_issue
            .as_ref()
            .is_some_and(|issue| issue.is_open)
    }

    pub fn has_open_no_show(&self) -> bool {
        self.no_show.as_ref().is_some_and(|no_show| no_show.is_open)
    }

    fn set_customer_snapshot(&mut self, snapshot: &CustomerCache) {
        self.customer_name = snapshot.name.clone();
        self.customer_email = snapshot.email.clone();
        self.customer_phone = snapshot.phone.clone();
        self.customer_cached = Some(snapshot.clone());
    }
}

/// Partial update restricted to booking-derived fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appointment_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// Sets `customerCached` together with `customerName/Email/Phone`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<CustomerCache>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_upstream: Option<bool>,
}

impl BookingPatch {
    pub fn has_changes(&self) -> bool {
        !self.changed_fields().is_empty()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.appointment_time.is_some() {
            fields.push("appointmentTime");
        }
        if self.service_type.is_some() {
            fields.push("serviceType");
        }
        if self.customer_id.is_some() {
            fields.push("customerId");
        }
        if self.customer.is_some() {
            fields.extend(["customerCached", "customerName", "customerEmail", "customerPhone"]);
        }
        if self.cancelled_upstream.is_some() {
            fields.push("cancelledUpstream");
        }
        fields
    }

    pub fn apply_to(&self, job: &mut Job) {
        if let Some(appointment_time) = self.appointment_time {
            job.appointment_time = Some(appointment_time);
        }
        if let Some(service_type) = &self.service_type {
            job.service_type = Some(service_type.clone());
        }
        if let Some(customer_id) = &self.customer_id {
            job.customer_id = Some(customer_id.clone());
        }
        if let Some(snapshot) = &self.customer {
            job.set_customer_snapshot(snapshot);
        }
        if let Some(cancelled) = self.cancelled_upstream {
            job.cancelled_upstream = cancelled;
        }
    }
}

/// Partial update restricted to staff-derived fields, carrying exactly one audit entry.
///
/// `expected_status` is the `workStatus` the patch was computed against; applying it
/// to a job whose status has since moved fails with [`JobError::StaleState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffPatch {
    pub expected_status: WorkStatus,
    pub work_status: Option<WorkStatus>,
    pub checklist: Option<Vec<ChecklistItem>>,
    pub photos_meta: Option<Vec<PhotoMeta>>,
    pub receipt_photos: Option<Vec<PhotoMeta>>,
    pub post_completion_issue: Option<PostCompletionIssue>,
    pub payment: Option<Payment>,
    pub vehicle_info: Option<VehicleInfo>,
    pub notes: Option<String>,
    pub no_show: Option<NoShow>,
    pub history_entry: StatusHistoryEntry,
}

impl StaffPatch {
    pub fn new(expected_status: WorkStatus, history_entry: StatusHistoryEntry) -> Self {
        Self {
            expected_status,
            work_status: None,
            checklist: None,
            photos_meta: None,
            receipt_photos: None,
            post_completion_issue: None,
            payment: None,
            vehicle_info: None,
            notes: None,
            no_show: None,
            history_entry,
        }
    }

    pub fn apply_to(self, job: &mut Job) -> Result<(), JobError> {
        if job.work_status != self.expected_status {
            return Err(JobError::StaleState {
                expected: self.expected_status,
                actual: job.work_status,
            });
        }
        if let Some(status) = self.work_status {
            job.work_status = status;
        }
        if let Some(checklist) = self.checklist {
            job.checklist = checklist;
        }
        if let Some(photos) = self.photos_meta {
            job.photos_meta = photos;
        }
        if let Some(photos) = self.receipt_photos {
            job.receipt_photos = photos;
        }
        if let Some(issue) = self.post_completion_issue {
            job.post_completion_issue = Some(issue);
        }
        if let Some(payment) = self.payment {
            job.payment = payment;
        }
        if let Some(vehicle) = self.vehicle_info {
            job.vehicle_info = Some(vehicle);
        }
        if let Some(notes) = self.notes {
            job.notes = Some(notes);
        }
        if let Some(no_show) = self.no_show {
            job.no_show = Some(no_show);
        }
        job.status_history.push(self.history_entry);
        Ok(())
    }
}

/// The only write shape a job store accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobUpdate {
    Booking(BookingPatch),
    Staff(StaffPatch),
}

impl JobUpdate {
    pub fn apply_to(self, job: &mut Job, now: DateTime<Utc>) -> Result<(), JobError> {
        match self {
            Self::Booking(patch) => patch.apply_to(job),
            Self::Staff(patch) => patch.apply_to(job)?,
        }
        job.updated_at = now;
        Ok(())
    }
}
