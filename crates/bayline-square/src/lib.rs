//! Booking-platform adapters: webhook decoding, signature checks, and pull-side API clients.

use async_trait::async_trait;
use bayline_core::BookingStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

mod cache;
mod event;
mod http;
mod signature;

pub use cache::{CachedCatalog, TtlCache, CATALOG_CACHE_CAPACITY, CATALOG_CACHE_TTL};
pub use event::{
    determine_booking_action, is_valid_booking, missing_booking_fields, parse_booking,
    parse_booking_event, BookingAction, EventError, EventMeta, WebhookEvent,
};
pub use http::{FailureKind, RetryBudget, SquareClient, SquareConfig};
pub use signature::{
    check_signature, compute_signature, constant_time_eq, verify_signature, SignatureCheck,
    SIGNATURE_HEADER,
};

pub const CRATE_NAME: &str = "bayline-square";

/// The platform rejects list queries spanning more than this many days.
pub const MAX_WINDOW_DAYS: i64 = 31;

/// Upper bound for either side of a reconciliation window, in days.
pub const MAX_WINDOW_SPAN_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("{field} must be between 0 and {max} days, got {value}", max = MAX_WINDOW_SPAN_DAYS)]
    DaysOutOfRange { field: &'static str, value: i64 },
}

#[derive(Debug, Error)]
pub enum SquareError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// A booking as the platform returns it. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquareBooking {
    pub id: Option<String>,
    pub version: Option<i64>,
    pub status: Option<BookingStatus>,
    pub start_at: Option<String>,
    pub location_id: Option<String>,
    pub customer_id: Option<String>,
    pub customer_note: Option<String>,
    pub seller_note: Option<String>,
    #[serde(default)]
    pub appointment_segments: Vec<AppointmentSegment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentSegment {
    pub service_variation_id: Option<String>,
    pub service_variation_version: Option<i64>,
    pub team_member_id: Option<String>,
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquareCustomer {
    pub id: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub company_name: Option<String>,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
}

impl SquareCustomer {
    pub fn display_name(&self) -> Option<String> {
        let parts = [self.given_name.as_deref(), self.family_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>();
        if parts.is_empty() {
            self.company_name.clone().filter(|name| !name.trim().is_empty())
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Inclusive `start_at` range for a booking listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingWindow {
    pub start_at_min: DateTime<Utc>,
    pub start_at_max: DateTime<Utc>,
}

impl BookingWindow {
    pub fn new(start_at_min: DateTime<Utc>, start_at_max: DateTime<Utc>) -> Self {
        Self {
            start_at_min,
            start_at_max,
        }
    }

    /// `[now - days_back, now + days_ahead]`, each side limited to `0..=MAX_WINDOW_SPAN_DAYS`.
    pub fn around(
        now: DateTime<Utc>,
        days_back: i64,
        days_ahead: i64,
    ) -> Result<Self, WindowError> {
        let back = span_days("daysBack", days_back)?;
        let ahead = span_days("daysAhead", days_ahead)?;
        Ok(Self::new(now - back, now + ahead))
    }

    /// Consecutive sub-windows no longer than `max_days`, covering this window.
    /// An inverted window has no slices.
    pub fn slices(&self, max_days: i64) -> Vec<BookingWindow> {
        if self.start_at_min > self.start_at_max {
            return Vec::new();
        }
        let step = Duration::days(max_days.max(1));
        let mut slices = Vec::new();
        let mut cursor = self.start_at_min;
        while cursor < self.start_at_max {
            let end = (cursor + step).min(self.start_at_max);
            slices.push(BookingWindow::new(cursor, end));
            cursor = end;
        }
        if slices.is_empty() {
            slices.push(*self);
        }
        slices
    }
}

fn span_days(field: &'static str, value: i64) -> Result<Duration, WindowError> {
    if !(0..=MAX_WINDOW_SPAN_DAYS).contains(&value) {
        return Err(WindowError::DaysOutOfRange { field, value });
    }
    Duration::try_days(value).ok_or(WindowError::DaysOutOfRange { field, value })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPage {
    #[serde(default)]
    pub bookings: Vec<SquareBooking>,
    pub cursor: Option<String>,
}

/// Every booking in a window, collected under a page budget.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingListing {
    pub bookings: Vec<SquareBooking>,
    pub pages: usize,
    /// True when the page budget ran out before the last cursor was drained.
    pub truncated: bool,
}

#[async_trait]
pub trait BookingsClient: Send + Sync {
    async fn list_bookings(
        &self,
        window: &BookingWindow,
        location_id: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<BookingPage, SquareError>;

    async fn retrieve_booking(
        &self,
        booking_id: &str,
    ) -> Result<Option<SquareBooking>, SquareError>;
}

#[async_trait]
pub trait CustomerClient: Send + Sync {
    async fn fetch_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<SquareCustomer>, SquareError>;
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Human-readable service name for a service-variation id.
    async fn service_name(&self, variation_id: &str) -> Result<String, SquareError>;
}

/// Drain every page for `window`, splitting it into platform-sized slices.
///
/// `max_pages` bounds the whole call, not each slice.
pub async fn list_all_bookings(
    client: &dyn BookingsClient,
    window: &BookingWindow,
    location_id: Option<&str>,
    max_pages: usize,
) -> Result<BookingListing, SquareError> {
    let mut listing = BookingListing::default();
    for slice in window.slices(MAX_WINDOW_DAYS) {
        let mut cursor: Option<String> = None;
        loop {
            if listing.pages >= max_pages {
                warn!(
                    max_pages,
                    collected = listing.bookings.len(),
                    "booking listing hit page cap; remaining pages skipped"
                );
                listing.truncated = true;
                return Ok(listing);
            }
            let page = client
                .list_bookings(&slice, location_id, cursor.as_deref())
                .await?;
            listing.pages += 1;
            listing.bookings.extend(page.bookings);
            match page.cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
    }
    Ok(listing)
}
