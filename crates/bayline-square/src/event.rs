use bayline_core::ParsedBooking;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::SquareBooking;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("webhook event {event_type} carries no booking object")]
    MalformedBooking { event_type: String },
}

/// Envelope fields shared by every event type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMeta {
    pub event_type: String,
    pub event_id: Option<String>,
    pub merchant_id: Option<String>,
    pub created_at: Option<String>,
    /// `data.id`, the id of the object the event is about.
    pub object_id: Option<String>,
}

/// A webhook delivery, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    BookingCreated {
        meta: EventMeta,
        booking: Option<SquareBooking>,
    },
    BookingUpdated {
        meta: EventMeta,
        booking: Option<SquareBooking>,
    },
    Other {
        meta: EventMeta,
    },
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    event_id: Option<String>,
    merchant_id: Option<String>,
    created_at: Option<String>,
    data: Option<RawData>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    id: Option<String>,
    object: Option<RawObject>,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    booking: Option<SquareBooking>,
}

impl WebhookEvent {
    pub fn from_slice(body: &[u8]) -> Result<Self, EventError> {
        let raw: RawEnvelope = serde_json::from_slice(body)
            .map_err(|err| EventError::MalformedPayload(err.to_string()))?;
        let (object_id, booking) = match raw.data {
            Some(data) => (data.id, data.object.and_then(|object| object.booking)),
            None => (None, None),
        };
        let meta = EventMeta {
            event_type: raw.event_type,
            event_id: raw.event_id,
            merchant_id: raw.merchant_id,
            created_at: raw.created_at,
            object_id,
        };
        Ok(match meta.event_type.as_str() {
            "booking.created" => Self::BookingCreated { meta, booking },
            "booking.updated" => Self::BookingUpdated { meta, booking },
            _ => Self::Other { meta },
        })
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::BookingCreated { meta, .. }
            | Self::BookingUpdated { meta, .. }
            | Self::Other { meta } => meta,
        }
    }

    pub fn action(&self) -> BookingAction {
        determine_booking_action(&self.meta().event_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingAction {
    Create,
    Update,
    Skip,
}

impl BookingAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Skip => "skip",
        }
    }
}

/// Unknown event types are skipped, never rejected.
pub fn determine_booking_action(event_type: &str) -> BookingAction {
    match event_type {
        "booking.created" => BookingAction::Create,
        "booking.updated" => BookingAction::Update,
        _ => BookingAction::Skip,
    }
}

/// Extract the normalized booking from a booking event.
///
/// Fails only when the nested booking object is absent; missing fields inside
/// it are left for [`is_valid_booking`] to judge.
pub fn parse_booking_event(event: &WebhookEvent) -> Result<ParsedBooking, EventError> {
    match event {
        WebhookEvent::BookingCreated { meta, booking }
        | WebhookEvent::BookingUpdated { meta, booking } => {
            let booking = booking.as_ref().ok_or_else(|| EventError::MalformedBooking {
                event_type: meta.event_type.clone(),
            })?;
            let mut parsed = parse_booking(booking);
            if parsed.booking_id.is_empty() {
                if let Some(object_id) = &meta.object_id {
                    parsed.booking_id = object_id.clone();
                }
            }
            Ok(parsed)
        }
        WebhookEvent::Other { meta } => Err(EventError::MalformedBooking {
            event_type: meta.event_type.clone(),
        }),
    }
}

/// Normalize a platform booking. Shared by the webhook and reconciliation paths.
pub fn parse_booking(booking: &SquareBooking) -> ParsedBooking {
    let appointment_time = booking
        .start_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|time| time.with_timezone(&Utc));
    let service_type = booking
        .appointment_segments
        .iter()
        .find_map(|segment| non_empty(segment.service_variation_id.as_deref()));
    let notes = non_empty(booking.customer_note.as_deref())
        .or_else(|| non_empty(booking.seller_note.as_deref()));

    ParsedBooking {
        booking_id: booking.id.clone().unwrap_or_default(),
        customer_id: non_empty(booking.customer_id.as_deref()),
        service_type,
        appointment_time,
        status: booking.status,
        location_id: non_empty(booking.location_id.as_deref()),
        notes,
        version: booking.version,
    }
}

/// Required fields the booking lacks; empty means persistable.
pub fn missing_booking_fields(booking: &ParsedBooking) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if booking.booking_id.trim().is_empty() {
        missing.push("bookingId");
    }
    if booking.appointment_time.is_none() {
        missing.push("appointmentTime");
    }
    if booking.status.is_none() {
        missing.push("status");
    }
    missing
}

pub fn is_valid_booking(booking: &ParsedBooking) -> bool {
    missing_booking_fields(booking).is_empty()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
