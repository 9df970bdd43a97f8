use std::sync::Arc;

use bayline_square::{
    check_signature, is_valid_booking, missing_booking_fields, parse_booking_event, BookingAction,
    EventError, SignatureCheck, WebhookEvent,
};
use bayline_storage::{JobStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::merger::{apply_booking, AppliedChange, FieldProvenanceMerger};

pub const WEBHOOK_CREATOR: &str = "square-webhook";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("webhook signature does not match")]
    SignatureInvalid,
    #[error("webhook signature missing")]
    SignatureMissing,
    #[error("webhook signature key is not configured")]
    SignatureKeyMissing,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("booking {booking_id:?} is missing required fields: {missing:?}")]
    InvalidBooking {
        booking_id: String,
        missing: Vec<&'static str>,
    },
    #[error("persisting booking failed: {0}")]
    Persistence(#[from] StoreError),
}

impl IngestError {
    /// Failures the platform should redeliver.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::SignatureInvalid | Self::SignatureMissing)
    }
}

impl From<EventError> for IngestError {
    fn from(err: EventError) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestAction {
    Created,
    Updated,
    Unchanged,
    SkippedUnsupportedEvent,
    SkippedFiltered,
    SkippedCancelled,
}

impl IngestAction {
    pub fn is_processed(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub processed: bool,
    pub action: IngestAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl IngestOutcome {
    fn new(action: IngestAction, booking_id: Option<String>, job_id: Option<Uuid>) -> Self {
        Self {
            processed: action.is_processed(),
            action,
            booking_id,
            job_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    pub signature_key: Option<String>,
    /// Reject unsigned deliveries instead of warning.
    pub strict_signatures: bool,
    /// Single-location deployments ignore bookings for other locations.
    pub location_id: Option<String>,
}

pub struct WebhookIngestPipeline {
    config: WebhookConfig,
    store: Arc<dyn JobStore>,
    merger: Arc<FieldProvenanceMerger>,
}

impl WebhookIngestPipeline {
    pub fn new(
        config: WebhookConfig,
        store: Arc<dyn JobStore>,
        merger: Arc<FieldProvenanceMerger>,
    ) -> Self {
        Self {
            config,
            store,
            merger,
        }
    }

    /// One delivery: verify, classify, validate, filter, then create-or-update.
    ///
    /// `url` must be the notification URL the platform signed, not a rewritten one.
    pub async fn ingest(
        &self,
        body: &[u8],
        signature: Option<&str>,
        url: &str,
    ) -> Result<IngestOutcome, IngestError> {
        self.verify(body, signature, url)?;

        let event = WebhookEvent::from_slice(body)?;
        let meta = event.meta().clone();
        let span = info_span!(
            "webhook_ingest",
            event_type = %meta.event_type,
            event_id = meta.event_id.as_deref().unwrap_or("")
        );
        async move {
            if event.action() == BookingAction::Skip {
                info!("unsupported event acknowledged");
                return Ok(IngestOutcome::new(
                    IngestAction::SkippedUnsupportedEvent,
                    meta.object_id.clone(),
                    None,
                ));
            }

            let booking = parse_booking_event(&event)?;
            if !is_valid_booking(&booking) {
                return Err(IngestError::InvalidBooking {
                    missing: missing_booking_fields(&booking),
                    booking_id: booking.booking_id,
                });
            }

            if let Some(location) = self.config.location_id.as_deref() {
                if booking.location_id.as_deref() != Some(location) {
                    info!(
                        booking_id = %booking.booking_id,
                        location_id = booking.location_id.as_deref().unwrap_or(""),
                        "booking for another location ignored"
                    );
                    return Ok(IngestOutcome::new(
                        IngestAction::SkippedFiltered,
                        Some(booking.booking_id),
                        None,
                    ));
                }
            }

            let change = apply_booking(
                self.store.as_ref(),
                &self.merger,
                &booking,
                WEBHOOK_CREATOR,
                false,
            )
            .await?;
            let action = match change {
                AppliedChange::Created(_) => IngestAction::Created,
                AppliedChange::Updated(_) => IngestAction::Updated,
                AppliedChange::Unchanged(_) => IngestAction::Unchanged,
                AppliedChange::SkippedCancelled => IngestAction::SkippedCancelled,
            };
            info!(booking_id = %booking.booking_id, action = ?action, "webhook processed");
            Ok(IngestOutcome::new(action, Some(booking.booking_id), change.job_id()))
        }
        .instrument(span)
        .await
    }

    fn verify(&self, body: &[u8], signature: Option<&str>, url: &str) -> Result<(), IngestError> {
        let Some(key) = self.config.signature_key.as_deref().filter(|k| !k.is_empty()) else {
            if self.config.strict_signatures {
                return Err(IngestError::SignatureKeyMissing);
            }
            warn!("no webhook signature key configured; skipping verification");
            return Ok(());
        };

        match check_signature(body, signature, key, url) {
            SignatureCheck::Valid => Ok(()),
            SignatureCheck::Invalid => {
                warn!(url, "webhook signature rejected");
                Err(IngestError::SignatureInvalid)
            }
            SignatureCheck::Missing if self.config.strict_signatures => {
                warn!(url, "unsigned webhook rejected");
                Err(IngestError::SignatureMissing)
            }
            SignatureCheck::Missing => {
                warn!(url, "unsigned webhook accepted outside strict mode");
                Ok(())
            }
        }
    }
}
