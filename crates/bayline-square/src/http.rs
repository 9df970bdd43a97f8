use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info_span, Instrument};

use crate::{
    BookingPage, BookingWindow, BookingsClient, CatalogClient, CustomerClient, SquareBooking,
    SquareCustomer, SquareError,
};

const LIST_PAGE_LIMIT: &str = "100";
const DEFAULT_VARIATION_NAME: &str = "Regular";

/// Why a Square GET failed, as far as trying it again is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// `429 RATE_LIMITED`. Square may say how long to stay away.
    RateLimited { retry_after: Option<Duration> },
    /// 5xx, or a timeout/connect failure before Square answered.
    Transient,
    /// Any other 4xx, e.g. a revoked token or a malformed cursor.
    Permanent,
}

impl FailureKind {
    pub fn from_status(status: StatusCode, headers: &HeaderMap) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = headers
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            Self::RateLimited { retry_after }
        } else if status.is_server_error() {
            Self::Transient
        } else {
            Self::Permanent
        }
    }

    pub fn from_send_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Transient
        } else {
            Self::Permanent
        }
    }
}

/// How many times, and how patiently, a Square GET is repeated.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryBudget {
    /// Pause before retrying after failed attempt `attempt` (0-based), or `None` to give up.
    /// A `Retry-After` longer than the doubling step wins; `max_delay` caps both.
    pub fn pause_after(&self, attempt: usize, failure: FailureKind) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        let step = self.base_delay.saturating_mul(factor);
        let pause = match failure {
            FailureKind::Permanent => return None,
            FailureKind::Transient => step,
            FailureKind::RateLimited { retry_after } => {
                retry_after.map_or(step, |after| after.max(step))
            }
        };
        Some(pause.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct SquareConfig {
    pub access_token: Option<String>,
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
    pub retry: RetryBudget,
}

impl Default for SquareConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            base_url: "https://connect.squareup.com".to_string(),
            api_version: "2024-10-17".to_string(),
            timeout: Duration::from_secs(20),
            retry: RetryBudget::default(),
        }
    }
}

impl SquareConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            access_token: std::env::var("SQUARE_ACCESS_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            base_url: std::env::var("SQUARE_API_BASE_URL").unwrap_or(defaults.base_url),
            api_version: std::env::var("SQUARE_API_VERSION").unwrap_or(defaults.api_version),
            timeout: std::env::var("SQUARE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retry: RetryBudget {
                max_retries: std::env::var("SQUARE_HTTP_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.retry.max_retries),
                ..defaults.retry
            },
        }
    }
}

/// Square REST client (`Square-Version` pinned). GETs are retried within a [`RetryBudget`].
#[derive(Debug, Clone)]
pub struct SquareClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    api_version: String,
    retry: RetryBudget,
}

#[derive(Debug, Deserialize)]
struct RetrieveBookingResponse {
    booking: Option<SquareBooking>,
}

#[derive(Debug, Deserialize)]
struct RetrieveCustomerResponse {
    customer: Option<SquareCustomer>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CatalogObjectResponse {
    pub object: Option<CatalogObject>,
    #[serde(default)]
    pub related_objects: Vec<CatalogObject>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CatalogObject {
    pub id: Option<String>,
    pub item_data: Option<CatalogItemData>,
    pub item_variation_data: Option<CatalogVariationData>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CatalogItemData {
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CatalogVariationData {
    pub item_id: Option<String>,
    pub name: Option<String>,
}

impl SquareClient {
    pub fn new(config: SquareConfig) -> Result<Self> {
        let access_token = config
            .access_token
            .context("SQUARE_ACCESS_TOKEN is not set")?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(concat!("bayline/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token,
            api_version: config.api_version,
            retry: config.retry,
        })
    }

    /// GET `path` and decode the JSON body. `Ok(None)` means the platform answered 404.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, SquareError> {
        let url = format!("{}{}", self.base_url, path);
        let span = info_span!("square_http", url = %url);
        async {
            let mut attempt = 0usize;
            loop {
                let sent = self
                    .client
                    .get(&url)
                    .query(query)
                    .bearer_auth(&self.access_token)
                    .header("Square-Version", &self.api_version)
                    .send()
                    .await;

                let pause = match sent {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let bytes = resp.bytes().await.map_err(SquareError::Request)?;
                            return serde_json::from_slice(&bytes).map(Some).map_err(|err| {
                                SquareError::Decode {
                                    url: url.clone(),
                                    message: err.to_string(),
                                }
                            });
                        }
                        if status == StatusCode::NOT_FOUND {
                            return Ok(None);
                        }
                        let failure = FailureKind::from_status(status, resp.headers());
                        let Some(pause) = self.retry.pause_after(attempt, failure) else {
                            return Err(SquareError::HttpStatus {
                                status: status.as_u16(),
                                url: url.clone(),
                            });
                        };
                        debug!(
                            status = status.as_u16(),
                            attempt,
                            ?failure,
                            "retrying square request"
                        );
                        pause
                    }
                    Err(err) => {
                        let failure = FailureKind::from_send_error(&err);
                        let Some(pause) = self.retry.pause_after(attempt, failure) else {
                            return Err(SquareError::Request(err));
                        };
                        debug!(error = %err, attempt, "retrying square request");
                        pause
                    }
                };
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl BookingsClient for SquareClient {
    async fn list_bookings(
        &self,
        window: &BookingWindow,
        location_id: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<BookingPage, SquareError> {
        let mut query = vec![
            ("limit", LIST_PAGE_LIMIT.to_string()),
            ("start_at_min", window.start_at_min.to_rfc3339()),
            ("start_at_max", window.start_at_max.to_rfc3339()),
        ];
        if let Some(location_id) = location_id {
            query.push(("location_id", location_id.to_string()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let page: Option<BookingPage> = self.get_json("/v2/bookings", &query).await?;
        Ok(page.unwrap_or_default())
    }

    async fn retrieve_booking(
        &self,
        booking_id: &str,
    ) -> Result<Option<SquareBooking>, SquareError> {
        let resp: Option<RetrieveBookingResponse> = self
            .get_json(&format!("/v2/bookings/{booking_id}"), &[])
            .await?;
        Ok(resp.and_then(|resp| resp.booking))
    }
}

#[async_trait]
impl CustomerClient for SquareClient {
    async fn fetch_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<SquareCustomer>, SquareError> {
        let resp: Option<RetrieveCustomerResponse> = self
            .get_json(&format!("/v2/customers/{customer_id}"), &[])
            .await?;
        Ok(resp.and_then(|resp| resp.customer))
    }
}

#[async_trait]
impl CatalogClient for SquareClient {
    async fn service_name(&self, variation_id: &str) -> Result<String, SquareError> {
        let path = format!("/v2/catalog/object/{variation_id}");
        let resp: Option<CatalogObjectResponse> = self
            .get_json(&path, &[("include_related_objects", "true".to_string())])
            .await?;
        resp.as_ref()
            .and_then(service_name_from_catalog)
            .ok_or_else(|| SquareError::Decode {
                url: path,
                message: format!("no item name for variation {variation_id}"),
            })
    }
}

/// Item name, suffixed with the variation name unless it is the default variation.
pub(crate) fn service_name_from_catalog(resp: &CatalogObjectResponse) -> Option<String> {
    let object = resp.object.as_ref()?;
    let variation = object.item_variation_data.as_ref();
    let variation_name = variation
        .and_then(|data| data.name.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty());

    let item_name = variation
        .and_then(|data| data.item_id.as_deref())
        .and_then(|item_id| {
            resp.related_objects
                .iter()
                .find(|related| related.id.as_deref() == Some(item_id))
        })
        .or_else(|| resp.related_objects.iter().find(|related| related.item_data.is_some()))
        .and_then(|item| item.item_data.as_ref())
        .or(object.item_data.as_ref())
        .and_then(|data| data.name.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty());

    match (item_name, variation_name) {
        (Some(item), Some(variation)) if variation != DEFAULT_VARIATION_NAME => {
            Some(format!("{item} - {variation}"))
        }
        (Some(item), _) => Some(item.to_string()),
        (None, Some(variation)) => Some(variation.to_string()),
        (None, None) => None,
    }
}
