//! Notion database sink: lookup-then-write upsert keyed by reservation number.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use staysync_core::CanonicalReservation;
use staysync_transport::{
    classify_status, send_with_retry, BackoffPolicy, JsonRequest, JsonResponse, JsonTransport,
    RetryError, RetryPolicy,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "staysync-sink";

pub const DEFAULT_NOTION_URL: &str = "https://api.notion.com/v1";
pub const NOTION_VERSION: &str = "2022-06-28";
/// Sink property holding the source confirmation id.
pub const EXTERNAL_ID_PROPERTY: &str = "Res #";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub base_url: String,
    pub token: String,
    pub database_id: String,
    pub notion_version: String,
    pub retry: RetryPolicy,
}

impl SinkConfig {
    pub fn new(token: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_NOTION_URL.to_string(),
            token: token.into(),
            database_id: database_id.into(),
            notion_version: NOTION_VERSION.to_string(),
            retry: RetryPolicy::new(
                BackoffPolicy {
                    max_retries: 5,
                    base_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(16),
                },
                classify_status,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable after {attempts} attempts: {reason}")]
    Unavailable { attempts: usize, reason: String },
    #[error("sink rejected {operation} with http {status}: {message}")]
    Rejected {
        operation: &'static str,
        status: u16,
        message: String,
    },
    #[error("malformed sink response to {operation}: {message}")]
    Malformed {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} interrupted before a response: {reason}")]
    Interrupted {
        operation: &'static str,
        reason: String,
    },
}

impl SinkError {
    /// The server may have applied the request even though it reported failure.
    pub fn outcome_unknown(&self) -> bool {
        match self {
            SinkError::Rejected { status, .. } => *status >= 500,
            SinkError::Interrupted { .. } => true,
            _ => false,
        }
    }
}

impl From<RetryError> for SinkError {
    fn from(err: RetryError) -> Self {
        SinkError::Unavailable {
            attempts: err.attempts(),
            reason: err.to_string(),
        }
    }
}

fn rich_text(content: &str) -> JsonValue {
    json!({"rich_text": [{"text": {"content": content}}]})
}

// Notion rejects select options containing commas.
fn select(name: &str) -> JsonValue {
    json!({"select": {"name": name.replace(',', " ")}})
}

/// Sink property map for a reservation. Absent dates are left out entirely so
/// a partial update never clears a value stored earlier.
pub fn build_properties(record: &CanonicalReservation) -> Map<String, JsonValue> {
    let mut props = Map::new();
    props.insert(
        "Name".into(),
        json!({"title": [{"text": {"content": record.guest_name}}]}),
    );
    props.insert(EXTERNAL_ID_PROPERTY.into(), rich_text(&record.external_id));
    props.insert("Status".into(), select(&record.status_label));
    props.insert("State".into(), select(record.status_kind.as_str()));
    props.insert("Group".into(), select(&record.property_group));
    props.insert("NTS".into(), json!({"number": record.nights}));
    props.insert("GST".into(), rich_text(&record.occupancy_label));
    props.insert("Room".into(), rich_text(&record.unit_label));
    props.insert("Total".into(), json!({"number": record.total_amount}));
    props.insert("TL Rate".into(), json!({"number": record.nightly_rate}));

    for (name, date) in [
        ("Created", record.created_at),
        ("CI", record.checkin_at),
        ("CO", record.checkout_at),
    ] {
        if let Some(date) = date {
            props.insert(
                name.into(),
                json!({"date": {"start": date.format(DATE_FORMAT).to_string()}}),
            );
        }
    }
    props
}

/// Plain text of a rich-text property as Notion returns it.
fn rich_text_value(property: &JsonValue) -> Option<String> {
    let parts = property.get("rich_text")?.as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|part| {
                part.get("plain_text")
                    .or_else(|| part.get("text").and_then(|t| t.get("content")))
                    .and_then(JsonValue::as_str)
            })
            .collect(),
    )
}

pub struct NotionSink {
    transport: Arc<dyn JsonTransport>,
    config: SinkConfig,
}

impl NotionSink {
    pub fn new(transport: Arc<dyn JsonTransport>, config: SinkConfig) -> Self {
        Self { transport, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: JsonRequest) -> JsonRequest {
        request
            .with_bearer(self.config.token.clone())
            .with_header("Notion-Version", self.config.notion_version.clone())
    }

    fn check(operation: &'static str, resp: JsonResponse) -> Result<JsonValue, SinkError> {
        if !resp.status.is_success() {
            let message = resp
                .body
                .get("message")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| resp.body.to_string());
            return Err(SinkError::Rejected {
                operation,
                status: resp.status.as_u16(),
                message,
            });
        }
        Ok(resp.body)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: JsonRequest,
    ) -> Result<JsonValue, SinkError> {
        let resp = send_with_retry(self.transport.as_ref(), &request, &self.config.retry).await?;
        Self::check(operation, resp)
    }

    /// Native page id of the entry whose reservation number is exactly `external_id`.
    pub async fn find_page(&self, external_id: &str) -> Result<Option<String>, SinkError> {
        let body = json!({
            "filter": {
                "property": EXTERNAL_ID_PROPERTY,
                "rich_text": {"equals": external_id}
            }
        });
        let path = format!("databases/{}/query", self.config.database_id);
        let request = self.authorized(JsonRequest::post(self.url(&path), body));
        let resp = self.send("query", request).await?;
        let results = resp
            .get("results")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| SinkError::Malformed {
                operation: "query",
                message: "missing results array".to_string(),
            })?;

        for page in results {
            let stored = page
                .get("properties")
                .and_then(|p| p.get(EXTERNAL_ID_PROPERTY))
                .and_then(rich_text_value);
            if stored.is_some_and(|s| s != external_id) {
                continue;
            }
            let id = page
                .get("id")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| SinkError::Malformed {
                    operation: "query",
                    message: "result without id".to_string(),
                })?;
            return Ok(Some(id.to_string()));
        }
        Ok(None)
    }

    /// One create request. Only a 429 is resent here; any other failure may
    /// have created the page already.
    pub async fn create_page(
        &self,
        properties: Map<String, JsonValue>,
    ) -> Result<String, SinkError> {
        let body = json!({
            "parent": {"database_id": self.config.database_id},
            "properties": properties,
        });
        let request = self.authorized(JsonRequest::post(self.url("pages"), body));
        let policy = self.config.retry.rate_limited_only();
        let resp = match send_with_retry(self.transport.as_ref(), &request, &policy).await {
            Ok(resp) => resp,
            Err(RetryError::Transport { error, .. }) => {
                return Err(SinkError::Interrupted {
                    operation: "create",
                    reason: error.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        Self::check("create", resp)?
            .get("id")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| SinkError::Malformed {
                operation: "create",
                message: "created page has no id".to_string(),
            })
    }

    /// Creates the page, looking it up again before every resend so an
    /// interrupted create that did land is not duplicated.
    async fn create_once(
        &self,
        external_id: &str,
        properties: Map<String, JsonValue>,
    ) -> Result<String, SinkError> {
        let backoff = self.config.retry.backoff;
        let mut attempt = 0usize;
        loop {
            let err = match self.create_page(properties.clone()).await {
                Ok(page_id) => return Ok(page_id),
                Err(err) if err.outcome_unknown() => err,
                Err(err) => return Err(err),
            };
            if attempt >= backoff.max_retries {
                return Err(SinkError::Unavailable {
                    attempts: attempt + 1,
                    reason: err.to_string(),
                });
            }
            let wait = backoff.delay_for_attempt(attempt);
            warn!(
                external_id = %external_id,
                error = %err,
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                "create outcome unknown, checking the sink before resending"
            );
            tokio::time::sleep(wait).await;
            if let Some(page_id) = self.find_page(external_id).await? {
                return Ok(page_id);
            }
            attempt += 1;
        }
    }

    pub async fn update_page(
        &self,
        page_id: &str,
        properties: Map<String, JsonValue>,
    ) -> Result<(), SinkError> {
        let request = self.authorized(JsonRequest::patch(
            self.url(&format!("pages/{page_id}")),
            json!({ "properties": properties }),
        ));
        self.send("update", request).await?;
        Ok(())
    }

    pub async fn upsert(&self, record: &CanonicalReservation) -> Result<UpsertOutcome, SinkError> {
        let properties = build_properties(record);
        match self.find_page(&record.external_id).await? {
            Some(page_id) => {
                debug!(external_id = %record.external_id, %page_id, "updating sink page");
                self.update_page(&page_id, properties).await?;
                info!(external_id = %record.external_id, "updated");
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let page_id = self.create_once(&record.external_id, properties).await?;
                info!(external_id = %record.external_id, %page_id, "created");
                Ok(UpsertOutcome::Created)
            }
        }
    }
}
