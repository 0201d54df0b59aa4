//! Streamline source client: request envelopes, windowed enumeration and
//! property-group resolution.

use std::sync::Arc;

use serde_json::{json, Map, Value as JsonValue};
use staysync_core::RawReservation;
use staysync_transport::{send_with_retry, JsonRequest, JsonTransport, RetryError, RetryPolicy};
use thiserror::Error;
use tracing::debug;

pub mod enumerate;
pub mod groups;

pub use enumerate::{DateType, EnumerationStrategy, EnumeratorConfig, SourceEnumerator, Window, WindowFailure};
pub use groups::{GroupCache, GroupResolver, GroupRules, GroupTable, PriorityGroup, PropertyInfoLookup};

pub const CRATE_NAME: &str = "staysync-source";

pub const GET_RESERVATIONS_FILTERED: &str = "GetReservationsFiltered";
pub const GET_ROOM_TYPE_GROUPS: &str = "GetRoomTypeGroupsList";
pub const GET_PROPERTY_INFO: &str = "GetPropertyInfo";

pub const DEFAULT_SOURCE_URL: &str = "https://web.streamlinevrs.com/api/json";
pub const DEFAULT_TOO_MANY_RESULTS_CODE: &str = "E0030";

/// Fields of a property-info response that may carry the owning group name.
const PROPERTY_GROUP_FIELDS: [&str; 2] = ["group_name", "room_type_group_name"];

#[derive(Debug, Clone)]
pub struct SourceCredentials {
    pub token_key: String,
    pub token_secret: String,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub url: String,
    pub credentials: SourceCredentials,
    pub retry: RetryPolicy,
    /// Status code the API uses when a query would return too many rows.
    pub too_many_results_code: String,
}

impl SourceConfig {
    pub fn new(credentials: SourceCredentials) -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.to_string(),
            credentials,
            retry: RetryPolicy::default(),
            too_many_results_code: DEFAULT_TOO_MANY_RESULTS_CODE.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source denied access with http {status} (is this host allow-listed?)")]
    AccessDenied { status: u16 },
    #[error("{method} matched too many results for one query")]
    TooManyResults { method: String },
    #[error("source api error {code}: {description}")]
    Api { code: String, description: String },
    #[error("unexpected http {status} from source: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("malformed source response: {0}")]
    Malformed(String),
    #[error("paging stalled: {0}")]
    Stalled(String),
    #[error(transparent)]
    Retry(#[from] RetryError),
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts both `{"data": …}` and `{"Response": {"data": …}}` envelopes.
fn envelope_body(body: &JsonValue) -> &JsonValue {
    if body.get("data").is_none() {
        if let Some(inner) = body.get("Response") {
            return inner;
        }
    }
    body
}

pub fn unwrap_envelope(
    method_name: &str,
    body: &JsonValue,
    too_many_results_code: &str,
) -> Result<JsonValue, SourceError> {
    let inner = envelope_body(body);
    let status = inner.get("status");
    let code = status.and_then(|s| s.get("code")).and_then(json_text);

    if code.as_deref() == Some(too_many_results_code) {
        return Err(SourceError::TooManyResults {
            method: method_name.to_string(),
        });
    }

    match inner.get("data") {
        Some(data) => Ok(data.clone()),
        None => match code {
            Some(code) => Err(SourceError::Api {
                code,
                description: status
                    .and_then(|s| s.get("description"))
                    .and_then(json_text)
                    .unwrap_or_default(),
            }),
            None => Err(SourceError::Malformed(format!(
                "{method_name} response has no data"
            ))),
        },
    }
}

/// Reservations inside a `data` payload; a lone object is a one-row result.
pub fn reservations_from_data(data: JsonValue) -> Vec<RawReservation> {
    let rows = match data {
        JsonValue::Array(rows) => rows,
        JsonValue::Object(mut fields) => match fields.remove("reservations") {
            Some(JsonValue::Array(rows)) => rows,
            Some(single @ JsonValue::Object(_)) => vec![single],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    rows.into_iter()
        .filter_map(|row| {
            let parsed = RawReservation::from_value(row);
            if parsed.is_none() {
                debug!("skipping non-object reservation row");
            }
            parsed
        })
        .collect()
}

pub struct SourceClient {
    transport: Arc<dyn JsonTransport>,
    config: SourceConfig,
}

impl SourceClient {
    pub fn new(transport: Arc<dyn JsonTransport>, config: SourceConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Issues one `{methodName, params}` call and returns the unwrapped `data`.
    pub async fn call(
        &self,
        method_name: &str,
        mut params: Map<String, JsonValue>,
    ) -> Result<JsonValue, SourceError> {
        params.insert(
            "token_key".to_string(),
            JsonValue::String(self.config.credentials.token_key.clone()),
        );
        params.insert(
            "token_secret".to_string(),
            JsonValue::String(self.config.credentials.token_secret.clone()),
        );
        let request = JsonRequest::post(
            self.config.url.clone(),
            json!({ "methodName": method_name, "params": params }),
        );

        let resp = send_with_retry(self.transport.as_ref(), &request, &self.config.retry).await?;
        let status = resp.status.as_u16();
        if status == 401 || status == 403 {
            return Err(SourceError::AccessDenied { status });
        }
        if !resp.status.is_success() {
            return Err(SourceError::HttpStatus {
                status,
                body: resp.body.to_string(),
            });
        }
        unwrap_envelope(method_name, &resp.body, &self.config.too_many_results_code)
    }

    pub async fn list_reservations(
        &self,
        params: Map<String, JsonValue>,
    ) -> Result<Vec<RawReservation>, SourceError> {
        let data = self.call(GET_RESERVATIONS_FILTERED, params).await?;
        Ok(reservations_from_data(data))
    }

    /// Reference table of room-type groups, id to display name.
    pub async fn list_groups(&self) -> Result<GroupTable, SourceError> {
        let data = self.call(GET_ROOM_TYPE_GROUPS, Map::new()).await?;
        Ok(GroupTable::from_data(&data))
    }
}

#[async_trait::async_trait]
impl PropertyInfoLookup for SourceClient {
    async fn property_group(&self, unit_id: &str) -> Result<Option<String>, SourceError> {
        let mut params = Map::new();
        params.insert("unit_id".to_string(), JsonValue::String(unit_id.to_string()));
        let data = self.call(GET_PROPERTY_INFO, params).await?;
        let property = data.get("property").unwrap_or(&data);
        Ok(PROPERTY_GROUP_FIELDS
            .iter()
            .find_map(|field| property.get(*field).and_then(json_text)))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value as JsonValue;
    use staysync_transport::{
        BackoffPolicy, JsonRequest, JsonResponse, JsonTransport, RetryPolicy, StatusCode,
        TransportError,
    };

    use super::{SourceConfig, SourceCredentials};

    type Responder = Box<dyn Fn(&JsonValue) -> JsonResponse + Send + Sync>;

    /// Answers each call from a closure over the request body and records the bodies.
    pub struct FnTransport {
        respond: Responder,
        pub bodies: Mutex<Vec<JsonValue>>,
    }

    impl FnTransport {
        pub fn new(respond: impl Fn(&JsonValue) -> JsonResponse + Send + Sync + 'static) -> Self {
            Self {
                respond: Box::new(respond),
                bodies: Mutex::new(Vec::new()),
            }
        }

        pub fn bodies(&self) -> Vec<JsonValue> {
            self.bodies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JsonTransport for FnTransport {
        async fn send(&self, request: &JsonRequest) -> Result<JsonResponse, TransportError> {
            let body = request.body.clone().unwrap_or(JsonValue::Null);
            self.bodies.lock().unwrap().push(body.clone());
            Ok((self.respond)(&body))
        }
    }

    pub fn ok(body: JsonValue) -> JsonResponse {
        JsonResponse::new(StatusCode::OK, body)
    }

    pub fn param<'a>(body: &'a JsonValue, name: &str) -> Option<&'a JsonValue> {
        body.get("params").and_then(|p| p.get(name))
    }

    pub fn config() -> SourceConfig {
        let mut config = SourceConfig::new(SourceCredentials {
            token_key: "key".to_string(),
            token_secret: "secret".to_string(),
        });
        config.url = "http://source.test/api/json".to_string();
        config.retry = RetryPolicy {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(5),
            },
            ..RetryPolicy::default()
        };
        config
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{config, ok, FnTransport};
    use super::*;
    use std::path::{Path, PathBuf};
    use staysync_transport::{JsonResponse, StatusCode};

    fn fixture_path(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures")
            .join("streamline")
            .join(name)
    }

    fn read_fixture(name: &str) -> JsonValue {
        let text = std::fs::read_to_string(fixture_path(name)).expect("read fixture");
        serde_json::from_str(&text).expect("parse fixture")
    }

    #[test]
    fn both_envelopes_unwrap_to_the_same_data() {
        let flat = json!({"data": {"reservations": [{"confirmation_id": "A"}]}});
        let nested = json!({"Response": {"data": {"reservations": [{"confirmation_id": "A"}]}}});
        let a = unwrap_envelope(GET_RESERVATIONS_FILTERED, &flat, "E0030").unwrap();
        let b = unwrap_envelope(GET_RESERVATIONS_FILTERED, &nested, "E0030").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn too_many_results_code_is_detected_in_either_envelope() {
        let flat = json!({"status": {"code": "E0030", "description": "too many"}});
        let nested = json!({"Response": {"status": {"code": "E0030"}}});
        for body in [flat, nested] {
            assert!(matches!(
                unwrap_envelope(GET_RESERVATIONS_FILTERED, &body, "E0030"),
                Err(SourceError::TooManyResults { .. })
            ));
        }
    }

    #[test]
    fn other_status_codes_without_data_are_api_errors() {
        let body = json!({"status": {"code": "E0012", "description": "bad token"}});
        match unwrap_envelope(GET_RESERVATIONS_FILTERED, &body, "E0030") {
            Err(SourceError::Api { code, description }) => {
                assert_eq!(code, "E0012");
                assert_eq!(description, "bad token");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            unwrap_envelope(GET_RESERVATIONS_FILTERED, &json!({}), "E0030"),
            Err(SourceError::Malformed(_))
        ));
    }

    #[test]
    fn reservations_are_read_from_fixture_page() {
        let body = read_fixture("reservations_page.json");
        let data = unwrap_envelope(GET_RESERVATIONS_FILTERED, &body, "E0030").unwrap();
        let rows = reservations_from_data(data);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].external_id().as_deref(), Some("31877"));
    }

    #[test]
    fn single_reservation_object_is_one_row() {
        let rows = reservations_from_data(json!({"reservations": {"confirmation_id": "Z"}}));
        assert_eq!(rows.len(), 1);
        let rows = reservations_from_data(json!([{"confirmation_id": "Z"}, "junk", 4]));
        assert_eq!(rows.len(), 1);
        assert!(reservations_from_data(json!({"reservations": null})).is_empty());
    }

    #[tokio::test]
    async fn call_merges_credentials_into_params() {
        let transport = Arc::new(FnTransport::new(|_| ok(json!({"data": []}))));
        let client = SourceClient::new(transport.clone(), config());
        let mut params = Map::new();
        params.insert("return_full".to_string(), json!(true));
        client.list_reservations(params).await.unwrap();

        let body = &transport.bodies()[0];
        assert_eq!(body["methodName"], json!(GET_RESERVATIONS_FILTERED));
        assert_eq!(body["params"]["token_key"], json!("key"));
        assert_eq!(body["params"]["token_secret"], json!("secret"));
        assert_eq!(body["params"]["return_full"], json!(true));
    }

    #[tokio::test]
    async fn forbidden_is_access_denied() {
        let transport = Arc::new(FnTransport::new(|_| {
            JsonResponse::new(StatusCode::FORBIDDEN, json!("IP not allowed"))
        }));
        let client = SourceClient::new(transport, config());
        let err = client.list_reservations(Map::new()).await.unwrap_err();
        assert!(matches!(err, SourceError::AccessDenied { status: 403 }));
    }

    #[tokio::test]
    async fn property_group_reads_group_name_field() {
        let transport = Arc::new(FnTransport::new(|body| {
            assert_eq!(body["methodName"], json!(GET_PROPERTY_INFO));
            assert_eq!(body["params"]["unit_id"], json!("77"));
            ok(json!({"Response": {"data": {"property": {"group_name": "Storey Lake"}}}}))
        }));
        let client = SourceClient::new(transport, config());
        assert_eq!(
            client.property_group("77").await.unwrap().as_deref(),
            Some("Storey Lake")
        );
    }
}
