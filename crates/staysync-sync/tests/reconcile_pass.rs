//! Full reconciliation passes against in-memory source and sink fakes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value as JsonValue};
use staysync_source::GroupRules;
use staysync_sync::{SyncConfig, SyncPipeline};
use staysync_transport::{JsonRequest, JsonResponse, JsonTransport, Method, StatusCode, TransportError};

const SOURCE_URL: &str = "http://streamline.test/api/json";
const NOTION_URL: &str = "http://notion.test/v1";

type Responder = dyn Fn(&str, &JsonValue) -> JsonResponse + Send + Sync;

/// Source fake answering `{methodName, params}` calls through a closure.
struct FakeStreamline {
    respond: Box<Responder>,
    calls: Mutex<Vec<String>>,
}

impl FakeStreamline {
    fn new(respond: impl Fn(&str, &JsonValue) -> JsonResponse + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls_to(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|m| *m == method).count()
    }
}

#[async_trait]
impl JsonTransport for FakeStreamline {
    async fn send(&self, request: &JsonRequest) -> Result<JsonResponse, TransportError> {
        assert_eq!(request.url, SOURCE_URL);
        let body = request.body.clone().unwrap_or(JsonValue::Null);
        let method = body["methodName"].as_str().unwrap_or_default().to_string();
        assert_eq!(body["params"]["token_key"], json!("key"));
        self.calls.lock().unwrap().push(method.clone());
        Ok((self.respond)(&method, &body["params"]))
    }
}

fn data(payload: JsonValue) -> JsonResponse {
    JsonResponse::new(StatusCode::OK, json!({ "data": payload }))
}

/// Source with a fixed reservation list and an empty group table.
fn streamline_with(reservations: JsonValue) -> FakeStreamline {
    FakeStreamline::new(move |method, _| match method {
        "GetReservationsFiltered" => data(json!({ "reservations": reservations.clone() })),
        "GetRoomTypeGroupsList" => data(json!({ "groups": [] })),
        _ => data(json!({})),
    })
}

#[derive(Default)]
struct NotionState {
    pages: Vec<(String, Map<String, JsonValue>)>,
    /// Reservation numbers whose lookups are always rate limited.
    throttled: HashSet<String>,
}

#[derive(Default)]
struct FakeNotion {
    state: Mutex<NotionState>,
}

impl FakeNotion {
    fn throttle(&self, external_id: &str) {
        self.state.lock().unwrap().throttled.insert(external_id.to_string());
    }

    fn pages_by_id(&self) -> HashMap<String, Map<String, JsonValue>> {
        self.state
            .lock()
            .unwrap()
            .pages
            .iter()
            .map(|(_, props)| (stored_id(props), props.clone()))
            .collect()
    }

    fn page_count(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }
}

fn stored_id(props: &Map<String, JsonValue>) -> String {
    props["Res #"]["rich_text"][0]["text"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl JsonTransport for FakeNotion {
    async fn send(&self, request: &JsonRequest) -> Result<JsonResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        let body = request.body.clone().unwrap_or(JsonValue::Null);
        let path = request.url.trim_start_matches(NOTION_URL);

        if request.method == Method::POST && path == "/databases/db/query" {
            let wanted = body["filter"]["rich_text"]["equals"].as_str().unwrap_or_default();
            if state.throttled.contains(wanted) {
                return Ok(JsonResponse::new(StatusCode::TOO_MANY_REQUESTS, json!({})));
            }
            let results: Vec<JsonValue> = state
                .pages
                .iter()
                .filter(|(_, props)| stored_id(props) == wanted)
                .map(|(id, props)| json!({ "id": id, "properties": props }))
                .collect();
            return Ok(JsonResponse::new(StatusCode::OK, json!({ "results": results })));
        }
        if request.method == Method::POST && path == "/pages" {
            let id = format!("page-{}", state.pages.len() + 1);
            let props = body["properties"].as_object().cloned().unwrap_or_default();
            state.pages.push((id.clone(), props));
            return Ok(JsonResponse::new(StatusCode::OK, json!({ "id": id })));
        }
        if request.method == Method::PATCH {
            let id = path.trim_start_matches("/pages/");
            let updates = body["properties"].as_object().cloned().unwrap_or_default();
            if let Some((_, props)) = state.pages.iter_mut().find(|(pid, _)| pid == id) {
                props.extend(updates);
                return Ok(JsonResponse::new(StatusCode::OK, json!({ "id": id })));
            }
            return Ok(JsonResponse::new(StatusCode::NOT_FOUND, json!({ "message": "gone" })));
        }
        Ok(JsonResponse::new(StatusCode::BAD_REQUEST, json!({ "message": "unexpected" })))
    }
}

fn config() -> SyncConfig {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("STREAMLINE_KEY", "key"),
        ("STREAMLINE_SECRET", "secret"),
        ("STREAMLINE_URL", SOURCE_URL),
        ("NOTION_TOKEN", "tok"),
        ("NOTION_DATABASE_ID", "db"),
        ("NOTION_URL", NOTION_URL),
        ("STAYSYNC_SINK_MAX_RETRIES", "3"),
        ("STAYSYNC_REQUEST_DELAY_MS", "0"),
    ]);
    SyncConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap()
}

fn pipeline(source: Arc<FakeStreamline>, sink: Arc<FakeNotion>) -> SyncPipeline {
    SyncPipeline::with_transports(config(), GroupRules::default(), source, sink)
}

fn r1() -> JsonValue {
    json!({
        "confirmation_id": "R1",
        "status_code": "8",
        "startdate": "2025-06-01",
        "price_total": "199.99"
    })
}

#[tokio::test(start_paused = true)]
async fn cancelled_reservation_is_created_then_updated_in_place() {
    let source = Arc::new(streamline_with(json!([r1()])));
    let sink = Arc::new(FakeNotion::default());
    let pipeline = pipeline(source, sink.clone());

    let first = pipeline.run_once().await;
    assert!(first.is_complete());
    assert_eq!((first.fetched, first.created, first.updated, first.skipped), (1, 1, 0, 0));
    let stored_first = sink.pages_by_id();

    let second = pipeline.run_once().await;
    assert_eq!((second.created, second.updated), (0, 1));
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(sink.page_count(), 1);
    assert_eq!(sink.pages_by_id(), stored_first);

    let props = &stored_first["R1"];
    assert_eq!(props["State"], json!({"select": {"name": "CANCELLED"}}));
    assert!(props["Status"]["select"]["name"].as_str().unwrap().ends_with("-CXL"));
    assert_eq!(props["Total"], json!({"number": 199.99}));
    assert_eq!(props["CI"], json!({"date": {"start": "2025-06-01"}}));
    assert!(!props.contains_key("CO"));
    assert_eq!(props["Group"], json!({"select": {"name": "Geral"}}));
}

#[tokio::test(start_paused = true)]
async fn a_bad_record_is_skipped_and_the_pass_continues() {
    let source = Arc::new(streamline_with(json!([
        {"first_name": "No", "last_name": "Id"},
        r1(),
        {"confirmation_id": "R2", "status_code": "2"}
    ])));
    let sink = Arc::new(FakeNotion::default());

    let summary = pipeline(source, sink.clone()).run_once().await;
    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.skipped, 1);
    assert!(summary.is_complete());
    assert_eq!(sink.page_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn sink_rate_limit_beyond_the_ceiling_only_skips_that_record() {
    let source = Arc::new(streamline_with(json!([
        r1(),
        {"confirmation_id": "R2", "status_code": "2"}
    ])));
    let sink = Arc::new(FakeNotion::default());
    sink.throttle("R1");

    let summary = pipeline(source, sink.clone()).run_once().await;
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.created, 1);
    assert!(sink.pages_by_id().contains_key("R2"));
    assert!(!sink.pages_by_id().contains_key("R1"));
}

#[tokio::test(start_paused = true)]
async fn access_denied_aborts_the_pass_without_panicking() {
    let source = Arc::new(FakeStreamline::new(|_, _| {
        JsonResponse::new(StatusCode::FORBIDDEN, json!("IP not allowed"))
    }));
    let sink = Arc::new(FakeNotion::default());

    let summary = pipeline(source, sink.clone()).run_once().await;
    assert!(!summary.is_complete());
    assert!(summary.aborted.as_deref().unwrap().contains("403"));
    assert_eq!(summary.fetched, 0);
    assert_eq!(sink.page_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn per_unit_lookup_runs_once_per_unit_within_a_pass() {
    let source = Arc::new(FakeStreamline::new(|method, params| match method {
        "GetReservationsFiltered" => data(json!({"reservations": [
            {"confirmation_id": "A1", "unit_id": "U7", "unit_name": "Lakeside 12"},
            {"confirmation_id": "A2", "unit_id": "U7", "unit_name": "Lakeside 12"},
            {"confirmation_id": "A3", "unit_id": "U9", "location_name": "Davenport"}
        ]})),
        "GetRoomTypeGroupsList" => data(json!([])),
        "GetPropertyInfo" if params["unit_id"] == json!("U7") => {
            data(json!({"property": {"group_name": "Lake Berkley"}}))
        }
        _ => data(json!({"property": {}})),
    }));
    let sink = Arc::new(FakeNotion::default());
    let pipeline = pipeline(source.clone(), sink.clone());

    pipeline.run_once().await;
    assert_eq!(source.calls_to("GetPropertyInfo"), 2);

    let pages = sink.pages_by_id();
    assert_eq!(pages["A1"]["Group"], json!({"select": {"name": "Lake Berkley"}}));
    assert_eq!(pages["A2"]["Group"], json!({"select": {"name": "Lake Berkley"}}));
    assert_eq!(pages["A3"]["Group"], json!({"select": {"name": "Davenport"}}));

    // The cache belongs to the pass, so the next pass looks units up again.
    pipeline.run_once().await;
    assert_eq!(source.calls_to("GetPropertyInfo"), 4);
}

#[tokio::test(start_paused = true)]
async fn fixture_page_resolves_priority_groups_from_the_rules_file() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let page: JsonValue = serde_json::from_str(
        &std::fs::read_to_string(root.join("fixtures/streamline/reservations_page.json")).unwrap(),
    )
    .unwrap();
    let rules = GroupRules::from_workspace_root(&root).unwrap();

    let source = Arc::new(FakeStreamline::new(move |method, _| match method {
        "GetReservationsFiltered" => JsonResponse::new(StatusCode::OK, page.clone()),
        _ => data(json!([])),
    }));
    let sink = Arc::new(FakeNotion::default());
    let mut config = config();
    config.request_delay = Duration::from_millis(400);
    let pipeline = SyncPipeline::with_transports(config, rules, source, sink.clone());

    let summary = pipeline.run_once().await;
    assert_eq!(summary.created, 3);

    let pages = sink.pages_by_id();
    assert_eq!(pages["31877"]["Group"], json!({"select": {"name": "Windsor Hills"}}));
    assert_eq!(pages["31902"]["Group"], json!({"select": {"name": "Storey Lake"}}));
    assert_eq!(pages["31955"]["Group"], json!({"select": {"name": "Encore Resort"}}));
    assert_eq!(pages["31902"]["State"], json!({"select": {"name": "CANCELLED"}}));
    assert!(!pages["31902"].contains_key("Created"));
    assert_eq!(pages["31955"]["NTS"], json!({"number": 0}));
}
