//! Reconciliation pass: enumerate source reservations, normalize, resolve the
//! property group and upsert each one into the sink.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;
use staysync_core::{normalize, NormalizeError, RawReservation};
use staysync_sink::{NotionSink, SinkConfig, SinkError, UpsertOutcome};
use staysync_source::{
    DateType, EnumerationStrategy, EnumeratorConfig, GroupCache, GroupResolver, GroupRules,
    GroupTable, SourceClient, SourceConfig, SourceCredentials, SourceEnumerator,
};
use staysync_transport::{HttpClientConfig, HttpJsonClient, JsonTransport, RequestPacer};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "staysync-sync";

const DEFAULT_MODIFIED_SINCE: &str = "2015-01-01 00:00:00";
const DEFAULT_CALENDAR_FROM_YEAR: i32 = 2015;
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_REQUEST_DELAY_MS: u64 = 400;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;
const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub strategy: EnumerationStrategy,
    pub enumerator: EnumeratorConfig,
    /// Minimum spacing between records, applied before each upsert.
    pub request_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| var(name).ok_or_else(|| anyhow!("{name} must be set"));

        let mut source = SourceConfig::new(SourceCredentials {
            token_key: required("STREAMLINE_KEY")?,
            token_secret: required("STREAMLINE_SECRET")?,
        });
        if let Some(url) = var("STREAMLINE_URL") {
            source.url = url;
        }
        if let Some(code) = var("STAYSYNC_TOO_MANY_RESULTS_CODE") {
            source.too_many_results_code = code;
        }

        let mut sink = SinkConfig::new(required("NOTION_TOKEN")?, required("NOTION_DATABASE_ID")?);
        if let Some(url) = var("NOTION_URL") {
            sink.base_url = url;
        }
        if let Some(version) = var("NOTION_VERSION") {
            sink.notion_version = version;
        }
        if let Some(retries) = parse_var::<usize>(&var, "STAYSYNC_SINK_MAX_RETRIES")? {
            sink.retry = sink.retry.with_max_retries(retries);
        }

        let mut enumerator = EnumeratorConfig::default();
        enumerator.result_cap = parse_var(&var, "STAYSYNC_RESULT_CAP")?;
        if let Some(size) = parse_var(&var, "STAYSYNC_PAGE_SIZE")? {
            enumerator.default_page_size = size;
        }
        if let Some(limit) = parse_var(&var, "STAYSYNC_MAX_SKIPPED_PAGES")? {
            enumerator.max_skipped_pages = limit;
        }

        Ok(Self {
            source,
            sink,
            strategy: strategy_from(&var)?,
            enumerator,
            request_delay: Duration::from_millis(
                parse_var(&var, "STAYSYNC_REQUEST_DELAY_MS")?.unwrap_or(DEFAULT_REQUEST_DELAY_MS),
            ),
            http_timeout_secs: parse_var(&var, "STAYSYNC_HTTP_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            user_agent: var("STAYSYNC_USER_AGENT").unwrap_or_else(|| "staysync/0.1".to_string()),
            workspace_root: var("STAYSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{name}={raw:?} is not valid"))
        })
        .transpose()
}

fn parse_modified_since(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN))
        })
        .with_context(|| format!("STAYSYNC_MODIFIED_SINCE={raw:?} is not a date"))
}

fn strategy_from(var: &impl Fn(&str) -> Option<String>) -> Result<EnumerationStrategy> {
    let modified_since = parse_modified_since(
        &var("STAYSYNC_MODIFIED_SINCE").unwrap_or_else(|| DEFAULT_MODIFIED_SINCE.to_string()),
    )?;
    let name = var("STAYSYNC_STRATEGY").unwrap_or_else(|| "bulk".to_string());

    match name.trim().to_ascii_lowercase().as_str() {
        "bulk" => Ok(EnumerationStrategy::Bulk {
            modified_since,
            page_size: parse_var(var, "STAYSYNC_PAGE_SIZE")?,
        }),
        "calendar" => {
            let from_year =
                parse_var(var, "STAYSYNC_CALENDAR_FROM_YEAR")?.unwrap_or(DEFAULT_CALENDAR_FROM_YEAR);
            let to_year = parse_var(var, "STAYSYNC_CALENDAR_TO_YEAR")?
                .unwrap_or_else(|| Utc::now().year() + 1);
            if to_year < from_year {
                bail!("calendar range {from_year}..={to_year} is empty");
            }
            let date_type = match var("STAYSYNC_DATE_TYPE").as_deref().map(str::trim) {
                None | Some("arrival") => DateType::Arrival,
                Some("modification") => DateType::Modification,
                Some(other) => bail!("unknown STAYSYNC_DATE_TYPE {other:?}"),
            };
            Ok(EnumerationStrategy::Calendar {
                from_year,
                to_year,
                date_type,
            })
        }
        "two-phase" | "two_phase" => Ok(EnumerationStrategy::TwoPhase {
            modified_since,
            batch_size: parse_var(var, "STAYSYNC_BATCH_SIZE")?.unwrap_or(DEFAULT_BATCH_SIZE),
        }),
        other => bail!("unknown STAYSYNC_STRATEGY {other:?} (expected bulk, calendar or two-phase)"),
    }
}

/// One record that could not be reconciled; the pass continues without it.
#[derive(Debug, Error)]
pub enum RecordFailure {
    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("upsert failed: {0}")]
    Upsert(#[from] SinkError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub batches: usize,
    pub skipped_windows: Vec<String>,
    /// Set when a window could not be retrieved and the pass stopped early.
    pub aborted: Option<String>,
}

impl SyncRunSummary {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    rules: GroupRules,
    source: SourceClient,
    sink: NotionSink,
    pacer: RequestPacer,
}

impl SyncPipeline {
    /// Production wiring: one reqwest-backed client shared by source and sink.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let rules = GroupRules::from_workspace_root(&config.workspace_root)?;
        let http: Arc<dyn JsonTransport> = Arc::new(HttpJsonClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?);
        Ok(Self::with_transports(config, rules, http.clone(), http))
    }

    pub fn with_transports(
        config: SyncConfig,
        rules: GroupRules,
        source_transport: Arc<dyn JsonTransport>,
        sink_transport: Arc<dyn JsonTransport>,
    ) -> Self {
        let source = SourceClient::new(source_transport, config.source.clone());
        let sink = NotionSink::new(sink_transport, config.sink.clone());
        let pacer = RequestPacer::new(config.request_delay);
        Self {
            config,
            rules,
            source,
            sink,
            pacer,
        }
    }

    pub fn source(&self) -> &SourceClient {
        &self.source
    }

    /// Loads the room-type group table; a pass without it still resolves
    /// groups through the per-unit lookup and fallbacks.
    async fn load_group_table(&self) -> GroupTable {
        match self.source.list_groups().await {
            Ok(table) => {
                info!(groups = table.len(), "loaded room type groups");
                table
            }
            Err(err) => {
                warn!(error = %err, "room type groups unavailable, continuing without them");
                GroupTable::default()
            }
        }
    }

    async fn reconcile(
        &self,
        raw: &RawReservation,
        resolver: &GroupResolver,
        cache: &mut GroupCache,
    ) -> Result<UpsertOutcome, RecordFailure> {
        let record = normalize(raw)?;
        let group = resolver
            .resolve(raw, &record.unit_label, cache, &self.source)
            .await;
        let record = record.with_property_group(group);
        debug!(external_id = %record.external_id, group = %record.property_group, "normalized");
        Ok(self.sink.upsert(&record).await?)
    }

    /// Runs one full pass. Record failures are counted as skipped; a window
    /// failure stops the pass and is reported in `aborted`.
    pub async fn run_once(&self) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        self.run_pass(run_id)
            .instrument(info_span!("reconcile_pass", %run_id))
            .await
    }

    async fn run_pass(&self, run_id: Uuid) -> SyncRunSummary {
        let started_at = Utc::now();
        info!(strategy = ?self.config.strategy, "starting reconciliation pass");

        let resolver = GroupResolver::new(self.rules.clone(), self.load_group_table().await);
        let mut cache = GroupCache::new();
        let mut enumerator =
            SourceEnumerator::new(&self.source, self.config.strategy.clone(), self.config.enumerator);

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            fetched: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            batches: 0,
            skipped_windows: Vec::new(),
            aborted: None,
        };

        loop {
            let batch = match enumerator.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(failure) => {
                    warn!(window = %failure.window, error = %failure.source, "aborting pass");
                    summary.aborted = Some(failure.to_string());
                    break;
                }
            };
            summary.batches += 1;
            summary.fetched += batch.len();
            info!(batch = summary.batches, records = batch.len(), "processing batch");

            for raw in &batch {
                self.pacer.pace().await;
                match self.reconcile(raw, &resolver, &mut cache).await {
                    Ok(UpsertOutcome::Created) => summary.created += 1,
                    Ok(UpsertOutcome::Updated) => summary.updated += 1,
                    Err(err) => {
                        let external_id = raw.external_id().unwrap_or_else(|| "<none>".to_string());
                        warn!(external_id = %external_id, error = %err, "skipping record");
                        summary.skipped += 1;
                    }
                }
                let processed = summary.created + summary.updated + summary.skipped;
                if processed % PROGRESS_EVERY == 0 {
                    info!(processed, "progress");
                }
            }
        }

        summary.skipped_windows = enumerator.skipped_windows().to_vec();
        summary.finished_at = Utc::now();
        info!(
            fetched = summary.fetched,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            skipped_windows = summary.skipped_windows.len(),
            aborted = summary.aborted.is_some(),
            "reconciliation pass finished"
        );
        summary
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    Ok(pipeline.run_once().await)
}
