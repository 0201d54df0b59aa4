//! Windowed enumeration of source reservations.
//!
//! The source refuses (or silently caps) queries that match too many rows, so
//! every strategy is expressed as a queue of bounded [`Window`]s. A window the
//! source rejects as too large is narrowed in place; one that cannot be
//! narrowed further is skipped and logged, never dropped silently.

use std::collections::VecDeque;
use std::fmt;

use chrono::{Days, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use staysync_core::RawReservation;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{SourceClient, SourceError};

const MODIFIED_SINCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const RANGE_DATE_FORMAT: &str = "%m/%d/%Y";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateType {
    Arrival,
    Modification,
}

impl DateType {
    pub fn as_param(self) -> &'static str {
        match self {
            DateType::Arrival => "arrival",
            DateType::Modification => "modification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnumerationStrategy {
    /// Everything modified since a timestamp, optionally paged.
    Bulk {
        modified_since: NaiveDateTime,
        page_size: Option<u32>,
    },
    /// One query per calendar month, inclusive of both years.
    Calendar {
        from_year: i32,
        to_year: i32,
        date_type: DateType,
    },
    /// Cheap id listing, then detail requests per id.
    TwoPhase {
        modified_since: NaiveDateTime,
        batch_size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Window {
    Unpaged {
        modified_since: NaiveDateTime,
    },
    Page {
        modified_since: NaiveDateTime,
        page: u32,
        page_size: u32,
    },
    Range {
        start: NaiveDate,
        end: NaiveDate,
        date_type: DateType,
    },
    IdListing {
        modified_since: NaiveDateTime,
    },
    Ids(Vec<String>),
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::Unpaged { modified_since } => write!(f, "all since {modified_since}"),
            Window::Page {
                modified_since,
                page,
                page_size,
            } => write!(f, "page {page} (size {page_size}) since {modified_since}"),
            Window::Range {
                start,
                end,
                date_type,
            } => write!(f, "{start}..={end} by {}", date_type.as_param()),
            Window::IdListing { modified_since } => write!(f, "id listing since {modified_since}"),
            Window::Ids(ids) => match (ids.first(), ids.last()) {
                (Some(first), Some(last)) => write!(f, "{} ids {first}..{last}", ids.len()),
                _ => write!(f, "0 ids"),
            },
        }
    }
}

impl Window {
    fn params(&self) -> Map<String, JsonValue> {
        let mut params = Map::new();
        match self {
            Window::Unpaged { modified_since } => {
                params.insert("modified_since".into(), since_param(modified_since));
                params.insert("return_full".into(), JsonValue::Bool(true));
            }
            Window::Page {
                modified_since,
                page,
                page_size,
            } => {
                params.insert("modified_since".into(), since_param(modified_since));
                params.insert("return_full".into(), JsonValue::Bool(true));
                params.insert("limit".into(), JsonValue::from(*page_size));
                params.insert("p".into(), JsonValue::from(*page));
            }
            Window::Range {
                start,
                end,
                date_type,
            } => {
                params.insert(
                    "start_date".into(),
                    JsonValue::String(start.format(RANGE_DATE_FORMAT).to_string()),
                );
                params.insert(
                    "end_date".into(),
                    JsonValue::String(end.format(RANGE_DATE_FORMAT).to_string()),
                );
                params.insert("date_type".into(), JsonValue::String(date_type.as_param().into()));
                params.insert("return_full".into(), JsonValue::Bool(true));
            }
            Window::IdListing { modified_since } => {
                params.insert("modified_since".into(), since_param(modified_since));
                params.insert("return_full".into(), JsonValue::Bool(false));
            }
            Window::Ids(_) => {}
        }
        params
    }
}

fn since_param(since: &NaiveDateTime) -> JsonValue {
    JsonValue::String(since.format(MODIFIED_SINCE_FORMAT).to_string())
}

fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()?;
    Some((start, end))
}

fn initial_windows(strategy: &EnumerationStrategy) -> VecDeque<Window> {
    match strategy {
        EnumerationStrategy::Bulk {
            modified_since,
            page_size: None,
        } => VecDeque::from([Window::Unpaged {
            modified_since: *modified_since,
        }]),
        EnumerationStrategy::Bulk {
            modified_since,
            page_size: Some(page_size),
        } => VecDeque::from([Window::Page {
            modified_since: *modified_since,
            page: 1,
            page_size: (*page_size).max(1),
        }]),
        EnumerationStrategy::Calendar {
            from_year,
            to_year,
            date_type,
        } => (*from_year..=*to_year)
            .flat_map(|year| (1..=12).map(move |month| (year, month)))
            .filter_map(|(year, month)| month_bounds(year, month))
            .map(|(start, end)| Window::Range {
                start,
                end,
                date_type: *date_type,
            })
            .collect(),
        EnumerationStrategy::TwoPhase { modified_since, .. } => {
            VecDeque::from([Window::IdListing {
                modified_since: *modified_since,
            }])
        }
    }
}

fn window_label(modified_since: NaiveDateTime, page: u32, page_size: u32) -> String {
    Window::Page {
        modified_since,
        page,
        page_size,
    }
    .to_string()
}

/// Largest page size at most half of `page_size` that keeps `offset` on a page boundary.
fn narrower_page_size(offset: u64, page_size: u32) -> Option<u32> {
    (1..=page_size / 2)
        .rev()
        .find(|candidate| offset % u64::from(*candidate) == 0)
}

#[derive(Debug, Clone, Copy)]
pub struct EnumeratorConfig {
    /// Page size used when an unpaged query has to be split into pages.
    pub default_page_size: u32,
    /// Windows returning more rows than this are treated as truncated.
    pub result_cap: Option<usize>,
    /// Consecutive unnarrowable pages tolerated before paging is abandoned.
    pub max_skipped_pages: usize,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            result_cap: None,
            max_skipped_pages: 5,
        }
    }
}

#[derive(Debug, Error)]
#[error("could not retrieve window {window}: {source}")]
pub struct WindowFailure {
    pub window: String,
    #[source]
    pub source: SourceError,
}

pub struct SourceEnumerator<'a> {
    client: &'a SourceClient,
    strategy: EnumerationStrategy,
    config: EnumeratorConfig,
    pending: VecDeque<Window>,
    skipped: Vec<String>,
    skipped_pages_in_row: usize,
    last_page: Option<Vec<RawReservation>>,
}

impl<'a> SourceEnumerator<'a> {
    pub fn new(
        client: &'a SourceClient,
        strategy: EnumerationStrategy,
        config: EnumeratorConfig,
    ) -> Self {
        let pending = initial_windows(&strategy);
        Self {
            client,
            strategy,
            config,
            pending,
            skipped: Vec::new(),
            skipped_pages_in_row: 0,
            last_page: None,
        }
    }

    /// Rewinds to the first window of the strategy.
    pub fn restart(&mut self) {
        self.pending = initial_windows(&self.strategy);
        self.skipped.clear();
        self.skipped_pages_in_row = 0;
        self.last_page = None;
    }

    /// Windows given up on because the source reported too many results.
    pub fn skipped_windows(&self) -> &[String] {
        &self.skipped
    }

    pub fn pending_windows(&self) -> usize {
        self.pending.len()
    }

    /// Next non-empty batch, or `None` once every window has been visited.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<RawReservation>>, WindowFailure> {
        while let Some(window) = self.pending.pop_front() {
            if let Window::Ids(ids) = &window {
                let records = self.fetch_ids(ids).await?;
                if records.is_empty() {
                    continue;
                }
                return Ok(Some(records));
            }

            let records = match self.client.list_reservations(window.params()).await {
                Ok(records) => records,
                Err(SourceError::TooManyResults { .. }) => {
                    self.narrow(window)?;
                    continue;
                }
                Err(source) => {
                    return Err(WindowFailure {
                        window: window.to_string(),
                        source,
                    })
                }
            };
            debug!(window = %window, rows = records.len(), "fetched window");

            if let Window::IdListing { .. } = window {
                self.queue_id_batches(&records);
                continue;
            }

            if let Some(cap) = self.config.result_cap {
                if records.len() > cap {
                    warn!(window = %window, rows = records.len(), cap, "window exceeded result cap");
                    self.narrow(window)?;
                    continue;
                }
            }

            if let Window::Page { .. } = window {
                self.skipped_pages_in_row = 0;
            }
            if records.is_empty() {
                continue;
            }
            if let Window::Page {
                modified_since,
                page,
                page_size,
            } = window
            {
                if self.last_page.as_ref() == Some(&records) {
                    return Err(WindowFailure {
                        window: window.to_string(),
                        source: SourceError::Stalled(
                            "page returned the same rows as the page before it".to_string(),
                        ),
                    });
                }
                self.last_page = Some(records.clone());
                self.pending.push_front(Window::Page {
                    modified_since,
                    page: page + 1,
                    page_size,
                });
            }
            return Ok(Some(records));
        }
        Ok(None)
    }

    fn queue_id_batches(&mut self, listing: &[RawReservation]) {
        let batch_size = match self.strategy {
            EnumerationStrategy::TwoPhase { batch_size, .. } => batch_size.max(1),
            _ => 1,
        };
        let ids: Vec<String> = listing.iter().filter_map(RawReservation::external_id).collect();
        if ids.len() < listing.len() {
            warn!(
                missing = listing.len() - ids.len(),
                "id listing rows without confirmation_id ignored"
            );
        }
        let batches: Vec<Window> = ids
            .chunks(batch_size)
            .map(|chunk| Window::Ids(chunk.to_vec()))
            .collect();
        for batch in batches.into_iter().rev() {
            self.pending.push_front(batch);
        }
    }

    async fn fetch_ids(&mut self, ids: &[String]) -> Result<Vec<RawReservation>, WindowFailure> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let mut params = Map::new();
            params.insert("confirmation_id".into(), JsonValue::String(id.clone()));
            params.insert("return_full".into(), JsonValue::Bool(true));
            match self.client.list_reservations(params).await {
                Ok(found) => records.extend(found),
                Err(SourceError::TooManyResults { .. }) => {
                    self.skip(format!("id {id}"));
                }
                Err(source) => {
                    return Err(WindowFailure {
                        window: format!("id {id}"),
                        source,
                    })
                }
            }
        }
        Ok(records)
    }

    fn narrow(&mut self, window: Window) -> Result<(), WindowFailure> {
        match window {
            Window::Unpaged { modified_since } => {
                debug!("unpaged query too large; switching to pages");
                self.pending.push_front(Window::Page {
                    modified_since,
                    page: 1,
                    page_size: self.config.default_page_size.max(1),
                });
            }
            Window::Page {
                modified_since,
                page,
                page_size,
            } => {
                let offset = u64::from(page.saturating_sub(1)) * u64::from(page_size);
                match narrower_page_size(offset, page_size) {
                    Some(smaller) => {
                        debug!(from = page_size, to = smaller, "narrowing page size");
                        self.pending.push_front(Window::Page {
                            modified_since,
                            page: (offset / u64::from(smaller)) as u32 + 1,
                            page_size: smaller,
                        });
                    }
                    None => {
                        let label = window_label(modified_since, page, page_size);
                        self.skip(label.clone());
                        self.skipped_pages_in_row += 1;
                        if self.skipped_pages_in_row > self.config.max_skipped_pages {
                            return Err(WindowFailure {
                                window: label,
                                source: SourceError::Stalled(format!(
                                    "{} consecutive pages skipped",
                                    self.skipped_pages_in_row
                                )),
                            });
                        }
                        self.pending.push_front(Window::Page {
                            modified_since,
                            page: page + 1,
                            page_size,
                        });
                    }
                }
            }
            Window::Range {
                start,
                end,
                date_type,
            } if start < end => {
                let half = (end - start).num_days() as u64 / 2;
                let mid = start + Days::new(half);
                debug!(%start, %end, %mid, "splitting date range");
                self.pending.push_front(Window::Range {
                    start: mid + Days::new(1),
                    end,
                    date_type,
                });
                self.pending.push_front(Window::Range {
                    start,
                    end: mid,
                    date_type,
                });
            }
            other => self.skip(other.to_string()),
        }
        Ok(())
    }

    fn skip(&mut self, window: String) {
        warn!(window = %window, "too many results in a window that cannot be narrowed; skipping it");
        self.skipped.push(window);
    }
}
