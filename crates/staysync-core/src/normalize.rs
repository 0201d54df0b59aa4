//! Lenient conversion of raw source fields into a [`CanonicalReservation`].
//!
//! Upstream data is known to be inconsistent, so malformed values fall back
//! to defaults instead of failing the record. The only hard requirement is
//! the confirmation id.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{CanonicalReservation, RawReservation, StatusBucket, StatusKind};

/// Group name used until (or unless) the resolver finds a better one.
pub const SENTINEL_GROUP: &str = "Geral";
pub const MAX_GUEST_NAME_CHARS: usize = 100;
pub const MAX_UNIT_LABEL_CHARS: usize = 100;
pub const MAX_TYPE_PREFIX_CHARS: usize = 10;

const CANCELLED_CODE: &str = "8";
const ZERO_DATE_PREFIX: &str = "0000-00-00";

#[derive(Debug, Clone, Copy)]
enum DateFormat {
    DateTime(&'static str),
    Date(&'static str),
}

const DATE_FORMATS: [DateFormat; 4] = [
    DateFormat::DateTime("%Y-%m-%d %H:%M:%S"),
    DateFormat::Date("%Y-%m-%d"),
    DateFormat::DateTime("%m/%d/%Y %H:%M:%S"),
    DateFormat::Date("%m/%d/%Y"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("reservation has no confirmation_id")]
    MissingExternalId,
}

pub fn parse_date_str(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() || text.starts_with(ZERO_DATE_PREFIX) {
        return None;
    }
    DATE_FORMATS.iter().find_map(|format| match *format {
        DateFormat::DateTime(f) => NaiveDateTime::parse_from_str(text, f)
            .ok()
            .map(|dt| dt.date()),
        DateFormat::Date(f) => NaiveDate::parse_from_str(text, f).ok(),
    })
}

/// `None` for missing, null, non-string, zero-date or unparseable input.
pub fn parse_date(value: Option<&JsonValue>) -> Option<NaiveDate> {
    match value? {
        JsonValue::String(s) => parse_date_str(s),
        _ => None,
    }
}

pub fn to_amount(value: Option<&JsonValue>) -> f64 {
    let parsed = match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() && v >= 0.0 => v,
        _ => 0.0,
    }
}

pub fn to_nights(value: Option<&JsonValue>) -> u32 {
    let parsed = match value {
        Some(JsonValue::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(JsonValue::String(s)) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.unwrap_or(0)
}

fn code_text(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

pub fn status_kind(code: &str) -> StatusKind {
    if code == CANCELLED_CODE {
        StatusKind::Cancelled
    } else {
        StatusKind::Confirmed
    }
}

pub fn status_bucket(code: &str) -> StatusBucket {
    match code {
        CANCELLED_CODE => StatusBucket::Cxl,
        "2" | "4" => StatusBucket::Bkd,
        "5" => StatusBucket::Out,
        _ => StatusBucket::Unk,
    }
}

pub fn status_label(type_name: &str, code: &str) -> String {
    let prefix = type_name
        .split_whitespace()
        .next()
        .map(|token| truncate_chars(token, MAX_TYPE_PREFIX_CHARS))
        .unwrap_or_default();
    format!("{prefix}-{}", status_bucket(code).as_str())
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn count_text(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => "0".to_string(),
    }
}

pub fn normalize(raw: &RawReservation) -> Result<CanonicalReservation, NormalizeError> {
    let external_id = raw.external_id().ok_or(NormalizeError::MissingExternalId)?;

    let first = raw.text("first_name").unwrap_or_default();
    let last = raw.text("last_name").unwrap_or_default();
    let guest_name = truncate_chars(format!("{first} {last}").trim(), MAX_GUEST_NAME_CHARS);
    let unit_label = truncate_chars(
        &raw.text("unit_name").unwrap_or_else(|| "Unknown".to_string()),
        MAX_UNIT_LABEL_CHARS,
    );

    let code = code_text(raw.get("status_code"));
    let type_name = raw.text("type_name").unwrap_or_else(|| "---".to_string());

    Ok(CanonicalReservation {
        external_id,
        guest_name,
        unit_label,
        property_group: SENTINEL_GROUP.to_string(),
        status_kind: status_kind(&code),
        status_label: status_label(&type_name, &code),
        nights: to_nights(raw.get("days_number")),
        total_amount: to_amount(raw.get("price_total")),
        nightly_rate: to_amount(raw.get("price_nightly")),
        occupancy_label: format!(
            "{}|{}",
            count_text(raw.get("occupants")),
            count_text(raw.get("occupants_small"))
        ),
        created_at: parse_date(raw.get("creation_date")),
        checkin_at: parse_date(raw.first_present(&["startdate", "start_date"])),
        checkout_at: parse_date(raw.first_present(&["enddate", "end_date"])),
    })
}
