//! Core reservation model and field normalization for staysync.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod normalize;

pub use normalize::{
    normalize, parse_date, parse_date_str, status_bucket, status_kind, status_label, to_amount,
    to_nights, NormalizeError, SENTINEL_GROUP,
};

pub const CRATE_NAME: &str = "staysync-core";

/// Untyped reservation record exactly as the source returned it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawReservation(Map<String, JsonValue>);

impl RawReservation {
    /// Wraps a JSON object; any other JSON shape is not a reservation.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Field value, with explicit JSON `null` treated as absent.
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    /// First of `fields` holding something other than null or a blank string.
    pub fn first_present(&self, fields: &[&str]) -> Option<&JsonValue> {
        fields.iter().find_map(|field| {
            self.get(field).filter(|v| match v {
                JsonValue::String(s) => !s.trim().is_empty(),
                _ => true,
            })
        })
    }

    /// Trimmed textual rendering of a string or numeric field.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            JsonValue::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Source confirmation id, the correlation key in the sink.
    pub fn external_id(&self) -> Option<String> {
        self.text("confirmation_id")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    Confirmed,
    Cancelled,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Confirmed => "CONFIRMED",
            StatusKind::Cancelled => "CANCELLED",
        }
    }
}

/// Coarse visual bucket appended to the status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusBucket {
    Cxl,
    Bkd,
    Out,
    Unk,
}

impl StatusBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusBucket::Cxl => "CXL",
            StatusBucket::Bkd => "BKD",
            StatusBucket::Out => "OUT",
            StatusBucket::Unk => "UNK",
        }
    }
}

/// Normalized reservation handed from the source side to the sink writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalReservation {
    pub external_id: String,
    pub guest_name: String,
    pub unit_label: String,
    pub property_group: String,
    pub status_kind: StatusKind,
    pub status_label: String,
    pub nights: u32,
    pub total_amount: f64,
    pub nightly_rate: f64,
    pub occupancy_label: String,
    pub created_at: Option<NaiveDate>,
    pub checkin_at: Option<NaiveDate>,
    pub checkout_at: Option<NaiveDate>,
}

impl CanonicalReservation {
    pub fn with_property_group(mut self, group: impl Into<String>) -> Self {
        self.property_group = group.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawReservation {
        RawReservation::from_value(value).expect("object")
    }

    #[test]
    fn non_object_values_are_not_reservations() {
        assert!(RawReservation::from_value(json!([1, 2])).is_none());
        assert!(RawReservation::from_value(json!("R1")).is_none());
    }

    #[test]
    fn text_renders_numbers_and_skips_blanks() {
        let r = raw(json!({"confirmation_id": 4411, "unit_name": "  ", "x": null}));
        assert_eq!(r.external_id().as_deref(), Some("4411"));
        assert_eq!(r.text("unit_name"), None);
        assert!(r.get("x").is_none());
    }

    #[test]
    fn first_present_skips_null_and_blank_candidates() {
        let r = raw(json!({"startdate": "", "start_date": "2025-06-01"}));
        assert_eq!(
            r.first_present(&["startdate", "start_date"]),
            Some(&json!("2025-06-01"))
        );
        let r = raw(json!({"startdate": null}));
        assert!(r.first_present(&["startdate", "start_date"]).is_none());
    }
}
