//! Property-group resolution.
//!
//! Resolution is one ordered chain, first hit wins:
//! priority keywords, reference group table, per-unit property lookup
//! (memoized per pass), then condo type / location / sentinel fallback.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use staysync_core::{RawReservation, SENTINEL_GROUP};
use tracing::{debug, warn};

use crate::{json_text, SourceError};

const LABEL_SEPARATORS: [&str; 3] = [" - ", " | ", " # "];
const SIZE_DESCRIPTORS: [&str; 2] = ["bedroom", "studio"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PriorityGroup {
    pub name: String,
    pub contains_any: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupRules {
    #[serde(default)]
    pub priority: Vec<PriorityGroup>,
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
}

fn default_sentinel() -> String {
    SENTINEL_GROUP.to_string()
}

impl Default for GroupRules {
    fn default() -> Self {
        Self {
            priority: Vec::new(),
            sentinel: default_sentinel(),
        }
    }
}

impl GroupRules {
    /// Loads `rules/groups.yaml`; a workspace without the file has no priority rules.
    pub fn from_workspace_root(root: &Path) -> anyhow::Result<Self> {
        let path = root.join("rules").join("groups.yaml");
        if !path.exists() {
            debug!(path = %path.display(), "no group rules file");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Room-type group id to display name, fetched once per pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTable {
    names: BTreeMap<String, String>,
}

impl GroupTable {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            names: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Reads the first list of `{id, name}` objects in a group-list payload.
    pub fn from_data(data: &JsonValue) -> Self {
        let rows: Vec<&JsonValue> = match data {
            JsonValue::Array(rows) => rows.iter().collect(),
            JsonValue::Object(fields) => fields
                .values()
                .find_map(|v| match v {
                    JsonValue::Array(rows) => Some(rows.iter().collect()),
                    JsonValue::Object(_) if v.get("id").is_some() => Some(vec![v]),
                    _ => None,
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Self::from_pairs(rows.into_iter().filter_map(|row| {
            let id = row.get("id").and_then(json_text)?;
            let name = row
                .get("name")
                .or_else(|| row.get("group_name"))
                .and_then(json_text)?;
            Some((id, name))
        }))
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Per-pass memo of per-unit lookups; `None` records "looked up, nothing found".
#[derive(Debug, Default)]
pub struct GroupCache {
    by_unit: HashMap<String, Option<String>>,
}

impl GroupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, unit_id: &str) -> Option<&Option<String>> {
        self.by_unit.get(unit_id)
    }

    pub fn insert(&mut self, unit_id: impl Into<String>, group: Option<String>) {
        self.by_unit.insert(unit_id.into(), group);
    }

    pub fn len(&self) -> usize {
        self.by_unit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_unit.is_empty()
    }
}

#[async_trait]
pub trait PropertyInfoLookup: Send + Sync {
    async fn property_group(&self, unit_id: &str) -> Result<Option<String>, SourceError>;
}

/// Prefix of a unit label such as `"Solara - 2 Bedroom Townhome"`.
pub fn label_prefix(unit_label: &str) -> Option<String> {
    LABEL_SEPARATORS.iter().find_map(|sep| {
        let (prefix, _) = unit_label.split_once(sep)?;
        let prefix = prefix.trim();
        (!prefix.is_empty()).then(|| prefix.to_string())
    })
}

fn is_size_descriptor(name: &str) -> bool {
    let lower = name.to_lowercase();
    SIZE_DESCRIPTORS.iter().any(|d| lower.contains(d))
}

pub struct GroupResolver {
    rules: GroupRules,
    table: GroupTable,
}

impl GroupResolver {
    pub fn new(rules: GroupRules, table: GroupTable) -> Self {
        Self { rules, table }
    }

    pub fn table(&self) -> &GroupTable {
        &self.table
    }

    pub fn match_priority_keyword(&self, raw: &RawReservation, unit_label: &str) -> Option<&str> {
        let haystack = [
            Some(unit_label.to_string()),
            raw.text("condo_type_name"),
            raw.text("location_name"),
        ]
        .into_iter()
        .flatten()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");

        self.rules
            .priority
            .iter()
            .find(|group| {
                group
                    .contains_any
                    .iter()
                    .any(|needle| haystack.contains(&needle.to_lowercase()))
            })
            .map(|group| group.name.as_str())
    }

    pub fn lookup_group_table(&self, raw: &RawReservation, unit_label: &str) -> Option<String> {
        let group_id = raw.text("condo_type_group_id")?;
        let name = self.table.get(&group_id)?;
        if is_size_descriptor(name) {
            return label_prefix(unit_label);
        }
        Some(name.to_string())
    }

    pub async fn lookup_per_unit(
        &self,
        raw: &RawReservation,
        cache: &mut GroupCache,
        lookup: &dyn PropertyInfoLookup,
    ) -> Option<String> {
        let unit_id = raw.text("unit_id")?;
        if let Some(memo) = cache.get(&unit_id) {
            return memo.clone();
        }
        match lookup.property_group(&unit_id).await {
            Ok(group) => {
                cache.insert(unit_id, group.clone());
                group
            }
            Err(err) => {
                warn!(unit_id = %unit_id, error = %err, "property info lookup failed");
                None
            }
        }
    }

    pub fn fallback(&self, raw: &RawReservation) -> String {
        raw.text("condo_type_name")
            .or_else(|| raw.text("location_name"))
            .unwrap_or_else(|| self.rules.sentinel.clone())
    }

    pub async fn resolve(
        &self,
        raw: &RawReservation,
        unit_label: &str,
        cache: &mut GroupCache,
        lookup: &dyn PropertyInfoLookup,
    ) -> String {
        if let Some(name) = self.match_priority_keyword(raw, unit_label) {
            return name.to_string();
        }
        if let Some(name) = self.lookup_group_table(raw, unit_label) {
            return name;
        }
        if let Some(name) = self.lookup_per_unit(raw, cache, lookup).await {
            return name;
        }
        self.fallback(raw)
    }
}
