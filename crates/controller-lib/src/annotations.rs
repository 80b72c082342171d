//! Cost cache persisted in node annotations
//!
//! The cache is not a separate store: the hourly cost and its freshness
//! timestamp live side by side in the node's annotation map and are always
//! written together.

use crate::models::{CostValue, NodeRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default annotation domain
pub const DEFAULT_DOMAIN: &str = "costwatch.io";

/// Sentinel persisted when the price cannot be determined
pub const UNKNOWN_COST: &str = "unknown";

/// Decimal places used when persisting a price
pub const COST_PRECISION: usize = 10;

/// Node condition written alongside the cost annotations
pub const COST_CONDITION_TYPE: &str = "HourlyCostKnown";
pub const REASON_UPDATED: &str = "Updated";
pub const REASON_UNKNOWN: &str = "Unknown";

/// Fully qualified annotation keys for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationKeys {
    pub hourly_cost: String,
    pub capacity: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub updated_at: String,
}

impl AnnotationKeys {
    pub fn new(domain: &str) -> Self {
        Self {
            hourly_cost: format!("{}/node-hourly-cost", domain),
            capacity: format!("{}/capacity", domain),
            instance_type: format!("{}/type", domain),
            availability_zone: format!("{}/availability-zone", domain),
            updated_at: format!("{}/cost-updated-at", domain),
        }
    }
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN)
    }
}

/// Interpretation of a persisted hourly cost annotation
#[derive(Debug, Clone, PartialEq)]
pub enum StoredCost {
    Absent,
    Unknown,
    Known(f64),
    /// Present but unusable: unparseable, zero or negative
    Invalid(String),
}

impl StoredCost {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return StoredCost::Absent;
        };
        if raw == UNKNOWN_COST {
            return StoredCost::Unknown;
        }
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() && v > 0.0 => StoredCost::Known(v),
            _ => StoredCost::Invalid(raw.to_string()),
        }
    }

    pub fn from_annotations(annotations: &BTreeMap<String, String>, keys: &AnnotationKeys) -> Self {
        Self::parse(annotations.get(&keys.hourly_cost).map(String::as_str))
    }

    /// Cost value this stored state resolves to; `None` when absent
    pub fn value(&self) -> Option<CostValue> {
        match self {
            StoredCost::Absent => None,
            StoredCost::Known(v) => Some(CostValue::Known(*v)),
            StoredCost::Unknown | StoredCost::Invalid(_) => Some(CostValue::Unknown),
        }
    }
}

/// Render a cost value the way it is persisted
pub fn format_cost(value: CostValue) -> String {
    match value {
        CostValue::Known(v) => format!("{:.*}", COST_PRECISION, v),
        CostValue::Unknown => UNKNOWN_COST.to_string(),
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Cached cost state read from a node
#[derive(Debug, Clone, PartialEq)]
pub struct CostCacheEntry {
    pub stored: StoredCost,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CostCacheEntry {
    pub fn read(node: &NodeRecord, keys: &AnnotationKeys) -> Self {
        Self {
            stored: StoredCost::from_annotations(&node.annotations, keys),
            updated_at: node
                .annotations
                .get(&keys.updated_at)
                .and_then(|raw| parse_timestamp(raw)),
        }
    }

    /// Absent, unknown, never timestamped, or more than one refresh interval
    /// away from `now` in either direction
    pub fn is_stale(&self, now: DateTime<Utc>, refresh_interval: Duration) -> bool {
        if matches!(self.stored, StoredCost::Absent | StoredCost::Unknown) {
            return true;
        }
        match self.updated_at {
            None => true,
            Some(at) => match (now - at).to_std() {
                Ok(age) => age > refresh_interval,
                // Stamped ahead of us; tolerate skew up to one interval
                Err(_) => match (at - now).to_std() {
                    Ok(ahead) => ahead > refresh_interval,
                    Err(_) => true,
                },
            },
        }
    }

    /// Fingerprint used to detect a cost change between two notifications
    pub fn fingerprint(node: &NodeRecord, keys: &AnnotationKeys) -> (Option<String>, Option<String>) {
        (
            node.annotations.get(&keys.hourly_cost).cloned(),
            node.annotations.get(&keys.updated_at).cloned(),
        )
    }
}

/// Whole hours a resource has existed, rounded up
pub fn billed_hours(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let seconds = (now - created_at).num_seconds().max(0) as f64;
    (seconds / 3600.0).ceil()
}
