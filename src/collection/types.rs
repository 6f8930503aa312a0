use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of a collection item. Servers use either numeric or string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
  Int(i64),
  Text(String),
}

impl fmt::Display for ItemId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ItemId::Int(id) => write!(f, "{}", id),
      ItemId::Text(id) => f.write_str(id),
    }
  }
}

impl From<i64> for ItemId {
  fn from(id: i64) -> Self {
    ItemId::Int(id)
  }
}

impl From<&str> for ItemId {
  fn from(id: &str) -> Self {
    ItemId::Text(id.to_string())
  }
}

/// A record from the collection endpoint.
///
/// Everything except `id` is kept as raw JSON; the change detector compares
/// the configured watched fields by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
  pub id: ItemId,
  #[serde(flatten)]
  pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Item {
  pub fn new(id: impl Into<ItemId>) -> Self {
    Self {
      id: id.into(),
      fields: serde_json::Map::new(),
    }
  }

  pub fn with_field(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
    self.fields.insert(name.to_string(), value.into());
    self
  }

  pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
    self.fields.get(name)
  }
}

/// The server-reported slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
  pub page: u32,
  pub limit: u32,
  pub total: u64,
  pub page_count: u32,
}

/// A normalized page result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
  pub items: Vec<Item>,
  pub pagination: Pagination,
  /// Value of the endpoint's data-source header, if it sent one
  pub data_source: Option<String>,
}

/// Inclusive numeric range filter, sent as `min_<field>` / `max_<field>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeFilter {
  pub min: Option<f64>,
  pub max: Option<f64>,
}

/// Active filters for the collection query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filters {
  pub status: Option<String>,
  pub date_from: Option<NaiveDate>,
  pub date_to: Option<NaiveDate>,
  pub ranges: BTreeMap<String, RangeFilter>,
  /// Exact-match filters passed through verbatim
  pub exact: BTreeMap<String, String>,
}

/// Parameters the request carries outside the exact-match filters.
const RESERVED_PARAMS: &[&str] = &["page", "limit", "status", "date_from", "date_to"];

impl Filters {
  /// Query parameters for the active filters, ordered by parameter name.
  ///
  /// Empty strings are treated as "no filter". Exact filters that collide
  /// with another parameter are left out; see [`Filters::conflicting_exact`].
  pub fn to_params(&self) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();

    if let Some(status) = self.status.as_deref().filter(|s| !s.is_empty()) {
      params.insert("status".to_string(), status.to_string());
    }
    if let Some(from) = self.date_from {
      params.insert("date_from".to_string(), from.format("%Y-%m-%d").to_string());
    }
    if let Some(to) = self.date_to {
      params.insert("date_to".to_string(), to.format("%Y-%m-%d").to_string());
    }
    for (field, range) in &self.ranges {
      if let Some(min) = range.min {
        params.insert(format!("min_{}", field), format_number(min));
      }
      if let Some(max) = range.max {
        params.insert(format!("max_{}", field), format_number(max));
      }
    }
    for (field, value) in &self.exact {
      if value.is_empty() || RESERVED_PARAMS.contains(&field.as_str()) {
        continue;
      }
      params.entry(field.clone()).or_insert_with(|| value.clone());
    }

    params
  }

  /// Exact filter names that shadow `page`, `limit`, a typed filter or a
  /// range bound. These are never sent.
  pub fn conflicting_exact(&self) -> Vec<&str> {
    self
      .exact
      .keys()
      .map(String::as_str)
      .filter(|name| {
        RESERVED_PARAMS.contains(name)
          || self.ranges.keys().any(|field| {
            name.strip_prefix("min_") == Some(field.as_str())
              || name.strip_prefix("max_") == Some(field.as_str())
          })
      })
      .collect()
  }
}

/// `10.0` and `10` must encode identically.
fn format_number(value: f64) -> String {
  if value.fract() == 0.0 && value.abs() < 1e15 {
    format!("{}", value as i64)
  } else {
    format!("{}", value)
  }
}

/// A logical page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageRequest {
  pub page: u32,
  pub limit: u32,
  pub filters: Filters,
}

impl Default for PageRequest {
  fn default() -> Self {
    Self {
      page: 1,
      limit: 20,
      filters: Filters::default(),
    }
  }
}

impl PageRequest {
  pub fn new(page: u32, limit: u32, filters: Filters) -> Self {
    Self {
      page,
      limit,
      filters,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_item_deserializes_with_extra_fields() {
    let item: Item =
      serde_json::from_str(r#"{"id": 7, "status": "paid", "amount": 12.5}"#).unwrap();
    assert_eq!(item.id, ItemId::Int(7));
    assert_eq!(item.field("status"), Some(&serde_json::json!("paid")));

    let item: Item = serde_json::from_str(r#"{"id": "tx-9"}"#).unwrap();
    assert_eq!(item.id, ItemId::from("tx-9"));
  }

  #[test]
  fn test_filter_params() {
    let mut filters = Filters {
      status: Some("completed".into()),
      date_from: NaiveDate::from_ymd_opt(2024, 1, 2),
      ..Default::default()
    };
    filters.ranges.insert(
      "amount".into(),
      RangeFilter {
        min: Some(10.0),
        max: Some(99.5),
      },
    );
    filters.exact.insert("category".into(), "food".into());
    filters.exact.insert("seller".into(), String::new());

    let params: Vec<_> = filters.to_params().into_iter().collect();
    assert_eq!(
      params,
      vec![
        ("category".to_string(), "food".to_string()),
        ("date_from".to_string(), "2024-01-02".to_string()),
        ("max_amount".to_string(), "99.5".to_string()),
        ("min_amount".to_string(), "10".to_string()),
        ("status".to_string(), "completed".to_string()),
      ]
    );
  }

  #[test]
  fn test_exact_filters_cannot_shadow_other_params() {
    let mut filters = Filters {
      status: Some("paid".into()),
      ..Default::default()
    };
    filters.ranges.insert(
      "amount".into(),
      RangeFilter {
        min: Some(1.0),
        max: None,
      },
    );
    filters.exact.insert("page".into(), "3".into());
    filters.exact.insert("status".into(), "refunded".into());
    filters.exact.insert("min_amount".into(), "500".into());
    filters.exact.insert("region".into(), "eu".into());

    let params = filters.to_params();
    assert_eq!(params.get("page"), None);
    assert_eq!(params.get("status").map(String::as_str), Some("paid"));
    assert_eq!(params.get("min_amount").map(String::as_str), Some("1"));
    assert_eq!(params.get("region").map(String::as_str), Some("eu"));

    assert_eq!(
      filters.conflicting_exact(),
      vec!["min_amount", "page", "status"]
    );
  }
}
