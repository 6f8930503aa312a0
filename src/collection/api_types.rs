//! Serde-deserializable types matching the collection endpoint's responses.
//!
//! These types are separate from domain types so the wire shape can drift
//! (field renames, optional members) without touching the sync engine.

use serde::Deserialize;

use super::types::{Item, Page, Pagination};

#[derive(Debug, Deserialize)]
pub struct ApiPagination {
  #[serde(default = "default_page")]
  pub page: u32,
  #[serde(default)]
  pub limit: u32,
  #[serde(default)]
  pub total: u64,
  #[serde(default, alias = "pageCount", alias = "page_count")]
  pub pages: u32,
}

fn default_page() -> u32 {
  1
}

#[derive(Debug, Deserialize)]
pub struct ApiPageResponse {
  #[serde(default, alias = "data")]
  pub items: Vec<Item>,
  pub pagination: Option<ApiPagination>,
}

impl ApiPageResponse {
  /// Normalize into a [`Page`]. A response without pagination describes
  /// exactly the items it carries.
  pub fn into_page(self, requested_limit: u32, data_source: Option<String>) -> Page {
    let pagination = match self.pagination {
      Some(p) => Pagination {
        page: p.page,
        limit: if p.limit == 0 { requested_limit } else { p.limit },
        total: p.total,
        page_count: p.pages,
      },
      None => Pagination {
        page: 1,
        limit: requested_limit,
        total: self.items.len() as u64,
        page_count: 1,
      },
    };

    Page {
      items: self.items,
      pagination,
      data_source,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_page_response() {
    let body = r#"{
      "items": [{"id": 1, "status": "A"}, {"id": 2, "status": "B"}],
      "pagination": {"page": 2, "limit": 2, "total": 9, "pages": 5}
    }"#;
    let response: ApiPageResponse = serde_json::from_str(body).unwrap();
    let page = response.into_page(2, Some("cache".into()));

    assert_eq!(page.items.len(), 2);
    assert_eq!(
      page.pagination,
      Pagination {
        page: 2,
        limit: 2,
        total: 9,
        page_count: 5
      }
    );
    assert_eq!(page.data_source.as_deref(), Some("cache"));
  }

  #[test]
  fn test_missing_pagination_is_synthesized() {
    let response: ApiPageResponse = serde_json::from_str(r#"{"data": [{"id": "a"}]}"#).unwrap();
    let page = response.into_page(20, None);
    assert_eq!(page.pagination.total, 1);
    assert_eq!(page.pagination.limit, 20);
    assert_eq!(page.pagination.page_count, 1);
  }
}
