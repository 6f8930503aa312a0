//! Canonical query identity.

use sha2::{Digest, Sha256};
use std::fmt;

use super::types::PageRequest;

/// Canonical encoding of page, limit and active filters.
///
/// Parameters are emitted in name order so two logically identical requests
/// always produce the same key, regardless of how the filters were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
  pub fn new(request: &PageRequest) -> Self {
    let mut params = request.filters.to_params();
    params.insert("limit".to_string(), request.limit.to_string());
    params.insert("page".to_string(), request.page.to_string());

    let encoded = params
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join("&");

    Self(encoded)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Short SHA256 digest, used to correlate log lines without dumping filter values.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(12);
    digest
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&PageRequest> for QueryKey {
  fn from(request: &PageRequest) -> Self {
    Self::new(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::collection::types::Filters;

  #[test]
  fn test_key_is_order_independent() {
    let mut a = Filters::default();
    a.exact.insert("seller".into(), "7".into());
    a.exact.insert("category".into(), "food".into());

    let mut b = Filters::default();
    b.exact.insert("category".into(), "food".into());
    b.exact.insert("seller".into(), "7".into());

    let ka = QueryKey::new(&PageRequest::new(1, 20, a));
    let kb = QueryKey::new(&PageRequest::new(1, 20, b));
    assert_eq!(ka, kb);
    assert_eq!(ka.digest(), kb.digest());
    assert_eq!(ka.as_str(), "category=food&limit=20&page=1&seller=7");
  }

  #[test]
  fn test_key_differs_by_page() {
    let k1 = QueryKey::new(&PageRequest::new(1, 20, Filters::default()));
    let k2 = QueryKey::new(&PageRequest::new(2, 20, Filters::default()));
    assert_ne!(k1, k2);
    assert_eq!(k1.digest().len(), 12);
  }
}
