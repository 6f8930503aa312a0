use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;
use url::Url;

use crate::collection::api_types::ApiPageResponse;
use crate::collection::types::{Page, PageRequest};
use crate::config::{Config, EndpointConfig};
use crate::error::FetchError;

/// Anything that can serve one page of the collection.
///
/// Implementations classify their failures into [`FetchError`]; HTTP 429 must
/// come back as [`FetchError::RateLimited`] so the orchestrator can back off.
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
  async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError>;
}

/// Collection endpoint client
#[derive(Clone)]
pub struct HttpPageSource {
  client: reqwest::Client,
  url: Url,
  token: Option<String>,
  timeout: Duration,
  data_source_header: String,
}

impl HttpPageSource {
  pub fn new(endpoint: &EndpointConfig) -> Result<Self> {
    let url =
      Url::parse(&endpoint.url).map_err(|e| eyre!("Invalid endpoint url {}: {}", endpoint.url, e))?;
    let timeout = Duration::from_millis(endpoint.timeout_ms);

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      url,
      token: Config::get_api_token(),
      timeout,
      data_source_header: endpoint.data_source_header.to_lowercase(),
    })
  }

  /// Endpoint url with `page`, `limit` and the filter parameters appended.
  pub fn request_url(&self, request: &PageRequest) -> Url {
    let mut url = self.url.clone();
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("page", &request.page.to_string());
      query.append_pair("limit", &request.limit.to_string());
      for (name, value) in request.filters.to_params() {
        query.append_pair(&name, &value);
      }
    }
    url
  }
}

#[async_trait]
impl PageSource for HttpPageSource {
  async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
    let mut builder = self.client.get(self.request_url(request));
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::from_transport(&e, self.timeout))?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::from_status(
        status.as_u16(),
        parse_retry_after(response.headers()),
      ));
    }

    let data_source = response
      .headers()
      .get(self.data_source_header.as_str())
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::from_transport(&e, self.timeout))?;

    let parsed: ApiPageResponse = serde_json::from_slice(&body)
      .map_err(|e| FetchError::Unknown(format!("Failed to parse page response: {}", e)))?;

    Ok(parsed.into_page(request.limit, data_source))
  }
}

/// `Retry-After` in its delta-seconds form. HTTP dates are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
  headers
    .get(RETRY_AFTER)?
    .to_str()
    .ok()?
    .trim()
    .parse::<u64>()
    .ok()
    .map(Duration::from_secs)
}
