//! HTTP transport for the resource API.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, ETAG, IF_MATCH, IF_UNMODIFIED_SINCE, LAST_MODIFIED};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

/// A request against the API, with `path` relative to the base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub if_match: Option<String>,
  pub if_unmodified_since: Option<String>,
}

impl ApiRequest {
  fn new(method: Method, path: impl Into<String>, body: Option<Value>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body,
      if_match: None,
      if_unmodified_since: None,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path, None)
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::Post, path, Some(body))
  }

  pub fn put(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::Put, path, Some(body))
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::Delete, path, None)
  }

  pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.push((name.into(), value.into()));
    self
  }

  /// Attach optimistic concurrency validators from a previous response.
  pub fn with_validators(mut self, etag: Option<String>, last_modified: Option<String>) -> Self {
    self.if_match = etag;
    self.if_unmodified_since = last_modified;
    self
  }
}

/// Decoded response. `body` is `Null` for empty bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  pub body: Value,
  pub etag: Option<String>,
  pub last_modified: Option<String>,
}

impl ApiResponse {
  pub fn ok(body: Value) -> Self {
    Self {
      status: 200,
      body,
      etag: None,
      last_modified: None,
    }
  }
}

/// Sends requests to the server.
///
/// Implementations report any HTTP status as a response; only failures to reach
/// the server or to read the body are errors.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// [`Transport`] over HTTP with bearer authentication.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
    let mut base = Url::parse(base_url)
      .map_err(|e| CacheError::Config(format!("invalid api url {base_url}: {e}")))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| CacheError::Transport(format!("failed to build http client: {e}")))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  fn url_for(&self, request: &ApiRequest) -> Result<Url> {
    let mut url = self
      .base
      .join(request.path.trim_start_matches('/'))
      .map_err(|e| CacheError::Transport(format!("invalid path {}: {e}", request.path)))?;
    if !request.query.is_empty() {
      url.query_pairs_mut().extend_pairs(&request.query);
    }
    Ok(url)
  }
}

fn header(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
  headers
    .get(name)
    .and_then(|v| v.to_str().ok())
    .map(String::from)
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
    let url = self.url_for(&request)?;
    debug!(method = request.method.as_str(), %url, "sending request");

    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };
    let mut builder = self
      .client
      .request(method, url)
      .header(ACCEPT, "application/json");
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(etag) = &request.if_match {
      builder = builder.header(IF_MATCH, etag);
    }
    if let Some(since) = &request.if_unmodified_since {
      builder = builder.header(IF_UNMODIFIED_SINCE, since);
    }
    if let Some(body) = &request.body {
      builder = builder
        .header(CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(body)?);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| CacheError::Transport(format!("{} {} failed: {e}", request.method.as_str(), request.path)))?;

    let status = response.status().as_u16();
    let etag = header(response.headers(), ETAG);
    let last_modified = header(response.headers(), LAST_MODIFIED);
    let bytes = response
      .bytes()
      .await
      .map_err(|e| CacheError::Transport(format!("failed to read response: {e}")))?;

    let body = if bytes.is_empty() {
      Value::Null
    } else {
      // Error pages are not always JSON; keep them as text.
      serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    Ok(ApiResponse {
      status,
      body,
      etag,
      last_modified,
    })
  }
}
