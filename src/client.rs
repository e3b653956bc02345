use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::{
    cache::ResponseCache,
    decode::{ItemPath, Row},
    executor::Executor,
    gate::ConcurrencyGate,
    paginate::{drive, map_rows, BufferedPages, PageSource, RowTransform, StreamedPages},
    ClientOptions, PagedEndpoint, ReportQuery, RequestDescriptor, Result, RowStream, StatError,
};

/// Base URL of the statistics API.
pub const DEFAULT_BASE_URL: &str = "https://statistics-api.wildberries.ru";

/// Health-check path answered by every API host.
pub const PING_PATH: &str = "/ping";

/// Async client for the seller statistics API.
///
/// Clones share one concurrency gate and one ping cache.
#[derive(Clone)]
pub struct StatClient {
    inner: Arc<Inner>,
}

struct Inner {
    executor: Executor,
    authorization: String,
    options: ClientOptions,
    ping_cache: ResponseCache<Value>,
}

impl fmt::Debug for StatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatClient")
            .field("base_url", &self.base_url())
            .field("authorization", &"<redacted>")
            .field("options", &self.inner.options)
            .finish()
    }
}

impl StatClient {
    /// Creates a client that sends `token` verbatim as the `Authorization` header.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new_raw_auth(base_url, token)
    }

    /// Creates a client with a full raw authorization value.
    pub fn new_raw_auth(base_url: impl Into<String>, authorization: impl Into<String>) -> Self {
        Self::build(base_url.into(), authorization.into(), ClientOptions::default())
    }

    /// Creates a client from a bearer token.
    ///
    /// If the token is missing the `Bearer ` prefix, it is added automatically.
    pub fn new_bearer(base_url: impl Into<String>, token: impl AsRef<str>) -> Self {
        let authorization = normalize_bearer_authorization(token.as_ref());
        Self::new_raw_auth(base_url, authorization)
    }

    /// Creates a client from environment variables.
    ///
    /// Reads:
    /// - `WB_API_TOKEN`: API token, sent as is
    /// - `WB_STATISTICS_URL`: optional base URL, defaults to [`DEFAULT_BASE_URL`]
    ///
    /// # Example
    ///
    /// ```no_run
    /// use wbstat_http::StatClient;
    ///
    /// let client = StatClient::from_env().expect("missing WB_API_TOKEN");
    /// ```
    pub fn from_env() -> std::result::Result<Self, String> {
        let token = std::env::var("WB_API_TOKEN")
            .map_err(|_| "missing WB_API_TOKEN environment variable".to_owned())?;
        if token.trim().is_empty() {
            return Err("WB_API_TOKEN is set but empty".to_owned());
        }
        let base_url = std::env::var("WB_STATISTICS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        Ok(Self::new(base_url, token.trim()))
    }

    /// Applies client options such as timeout, concurrency and retry behavior.
    ///
    /// The returned client gets a fresh gate and cache sized from `opts`.
    pub fn with_options(self, opts: ClientOptions) -> Self {
        Self::build(
            self.base_url().to_owned(),
            self.inner.authorization.clone(),
            opts,
        )
    }

    fn build(base_url: String, authorization: String, options: ClientOptions) -> Self {
        let executor = Executor::new(
            reqwest::Client::new(),
            base_url,
            authorization.clone(),
            Duration::from_millis(options.timeout_ms),
            ConcurrencyGate::new(options.max_concurrent),
            options.retry.clone(),
        );
        let ping_cache = ResponseCache::new(Duration::from_millis(options.ping_cache_ttl_ms));
        Self {
            inner: Arc::new(Inner {
                executor,
                authorization,
                options,
                ping_cache,
            }),
        }
    }

    /// Base URL every request path is appended to.
    pub fn base_url(&self) -> &str {
        self.inner.executor.base_url()
    }

    /// Options this client was built with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Requests currently holding a concurrency slot, including streamed
    /// bodies that are still being read.
    pub fn in_flight(&self) -> usize {
        self.inner.executor.gate().in_flight()
    }

    /// Sends `request` and parses the response body as JSON.
    ///
    /// 204 and empty bodies yield an empty JSON array.
    pub async fn request_json(&self, request: RequestDescriptor) -> Result<Value> {
        let reply = self.inner.executor.execute(&request).await?;
        if reply.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        let body = reply.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Array(Vec::new()));
        }
        serde_json::from_slice(&body).map_err(|err| {
            StatError::Decode(format!(
                "invalid JSON response from {}: {err}",
                request.path
            ))
        })
    }

    /// Sends a GET with `query` parameters and parses the JSON response.
    pub async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let request = query
            .iter()
            .fold(RequestDescriptor::get(path), |request, (key, value)| {
                request.query(*key, value)
            });
        self.request_json(request).await
    }

    /// Sends `body` as a JSON POST and parses the JSON response.
    pub async fn post_json(&self, path: &str, body: Value) -> Result<Value> {
        self.request_json(RequestDescriptor::post(path).json(body))
            .await
    }

    /// Streams the rows of one response without buffering its body.
    ///
    /// `item_path` locates the array (`"item"` for a root array,
    /// `"result.item"` for `{"result": [...]}`). A failed `transform` ends
    /// the stream with a [`StatError::Generic`] error.
    pub fn stream_rows(
        &self,
        request: RequestDescriptor,
        item_path: impl Into<ItemPath>,
        transform: Option<RowTransform>,
    ) -> RowStream {
        let source = StreamedPages {
            executor: self.inner.executor.clone(),
            item_path: item_path.into(),
        };
        let rows = stream::once(source.open(request)).try_flatten().boxed();
        match transform {
            Some(transform) => map_rows(rows, transform),
            None => rows,
        }
    }

    /// Calls [`PING_PATH`], serving repeated calls from the ping cache.
    pub async fn ping(&self) -> Result<Value> {
        self.ping_path(PING_PATH).await
    }

    /// Pings a custom health-check path; cached per base URL and path.
    pub async fn ping_path(&self, path: &str) -> Result<Value> {
        let key = format!("{}{path}", self.base_url());
        if let Some(cached) = self.inner.ping_cache.get(&key) {
            return Ok(cached);
        }
        let value = self.request_json(RequestDescriptor::get(path)).await?;
        self.inner.ping_cache.set(key, value.clone());
        Ok(value)
    }

    /// Drops every cached ping response.
    pub fn clear_ping_cache(&self) {
        self.inner.ping_cache.clear();
    }

    /// Fetches every page of `endpoint` into memory.
    pub async fn fetch_pages(&self, endpoint: &PagedEndpoint, query: ReportQuery) -> Result<Vec<Row>> {
        let source = BufferedPages {
            executor: self.inner.executor.clone(),
            item_path: endpoint.item_path.clone(),
        };
        drive(source, endpoint.clone(), query).try_collect().await
    }

    /// Streams the pages of `endpoint`, decoding each body incrementally.
    ///
    /// Rows yielded before a failure stay delivered; the stream ends after
    /// the first error.
    pub fn stream_pages(&self, endpoint: &PagedEndpoint, query: ReportQuery) -> RowStream {
        let source = StreamedPages {
            executor: self.inner.executor.clone(),
            item_path: endpoint.item_path.clone(),
        };
        drive(source, endpoint.clone(), query)
    }

    /// Realization report rows for a date range.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use wbstat_http::{ReportQuery, StatClient};
    ///
    /// # async fn run() -> wbstat_http::Result<()> {
    /// let client = StatClient::from_env().expect("missing WB_API_TOKEN");
    /// let rows = client
    ///     .report_detail_by_period(ReportQuery::new("2024-01-01", "2024-01-31").fetch_all(true))
    ///     .await?;
    /// println!("{} rows", rows.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn report_detail_by_period(&self, query: ReportQuery) -> Result<Vec<Row>> {
        self.fetch_pages(&PagedEndpoint::report_detail_by_period(), query)
            .await
    }

    /// Streaming counterpart of [`StatClient::report_detail_by_period`].
    pub fn stream_report_detail_by_period(&self, query: ReportQuery) -> RowStream {
        self.stream_pages(&PagedEndpoint::report_detail_by_period(), query)
    }
}

fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
