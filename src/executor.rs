use std::time::Duration;

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::{header, StatusCode};
use tokio::time::sleep;

use crate::{
    classify::classify,
    gate::{ConcurrencyGate, GatePermit},
    RequestDescriptor, Result, RetryPolicy, StatError,
};

/// Successful response together with the concurrency slot it occupies.
///
/// The slot is held until the reply (or the byte stream made from it) is
/// dropped, so a body that is still being read counts as in flight.
#[derive(Debug)]
pub(crate) struct Reply {
    response: reqwest::Response,
    permit: GatePermit,
}

impl Reply {
    /// 204 or an explicit zero-length body.
    pub(crate) fn is_empty(&self) -> bool {
        self.response.status() == StatusCode::NO_CONTENT
            || self.response.content_length() == Some(0)
    }

    pub(crate) async fn bytes(self) -> Result<Bytes> {
        let Self { response, permit } = self;
        let body = response.bytes().await.map_err(StatError::network);
        drop(permit);
        body
    }

    pub(crate) fn into_byte_stream(self) -> BoxStream<'static, Result<Bytes>> {
        let Self { response, permit } = self;
        response
            .bytes_stream()
            .map_err(StatError::network)
            .map(move |chunk| {
                let _slot = &permit;
                chunk
            })
            .boxed()
    }
}

/// Runs one logical request under the gate with retries.
#[derive(Clone, Debug)]
pub(crate) struct Executor {
    http: reqwest::Client,
    base_url: String,
    authorization: String,
    timeout: Duration,
    gate: ConcurrencyGate,
    retry: RetryPolicy,
}

impl Executor {
    pub(crate) fn new(
        http: reqwest::Client,
        base_url: String,
        authorization: String,
        timeout: Duration,
        gate: ConcurrencyGate,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url,
            authorization,
            timeout,
            gate,
            retry,
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub(crate) async fn execute(&self, request: &RequestDescriptor) -> Result<Reply> {
        let permit = self.gate.acquire().await?;
        let mut attempt = 0u32;

        loop {
            let (err, retryable) = match self.build(request).send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(Reply { response, permit });
                }
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    match response.text().await {
                        Ok(body) => {
                            let err = classify(status, &headers, body);
                            let retryable = !matches!(err, StatError::Auth { .. })
                                && self.retry.should_retry_status(status.as_u16());
                            (err, retryable)
                        }
                        Err(err) => {
                            let transient = should_retry_transport(&err);
                            (StatError::network(err), transient)
                        }
                    }
                }
                Err(err) => {
                    let transient = should_retry_transport(&err);
                    (StatError::network(err), transient)
                }
            };

            if !retryable || attempt >= self.retry.max_retries {
                return Err(err);
            }
            self.wait_before_retry(attempt, &err).await;
            attempt += 1;
        }
    }

    fn build(&self, request: &RequestDescriptor) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .header(header::AUTHORIZATION, &self.authorization)
            .timeout(request.timeout.unwrap_or(self.timeout));

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    async fn wait_before_retry(&self, attempt: u32, err: &StatError) {
        let delay = self.retry.delay(attempt);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying request"
        );

        self.retry.notify(attempt, delay, err);
        sleep(delay).await;
    }
}

fn should_retry_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}
