use std::time::Duration;

use reqwest::{header, header::HeaderMap, StatusCode};

use crate::StatError;

/// Maps a failed response onto the error taxonomy.
///
/// Must only be called with non-success statuses; 2xx responses are handled
/// by the caller.
pub(crate) fn classify(status: StatusCode, headers: &HeaderMap, body: String) -> StatError {
    let message = title_from_body(&body).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StatError::Auth {
            status: status.as_u16(),
            message,
            body,
        },
        StatusCode::TOO_MANY_REQUESTS => StatError::RateLimit {
            status: status.as_u16(),
            message,
            retry_after: retry_after(headers),
            body,
        },
        _ => StatError::Generic {
            status: Some(status.as_u16()),
            message,
            body,
            source: None,
        },
    }
}

fn title_from_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("title")?.as_str().map(str::to_owned)
}

/// Seconds form only; HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    let seconds = raw.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}
