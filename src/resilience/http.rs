//! HTTP adapters for the resilience layer
//!
//! Turns `reqwest` outcomes into [`CallFailure`]s so the retry wrapper and
//! fallback executor can classify them.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response};
use std::time::Duration;

use super::retry::CallFailure;

/// Longest response body kept in a failure for diagnostics
const MAX_ERROR_BODY: usize = 512;

/// Upper bound on any server-supplied `Retry-After`
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Parse a `Retry-After` header given as seconds or as an HTTP date
///
/// Values are capped at [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    let delay = if let Ok(secs) = value.parse::<u64>() {
        Duration::from_secs(secs)
    } else if let Ok(secs) = value.parse::<f64>() {
        if secs.is_nan() || secs < 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_AFTER)
    } else {
        let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
        (at - now).to_std().unwrap_or(Duration::ZERO)
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

/// Map a transport-level error
pub fn classify_error(err: &reqwest::Error) -> CallFailure {
    if err.is_timeout() {
        CallFailure::Timeout(Duration::ZERO)
    } else if err.is_connect() || err.is_request() {
        CallFailure::Network(err.to_string())
    } else if err.is_decode() || err.is_body() {
        CallFailure::Other(err.to_string())
    } else {
        CallFailure::Network(err.to_string())
    }
}

/// Pass through a 2xx response, or describe why it failed
pub async fn check_response(response: Response) -> Result<Response, CallFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers(), Utc::now());
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }

    let failure = CallFailure::status(status.as_u16()).with_body(body);
    Err(match retry_after {
        Some(delay) => failure.with_retry_after(delay),
        None => failure,
    })
}

/// Send a request and classify the result in one step
pub async fn send(request: RequestBuilder) -> Result<Response, CallFailure> {
    let response = request.send().await.map_err(|e| classify_error(&e))?;
    check_response(response).await
}

/// Send a request and decode a JSON body, classifying every failure
pub async fn send_json<T>(request: RequestBuilder) -> Result<T, CallFailure>
where
    T: serde::de::DeserializeOwned,
{
    let response = send(request).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| CallFailure::Other(format!("invalid response body: {}", e)))
}
