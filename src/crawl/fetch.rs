//! HTTP fetching with streaming body caps and SSRF-checked redirects
//!
//! Bodies are streamed and cut off cleanly at 5 MiB. Redirects are not
//! followed by the client; each hop is re-validated against the SSRF
//! policy before the next request. Transient failures retry twice with
//! exponential backoff (1 s, 2 s); policy rejections never retry.

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::ssrf::{validate_resolved_ip, validate_url, SsrfError};

/// Hard cap on a fetched body
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;
/// Redirect hops before giving up
pub const MAX_REDIRECTS: usize = 5;
/// Transient retries (1 s, 2 s backoff)
pub const MAX_RETRIES: u32 = 2;
/// Per-request timeout
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("meshseek/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum FetchError {
    /// Policy rejection: never retried
    #[error(transparent)]
    Ssrf(#[from] SsrfError),
    #[error("HTTP status {0} refuses crawling")]
    Refused(StatusCode),
    #[error("Too many redirects (> {MAX_REDIRECTS})")]
    TooManyRedirects,
    #[error("Redirect without a Location header")]
    BadRedirect,
    #[error("Unsupported content type: {0}")]
    UnsupportedContent(String),
    /// Transient network or server failure, retryable
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl FetchError {
    /// Whether the failure taxonomy permits a retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A fetched page body with its final URL after redirects
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: Url,
    pub body: Vec<u8>,
    pub content_type: String,
    /// True when the body hit the cap and was truncated
    pub truncated: bool,
}

/// Build the crawler HTTP client (no automatic redirects: every hop is
/// re-validated here)
pub fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(FETCH_TIMEOUT)
        .build()
}

/// Fetch one page with redirect re-validation and retry taxonomy applied
pub async fn fetch_page(client: &Client, url: &str) -> Result<FetchedPage, FetchError> {
    // SSRF rejection happens before any network I/O and is final
    let validated = validate_url(url)?;

    let mut attempt = 0;
    loop {
        match fetch_following_redirects(client, validated.clone()).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                let backoff = Duration::from_secs(1 << attempt);
                debug!(%url, error = %e, ?backoff, "transient fetch failure, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn fetch_following_redirects(client: &Client, start: Url) -> Result<FetchedPage, FetchError> {
    let mut url = start;

    for _ in 0..=MAX_REDIRECTS {
        check_resolved_host(&url).await?;

        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(FetchError::BadRedirect)?;
            let next = url.join(location).map_err(|_| FetchError::BadRedirect)?;
            // Each hop must independently pass the SSRF policy
            url = validate_url(next.as_str())?;
            continue;
        }

        if status.is_server_error() {
            return Err(FetchError::Transient(format!("HTTP {status}")));
        }
        if status == StatusCode::FORBIDDEN || status == StatusCode::GONE {
            return Err(FetchError::Refused(status));
        }
        if !status.is_success() {
            return Err(FetchError::Refused(status));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        if !is_indexable_content_type(&content_type) {
            return Err(FetchError::UnsupportedContent(content_type));
        }

        let (body, truncated) = read_capped(response).await?;
        return Ok(FetchedPage {
            final_url: url,
            body,
            content_type,
            truncated,
        });
    }

    Err(FetchError::TooManyRedirects)
}

/// Resolve the host and reject URLs whose DNS answers land in blocked
/// ranges (DNS-rebinding defense for the initial resolution)
async fn check_resolved_host(url: &Url) -> Result<(), FetchError> {
    let Some(host) = url.host_str() else {
        return Ok(());
    };
    // IP literals were already checked by validate_url
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| FetchError::Transient(format!("dns: {e}")))?;
    for addr in addrs {
        validate_resolved_ip(&addr.ip())?;
    }
    Ok(())
}

fn is_indexable_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    matches!(
        essence.as_str(),
        "text/html" | "text/plain" | "application/xhtml+xml" | "text/markdown"
    )
}

/// Stream the body, cutting off cleanly at [`MAX_BODY_BYTES`]
async fn read_capped(response: reqwest::Response) -> Result<(Vec<u8>, bool), FetchError> {
    if let Some(len) = response.content_length() {
        if len as usize > MAX_BODY_BYTES {
            warn!(len, "declared body over cap, truncating stream");
        }
    }

    let mut body = Vec::new();
    let mut truncated = false;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Transient(e.to_string()))?;
        let remaining = MAX_BODY_BYTES - body.len();
        if chunk.len() >= remaining {
            body.extend_from_slice(&chunk[..remaining]);
            truncated = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }

    Ok((body, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssrf_rejected_before_io() {
        // A blocked URL must fail validation synchronously; the error is
        // the non-retryable SSRF kind.
        let err = validate_url("http://169.254.169.254/metadata").unwrap_err();
        let fetch_err = FetchError::from(err);
        assert!(!fetch_err.is_transient());
    }

    #[test]
    fn test_content_type_whitelist() {
        assert!(is_indexable_content_type("text/html; charset=utf-8"));
        assert!(is_indexable_content_type("TEXT/PLAIN"));
        assert!(!is_indexable_content_type("application/pdf"));
        assert!(!is_indexable_content_type("image/png"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Transient("reset".into()).is_transient());
        assert!(!FetchError::Refused(StatusCode::FORBIDDEN).is_transient());
        assert!(!FetchError::TooManyRedirects.is_transient());
    }
}
