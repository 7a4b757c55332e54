//! URL canonicalization — the first dedup layer
//!
//! Two URLs that canonicalize to the same string are the same page:
//! - lowercase scheme and host, default ports stripped
//! - fragments removed
//! - known tracking parameters dropped, remaining query sorted
//! - dot-segments collapsed, trailing slash trimmed (except root)
//! - a same-origin `<link rel="canonical">` wins when present
//!
//! Canonicalization is idempotent: applying it twice equals once.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

/// Maximum accepted URL length
pub const MAX_URL_LEN: usize = 4096;

/// Tracking parameters stripped during canonicalization
static TRACKING_PARAMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "utm_source",
        "utm_medium",
        "utm_campaign",
        "utm_term",
        "utm_content",
        "gclid",
        "fbclid",
        "msclkid",
    ]
    .into_iter()
    .collect()
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanonicalError {
    #[error("URL exceeds {MAX_URL_LEN} bytes")]
    TooLong,
    #[error("URL does not parse: {0}")]
    Unparseable(String),
    #[error("URL scheme must be http or https")]
    BadScheme,
    #[error("URL has no host")]
    NoHost,
}

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("utm_") || TRACKING_PARAMS.contains(lower.as_str())
}

/// Canonicalize a URL string
pub fn canonicalize(raw: &str) -> Result<String, CanonicalError> {
    if raw.len() > MAX_URL_LEN {
        return Err(CanonicalError::TooLong);
    }

    // Url::parse lowercases scheme and host, resolves dot-segments,
    // and drops default ports.
    let mut url = Url::parse(raw.trim()).map_err(|e| CanonicalError::Unparseable(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CanonicalError::BadScheme);
    }
    if url.host_str().is_none() {
        return Err(CanonicalError::NoHost);
    }

    url.set_fragment(None);

    // Strip tracking params, sort the rest for a stable ordering
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    if params.is_empty() {
        url.set_query(None);
    } else {
        let query = params
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }

    // Trim trailing slash except for the root path
    let path = url.path().to_string();
    if path != "/" && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Ok(url.to_string())
}

/// Apply a page's `<link rel="canonical">` hint.
///
/// The hint is honored only when it parses, canonicalizes, and points at
/// the same origin as the fetched URL; anything else keeps the fetched
/// canonical form (cross-origin hints are an abuse channel).
pub fn apply_rel_canonical(fetched_canonical: &str, hint: &str) -> String {
    let Ok(hinted) = canonicalize(hint) else {
        return fetched_canonical.to_string();
    };
    let (Ok(a), Ok(b)) = (Url::parse(fetched_canonical), Url::parse(&hinted)) else {
        return fetched_canonical.to_string();
    };
    if a.origin() == b.origin() {
        hinted
    } else {
        fetched_canonical.to_string()
    }
}

/// The origin (scheme://host:port) a URL belongs to, for politeness
pub fn origin_of(canonical_url: &str) -> Option<String> {
    Url::parse(canonical_url)
        .ok()
        .map(|u| u.origin().ascii_serialization())
}
