//! SSRF guard — URL validation for every outbound HTTP fetch
//!
//! Blocks fetches that would reach internal network resources: bad
//! schemes, loopback, RFC1918, link-local, IPv6 unique-local, cloud
//! metadata endpoints. Applied to the initial URL and re-applied to
//! every redirect hop. A rejected URL is never retried.

use std::net::IpAddr;
use thiserror::Error;
use url::{Host, Url};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SsrfError {
    #[error("Scheme '{0}' is not http or https")]
    BadScheme(String),
    #[error("URL has no host")]
    NoHost,
    #[error("Hostname '{0}' is blocked")]
    BlockedHost(String),
    #[error("IP address {0} is in a private or reserved range")]
    BlockedIp(IpAddr),
    #[error("URL does not parse: {0}")]
    Unparseable(String),
}

/// Cloud metadata endpoints blocked by name
const BLOCKED_HOSTNAMES: &[&str] = &["metadata.google.internal", "169.254.169.254"];

fn is_blocked_hostname(host: &str) -> bool {
    let lower = host.to_ascii_lowercase();
    if BLOCKED_HOSTNAMES.contains(&lower.as_str()) {
        return true;
    }
    lower == "localhost"
        || lower.ends_with(".local")
        || lower.ends_with(".internal")
        || lower.ends_with(".intranet")
}

fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_multicast()
                || octets[0] == 0
                // Benchmark range 198.18.0.0/15 and reserved 240/4
                || (octets[0] == 198 && (octets[1] == 18 || octets[1] == 19))
                || octets[0] >= 240
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // Unique-local fc00::/7
                || (segments[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Validate a URL against the SSRF policy.
///
/// Hostname checks are static; when the host is an IP literal the IP is
/// checked directly. DNS-resolved IPs are re-checked by the fetcher for
/// every connection it actually opens.
pub fn validate_url(raw: &str) -> Result<Url, SsrfError> {
    let url = Url::parse(raw).map_err(|e| SsrfError::Unparseable(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(SsrfError::BadScheme(other.to_string())),
    }

    match url.host() {
        None => Err(SsrfError::NoHost),
        Some(Host::Domain(domain)) => {
            if is_blocked_hostname(domain) {
                Err(SsrfError::BlockedHost(domain.to_string()))
            } else {
                Ok(url)
            }
        }
        Some(Host::Ipv4(ip)) => {
            let ip = IpAddr::V4(ip);
            if is_blocked_ip(&ip) {
                Err(SsrfError::BlockedIp(ip))
            } else {
                Ok(url)
            }
        }
        Some(Host::Ipv6(ip)) => {
            let ip = IpAddr::V6(ip);
            if is_blocked_ip(&ip) {
                Err(SsrfError::BlockedIp(ip))
            } else {
                Ok(url)
            }
        }
    }
}

/// Validate a resolved socket address before connecting
pub fn validate_resolved_ip(ip: &IpAddr) -> Result<(), SsrfError> {
    if is_blocked_ip(ip) {
        Err(SsrfError::BlockedIp(*ip))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_url_passes() {
        assert!(validate_url("https://example.org/page").is_ok());
        assert!(validate_url("http://93.184.216.34/").is_ok());
    }

    #[test]
    fn test_bad_schemes_rejected() {
        assert!(matches!(
            validate_url("file:///etc/passwd"),
            Err(SsrfError::BadScheme(_))
        ));
        assert!(matches!(
            validate_url("gopher://example.org"),
            Err(SsrfError::BadScheme(_))
        ));
    }

    #[test]
    fn test_metadata_endpoint_rejected() {
        assert!(matches!(
            validate_url("http://169.254.169.254/metadata"),
            Err(SsrfError::BlockedIp(_))
        ));
        assert!(matches!(
            validate_url("http://metadata.google.internal/x"),
            Err(SsrfError::BlockedHost(_))
        ));
    }

    #[test]
    fn test_private_ranges_rejected() {
        for url in [
            "http://127.0.0.1/",
            "http://10.0.0.5/",
            "http://172.16.1.1/",
            "http://192.168.1.1/",
            "http://0.0.0.0/",
            "http://198.18.0.1/",
            "http://[::1]/",
            "http://[fc00::1]/",
            "http://[fe80::1]/",
        ] {
            assert!(
                matches!(validate_url(url), Err(SsrfError::BlockedIp(_))),
                "expected rejection for {url}"
            );
        }
    }

    #[test]
    fn test_internal_hostnames_rejected() {
        for url in [
            "http://localhost/",
            "http://printer.local/",
            "http://service.internal/x",
        ] {
            assert!(
                matches!(validate_url(url), Err(SsrfError::BlockedHost(_))),
                "expected rejection for {url}"
            );
        }
    }

    #[test]
    fn test_resolved_ip_check() {
        assert!(validate_resolved_ip(&"93.184.216.34".parse().unwrap()).is_ok());
        assert!(validate_resolved_ip(&"10.1.2.3".parse().unwrap()).is_err());
        assert!(validate_resolved_ip(&"fe80::1".parse().unwrap()).is_err());
    }
}
