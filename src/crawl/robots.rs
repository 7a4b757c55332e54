//! robots.txt fetching, parsing, and caching
//!
//! Policy is conservative: a missing or unparseable robots.txt denies
//! crawling for that origin. Parsed policies are cached for 24 hours.
//! `Crawl-delay` is honored up to 60 seconds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// Our user-agent token in robots.txt group headers
pub const USER_AGENT_TOKEN: &str = "meshseek";
/// Cache lifetime for a fetched policy
pub const ROBOTS_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
/// Longest honored crawl delay
pub const MAX_CRAWL_DELAY_SECS: u64 = 60;
/// Size cap on a robots.txt body
const MAX_ROBOTS_BYTES: usize = 512 * 1024;

/// One user-agent group's rules
#[derive(Debug, Clone, Default)]
struct RuleGroup {
    disallow: Vec<String>,
    allow: Vec<String>,
    crawl_delay: Option<u64>,
}

/// Parsed robots policy for one origin
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    specific: Option<RuleGroup>,
    wildcard: Option<RuleGroup>,
}

impl RobotsPolicy {
    /// Parse a robots.txt body. Unknown directives are skipped; a body
    /// that yields no groups at all parses to an empty policy that
    /// allows everything (an *empty file* is an explicit everything-goes).
    pub fn parse(body: &str) -> Self {
        let mut specific: Option<RuleGroup> = None;
        let mut wildcard: Option<RuleGroup> = None;
        let mut in_specific = false;
        let mut in_wildcard = false;
        let mut group_open = false;

        for raw_line in body.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    let token = value.to_ascii_lowercase();
                    // A new group header after rules starts a new group
                    if group_open {
                        in_specific = false;
                        in_wildcard = false;
                        group_open = false;
                    }
                    if token == "*" {
                        in_wildcard = true;
                        wildcard.get_or_insert_with(RuleGroup::default);
                    } else if token.contains(USER_AGENT_TOKEN) {
                        in_specific = true;
                        specific.get_or_insert_with(RuleGroup::default);
                    }
                }
                "disallow" | "allow" | "crawl-delay" => {
                    group_open = true;
                    let mut targets: Vec<&mut RuleGroup> = Vec::new();
                    if in_specific {
                        if let Some(g) = specific.as_mut() {
                            targets.push(g);
                        }
                    }
                    if in_wildcard {
                        if let Some(g) = wildcard.as_mut() {
                            targets.push(g);
                        }
                    }
                    for group in targets {
                        match field.as_str() {
                            "disallow" => {
                                if !value.is_empty() {
                                    group.disallow.push(value.to_string());
                                }
                            }
                            "allow" => group.allow.push(value.to_string()),
                            _ => {
                                if let Ok(secs) = value.parse::<f64>() {
                                    group.crawl_delay = Some(secs.ceil() as u64);
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Self { specific, wildcard }
    }

    fn group(&self) -> Option<&RuleGroup> {
        self.specific.as_ref().or(self.wildcard.as_ref())
    }

    /// Whether this policy allows fetching `path`
    pub fn allows(&self, path: &str) -> bool {
        let Some(group) = self.group() else {
            // No applicable group: nothing is disallowed
            return true;
        };

        // Longest-match wins; allow beats disallow on equal length
        let best_allow = group
            .allow
            .iter()
            .filter(|rule| path.starts_with(rule.as_str()))
            .map(|rule| rule.len())
            .max();
        let best_disallow = group
            .disallow
            .iter()
            .filter(|rule| path.starts_with(rule.as_str()))
            .map(|rule| rule.len())
            .max();

        match (best_allow, best_disallow) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(d)) => a >= d,
        }
    }

    /// The crawl delay to respect, clamped to [`MAX_CRAWL_DELAY_SECS`]
    pub fn crawl_delay_secs(&self) -> Option<u64> {
        self.group()
            .and_then(|g| g.crawl_delay)
            .map(|d| d.min(MAX_CRAWL_DELAY_SECS))
    }
}

/// Verdict for one URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotsVerdict {
    Allowed { crawl_delay_secs: Option<u64> },
    Denied,
}

enum CacheEntry {
    Policy(RobotsPolicy),
    /// Fetch failed or body unparseable: deny until TTL expires
    Deny,
}

/// Per-origin robots cache
pub struct RobotsCache {
    client: reqwest::Client,
    entries: Mutex<HashMap<String, (Instant, CacheEntry)>>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether `url` may be crawled, fetching and caching the
    /// origin's robots.txt as needed.
    pub async fn check(&self, url: &Url) -> RobotsVerdict {
        let origin = url.origin().ascii_serialization();
        let path = url.path().to_string();

        {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((fetched_at, entry)) = entries.get(&origin) {
                if fetched_at.elapsed() < ROBOTS_CACHE_TTL {
                    return Self::verdict(entry, &path);
                }
            }
        }

        let entry = self.fetch_policy(&origin).await;
        let verdict = Self::verdict(&entry, &path);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(origin, (Instant::now(), entry));
        verdict
    }

    fn verdict(entry: &CacheEntry, path: &str) -> RobotsVerdict {
        match entry {
            CacheEntry::Policy(policy) => {
                if policy.allows(path) {
                    RobotsVerdict::Allowed {
                        crawl_delay_secs: policy.crawl_delay_secs(),
                    }
                } else {
                    RobotsVerdict::Denied
                }
            }
            CacheEntry::Deny => RobotsVerdict::Denied,
        }
    }

    async fn fetch_policy(&self, origin: &str) -> CacheEntry {
        let robots_url = format!("{origin}/robots.txt");
        let response = match self.client.get(&robots_url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(%robots_url, error = %e, "robots fetch failed, denying origin");
                return CacheEntry::Deny;
            }
        };

        if !response.status().is_success() {
            debug!(%robots_url, status = %response.status(), "robots absent, denying origin");
            return CacheEntry::Deny;
        }

        match response.text().await {
            Ok(body) if body.len() <= MAX_ROBOTS_BYTES => {
                CacheEntry::Policy(RobotsPolicy::parse(&body))
            }
            _ => CacheEntry::Deny,
        }
    }
}
