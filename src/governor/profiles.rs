//! Resource profiles
//!
//! A profile sets the hard caps the governor and load guard enforce:
//! crawl concurrency, bandwidth token rates, fan-out breadth, and LLM
//! participation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four operating profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Profile {
    /// Laptop-friendly: minimal background work
    Minimal,
    /// Sensible defaults for a desktop
    #[default]
    Balanced,
    /// Always-on machine donating real capacity
    Contributor,
    /// Dedicated server
    Dedicated,
}

/// Concrete caps derived from a profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileLimits {
    pub max_concurrent_crawls: usize,
    /// Upload token rate, bits per second
    pub upload_bps: u64,
    /// Download token rate, bits per second
    pub download_bps: u64,
    /// Remote responders queried per keyword
    pub search_fanout: usize,
    pub llm_enabled: bool,
    /// Queries per minute admitted per caller
    pub qpm_limit: u32,
    /// Concurrent queries admitted
    pub max_concurrent_queries: usize,
}

impl Profile {
    pub fn limits(&self) -> ProfileLimits {
        match self {
            Self::Minimal => ProfileLimits {
                max_concurrent_crawls: 1,
                upload_bps: 1_000_000,
                download_bps: 2_000_000,
                search_fanout: 2,
                llm_enabled: false,
                qpm_limit: 30,
                max_concurrent_queries: 4,
            },
            Self::Balanced => ProfileLimits {
                max_concurrent_crawls: 5,
                upload_bps: 5_000_000,
                download_bps: 10_000_000,
                search_fanout: 3,
                llm_enabled: false,
                qpm_limit: 60,
                max_concurrent_queries: 8,
            },
            Self::Contributor => ProfileLimits {
                max_concurrent_crawls: 10,
                upload_bps: 20_000_000,
                download_bps: 50_000_000,
                search_fanout: 4,
                llm_enabled: true,
                qpm_limit: 120,
                max_concurrent_queries: 16,
            },
            Self::Dedicated => ProfileLimits {
                max_concurrent_crawls: 20,
                upload_bps: 100_000_000,
                download_bps: 200_000_000,
                search_fanout: 5,
                llm_enabled: true,
                qpm_limit: 300,
                max_concurrent_queries: 32,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Balanced => "balanced",
            Self::Contributor => "contributor",
            Self::Dedicated => "dedicated",
        }
    }
}

impl FromStr for Profile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(Self::Minimal),
            "balanced" => Ok(Self::Balanced),
            "contributor" => Ok(Self::Contributor),
            "dedicated" => Ok(Self::Dedicated),
            other => Err(UnknownProfile(other.to_string())),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Startup error for profile names outside the whitelist
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown profile '{0}'; allowed: minimal, balanced, contributor, dedicated")]
pub struct UnknownProfile(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_scale_up() {
        let minimal = Profile::Minimal.limits();
        let dedicated = Profile::Dedicated.limits();
        assert!(minimal.max_concurrent_crawls < dedicated.max_concurrent_crawls);
        assert!(minimal.upload_bps < dedicated.upload_bps);
        assert!(minimal.search_fanout < dedicated.search_fanout);
    }

    #[test]
    fn test_balanced_matches_authoritative_defaults() {
        let limits = Profile::Balanced.limits();
        assert_eq!(limits.max_concurrent_crawls, 5);
        assert_eq!(limits.upload_bps, 5_000_000);
        assert_eq!(limits.download_bps, 10_000_000);
        assert_eq!(limits.search_fanout, 3);
    }

    #[test]
    fn test_parse_whitelist() {
        assert_eq!("balanced".parse::<Profile>(), Ok(Profile::Balanced));
        assert!("turbo".parse::<Profile>().is_err());
    }
}
