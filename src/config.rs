//! Node configuration
//!
//! A fully enumerated configuration record with per-field validated
//! ranges. There is no reflective or string-driven dispatch anywhere:
//! tokenizers and profiles come from closed whitelists, and any value
//! outside its range is a startup error.

use std::path::PathBuf;
use thiserror::Error;

use crate::credits::OffPeakWindow;
use crate::governor::Profile;
use crate::index::Tokenizer;

/// Validated difficulty range for peer admission PoW
pub const MIN_POW_DIFFICULTY: u32 = 8;
pub const MAX_POW_DIFFICULTY: u32 = 32;
/// Validated fan-out range
pub const MAX_FANOUT: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("data_dir must not be empty")]
    EmptyDataDir,
    #[error("pow_difficulty {0} outside [{MIN_POW_DIFFICULTY}, {MAX_POW_DIFFICULTY}]")]
    PowDifficulty(u32),
    #[error("fanout {0} outside [1, {MAX_FANOUT}]")]
    Fanout(usize),
    #[error(transparent)]
    Tokenizer(#[from] crate::index::UnknownTokenizer),
    #[error(transparent)]
    Profile(#[from] crate::governor::UnknownProfile),
    #[error("off-peak window hours must be < 24 (got {0}–{1})")]
    OffPeakWindow(u8, u8),
    #[error("claimed UTC offset {0} outside [-12, 14]")]
    UtcOffset(i32),
}

/// The complete node configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Root of all persistent state (see the layout in `node.rs`)
    pub data_dir: PathBuf,
    /// Resource profile
    pub profile: Profile,
    /// Index tokenizer (closed whitelist)
    pub tokenizer: Tokenizer,
    /// Overlay listen port (0 = ephemeral)
    pub listen_port: u16,
    /// Bootstrap seed endpoints as multiaddrs
    pub bootstrap: Vec<String>,
    /// PoW difficulty demanded of peer identities
    pub pow_difficulty: u32,
    /// Remote responders per search
    pub fanout: usize,
    /// Off-peak window for the LLM credit multiplier
    pub off_peak: OffPeakWindow,
    /// Claimed local UTC offset, hours
    pub utc_offset_hours: i32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".meshseek"),
            profile: Profile::Balanced,
            tokenizer: Tokenizer::Unicode61,
            listen_port: 0,
            bootstrap: Vec::new(),
            pow_difficulty: 20,
            fanout: 3,
            off_peak: OffPeakWindow::default(),
            utc_offset_hours: 0,
        }
    }
}

impl MeshConfig {
    /// Range-validate every field; called once at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDataDir);
        }
        if !(MIN_POW_DIFFICULTY..=MAX_POW_DIFFICULTY).contains(&self.pow_difficulty) {
            return Err(ConfigError::PowDifficulty(self.pow_difficulty));
        }
        if self.fanout == 0 || self.fanout > MAX_FANOUT {
            return Err(ConfigError::Fanout(self.fanout));
        }
        if self.off_peak.start_hour >= 24 || self.off_peak.end_hour >= 24 {
            return Err(ConfigError::OffPeakWindow(
                self.off_peak.start_hour,
                self.off_peak.end_hour,
            ));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(ConfigError::UtcOffset(self.utc_offset_hours));
        }
        Ok(())
    }

    /// Parse whitelist-bound string fields (external adapters hand us
    /// strings; everything else is typed)
    pub fn with_tokenizer_name(mut self, name: &str) -> Result<Self, ConfigError> {
        self.tokenizer = name.parse()?;
        Ok(self)
    }

    pub fn with_profile_name(mut self, name: &str) -> Result<Self, ConfigError> {
        self.profile = name.parse()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        MeshConfig::default().validate().unwrap();
    }

    #[test]
    fn test_pow_range_enforced() {
        let mut config = MeshConfig::default();
        config.pow_difficulty = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PowDifficulty(4))
        ));
        config.pow_difficulty = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fanout_range() {
        let mut config = MeshConfig::default();
        config.fanout = 0;
        assert!(config.validate().is_err());
        config.fanout = 100;
        assert!(config.validate().is_err());
        config.fanout = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tokenizer_whitelist_is_startup_error() {
        let err = MeshConfig::default()
            .with_tokenizer_name("dynamic_fts")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Tokenizer(_)));

        let ok = MeshConfig::default().with_tokenizer_name("trigram").unwrap();
        assert_eq!(ok.tokenizer, Tokenizer::Trigram);
    }

    #[test]
    fn test_profile_whitelist() {
        assert!(MeshConfig::default().with_profile_name("contributor").is_ok());
        assert!(MeshConfig::default().with_profile_name("extreme").is_err());
    }

    #[test]
    fn test_utc_offset_range() {
        let mut config = MeshConfig::default();
        config.utc_offset_hours = 15;
        assert!(matches!(config.validate(), Err(ConfigError::UtcOffset(15))));
    }
}
