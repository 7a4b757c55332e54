//! Tokenizers — a closed whitelist, never built from user strings
//!
//! Any configuration value outside this enum is a startup error. The
//! same tokenizer must be used for indexing and querying or postings
//! will not line up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed tokenizer whitelist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Tokenizer {
    /// Unicode alphanumeric word splitting, lowercased (default)
    #[default]
    Unicode61,
    /// ASCII-only words; non-ASCII is a separator
    Ascii,
    /// Unicode words passed through a light English stemmer
    Porter,
    /// Character trigrams, for substring-ish matching
    Trigram,
}

impl Tokenizer {
    pub const ALL: [Tokenizer; 4] = [
        Tokenizer::Unicode61,
        Tokenizer::Ascii,
        Tokenizer::Porter,
        Tokenizer::Trigram,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Unicode61 => "unicode61",
            Self::Ascii => "ascii",
            Self::Porter => "porter",
            Self::Trigram => "trigram",
        }
    }

    /// Tokenize text for indexing or querying
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        match self {
            Self::Unicode61 => unicode_words(text),
            Self::Ascii => text
                .to_lowercase()
                .split(|c: char| !c.is_ascii_alphanumeric())
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect(),
            Self::Porter => unicode_words(text).into_iter().map(|w| stem(&w)).collect(),
            Self::Trigram => trigrams(text),
        }
    }
}

impl FromStr for Tokenizer {
    type Err = UnknownTokenizer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unicode61" => Ok(Self::Unicode61),
            "ascii" => Ok(Self::Ascii),
            "porter" => Ok(Self::Porter),
            "trigram" => Ok(Self::Trigram),
            other => Err(UnknownTokenizer(other.to_string())),
        }
    }
}

impl fmt::Display for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Startup error for configuration values outside the whitelist
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown tokenizer '{0}'; allowed: unicode61, ascii, porter, trigram")]
pub struct UnknownTokenizer(pub String);

fn unicode_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn trigrams(text: &str) -> Vec<String> {
    let chars: Vec<char> = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();
    if chars.len() < 3 {
        return if chars.is_empty() {
            Vec::new()
        } else {
            vec![chars.into_iter().collect()]
        };
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

/// First-pass Porter suffix stripping — enough to conflate common
/// English inflections without a full stemmer
fn stem(word: &str) -> String {
    let w = word;
    if w.len() <= 3 {
        return w.to_string();
    }
    for (suffix, replacement) in [
        ("sses", "ss"),
        ("ies", "i"),
        ("ing", ""),
        ("edly", ""),
        ("ed", ""),
        ("ly", ""),
        ("s", ""),
    ] {
        if let Some(stripped) = w.strip_suffix(suffix) {
            if stripped.len() >= 3 && (w.len() - suffix.len()) + replacement.len() >= 3 {
                return format!("{stripped}{replacement}");
            }
        }
    }
    w.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unicode61_basic() {
        assert_eq!(
            Tokenizer::Unicode61.tokenize("The quick-brown Fox!"),
            vec!["the", "quick", "brown", "fox"]
        );
    }

    #[test]
    fn test_ascii_drops_non_ascii() {
        assert_eq!(
            Tokenizer::Ascii.tokenize("caffè latte"),
            vec!["caff", "latte"]
        );
    }

    #[test]
    fn test_porter_conflates_inflections() {
        let tokens = Tokenizer::Porter.tokenize("running jumped quickly");
        assert_eq!(tokens, vec!["runn", "jump", "quick"]);
    }

    #[test]
    fn test_trigram() {
        assert_eq!(Tokenizer::Trigram.tokenize("rust"), vec!["rus", "ust"]);
        assert_eq!(Tokenizer::Trigram.tokenize("ab"), vec!["ab"]);
        assert!(Tokenizer::Trigram.tokenize("").is_empty());
    }

    #[test]
    fn test_whitelist_parsing() {
        assert_eq!("unicode61".parse::<Tokenizer>(), Ok(Tokenizer::Unicode61));
        assert_eq!("porter".parse::<Tokenizer>(), Ok(Tokenizer::Porter));
        assert!("fts5_custom".parse::<Tokenizer>().is_err());
        assert!("Unicode61".parse::<Tokenizer>().is_err());
    }
}
