//! Key matching for pattern sweeps (`get_matching`)

use regex::Regex;

use crate::error::{Error, Result};

/// Caller-defined predicate over keys
pub trait KeyMatcher<K>: Send + Sync {
    /// True if the key is selected
    fn matches(&self, key: &K) -> bool;
}

impl<K, F> KeyMatcher<K> for F
where
    F: Fn(&K) -> bool + Send + Sync,
{
    fn matches(&self, key: &K) -> bool {
        self(key)
    }
}

/// Regex over the key's `Display` form
#[derive(Debug, Clone)]
pub struct RegexKeyMatcher {
    pattern: Regex,
}

impl RegexKeyMatcher {
    /// Compile a pattern. An invalid pattern is a configuration error.
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid key pattern '{}': {}", pattern, e)))?;
        Ok(Self { pattern })
    }

    /// The source pattern
    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

impl<K: std::fmt::Display> KeyMatcher<K> for RegexKeyMatcher {
    fn matches(&self, key: &K) -> bool {
        self.pattern.is_match(&key.to_string())
    }
}
