//! Cache key scheme.
//!
//! Keys follow `namespace:id:variant` (e.g. `github:octocat:dark`). The namespace
//! is the key's group, which is what bulk invalidation operates on.
use std::fmt;

use regex::Regex;

use crate::services::cache::client::{CacheError, CacheResult};

pub const DELIMITER: char = ':';

/// Structured form of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyScheme {
    namespace: String,
    id: Option<String>,
    variant: Option<String>,
}

impl KeyScheme {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: Some(id.into()),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Split a raw key on the first two delimiters. Anything after the second
    /// delimiter (including further delimiters) is the variant.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(3, DELIMITER);
        Self {
            namespace: parts.next().unwrap_or_default().to_string(),
            id: parts.next().map(str::to_string),
            variant: parts.next().map(str::to_string),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Group used for bulk invalidation.
    pub fn group(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespace)?;
        if let Some(id) = &self.id {
            write!(f, "{DELIMITER}{id}")?;
        }
        if let Some(variant) = &self.variant {
            write!(f, "{DELIMITER}{variant}")?;
        }
        Ok(())
    }
}

/// Matcher for `delete_by_pattern`.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Substring(String),
    Regex(Regex),
}

impl KeyPattern {
    pub fn substring(pattern: impl Into<String>) -> Self {
        KeyPattern::Substring(pattern.into())
    }

    pub fn regex(pattern: &str) -> CacheResult<Self> {
        Regex::new(pattern)
            .map(KeyPattern::Regex)
            .map_err(|e| CacheError::InvalidPattern(e.to_string()))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Substring(needle) => key.contains(needle.as_str()),
            KeyPattern::Regex(re) => re.is_match(key),
        }
    }
}
