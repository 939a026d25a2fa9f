/*
 * Responsibility
 * - admin cache 操作の request/response DTO
 * - query の形式チェック用 validate()
 */
use serde::{Deserialize, Serialize};

const MAX_PATTERN_LEN: usize = 256;

#[derive(Debug, Deserialize)]
pub struct PatternQuery {
    pub pattern: String,
    // false: substring match, true: regular expression
    #[serde(default)]
    pub regex: bool,
}

impl PatternQuery {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.pattern.is_empty() {
            return Err("pattern is required");
        }
        if self.pattern.len() > MAX_PATTERN_LEN {
            return Err("pattern must be <= 256 chars");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub cleared: bool,
}

#[derive(Debug, Serialize)]
pub struct DeletedCountResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize)]
pub struct DeletedKeyResponse {
    pub key: String,
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_or_huge_patterns_are_rejected() {
        let query = |pattern: &str| PatternQuery {
            pattern: pattern.to_string(),
            regex: false,
        };

        assert!(query("github:").validate().is_ok());
        assert!(query("").validate().is_err());
        assert!(query(&"x".repeat(257)).validate().is_err());
    }
}
