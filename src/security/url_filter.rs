//! Allow/deny filtering of outbound URLs.
//!
//! Applied to `downloadFrom` entries and webhook targets before any network call.

use regex::Regex;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("'{0}' is not a valid URL")]
    Invalid(String),
    #[error("'{0}' is not an HTTP(S) URL")]
    Scheme(String),
    #[error("'{0}' does not match the allow list")]
    NotAllowed(String),
    #[error("'{0}' matches the deny list")]
    Denied(String),
}

/// A pair of optional regexes. An empty pattern disables its side.
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    allow: Option<Regex>,
    deny: Option<Regex>,
}

impl UrlFilter {
    pub fn new(allow: &str, deny: &str) -> Result<Self, regex::Error> {
        let compile = |pattern: &str| -> Result<Option<Regex>, regex::Error> {
            if pattern.is_empty() {
                Ok(None)
            } else {
                Regex::new(pattern).map(Some)
            }
        };

        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    pub fn check(&self, raw: &str) -> Result<Url, FilterError> {
        let url = Url::parse(raw).map_err(|_| FilterError::Invalid(raw.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FilterError::Scheme(raw.to_string()));
        }

        if let Some(allow) = &self.allow {
            if !allow.is_match(raw) {
                return Err(FilterError::NotAllowed(raw.to_string()));
            }
        }

        if let Some(deny) = &self.deny {
            if deny.is_match(raw) {
                return Err(FilterError::Denied(raw.to_string()));
            }
        }

        Ok(url)
    }
}
