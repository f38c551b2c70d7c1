//! Secret handling.
//!
//! - `ApiKey`: wrapper that prevents accidental logging
//! - `scrub_secrets`: redact secrets from text before it is logged or sent out

use secrecy::{ExposeSecret, SecretBox};

/// Environment variable consulted for the LLM API key.
pub const API_KEY_ENV: &str = "WAYPOINT_LLM_API_KEY";

/// API key wrapper that prevents accidental logging.
#[derive(Clone)]
pub struct ApiKey(SecretBox<str>);

impl ApiKey {
    /// Create a new API key.
    #[must_use]
    pub fn new(key: String) -> Self {
        Self(SecretBox::new(key.into_boxed_str()))
    }

    /// Resolve a key from the environment, falling back to a configured value.
    #[must_use]
    pub fn resolve(configured: Option<&str>) -> Option<Self> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| configured.map(ToString::to_string))
            .map(Self::new)
    }

    /// Expose the secret for actual API calls.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Common secret patterns to scrub from error text.
pub const COMMON_SECRET_PATTERNS: &[&str] = &[
    "api_key=",
    "apikey=",
    "token=",
    "secret=",
    "password=",
    "Authorization: Bearer ",
    "x-api-key: ",
];

/// Replace the value following each pattern with `[REDACTED]`.
#[must_use]
pub fn scrub_secrets(text: &str, patterns: &[&str]) -> String {
    let mut result = text.to_string();

    for pattern in patterns {
        let mut search_start = 0;
        while let Some(found) = result[search_start..].find(pattern) {
            let value_start = search_start + found + pattern.len();
            let value_end = result[value_start..]
                .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '&' | ','))
                .map_or(result.len(), |e| value_start + e);

            result.replace_range(value_start..value_end, "[REDACTED]");
            search_start = value_start + "[REDACTED]".len();
        }
    }

    result
}
