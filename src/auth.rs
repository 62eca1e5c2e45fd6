//! Credential seam for the transcription service.
//!
//! The connection manager consumes a token; it never stores or validates
//! one. Where the token comes from (OS keychain, settings file, env var)
//! is the host application's concern, expressed through [`TokenProvider`].

use std::fmt;

/// Errors from a token lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// No token has been stored under the expected key
    KeyNotFound,
    /// The backing store could not be reached
    Unavailable(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::KeyNotFound => write!(f, "no API token configured"),
            TokenError::Unavailable(e) => write!(f, "credential store unavailable: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

/// Source of the authentication token used to open the streaming connection.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<String, TokenError>;
}

/// Reads the token from an environment variable.
///
/// Empty values are treated as absent.
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new("DEEPGRAM_API_KEY")
    }
}

impl TokenProvider for EnvTokenProvider {
    fn token(&self) -> Result<String, TokenError> {
        std::env::var(&self.var)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or(TokenError::KeyNotFound)
    }
}

/// Fixed token, used by tests and by hosts that manage credentials
/// themselves.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Result<String, TokenError> {
        if self.token.is_empty() {
            Err(TokenError::KeyNotFound)
        } else {
            Ok(self.token.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_provider_returns_token() {
        let provider = StaticTokenProvider::new("tok_123");
        assert_eq!(provider.token().unwrap(), "tok_123");
    }

    #[test]
    fn test_static_provider_empty_is_not_found() {
        let provider = StaticTokenProvider::new("");
        assert_eq!(provider.token().unwrap_err(), TokenError::KeyNotFound);
    }

    #[test]
    fn test_env_provider_missing_var() {
        let provider = EnvTokenProvider::new("VOXSTREAM_TEST_TOKEN_THAT_IS_NOT_SET");
        assert_eq!(provider.token().unwrap_err(), TokenError::KeyNotFound);
    }

    #[test]
    fn test_token_error_display() {
        assert!(TokenError::KeyNotFound.to_string().contains("token"));
        assert!(TokenError::Unavailable("locked".to_string())
            .to_string()
            .contains("locked"));
    }
}
