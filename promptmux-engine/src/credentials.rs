//! Credential resolution for the engine process
//!
//! The engine reads its OAuth token from the `CLAUDE_CODE_OAUTH_TOKEN`
//! environment variable. A per-session token on [`crate::SessionConfig`]
//! takes precedence; otherwise the injected provider decides.

/// Environment variable the engine reads its token from
pub const OAUTH_TOKEN_ENV: &str = "CLAUDE_CODE_OAUTH_TOKEN";

/// Source of the OAuth token injected into spawned engine processes.
pub trait Credentials: Send + Sync {
    /// Token to export, or `None` to let the engine's own resolution apply
    fn oauth_token(&self) -> Option<String>;
}

/// Resolve the token from this process's environment.
#[derive(Debug, Default)]
pub struct EnvCredentials;

impl Credentials for EnvCredentials {
    fn oauth_token(&self) -> Option<String> {
        std::env::var(OAUTH_TOKEN_ENV).ok().filter(|t| !t.is_empty())
    }
}

/// Fixed token, or explicitly none.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    /// Provide a fixed token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Provide no token; the engine falls back to its own resolution
    pub fn none() -> Self {
        Self { token: None }
    }
}

impl Credentials for StaticCredentials {
    fn oauth_token(&self) -> Option<String> {
        self.token.clone()
    }
}
