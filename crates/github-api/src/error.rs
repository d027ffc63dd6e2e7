use reqwest::StatusCode;

use crate::types::ErrorBody;

pub const ACCOUNT_SUSPENDED_MESSAGE: &str = "Sorry. Your account was suspended.";
pub const REPOSITORY_BLOCKED_MESSAGE: &str = "Repository access blocked";
pub const BAD_CREDENTIALS_MESSAGE: &str = "Bad credentials";

#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unprocessable request: {0}")]
    Client(String),
    #[error("account suspended")]
    AccountSuspended,
    #[error("repository access blocked")]
    RepositoryBlocked,
    #[error("bad credentials")]
    BadCredentials,
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("rate limit retries failed")]
    RateLimitRetriesExhausted,
    #[error("an impersonated instance can't create impersonation tokens")]
    InvalidImpersonation,
    #[error("at least one GitHub token must be provided")]
    NoToken,
    #[error("GitHub answered {status}: {message}")]
    Http { status: StatusCode, message: String },
    #[error("HTTP request failed")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response body")]
    Decode(#[source] serde_json::Error),
}

impl GithubError {
    /// Classifies a non-2xx response.
    ///
    /// Status codes take precedence over the message, then well-known messages are matched
    /// exactly, except for rate limiting which GitHub words in several ways.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_default();

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Self::Client(message);
        }

        if status == StatusCode::NOT_FOUND {
            return Self::NotFound(message);
        }

        match message.as_str() {
            ACCOUNT_SUSPENDED_MESSAGE => Self::AccountSuspended,
            REPOSITORY_BLOCKED_MESSAGE => Self::RepositoryBlocked,
            BAD_CREDENTIALS_MESSAGE => Self::BadCredentials,
            _ if message.contains("rate limit") => Self::RateLimit(message),
            _ => Self::Http { status, message },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
