/// Errors surfaced by the session service and its storage backends.
///
/// Tokens are never embedded in full; variants carry the short preview
/// produced by [`token_preview`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("duplicate session token: {0}")]
    DuplicateToken(String),

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session recovery failed: {0}")]
    Recovery(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    pub(crate) fn not_found(token: &str) -> Self {
        Self::NotFound(token_preview(token).to_string())
    }

    pub(crate) fn duplicate(token: &str) -> Self {
        Self::DuplicateToken(token_preview(token).to_string())
    }

    /// Whether this error means the session is gone (unknown, evicted or deleted).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// First 8 characters of a token, safe to put in logs.
pub fn token_preview(token: &str) -> &str {
    match token.char_indices().nth(8) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}
