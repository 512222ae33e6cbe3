//! HTTP-01 challenge passthrough.
//!
//! Tokens written by the issuer into `<base_dir>/.acme-challenges` are answered
//! here on every host, before any site routing happens.

use axum::{
    extract::{Path, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};

use crate::error::AppError;
use crate::state::AppState;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// A token is a single path segment; anything that could walk directories is refused.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty() && !token.contains(['/', '\\', '\0']) && !token.contains("..")
}

pub async fn challenge(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    if !is_valid_token(&token) {
        return Err(AppError::Forbidden(token));
    }

    let path = state.challenge_dir.join(&token);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| AppError::FileNotFound(format!("{}{}", ACME_CHALLENGE_PREFIX, token)))?;

    tracing::debug!(token = %token, "Served ACME challenge token");
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], content).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validation() {
        assert!(is_valid_token("abc-DEF_123"));
        assert!(!is_valid_token(""));
        assert!(!is_valid_token(".."));
        assert!(!is_valid_token("../websites.json"));
        assert!(!is_valid_token("a/b"));
        assert!(!is_valid_token("a\\b"));
    }
}
