//! Request authentication and principal resolution.
//!
//! A thin collaborator of the HTTP surface: resolves the `Authorization`
//! bearer token to a principal through the configured token map, enforces
//! the allow-list, and honors the `X-End-User` delegation header for
//! trusted services (the delegated value replaces the token's principal as
//! the effective uploader). With auth disabled every request runs as
//! `anonymous`, which keeps local development and tests friction-free.

use axum::http::HeaderMap;

use crate::config::AuthConfig;
use crate::error::{RagError, Result};

/// Header a trusted service uses to act on behalf of an end user.
pub const END_USER_HEADER: &str = "x-end-user";

/// The resolved caller identity.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Effective principal recorded as `uploaded_by`.
    pub user: String,
}

/// Authenticate a request from its headers.
pub fn authenticate(config: &AuthConfig, headers: &HeaderMap) -> Result<AuthContext> {
    if !config.enabled {
        return Ok(AuthContext {
            user: "anonymous".to_string(),
        });
    }

    let token = bearer_token(headers)
        .ok_or_else(|| RagError::Unauthorized("missing bearer token".to_string()))?;

    let principal = config
        .tokens
        .get(token)
        .cloned()
        .ok_or_else(|| RagError::Unauthorized("invalid bearer token".to_string()))?;

    // Trusted services may delegate: the header value becomes the
    // effective user. For everyone else the header is ignored.
    let effective = match headers.get(END_USER_HEADER).and_then(|v| v.to_str().ok()) {
        Some(delegated)
            if !delegated.is_empty() && config.trusted_services.contains(&principal) =>
        {
            delegated.to_string()
        }
        _ => principal,
    };

    if !config.allowed_users.is_empty() && !config.allowed_users.contains(&effective) {
        return Err(RagError::Forbidden(format!(
            "User {} is not authorized to access this API",
            effective
        )));
    }

    Ok(AuthContext { user: effective })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
