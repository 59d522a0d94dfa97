
/// Source of the access token attached to broker connections.
///
/// Consulted once per connect attempt. A token that changes mid-session is
/// picked up by the next reconnection, not by the live connection.
pub trait CredentialSource: Send + Sync {
    /// Returns the current access token, or None for an anonymous session.
    fn access_token(&self) -> Option<String>;
}

/// Fixed access token (tests, server-to-server sessions)
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CredentialSource for StaticTokenSource {
    fn access_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}

/// No credentials; connections are opened without an Authorization header
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn access_token(&self) -> Option<String> {
        None
    }
}

/// Build connection headers for an optional bearer token
///
/// Produces "Authorization: Bearer <token>" when a token is present.
/// Empty tokens are treated as absent.
pub fn auth_headers(token: Option<&str>) -> Vec<(String, String)> {
    match token {
        Some(token) if !token.is_empty() => {
            vec![("Authorization".to_string(), format!("Bearer {token}"))]
        }
        _ => Vec::new(),
    }
}
