use axum::http::{header, HeaderMap};
use base64::Engine;
use std::fmt;

/// Username and password taken from an inbound `Authorization: Basic` header
///
/// Both fields may be empty. The password never appears in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Anonymous credentials (both fields empty)
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// True when both a username and a password are present
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Extract Basic credentials from request headers
    ///
    /// Anything other than a well-formed `Basic base64(user:pass)` value
    /// yields anonymous credentials.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            tracing::debug!("No Authorization header found");
            return Self::anonymous();
        };

        let Some(encoded) = value.strip_prefix("Basic ") else {
            return Self::anonymous();
        };

        let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Ignoring undecodable Basic credentials: {}", e);
                return Self::anonymous();
            }
        };

        let Ok(decoded) = String::from_utf8(decoded) else {
            return Self::anonymous();
        };

        match decoded.split_once(':') {
            Some((username, password)) => {
                tracing::debug!(
                    username = %username,
                    "Using credentials from Authorization header"
                );
                Self::new(username, password)
            }
            None => Self::anonymous(),
        }
    }
}
