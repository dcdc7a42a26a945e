//! Provider error types.

use thiserror::Error;

/// Maximum number of characters of a response body kept for diagnostics.
pub const MAX_BODY_CHARS: usize = 400;

/// Errors raised by the embedding and vector-search providers.
///
/// Bodies are truncated and scrubbed of the request credential before they are
/// stored here, so these values are safe to log or surface to a caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// No credentials are configured for the provider. Never retried.
    #[error("{service} credentials are not configured")]
    Configuration { service: &'static str },

    /// 5xx, 429, timeout or connection failure that survived every retry.
    #[error("{service} request failed after {attempts} attempt(s) (status {status:?}): {body}")]
    Transient {
        service: &'static str,
        status: Option<u16>,
        body: String,
        attempts: u32,
    },

    /// A 4xx other than 429. Fails immediately.
    #[error("{service} rejected the request ({status}): {body}")]
    Rejected {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// HTTP 2xx carrying a provider-level error code.
    #[error("{service} API error ({code}): {message}")]
    Api {
        service: &'static str,
        code: i64,
        message: String,
    },

    /// The response could not be decoded.
    #[error("{service} returned an invalid response: {detail}")]
    InvalidResponse {
        service: &'static str,
        detail: String,
    },

    /// The embedding provider answered but gave no usable vector.
    #[error("embedding provider returned no usable vector: {0}")]
    Embedding(String),
}

impl ProviderError {
    /// True when the provider cannot be used at all until configuration changes.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ProviderError::Configuration { .. })
    }

    /// HTTP status associated with the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Transient { status, .. } => *status,
            ProviderError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Truncate a body for diagnostics and scrub the credential out of it.
pub fn sanitize_body(body: &str, secret: Option<&str>) -> String {
    let scrubbed = match secret {
        Some(s) if !s.is_empty() => body.replace(s, "***"),
        _ => body.to_string(),
    };
    let trimmed = scrubbed.trim();
    if trimmed.chars().count() <= MAX_BODY_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_BODY_CHARS).collect();
    out.push('…');
    out
}
