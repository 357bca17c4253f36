use thiserror::Error;

use crate::error::FailureReason;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Unauthorized - check the configured server credentials")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Connectivity(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 | 403 => RemoteError::Unauthorized,
            404 => RemoteError::NotFound(truncated),
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::ServerError(truncated),
            _ => RemoteError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            RemoteError::NotFound(_) => FailureReason::NotFound,
            RemoteError::Unauthorized | RemoteError::RateLimited | RemoteError::ServerError(_) => {
                FailureReason::ServerError
            }
            RemoteError::Connectivity(_) => FailureReason::Connectivity,
            RemoteError::InvalidResponse(_) => FailureReason::Unknown,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else if let Some(status) = e.status() {
            RemoteError::from_status(status, &e.to_string())
        } else {
            RemoteError::Connectivity(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status() {
        assert!(matches!(
            RemoteError::from_status(StatusCode::UNAUTHORIZED, ""),
            RemoteError::Unauthorized
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::NOT_FOUND, "no such patient"),
            RemoteError::NotFound(ref body) if body == "no such patient"
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::BAD_GATEWAY, ""),
            RemoteError::ServerError(_)
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::IM_A_TEAPOT, ""),
            RemoteError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "é".repeat(400);
        let RemoteError::ServerError(message) =
            RemoteError::from_status(StatusCode::INTERNAL_SERVER_ERROR, &body)
        else {
            panic!("expected server error");
        };
        assert!(message.contains("truncated, 800 total bytes"));
    }

    #[test]
    fn test_reason() {
        assert_eq!(RemoteError::RateLimited.reason(), FailureReason::ServerError);
        assert_eq!(
            RemoteError::NotFound("x".into()).reason(),
            FailureReason::NotFound
        );
        assert_eq!(
            RemoteError::InvalidResponse("x".into()).reason(),
            FailureReason::Unknown
        );
    }
}
