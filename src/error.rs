use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Failure to obtain a credential. Fatal for a run: nothing downstream can be authorized without one.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The identity service answered with an OAuth2 error payload.
    #[error("{code}: {description}")]
    Identity { code: String, description: String },

    /// The mechanism cannot be used on this host (missing variables, no CLI, no identity endpoint).
    #[error("{source_name} is unavailable: {reason}")]
    Unavailable {
        source_name: &'static str,
        reason: String,
    },

    #[error("{0:#}")]
    AuthorizationError(anyhow::Error),

    #[error("sign-in was not completed before the device code expired")]
    Expired,

    #[error("no credential in the chain produced a token: {0}")]
    ChainExhausted(String),

    #[error("malformed identity response: {0}")]
    Malformed(String),

    #[error("identity request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Coarse classification of a failed service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Transient,
    Unknown,
}

impl ErrorKind {
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            404 => ErrorKind::NotFound,
            401 | 403 => ErrorKind::Unauthorized,
            408 | 429 => ErrorKind::Transient,
            s if s >= 500 => ErrorKind::Transient,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Failure of a Key Vault or Resource Manager call. Reported and skipped, never fatal.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{message} (status: {status}, code: {code})")]
    Response {
        kind: ErrorKind,
        status: StatusCode,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    InvalidInput(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Response { kind, .. } => *kind,
            ServiceError::Credential(_) => ErrorKind::Unauthorized,
            ServiceError::Http(err) if err.is_timeout() => ErrorKind::Transient,
            ServiceError::Http(err) => err.status().map(ErrorKind::from_status).unwrap_or(ErrorKind::Unknown),
            ServiceError::Decode(_) | ServiceError::Url(_) | ServiceError::InvalidInput(_) => ErrorKind::Unknown,
        }
    }

    /// Builds an error from a non-success response, keeping the service's own message when the body has one.
    pub(crate) fn from_response(status: StatusCode, body: &str) -> Self {
        let (code, message) = match serde_json::from_str::<ErrorResponse>(body) {
            Ok(response) => (response.error.code, response.error.message),
            Err(_) if body.trim().is_empty() => (
                "Unknown".to_owned(),
                status.canonical_reason().unwrap_or("Service request failed").to_owned(),
            ),
            Err(_) => ("Unknown".to_owned(), body.to_owned()),
        };
        ServiceError::Response {
            kind: ErrorKind::from_status(status),
            status,
            code,
            message: one_line(&message),
        }
    }
}

/// Longest message kept from an error body, in characters.
const MAX_MESSAGE_CHARS: usize = 200;

/// Collapses runs of whitespace (line breaks included) and cuts overly long bodies.
fn one_line(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_MESSAGE_CHARS {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(MAX_MESSAGE_CHARS).collect();
    truncated.push_str("...");
    truncated
}

// {"error": {"code": "SecretNotFound", "message": "..."}}
#[derive(Deserialize, Debug)]
struct ErrorResponse {
    error: ErrorResponseValue,
}

#[derive(Deserialize, Debug)]
struct ErrorResponseValue {
    code: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(ErrorKind::from_status(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_status(StatusCode::UNAUTHORIZED), ErrorKind::Unauthorized);
        assert_eq!(ErrorKind::from_status(StatusCode::FORBIDDEN), ErrorKind::Unauthorized);
        assert_eq!(ErrorKind::from_status(StatusCode::TOO_MANY_REQUESTS), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_status(StatusCode::SERVICE_UNAVAILABLE), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_status(StatusCode::BAD_REQUEST), ErrorKind::Unknown);
    }

    #[test]
    fn response_error_keeps_service_message() {
        let body = r#"{"error":{"code":"SecretNotFound","message":"A secret with (name/id) Secretname was not found in this key vault."}}"#;
        let err = ServiceError::from_response(StatusCode::NOT_FOUND, body);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let text = err.to_string();
        assert!(text.starts_with("A secret with (name/id) Secretname was not found"));
        assert!(text.contains("SecretNotFound"));
    }

    #[test]
    fn response_error_without_body_uses_reason() {
        let err = ServiceError::from_response(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().starts_with("Bad Gateway"));
    }

    #[test]
    fn non_json_bodies_are_reduced_to_one_line() {
        let body = "<html>\n<body>502 Bad Gateway</body>\n</html>\n";
        let err = ServiceError::from_response(StatusCode::BAD_GATEWAY, body);
        assert_eq!(
            err.to_string(),
            "<html> <body>502 Bad Gateway</body> </html> (status: 502 Bad Gateway, code: Unknown)"
        );
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        match ServiceError::from_response(StatusCode::INTERNAL_SERVER_ERROR, &body) {
            ServiceError::Response { message, .. } => {
                assert_eq!(message.len(), MAX_MESSAGE_CHARS + 3);
                assert!(message.ends_with("..."));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn credential_failures_during_calls_are_unauthorized() {
        let err = ServiceError::from(CredentialError::Expired);
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
}
