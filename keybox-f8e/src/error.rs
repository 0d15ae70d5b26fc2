//! Mapping of HTTP failures onto the domain error taxonomy

use keybox_core::Error;
use serde::Deserialize;

/// Error codes the remote authority puts in rejection bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Token never matched the action
    TokenInvalid,
    /// Token was already used
    TokenAlreadyConsumed,
    /// Action already cancelled or completed
    AlreadyTerminal,
    /// A concurrent rotation already committed
    KeysetConflict,
    /// Key already used by a keyset on the account
    KeyReuse,
    /// Another action of the same type is in flight
    ActionInFlight,
    /// Proof of possession missing or invalid
    MissingProof,
    /// Delay window has not elapsed
    DelayNotElapsed,
    /// Unknown resource
    NotFound,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a non-success response to an error.
///
/// Known codes win over the status. Without one, 404 is `NotFound`, 429 and
/// 5xx are transient and everything else is a plain rejection.
pub fn error_from_response(status: u16, body: &str) -> Error {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {}", status));

    let code = parsed
        .code
        .as_deref()
        .and_then(|c| serde_json::from_value::<ErrorCode>(serde_json::Value::String(c.to_string())).ok());

    match code {
        Some(ErrorCode::TokenInvalid) => Error::TokenInvalid(message),
        Some(ErrorCode::TokenAlreadyConsumed) => Error::TokenAlreadyConsumed(message),
        Some(ErrorCode::AlreadyTerminal) => Error::AlreadyTerminal(message),
        Some(ErrorCode::KeysetConflict) => Error::StaleRotation(message),
        Some(ErrorCode::KeyReuse) => Error::KeyReuse(message),
        Some(ErrorCode::ActionInFlight) => Error::ActionInFlight(message),
        Some(ErrorCode::MissingProof) => Error::MissingProof(message),
        Some(ErrorCode::DelayNotElapsed) => Error::RemoteRejected(message),
        Some(ErrorCode::NotFound) => Error::NotFound(message),
        None => match status {
            404 => Error::NotFound(message),
            429 | 500..=599 => Error::RemoteUnavailable(format!("HTTP {}: {}", status, message)),
            _ => Error::RemoteRejected(format!("HTTP {}: {}", status, message)),
        },
    }
}

/// Map a transport failure to an error
pub(crate) fn error_from_transport(err: reqwest::Error) -> Error {
    if err.is_decode() {
        Error::RemoteRejected(format!("JSON decode error: {}", err))
    } else {
        Error::Network(format!("HTTP error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        let body = r#"{"code":"TOKEN_ALREADY_CONSUMED","message":"used"}"#;
        assert!(matches!(
            error_from_response(409, body),
            Error::TokenAlreadyConsumed(m) if m == "used"
        ));
        assert!(matches!(
            error_from_response(400, r#"{"code":"TOKEN_INVALID"}"#),
            Error::TokenInvalid(_)
        ));
        assert!(matches!(
            error_from_response(409, r#"{"code":"KEYSET_CONFLICT"}"#),
            Error::StaleRotation(_)
        ));
        assert!(matches!(
            error_from_response(409, r#"{"code":"KEY_REUSE"}"#),
            Error::KeyReuse(_)
        ));
        assert!(matches!(
            error_from_response(409, r#"{"code":"ALREADY_TERMINAL"}"#),
            Error::AlreadyTerminal(_)
        ));
    }

    #[test]
    fn test_status_fallbacks() {
        assert!(error_from_response(503, "upstream down").is_transient());
        assert!(error_from_response(429, "").is_transient());
        assert!(matches!(error_from_response(404, ""), Error::NotFound(_)));
        let rejected = error_from_response(400, r#"{"code":"SOMETHING_NEW"}"#);
        assert!(matches!(rejected, Error::RemoteRejected(_)));
        assert!(!rejected.is_transient());
    }

    #[test]
    fn test_code_beats_status() {
        assert!(matches!(
            error_from_response(500, r#"{"code":"TOKEN_INVALID"}"#),
            Error::TokenInvalid(_)
        ));
    }
}
