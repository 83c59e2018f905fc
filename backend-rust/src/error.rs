use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes surfaced to clients in `error {code, message}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Forbidden,
    BadRequest,
    BadPayload,
    NotFound,
    PremiumRequired,
    CalibrationRequired,
    SpectateNotAllowed,
    UserOffline,
}

/// Failures raised while handling one inbound message.
///
/// Every variant is reported to the sender only and leaves shared state
/// untouched.
#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    BadPayload(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} requires a premium account")]
    PremiumRequired(String),
    #[error("this match requires a valid board calibration")]
    CalibrationRequired,
    #[error("spectating is disabled for this room")]
    SpectateNotAllowed,
    #[error("{0} is offline")]
    UserOffline(String),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Forbidden(_) => ErrorCode::Forbidden,
            CoreError::BadRequest(_) => ErrorCode::BadRequest,
            CoreError::BadPayload(_) => ErrorCode::BadPayload,
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::PremiumRequired(_) => ErrorCode::PremiumRequired,
            CoreError::CalibrationRequired => ErrorCode::CalibrationRequired,
            CoreError::SpectateNotAllowed => ErrorCode::SpectateNotAllowed,
            CoreError::UserOffline(_) => ErrorCode::UserOffline,
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        CoreError::Forbidden(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        CoreError::BadRequest(msg.into())
    }

    pub fn bad_payload(msg: impl Into<String>) -> Self {
        CoreError::BadPayload(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_like_the_wire() {
        let json = serde_json::to_string(&ErrorCode::CalibrationRequired).unwrap();
        assert_eq!(json, "\"CALIBRATION_REQUIRED\"");
        assert_eq!(CoreError::not_found("match").code(), ErrorCode::NotFound);
        assert_eq!(CoreError::not_found("match").to_string(), "match not found");
    }
}
