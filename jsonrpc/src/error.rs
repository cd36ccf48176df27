//! Fixed error codes and the error object carried by error responses.

use parse_display::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every error code this implementation puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(style = "snake_case")]
pub enum ErrorCode {
    /// The bytes received were not valid JSON.
    ParseError,
    /// The JSON received was not a valid request object.
    InvalidRequest,
    /// No method is registered under the requested name.
    MethodNotFound,
    /// The params were of the wrong shape for the method.
    InvalidParams,
    /// The engine failed while producing a reply.
    InternalError,
    /// A handler failed with an error that is not an RPC error.
    UncaughtException,
    /// A job returned by a handler concluded with a failure.
    JobFailed,
    /// A job returned by a handler was canceled.
    JobCanceled,
}

impl ErrorCode {
    /// Numeric code as sent on the wire.
    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::UncaughtException => -32000,
            Self::JobFailed => -32001,
            Self::JobCanceled => -32002,
        }
    }

    /// Human readable message sent alongside the code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::ParseError => "parse error",
            Self::InvalidRequest => "invalid request",
            Self::MethodNotFound => "method not found",
            Self::InvalidParams => "invalid params",
            Self::InternalError => "internal error",
            Self::UncaughtException => "uncaught exception",
            Self::JobFailed => "job failed",
            Self::JobCanceled => "job canceled",
        }
    }

    /// Look up a known code by its numeric value.
    pub fn from_code(code: i64) -> Option<Self> {
        [
            Self::ParseError,
            Self::InvalidRequest,
            Self::MethodNotFound,
            Self::InvalidParams,
            Self::InternalError,
            Self::UncaughtException,
            Self::JobFailed,
            Self::JobCanceled,
        ]
        .into_iter()
        .find(|known| known.code() == code)
    }
}

/// The `error` member of an error response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,

    /// Short description of the error.
    pub message: String,

    /// Additional structured detail, omitted from the wire when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create an error object for one of the fixed codes.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_owned(),
            data: None,
        }
    }

    /// Create an error object with an application specific code.
    pub fn custom(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The fixed code this object carries, if it is one of ours.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl From<ErrorCode> for ErrorObject {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_object_omits_missing_data() {
        let value = serde_json::to_value(ErrorObject::new(ErrorCode::MethodNotFound)).unwrap();
        assert_eq!(value, serde_json::json!({"code": -32601, "message": "method not found"}));
    }

    #[test]
    fn test_error_object_with_data() {
        let error = ErrorObject::new(ErrorCode::JobFailed).with_data(serde_json::json!({"reason": "x"}));
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"code": -32001, "message": "job failed", "data": {"reason": "x"}})
        );
        assert_eq!(error.kind(), Some(ErrorCode::JobFailed));
    }

    #[test]
    fn test_from_code() {
        assert_eq!(ErrorCode::from_code(-32002), Some(ErrorCode::JobCanceled));
        assert_eq!(ErrorCode::from_code(-32099), None);
        assert_eq!(ErrorCode::InvalidParams.to_string(), "invalid_params");
    }
}
