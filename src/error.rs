//! Error types for oipd

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the indexing daemon.
///
/// Variants map onto the failure classes of the record state machine:
/// transient errors are retried by callers, the rest are logged and
/// terminal for the record/entry that produced them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transient error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("template missing: {0}")]
    TemplateMissing(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("unknown enum value: {0}")]
    UnknownEnumValue(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn signature_invalid(msg: impl Into<String>) -> Self {
        Error::SignatureInvalid(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    pub fn template_missing(msg: impl Into<String>) -> Self {
        Error::TemplateMissing(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Error::Policy(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for errors a sync loop should retry on the next cycle rather
    /// than memoize as permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Http(_))
    }

    /// Maps an internal error onto the small taxonomy code surfaced over
    /// the HTTP API. Internal detail (stack traces, storage paths) never
    /// crosses this boundary.
    pub fn taxonomy_code(&self) -> &'static str {
        match self {
            Error::Transient(_) | Error::Http(_) => "transient",
            Error::NotFound(_) => "not_found",
            Error::SignatureInvalid(_) => "signature_invalid",
            Error::Decode(_) => "decode_error",
            Error::TemplateMissing(_) => "template_missing",
            Error::Unauthorized(_) => "unauthorized",
            Error::Policy(_) => "policy_violation",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::UnknownField(_) => "unknown_field",
            Error::UnknownEnumValue(_) => "unknown_enum_value",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) | Error::Internal(_) => {
                "internal"
            }
        }
    }
}
