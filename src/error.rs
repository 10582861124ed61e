use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    Unavailable,
    IdempotencyUnavailable,
    PermissionDenied,
    HandlerNotFound,
    Handler,
    EventDispatch,
    Transaction,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Encode => "encode",
            ErrorCode::Decode => "decode",
            ErrorCode::Validation => "validation",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::IdempotencyUnavailable => "idempotency_unavailable",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::HandlerNotFound => "handler_not_found",
            ErrorCode::Handler => "handler",
            ErrorCode::EventDispatch => "event_dispatch",
            ErrorCode::Transaction => "transaction",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Infrastructure failures raised by pipeline stages, handlers and stores.
///
/// Business-rule rejections are not errors; they travel as
/// [`Outcome::Rejected`](crate::pipeline::envelope::Outcome::Rejected).
/// The type is `Clone` so one failed flight can be handed to every caller
/// that joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
    #[error("idempotency store unavailable: {message}")]
    IdempotencyUnavailable { message: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no handler registered for '{request_type}'")]
    HandlerNotFound { request_type: String },
    #[error("handler '{request_type}' failed: {message}")]
    Handler {
        request_type: String,
        message: String,
    },
    #[error("domain event dispatch failed: {message}")]
    EventDispatch { message: String },
    #[error("transaction error: {message}")]
    Transaction { message: String },
    #[error("timeout")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::Encode(_) => ErrorCode::Encode,
            PipelineError::Decode(_) => ErrorCode::Decode,
            PipelineError::Validation(_) => ErrorCode::Validation,
            PipelineError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            PipelineError::Unavailable { .. } => ErrorCode::Unavailable,
            PipelineError::IdempotencyUnavailable { .. } => ErrorCode::IdempotencyUnavailable,
            PipelineError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            PipelineError::HandlerNotFound { .. } => ErrorCode::HandlerNotFound,
            PipelineError::Handler { .. } => ErrorCode::Handler,
            PipelineError::EventDispatch { .. } => ErrorCode::EventDispatch,
            PipelineError::Transaction { .. } => ErrorCode::Transaction,
            PipelineError::Timeout => ErrorCode::Timeout,
            PipelineError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Transient infrastructure failures a caller may retry with the same key.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Unavailable { .. }
                | PipelineError::IdempotencyUnavailable { .. }
                | PipelineError::Timeout
        )
    }

    pub fn handler(request_type: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Handler {
            request_type: request_type.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        PipelineError::Unavailable {
            message: message.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for PipelineError {
    fn from(value: rmp_serde::encode::Error) -> Self {
        PipelineError::Encode(value.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PipelineError {
    fn from(value: rmp_serde::decode::Error) -> Self {
        PipelineError::Decode(value.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(value: serde_json::Error) -> Self {
        PipelineError::Decode(value.to_string())
    }
}
