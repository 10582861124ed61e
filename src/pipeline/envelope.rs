use crate::error::PipelineError;
use crate::permission::CallerContext;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Client-supplied token naming one logical attempt of a command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Command,
    Query,
}

/// Marks a query as cacheable. `key` identifies the parameters; the stage
/// adds the request type, tenant and user segments itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheDescriptor {
    pub key: String,
    #[serde(default)]
    pub ttl: Option<Duration>,
    /// Skip the lookup and overwrite the entry with the new result.
    #[serde(default)]
    pub refresh: bool,
}

impl CacheDescriptor {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
            refresh: false,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn refreshing(mut self) -> Self {
        self.refresh = true;
        self
    }
}

/// One request travelling through the pipeline.
///
/// Capabilities are explicit fields rather than marker traits: a command may
/// carry an idempotency key, a query may carry a cache descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_type: String,
    pub kind: RequestKind,
    pub caller: CallerContext,
    pub payload: Value,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
    #[serde(default)]
    pub cache: Option<CacheDescriptor>,
    /// Query request types whose cached results a successful command evicts.
    #[serde(default)]
    pub invalidates: Vec<String>,
}

impl RequestEnvelope {
    pub fn command(request_type: impl Into<String>, caller: CallerContext, payload: Value) -> Self {
        Self {
            request_type: request_type.into(),
            kind: RequestKind::Command,
            caller,
            payload,
            idempotency_key: None,
            cache: None,
            invalidates: Vec::new(),
        }
    }

    pub fn query(request_type: impl Into<String>, caller: CallerContext, payload: Value) -> Self {
        Self {
            request_type: request_type.into(),
            kind: RequestKind::Query,
            caller,
            payload,
            idempotency_key: None,
            cache: None,
            invalidates: Vec::new(),
        }
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn with_cache(mut self, descriptor: CacheDescriptor) -> Self {
        self.cache = Some(descriptor);
        self
    }

    pub fn invalidating(mut self, request_type: impl Into<String>) -> Self {
        self.invalidates.push(request_type.into());
        self
    }

    pub fn is_command(&self) -> bool {
        self.kind == RequestKind::Command
    }

    pub fn is_query(&self) -> bool {
        self.kind == RequestKind::Query
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            PipelineError::Validation(format!(
                "payload of '{}' does not match its schema: {e}",
                self.request_type
            ))
        })
    }
}

/// Business-rule rejection. Not an error: nothing is retried or re-thrown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rejection {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl Rejection {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    Success(Value),
    Rejected(Rejection),
}

impl Outcome {
    pub fn success<T: Serialize>(value: &T) -> Result<Self, PipelineError> {
        serde_json::to_value(value)
            .map(Outcome::Success)
            .map_err(|e| PipelineError::Encode(e.to_string()))
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Outcome::Rejected(Rejection::new(code, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// MessagePack encoding used for idempotency records.
    pub fn encode(&self) -> Result<Vec<u8>, PipelineError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Event raised by a handler and published only if its transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainEvent {
    pub name: String,
    pub payload: Value,
}

impl DomainEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}
