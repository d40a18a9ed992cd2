use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("schedule body does not match the document schema: {0}")]
    Json(#[from] serde_json::Error),
    #[error("channel id {0} is outside the supported switch range")]
    InvalidSwitchId(i64),
    #[error("switch {0} appears more than once in controls")]
    DuplicateSwitch(u8),
    #[error("invalid state {value} on switch {switch_index}, expected 0 or 1")]
    InvalidState { switch_index: u8, value: i64 },
    #[error("metadata field `{field}` has invalid value {value}")]
    InvalidMetadata { field: &'static str, value: i64 },
}

/// Failure reported by the transport before any HTTP status was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error {code}: {message}")]
pub struct TransportFailure {
    pub code: i32,
    pub message: String,
}

impl TransportFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
