//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{GenerationBatch, Question};
use crate::error::FailureKind;
use crate::pipeline::RunFailure;
use crate::progress::ProgressEvent;
use crate::usage::UsageSnapshot;

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    GenerateVariants {
        question: Question,
        #[serde(rename = "maxRetries", default)]
        max_retries: Option<u32>,
        /// Base64 image or data URL of the source question.
        #[serde(default)]
        image: Option<String>,
    },
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Progress {
        #[serde(flatten)]
        event: ProgressEvent,
    },
    Batch {
        batch: GenerationBatch,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_type: Option<FailureKind>,
        retry_exhausted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_count: Option<u32>,
    },
}

impl ServerWsMessage {
    /// Protocol-level error (bad input), not tied to a pipeline failure.
    pub fn bad_request(message: impl Into<String>) -> Self {
        ServerWsMessage::Error { message: message.into(), error_type: None, retry_exhausted: false, retry_count: None }
    }
}

impl From<RunFailure> for ServerWsMessage {
    fn from(f: RunFailure) -> Self {
        ServerWsMessage::Error {
            message: f.message,
            error_type: Some(f.error_type),
            retry_exhausted: f.retry_exhausted,
            retry_count: Some(f.retry_count),
        }
    }
}

//
// HTTP request/response DTOs
//

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub oracle: bool,
}

#[derive(Serialize)]
pub struct UsageOut {
    #[serde(flatten)]
    pub snapshot: UsageSnapshot,
    pub summary: String,
}

#[derive(Serialize)]
pub struct ResetOut {
    pub ok: bool,
}

#[derive(Deserialize)]
pub struct RepairJsonIn {
    pub text: String,
}

#[derive(Serialize)]
pub struct RepairJsonOut {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
