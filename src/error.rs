//! Error types for the generation pipeline.
//!
//! - `RepairError`: oracle text that no repair strategy could turn into JSON
//! - `SandboxError`: generated code that is structurally unusable (fatal)
//! - `OracleError`: transport / provider failures
//! - `PipelineError`: everything that can end a batch, with `failure_kind()`
//!   mapping onto the tags reported to clients

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RepairError {
  #[error("malformed payload: {reason} (near: {preview})")]
  MalformedPayload { reason: String, preview: String },
}

/// Failures of the generated script as a whole. Runtime faults inside the entry
/// point never surface here; they become per-variant errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
  #[error("SyntaxError in generated code: {0}")]
  Syntax(String),

  #[error("ImportError in generated code: {0}")]
  Import(String),
}

#[derive(Debug, Error)]
pub enum OracleError {
  #[error("oracle not configured (OPENAI_API_KEY unset)")]
  NotConfigured,

  #[error("HTTP request failed: {0}")]
  RequestFailed(String),

  #[error("provider returned HTTP {status}: {message}")]
  Http { status: u16, message: String },

  #[error("rate limited by provider: {0}")]
  RateLimited(String),

  #[error("empty response from provider")]
  EmptyResponse,
}

impl OracleError {
  /// Provider throttling or exhausted quota.
  pub fn is_quota(&self) -> bool {
    match self {
      OracleError::RateLimited(_) => true,
      OracleError::Http { status: 429, .. } => true,
      other => looks_like_quota(&other.to_string()),
    }
  }
}

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("API error: {0}")]
  QuotaExceeded(String),

  #[error(transparent)]
  Sandbox(#[from] SandboxError),

  #[error(transparent)]
  MalformedPayload(#[from] RepairError),

  #[error("oracle call failed: {0}")]
  Oracle(OracleError),

  #[error("invalid question data: {0}")]
  InvalidQuestion(String),

  #[error("no usable variant code after {attempts} attempts; last error: {last_error}")]
  AttemptsExhausted { attempts: u32, last_error: String },
}

impl From<OracleError> for PipelineError {
  fn from(e: OracleError) -> Self {
    if e.is_quota() {
      PipelineError::QuotaExceeded(e.to_string())
    } else {
      PipelineError::Oracle(e)
    }
  }
}

/// Error-type tag carried by the final failure event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  Api,
  Syntax,
  Import,
  Json,
  Generation,
}

impl FailureKind {
  /// Kinds that end the run without an auto-fix round.
  pub fn is_fatal(&self) -> bool {
    matches!(self, FailureKind::Api | FailureKind::Syntax | FailureKind::Import)
  }
}

impl PipelineError {
  pub fn failure_kind(&self) -> FailureKind {
    match self {
      PipelineError::QuotaExceeded(_) => FailureKind::Api,
      PipelineError::Oracle(e) if e.is_quota() => FailureKind::Api,
      PipelineError::Sandbox(SandboxError::Syntax(_)) => FailureKind::Syntax,
      PipelineError::Sandbox(SandboxError::Import(_)) => FailureKind::Import,
      PipelineError::MalformedPayload(_) => FailureKind::Json,
      PipelineError::Oracle(_)
      | PipelineError::InvalidQuestion(_)
      | PipelineError::AttemptsExhausted { .. } => FailureKind::Generation,
    }
  }
}

/// Case-insensitive `api` / `quota` / `rate` substring rule for untyped provider messages.
pub fn looks_like_quota(message: &str) -> bool {
  let m = message.to_lowercase();
  m.contains("api") || m.contains("quota") || m.contains("rate")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn quota_substring_rule_is_case_insensitive() {
    assert!(looks_like_quota("Rate limit reached for requests"));
    assert!(looks_like_quota("QUOTA exhausted"));
    assert!(looks_like_quota("bad API key"));
    assert!(!looks_like_quota("connection reset by peer"));
  }

  #[test]
  fn oracle_errors_map_to_quota_when_throttled() {
    let e: PipelineError = OracleError::Http { status: 429, message: "slow down".into() }.into();
    assert_eq!(e.failure_kind(), FailureKind::Api);

    let e: PipelineError = OracleError::RequestFailed("upstream said: rate limit".into()).into();
    assert!(matches!(e, PipelineError::QuotaExceeded(_)));

    let e: PipelineError = OracleError::EmptyResponse.into();
    assert_eq!(e.failure_kind(), FailureKind::Generation);
  }

  #[test]
  fn own_generation_failure_is_not_fatal() {
    let e = PipelineError::AttemptsExhausted { attempts: 3, last_error: "x is not defined".into() };
    assert_eq!(e.failure_kind(), FailureKind::Generation);
    assert!(!e.failure_kind().is_fatal());
    assert!(!looks_like_quota(&PipelineError::AttemptsExhausted { attempts: 3, last_error: String::new() }.to_string()));
  }

  #[test]
  fn sandbox_failures_are_fatal() {
    let e: PipelineError = SandboxError::Syntax("unexpected token".into()).into();
    assert_eq!(e.failure_kind(), FailureKind::Syntax);
    assert!(e.failure_kind().is_fatal());
    let e: PipelineError = SandboxError::Import("os".into()).into();
    assert_eq!(e.failure_kind(), FailureKind::Import);
  }
}
