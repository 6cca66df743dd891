//! Oracle-assisted repair: revised question data after a failed batch, and a
//! single "re-emit this as valid JSON" round trip for unparseable responses.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::config::Prompts;
use crate::domain::Question;
use crate::error::{PipelineError, RepairError};
use crate::json_repair::repair_json_as;
use crate::oracle::{Oracle, OracleRequest};
use crate::util::{fill_template, trunc_for_log};

/// Broken payloads are cut to this many chars before being sent back.
const FIX_JSON_MAX_CHARS: usize = 3000;

/// The oracle's answer to "fix this question data".
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FixProposal {
  #[serde(default)]
  pub analysis: String,
  #[serde(default)]
  pub fix_description: String,
  #[serde(default)]
  pub fixed_data: Option<Value>,
  #[serde(default)]
  pub can_fix: bool,
}

impl FixProposal {
  fn unfixable(reason: impl Into<String>) -> Self {
    Self { analysis: reason.into(), can_fix: false, ..Default::default() }
  }

  /// The replacement question, if the oracle claims a fix and the data is a valid question.
  pub fn revised_question(&self) -> Option<Question> {
    if !self.can_fix {
      return None;
    }
    let data = self.fixed_data.clone()?;
    match serde_json::from_value::<Question>(data) {
      Ok(q) => match q.validate() {
        Ok(()) => Some(q),
        Err(e) => {
          warn!(target: "variants", error = %e, "Proposed fix is not a valid question");
          None
        }
      },
      Err(e) => {
        warn!(target: "variants", error = %e, "Proposed fix does not have question shape");
        None
      }
    }
  }
}

/// Ask the oracle to repair `question` given the error that ended the last batch.
/// Only quota errors propagate; every other failure yields an unfixable proposal.
#[instrument(level = "info", skip_all, fields(error_len = error_message.len()))]
pub async fn request_fix(
  oracle: &dyn Oracle,
  prompts: &Prompts,
  error_message: &str,
  error_context: &str,
  question: &Question,
) -> Result<FixProposal, PipelineError> {
  let question_json = serde_json::to_string_pretty(question).unwrap_or_default();
  let user = fill_template(
    &prompts.fix_error_user_template,
    &[
      ("error_message", error_message),
      ("error_context", error_context),
      ("question_json", &question_json),
    ],
  );
  let req = OracleRequest::new("fix_error", &prompts.fix_error_system, user).json();

  let resp = match oracle.generate(req).await {
    Ok(r) => r,
    Err(e) if e.is_quota() => return Err(e.into()),
    Err(e) => return Ok(FixProposal::unfixable(e.to_string())),
  };

  match parse_with_fix::<FixProposal>(oracle, prompts, &resp.text).await {
    Ok(p) => {
      info!(target: "variants", can_fix = p.can_fix, analysis = %trunc_for_log(&p.analysis, 120), "Fix proposal received");
      Ok(p)
    }
    Err(e @ PipelineError::QuotaExceeded(_)) => Err(e),
    Err(e) => Ok(FixProposal::unfixable(e.to_string())),
  }
}

/// Repair `raw` into `T`; if every strategy fails, ask the oracle once to
/// re-emit valid JSON and repair that.
pub async fn parse_with_fix<T: DeserializeOwned>(
  oracle: &dyn Oracle,
  prompts: &Prompts,
  raw: &str,
) -> Result<T, PipelineError> {
  let first = match repair_json_as::<T>(raw) {
    Ok(v) => return Ok(v),
    Err(e) => e,
  };
  let RepairError::MalformedPayload { reason, .. } = &first;
  warn!(target: "variants", %reason, "Response is not valid JSON; asking oracle to fix it");

  let broken: String = raw.chars().take(FIX_JSON_MAX_CHARS).collect();
  let user = fill_template(
    &prompts.fix_json_user_template,
    &[("error_message", reason), ("raw_response", &broken)],
  );
  let req = OracleRequest::new("fix_json", &prompts.fix_json_system, user).json().fast().temperature(0.0);

  match oracle.generate(req).await {
    Ok(resp) => repair_json_as::<T>(&resp.text).map_err(PipelineError::from),
    Err(e) if e.is_quota() => Err(e.into()),
    Err(e) => {
      warn!(target: "variants", error = %e, "JSON fix request failed");
      Err(first.into())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{Choice, QuestionType};
  use crate::error::OracleError;
  use crate::oracle::testing::ScriptedOracle;

  #[derive(Deserialize, Debug)]
  struct Answer {
    answer: String,
  }

  fn question() -> Question {
    Question {
      number: "1".into(),
      text: "$\\frac{1}{2} + x$".into(),
      passage: None,
      choices: vec![Choice { symbol: "①".into(), text: "1".into() }],
      graph_info: None,
      question_type: QuestionType::MultipleChoice,
    }
  }

  #[tokio::test]
  async fn clean_payload_needs_no_oracle() {
    let oracle = ScriptedOracle::new();
    let a: Answer = parse_with_fix(&oracle, &Prompts::default(), "```json\n{\"answer\": \"③\"}\n```").await.unwrap();
    assert_eq!(a.answer, "③");
    assert_eq!(oracle.calls(), 0);
  }

  #[tokio::test]
  async fn hopeless_payload_gets_one_fix_round_trip() {
    let oracle = ScriptedOracle::new().reply("{\"answer\": \"②\"}");
    let a: Answer = parse_with_fix(&oracle, &Prompts::default(), "answer is ② {").await.unwrap();
    assert_eq!(a.answer, "②");
    assert_eq!(oracle.operations(), vec!["fix_json"]);
  }

  #[tokio::test]
  async fn failed_fix_reports_original_parse_error() {
    let oracle = ScriptedOracle::new().fail(OracleError::EmptyResponse);
    let err = parse_with_fix::<Answer>(&oracle, &Prompts::default(), "nothing here").await.unwrap_err();
    assert!(matches!(err, PipelineError::MalformedPayload(_)));
  }

  #[tokio::test]
  async fn quota_during_fix_is_fatal() {
    let oracle = ScriptedOracle::new().fail(OracleError::RateLimited("slow down".into()));
    let err = parse_with_fix::<Answer>(&oracle, &Prompts::default(), "nothing here").await.unwrap_err();
    assert!(matches!(err, PipelineError::QuotaExceeded(_)));
  }

  #[tokio::test]
  async fn proposal_with_valid_data_yields_revised_question() {
    let reply = r#"{"analysis": "bad latex", "fix_description": "escaped", "can_fix": true,
      "fixed_data": {"question_number": "1", "question_text": "$\frac{1}{2} + 1$", "choices": [{"number": "①", "text": "1.5"}]}}"#;
    let oracle = ScriptedOracle::new().reply(reply);
    let p = request_fix(&oracle, &Prompts::default(), "boom", "context", &question()).await.unwrap();
    let q = p.revised_question().unwrap();
    assert_eq!(q.text, "$\\frac{1}{2} + 1$");
    assert_eq!(oracle.operations(), vec!["fix_error"]);
  }

  #[tokio::test]
  async fn unfixable_or_broken_proposals_yield_nothing() {
    let oracle = ScriptedOracle::new().reply(r#"{"analysis": "no idea", "can_fix": false}"#);
    let p = request_fix(&oracle, &Prompts::default(), "boom", "context", &question()).await.unwrap();
    assert!(p.revised_question().is_none());

    let oracle = ScriptedOracle::new().reply(r#"{"can_fix": true, "fixed_data": {"question_text": "x", "choices": [{"number": "9", "text": "a"}]}}"#);
    let p = request_fix(&oracle, &Prompts::default(), "boom", "context", &question()).await.unwrap();
    assert!(p.revised_question().is_none());

    let oracle = ScriptedOracle::new().fail(OracleError::Http { status: 500, message: "down".into() });
    let p = request_fix(&oracle, &Prompts::default(), "boom", "context", &question()).await.unwrap();
    assert!(!p.can_fix);
  }
}
