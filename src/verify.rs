//! Answer verification: local check first, oracle judgement second, and
//! regeneration of single variants until the target count is reached.

use std::collections::VecDeque;

use async_trait::async_trait;

use tracing::{debug, info, instrument};

use crate::config::Prompts;
use crate::domain::{
  render_choices, Correctness, Difficulty, Variant, Verification, DIFFICULTY_DISTRIBUTION, VARIANTS_PER_ATTEMPT,
};
use crate::error::PipelineError;
use crate::fixer::parse_with_fix;
use crate::oracle::{Oracle, OracleRequest};
use crate::progress::{ProgressEvent, ProgressSink, ProgressStep};
use crate::sandbox::SandboxExecutor;
use crate::util::fill_template;

/// Produces one more candidate of the requested difficulty.
#[async_trait]
pub trait VariantSource: Send {
  async fn next_variant(&mut self, difficulty: Difficulty) -> Option<Variant>;
}

/// Re-runs accepted code for fresh variants, continuing the batch's id sequence.
pub struct CodeVariantSource<'a> {
  executor: &'a SandboxExecutor,
  code: &'a str,
  next_id: u32,
}

impl<'a> CodeVariantSource<'a> {
  pub fn new(executor: &'a SandboxExecutor, code: &'a str, next_id: u32) -> Self {
    Self { executor, code, next_id }
  }
}

#[async_trait]
impl VariantSource for CodeVariantSource<'_> {
  async fn next_variant(&mut self, difficulty: Difficulty) -> Option<Variant> {
    let id = self.next_id;
    self.next_id += 1;
    // Code that loaded once cannot become a syntax error; stop regenerating if it somehow does.
    self.executor.execute(self.code, difficulty, id).await.ok()
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VerificationOutcome {
  pub verified: Vec<Variant>,
  pub discarded_count: u32,
  /// Oracle judgements requested (local passes excluded).
  pub llm_verified_count: u32,
}

/// Answer equals a choice symbol or a choice text (both trimmed).
pub fn local_check(v: &Variant) -> bool {
  let answer = v.answer.trim();
  if answer.is_empty() || v.choices.is_empty() {
    return false;
  }
  v.answer_choice().is_some() || v.choices.iter().any(|c| c.text.trim() == answer)
}

/// Difficulty furthest below its share of `target`. Ties go easy, medium, hard; no deficit -> medium.
pub fn most_needed(verified: &[Variant], target: usize) -> Difficulty {
  let mut chosen = Difficulty::Medium;
  let mut max_deficit: i64 = 0;
  for (difficulty, share) in DIFFICULTY_DISTRIBUTION {
    let wanted = (share * target / VARIANTS_PER_ATTEMPT) as i64;
    let have = verified.iter().filter(|v| v.difficulty == difficulty).count() as i64;
    let deficit = wanted - have;
    if deficit > max_deficit {
      max_deficit = deficit;
      chosen = difficulty;
    }
  }
  chosen
}

fn unusable(v: &Variant) -> Option<&'static str> {
  if v.is_error() {
    Some("execution error")
  } else if v.answer.trim().is_empty() && v.choices.is_empty() {
    Some("no answer and no choices")
  } else {
    None
  }
}

/// Independent oracle judgement. Oracle or parse failures come back as an
/// inconclusive verdict; quota errors abort.
async fn judge(oracle: &dyn Oracle, prompts: &Prompts, v: &Variant) -> Result<Verification, PipelineError> {
  let choices = if v.choices.is_empty() {
    "(no choices)".to_string()
  } else {
    render_choices(&v.choices).trim_start().to_string()
  };
  let user = fill_template(
    &prompts.verify_user_template,
    &[
      ("question_text", &v.question_text),
      ("choices", &choices),
      ("claimed_answer", &v.answer),
      ("claimed_explanation", &v.explanation),
    ],
  );
  let req = OracleRequest::new("verify", &prompts.verify_system, user).json().temperature(0.3);

  let resp = match oracle.generate(req).await {
    Ok(r) => r,
    Err(e) if e.is_quota() => return Err(e.into()),
    Err(e) => return Ok(Verification::inconclusive(&v.answer, &e.to_string())),
  };
  match parse_with_fix::<Verification>(oracle, prompts, &resp.text).await {
    Ok(verdict) => Ok(verdict),
    Err(e @ PipelineError::QuotaExceeded(_)) => Err(e),
    Err(e) => Ok(Verification::inconclusive(&v.answer, &e.to_string())),
  }
}

/// Verify `initial`, then pull from `source` until `target` variants are
/// accepted or `max_total_attempts` candidates have been considered.
#[instrument(level = "info", skip_all, fields(initial = initial.len(), target_verified = target, max_total_attempts = max_total_attempts))]
pub async fn verify_batch(
  oracle: &dyn Oracle,
  prompts: &Prompts,
  initial: Vec<Variant>,
  source: &mut dyn VariantSource,
  target: usize,
  max_total_attempts: usize,
  sink: &dyn ProgressSink,
) -> Result<VerificationOutcome, PipelineError> {
  let mut queue: VecDeque<Variant> = initial.into();
  let mut verified: Vec<Variant> = Vec::with_capacity(target);
  let mut discarded_count = 0u32;
  let mut llm_verified_count = 0u32;
  let mut considered = 0usize;

  sink.report(ProgressEvent::new(ProgressStep::Verify, 55, "Verifying answers").detail("target", target));

  while verified.len() < target && considered < max_total_attempts {
    let mut candidate = match queue.pop_front() {
      Some(v) => v,
      None => {
        let difficulty = most_needed(&verified, target);
        debug!(target: "verify", %difficulty, needed = target - verified.len(), "Requesting extra variant");
        match source.next_variant(difficulty).await {
          Some(v) => v,
          None => break,
        }
      }
    };
    considered += 1;
    let progress = 55 + (verified.len() * 30 / target.max(1)) as u8;
    let id = candidate.variant_id;

    if let Some(reason) = unusable(&candidate) {
      discarded_count += 1;
      sink.report(
        ProgressEvent::new(ProgressStep::Verify, progress, format!("Variant {}: {}, discarded", id, reason))
          .detail("variant_id", id)
          .detail("status", "discarded"),
      );
      continue;
    }

    if local_check(&candidate) {
      candidate.verification = Some(Verification::local_pass(&candidate.answer));
      verified.push(candidate);
      sink.report(
        ProgressEvent::new(ProgressStep::Verify, progress, format!("Variant {}: local check passed ({}/{})", id, verified.len(), target))
          .detail("variant_id", id)
          .detail("status", "local_pass")
          .detail("verified", verified.len()),
      );
      continue;
    }

    sink.report(
      ProgressEvent::new(ProgressStep::Verify, progress, format!("Variant {}: asking the oracle", id))
        .detail("variant_id", id)
        .detail("status", "llm_verifying"),
    );
    llm_verified_count += 1;
    let verdict = judge(oracle, prompts, &candidate).await?;
    if verdict.is_correct == Correctness::Unknown {
      discarded_count += 1;
      sink.report(
        ProgressEvent::new(ProgressStep::Verify, progress, format!("Variant {}: inconclusive, discarded", id))
          .detail("variant_id", id)
          .detail("status", "llm_fail"),
      );
      continue;
    }
    candidate.verification = Some(verdict);
    verified.push(candidate);
    sink.report(
      ProgressEvent::new(ProgressStep::Verify, progress, format!("Variant {}: oracle verified ({}/{})", id, verified.len(), target))
        .detail("variant_id", id)
        .detail("status", "llm_pass")
        .detail("verified", verified.len()),
    );
  }

  info!(target: "verify", verified = verified.len(), discarded_count, llm_verified_count, considered, "Verification finished");
  sink.report(
    ProgressEvent::new(
      ProgressStep::Verify,
      90,
      format!("Verified {} (oracle checks: {}), discarded {}", verified.len(), llm_verified_count, discarded_count),
    )
    .detail("verified", verified.len())
    .detail("llm_verified", llm_verified_count)
    .detail("discarded", discarded_count),
  );

  Ok(VerificationOutcome { verified, discarded_count, llm_verified_count })
}
