//! Self-healing generation loop.
//!
//! One batch: ask the oracle for variant code, run it over the 3/4/3
//! difficulty slots, retry with fresh code while too many slots fail, solve the
//! source question, then hand the survivors to the verification stage.
//! `run_with_auto_fix` wraps that in up to `max_auto_retry` rounds of
//! oracle-assisted question repair.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{PipelineSettings, Prompts};
use crate::domain::{
  render_choices, GenerationBatch, OriginalEntry, OriginalSolution, Question, QuestionType, Variant,
  DIFFICULTY_DISTRIBUTION, VARIANTS_PER_ATTEMPT,
};
use crate::error::{FailureKind, PipelineError};
use crate::extract::extract_code_block;
use crate::fixer::{parse_with_fix, request_fix};
use crate::oracle::{Oracle, OracleRequest};
use crate::progress::{MonotonicSink, ProgressEvent, ProgressSink, ProgressStep};
use crate::sandbox::SandboxExecutor;
use crate::util::{fill_template, trunc_for_log};
use crate::verify::{verify_batch, CodeVariantSource};

/// Terminal failure of a run, as reported to clients.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RunFailure {
  pub message: String,
  pub error_type: FailureKind,
  pub retry_exhausted: bool,
  /// Total retries over the run: failed code attempts plus auto-fix rounds.
  pub retry_count: u32,
  /// Auto-fix rounds used before giving up.
  pub auto_fix_rounds: u32,
}

pub struct Pipeline {
  /// Identifies one run in logs and in the `start` event.
  task_id: String,
  oracle: Arc<dyn Oracle>,
  prompts: Arc<Prompts>,
  settings: PipelineSettings,
  executor: SandboxExecutor,
}

impl Pipeline {
  pub fn new(oracle: Arc<dyn Oracle>, prompts: Arc<Prompts>, settings: PipelineSettings) -> Self {
    let executor = SandboxExecutor::new(settings.sandbox.clone());
    Self { task_id: Uuid::new_v4().to_string(), oracle, prompts, settings, executor }
  }

  /// One batch for one question revision: CODE_GEN → EXEC → (SUCCESS | RETRY | FAILED),
  /// then solving the original and verification.
  ///
  /// Failed code attempts are counted into `retry_count`, also when the batch fails.
  #[instrument(level = "info", skip(self, question, image, sink, retry_count), fields(question = %question.number))]
  pub async fn generate_variants(
    &self,
    question: &Question,
    image: Option<&str>,
    max_retries: u32,
    sink: &dyn ProgressSink,
    retry_count: &mut u32,
  ) -> Result<GenerationBatch, PipelineError> {
    question.validate().map_err(PipelineError::InvalidQuestion)?;
    let max_retries = max_retries.max(1);
    let sink = &MonotonicSink::new(sink);

    let mut last_error = String::new();
    let mut accepted: Option<(String, Vec<Variant>)> = None;

    for attempt in 1..=max_retries {
      let retrying = attempt > 1;
      let step_progress = (10 + attempt.saturating_sub(1) * 5).min(20) as u8;
      sink.report(
        ProgressEvent::new(ProgressStep::CodeGen, step_progress, format!("Generating variant code (attempt {}/{})", attempt, max_retries))
          .detail("attempt", attempt),
      );
      let code = self.generate_code(question, image).await?;
      sink.report(
        ProgressEvent::new(ProgressStep::CodeGen, 20, "Variant code received").detail("code_length", code.len()),
      );

      let variants = self.execute_slots(&code, retrying, sink).await?;
      let errored: Vec<&Variant> = variants.iter().filter(|v| v.is_error()).collect();
      let error_rate = errored.len() as f64 / VARIANTS_PER_ATTEMPT as f64;

      if error_rate < self.settings.error_rate_threshold {
        info!(target: "variants", attempt, errored = errored.len(), "Variant code accepted");
        accepted = Some((code, variants));
        break;
      }

      last_error = errored
        .first()
        .and_then(|v| v.error.clone())
        .unwrap_or_else(|| "unknown execution error".to_string());
      *retry_count += 1;
      warn!(
        target: "variants",
        attempt,
        errored = errored.len(),
        last_error = %trunc_for_log(&last_error, 200),
        "Too many failing slots; regenerating code"
      );
    }

    let (code, variants) = accepted.ok_or_else(|| PipelineError::AttemptsExhausted {
      attempts: max_retries,
      last_error: last_error.clone(),
    })?;

    sink.report(ProgressEvent::new(ProgressStep::SolveOriginal, 45, "Solving the original question"));
    let solution = self.solve_original(question, image).await?;
    sink.report(
      ProgressEvent::new(ProgressStep::SolveOriginal, 50, "Original question solved")
        .detail("has_answer", !solution.answer.is_empty()),
    );

    let mut source = CodeVariantSource::new(&self.executor, &code, VARIANTS_PER_ATTEMPT as u32 + 1);
    let outcome = verify_batch(
      self.oracle.as_ref(),
      &self.prompts,
      variants,
      &mut source,
      self.settings.target_verified,
      self.settings.max_total_attempts,
      sink,
    )
    .await?;

    let verified_count = outcome.verified.len() as u32;
    sink.report(
      ProgressEvent::new(ProgressStep::Complete, 95, format!("{} variants ready", verified_count))
        .detail("verified", verified_count)
        .detail("discarded", outcome.discarded_count),
    );

    Ok(GenerationBatch {
      original: OriginalEntry { question: question.clone(), solution },
      variants: outcome.verified,
      generation_method: "code".into(),
      generated_code: code,
      retry_count: *retry_count,
      discarded_count: outcome.discarded_count,
      verified_count,
      llm_verified_count: outcome.llm_verified_count,
    })
  }

  /// Full run with oracle-assisted question repair between failed batches.
  #[instrument(level = "info", skip_all, fields(task_id = %self.task_id, question = %question.number))]
  pub async fn run_with_auto_fix(
    &self,
    question: Question,
    image: Option<String>,
    sink: &dyn ProgressSink,
  ) -> Result<GenerationBatch, RunFailure> {
    let max_auto_retry = self.settings.max_auto_retry;
    sink.report(
      ProgressEvent::new(ProgressStep::Start, 0, "Starting variant generation").detail("task_id", self.task_id.clone()),
    );

    let mut current = question;
    let mut round = 0u32;
    let mut code_retries = 0u32;
    loop {
      if round == 0 {
        sink.report(ProgressEvent::new(ProgressStep::Generate, 5, "Generating variant code"));
      } else {
        sink.report(
          ProgressEvent::new(ProgressStep::AutoRetry, 5, format!("Retrying with repaired question ({}/{})", round, max_auto_retry))
            .detail("retry_count", round),
        );
      }

      let mut round_retries = 0;
      let generated = self
        .generate_variants(&current, image.as_deref(), self.settings.max_retries, sink, &mut round_retries)
        .await;
      code_retries += round_retries;
      let err = match generated {
        Ok(batch) => {
          sink.report(
            ProgressEvent::new(ProgressStep::Generated, 98, format!("{} variants generated", batch.verified_count))
              .detail("code_length", batch.generated_code.len())
              .detail("retry_count", batch.retry_count),
          );
          sink.report(ProgressEvent::new(ProgressStep::Complete, 100, "Done"));
          return Ok(batch);
        }
        Err(e) => e,
      };

      let kind = err.failure_kind();
      if kind.is_fatal() {
        error!(target: "variants", error = %err, ?kind, "Fatal generation error");
        return Err(fail(sink, err.to_string(), kind, false, round, code_retries));
      }
      if round >= max_auto_retry {
        error!(target: "variants", error = %err, rounds = round, "Auto-fix rounds exhausted");
        return Err(fail(sink, format!("variant generation failed: {}", err), kind, true, round, code_retries));
      }

      let message = err.to_string();
      sink.report(
        ProgressEvent::new(ProgressStep::AutoFix, 25, "Analyzing the error and repairing the question")
          .detail("error", trunc_for_log(&message, 300)),
      );
      let context = match kind {
        FailureKind::Json => "JSON parse error: the oracle response is not valid JSON",
        _ => "error while generating variants",
      };
      let proposal = match request_fix(self.oracle.as_ref(), &self.prompts, &message, context, &current).await {
        Ok(p) => p,
        Err(fatal) => {
          let kind = fatal.failure_kind();
          return Err(fail(sink, fatal.to_string(), kind, false, round, code_retries));
        }
      };

      match proposal.revised_question() {
        Some(revised) => {
          info!(target: "variants", round = round + 1, fix = %trunc_for_log(&proposal.fix_description, 200), "Question repaired");
          sink.report(
            ProgressEvent::new(ProgressStep::AutoFixed, 30, format!("Question repaired: {}", proposal.fix_description))
              .detail("analysis", proposal.analysis.clone()),
          );
          current = revised;
          round += 1;
        }
        None => {
          warn!(target: "variants", analysis = %trunc_for_log(&proposal.analysis, 200), "Oracle could not repair the question");
          sink.report(
            ProgressEvent::new(ProgressStep::AutoFixFailed, 0, format!("Automatic repair failed: {}", proposal.analysis)),
          );
          return Err(fail(sink, format!("variant generation failed: {}", message), kind, false, round, code_retries));
        }
      }
    }
  }

  async fn generate_code(&self, question: &Question, image: Option<&str>) -> Result<String, PipelineError> {
    let question_json =
      serde_json::to_string_pretty(question).map_err(|e| PipelineError::InvalidQuestion(e.to_string()))?;
    let user = fill_template(
      &self.prompts.code_gen_user_template,
      &[("question", &question.render_for_prompt()), ("question_json", &question_json)],
    );
    let req = OracleRequest::new("code_gen", &self.prompts.code_gen_system, user)
      .temperature(0.5)
      .with_image(image.map(str::to_string));
    let resp = self.oracle.generate(req).await?;
    Ok(extract_code_block(&resp.text))
  }

  /// Run `code` once per slot. Only a structurally broken script aborts.
  async fn execute_slots(&self, code: &str, retrying: bool, sink: &dyn ProgressSink) -> Result<Vec<Variant>, PipelineError> {
    let base: usize = if retrying { 35 } else { 25 };
    let mut variants = Vec::with_capacity(VARIANTS_PER_ATTEMPT);
    let mut id = 0u32;
    for (difficulty, count) in DIFFICULTY_DISTRIBUTION {
      for _ in 0..count {
        id += 1;
        let v = self.executor.execute(code, difficulty, id).await?;
        let progress = (base + id as usize * 15 / VARIANTS_PER_ATTEMPT).min(40) as u8;
        sink.report(
          ProgressEvent::new(ProgressStep::ExecCode, progress, format!("Variant {} ({})", id, difficulty))
            .detail("variant_id", id)
            .detail("ok", !v.is_error()),
        );
        variants.push(v);
      }
    }
    Ok(variants)
  }

  /// Oracle solution of the source question. Non-quota failures give an empty solution.
  async fn solve_original(&self, question: &Question, image: Option<&str>) -> Result<OriginalSolution, PipelineError> {
    let choices = if question.choices.is_empty() {
      "\n(none)".to_string()
    } else {
      render_choices(&question.choices)
    };
    let question_type = match question.question_type {
      QuestionType::MultipleChoice => "multiple_choice",
      QuestionType::FreeResponse => "free_response",
    };
    let mut text = question.text.clone();
    if let Some(p) = question.passage.as_deref().filter(|p| !p.trim().is_empty()) {
      text = format!("{}\n\n{}", p, text);
    }
    let user = fill_template(
      &self.prompts.solve_user_template,
      &[("question_text", &text), ("choices", &choices), ("question_type", question_type)],
    );
    let req = OracleRequest::new("solve_original", &self.prompts.solve_system, user)
      .json()
      .temperature(0.3)
      .with_image(image.map(str::to_string));

    let resp = match self.oracle.generate(req).await {
      Ok(r) => r,
      Err(e) if e.is_quota() => return Err(e.into()),
      Err(e) => {
        warn!(target: "variants", error = %e, "Solving the original failed");
        return Ok(OriginalSolution::default());
      }
    };
    match parse_with_fix::<OriginalSolution>(self.oracle.as_ref(), &self.prompts, &resp.text).await {
      Ok(s) => Ok(s),
      Err(e @ PipelineError::QuotaExceeded(_)) => Err(e),
      Err(e) => {
        warn!(target: "variants", error = %e, "Original solution unparseable");
        Ok(OriginalSolution::default())
      }
    }
  }
}

fn fail(
  sink: &dyn ProgressSink,
  message: String,
  kind: FailureKind,
  retry_exhausted: bool,
  auto_fix_rounds: u32,
  code_retries: u32,
) -> RunFailure {
  let retry_count = auto_fix_rounds + code_retries;
  sink.report(
    ProgressEvent::new(ProgressStep::Error, 0, message.clone())
      .detail("error_type", serde_json::to_value(kind).unwrap_or_default())
      .detail("retry_exhausted", retry_exhausted)
      .detail("retry_count", retry_count),
  );
  RunFailure { message, error_type: kind, retry_exhausted, retry_count, auto_fix_rounds }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{Choice, Correctness, CHOICE_SYMBOLS};
  use crate::error::OracleError;
  use crate::oracle::testing::ScriptedOracle;
  use crate::progress::testing::RecordingSink;
  use crate::sandbox::SandboxLimits;

  const TWO_PLUS_THREE: &str = r#"
function generate_variant(difficulty, variant_id) {
  const a = 2, b = 3;
  const answer = a + b;
  const texts = [answer - 3, answer - 2, answer - 1, answer, answer + 1];
  const symbols = ["①", "②", "③", "④", "⑤"];
  return {
    question_text: "$" + a + " + " + b + "$ = ?",
    choices: texts.map((t, i) => ({ number: symbols[i], text: str(t) })),
    answer: "④",
    explanation: "[Solution]\n$2 + 3 = 5$\n∴ Answer: ④",
    change_description: "same numbers",
  };
}
"#;

  fn fenced(code: &str) -> String {
    format!("```javascript\n{}\n```", code)
  }

  /// Throws for ids up to `n`, otherwise behaves like `TWO_PLUS_THREE`.
  fn failing_below(n: u32) -> String {
    TWO_PLUS_THREE.replace(
      "const a = 2, b = 3;",
      &format!("if (variant_id <= {}) {{ throw new Error(\"bad slot \" + variant_id); }}\n  const a = 2, b = 3;", n),
    )
  }

  fn question() -> Question {
    Question {
      number: "3".into(),
      text: "$2 + 3$ = ?".into(),
      passage: None,
      choices: CHOICE_SYMBOLS
        .iter()
        .zip(["2", "3", "4", "5", "6"])
        .map(|(s, t)| Choice { symbol: s.to_string(), text: t.to_string() })
        .collect(),
      graph_info: None,
      question_type: QuestionType::MultipleChoice,
    }
  }

  fn settings(max_retries: u32) -> PipelineSettings {
    PipelineSettings {
      max_retries,
      sandbox: SandboxLimits { seed: Some(7), ..SandboxLimits::default() },
      ..PipelineSettings::default()
    }
  }

  fn pipeline(oracle: Arc<ScriptedOracle>) -> Pipeline {
    Pipeline::new(oracle, Arc::new(Prompts::default()), settings(3))
  }

  const SOLVED: &str = r#"{"answer": "④", "explanation": "$2+3=5$", "key_concepts": ["addition"]}"#;

  #[tokio::test]
  async fn two_plus_three_end_to_end() {
    let oracle = Arc::new(ScriptedOracle::new().reply(fenced(TWO_PLUS_THREE)).reply(SOLVED));
    let sink = RecordingSink::default();
    let batch = pipeline(oracle.clone()).generate_variants(&question(), None, 3, &sink, &mut 0).await.unwrap();

    assert_eq!(batch.variants.len(), 10);
    assert_eq!(batch.verified_count, 10);
    assert_eq!(batch.retry_count, 0);
    assert_eq!(batch.llm_verified_count, 0);
    assert_eq!(batch.generation_method, "code");
    assert_eq!(batch.original.solution.answer, "④");
    for v in &batch.variants {
      assert_eq!(v.answer, "④");
      assert_eq!(v.answer_choice().map(|c| c.text.as_str()), Some("5"));
      assert_eq!(v.verification.as_ref().map(|x| x.is_correct), Some(Correctness::Correct));
    }
    assert_eq!(oracle.operations(), vec!["code_gen", "solve_original"]);

    let progress: Vec<u8> = sink.events().iter().map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", progress);
  }

  #[tokio::test]
  async fn two_bad_attempts_then_success() {
    let always = TWO_PLUS_THREE.replace("const a = 2, b = 3;", "throw new Error(\"always\");");
    let even = TWO_PLUS_THREE.replace(
      "const a = 2, b = 3;",
      "if (variant_id % 2 === 0) { throw new Error(\"even\"); }\n  const a = 2, b = 3;",
    );
    let oracle = Arc::new(
      ScriptedOracle::new()
        .reply(fenced(&always))
        .reply(fenced(&even))
        .reply(fenced(&failing_below(2)))
        .reply(SOLVED),
    );
    let sink = RecordingSink::default();
    let batch = pipeline(oracle.clone()).generate_variants(&question(), None, 3, &sink, &mut 0).await.unwrap();

    assert_eq!(batch.retry_count, 2);
    assert_eq!(batch.verified_count, 10);
    // two errored slots discarded, replaced by ids 11 and 12
    assert_eq!(batch.discarded_count, 2);
    assert!(batch.variants.iter().any(|v| v.variant_id == 12));
    assert_eq!(oracle.operations(), vec!["code_gen", "code_gen", "code_gen", "solve_original"]);
    // Retried attempts do not move the bar backwards.
    let progress: Vec<u8> = sink.events().iter().map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
  }

  #[tokio::test]
  async fn exhausted_attempts_carry_last_error() {
    let always = TWO_PLUS_THREE.replace("const a = 2, b = 3;", "throw new Error(\"always\");");
    let oracle = Arc::new(ScriptedOracle::new().reply(fenced(&always)).reply(fenced(&always)));
    let sink = RecordingSink::default();
    let err = pipeline(oracle).generate_variants(&question(), None, 2, &sink, &mut 0).await.unwrap_err();
    match err {
      PipelineError::AttemptsExhausted { attempts, last_error } => {
        assert_eq!(attempts, 2);
        assert!(last_error.contains("always"));
      }
      other => panic!("unexpected error: {:?}", other),
    }
  }

  #[tokio::test]
  async fn quota_error_stops_without_retries() {
    let oracle = Arc::new(ScriptedOracle::new().fail(OracleError::RequestFailed("Rate limit exceeded".into())));
    let sink = RecordingSink::default();
    let failure = pipeline(oracle.clone()).run_with_auto_fix(question(), None, &sink).await.unwrap_err();

    assert_eq!(failure.error_type, FailureKind::Api);
    assert!(!failure.retry_exhausted);
    assert_eq!(oracle.calls(), 1);
    assert_eq!(sink.steps().last(), Some(&ProgressStep::Error));
  }

  #[tokio::test]
  async fn syntax_error_is_fatal() {
    let oracle = Arc::new(ScriptedOracle::new().reply(fenced("function generate_variant(d, id) { return {")));
    let sink = RecordingSink::default();
    let failure = pipeline(oracle.clone()).run_with_auto_fix(question(), None, &sink).await.unwrap_err();

    assert_eq!(failure.error_type, FailureKind::Syntax);
    assert_eq!(oracle.operations(), vec!["code_gen"]);
  }

  #[tokio::test]
  async fn auto_fix_replaces_question_and_succeeds() {
    let always = TWO_PLUS_THREE.replace("const a = 2, b = 3;", "throw new Error(\"always\");");
    let fix = r#"{"analysis": "broken formula", "fix_description": "rewrote the formula", "can_fix": true,
      "fixed_data": {"question_number": "3", "question_text": "$2 + 3$ = ? (fixed)",
        "choices": [{"number": "①", "text": "4"}, {"number": "②", "text": "5"}]}}"#;
    let oracle = Arc::new(
      ScriptedOracle::new()
        .reply(fenced(&always))
        .reply(fix)
        .reply(fenced(TWO_PLUS_THREE))
        .reply(SOLVED),
    );
    let p = Pipeline::new(oracle.clone(), Arc::new(Prompts::default()), settings(1));
    let sink = RecordingSink::default();
    let batch = p.run_with_auto_fix(question(), None, &sink).await.unwrap();

    assert_eq!(batch.original.question.text, "$2 + 3$ = ? (fixed)");
    assert_eq!(oracle.operations(), vec!["code_gen", "fix_error", "code_gen", "solve_original"]);
    assert!(sink.events()[0].details.contains_key("task_id"));
    let steps = sink.steps();
    assert!(steps.contains(&ProgressStep::AutoFix));
    assert!(steps.contains(&ProgressStep::AutoFixed));
    assert!(steps.contains(&ProgressStep::AutoRetry));
    assert_eq!(steps.last(), Some(&ProgressStep::Complete));
  }

  #[tokio::test]
  async fn unfixable_question_ends_the_run() {
    let always = TWO_PLUS_THREE.replace("const a = 2, b = 3;", "throw new Error(\"always\");");
    let oracle = Arc::new(
      ScriptedOracle::new()
        .reply(fenced(&always))
        .reply(r#"{"analysis": "nothing to fix", "can_fix": false}"#),
    );
    let p = Pipeline::new(oracle.clone(), Arc::new(Prompts::default()), settings(1));
    let sink = RecordingSink::default();
    let failure = p.run_with_auto_fix(question(), None, &sink).await.unwrap_err();

    assert_eq!(failure.error_type, FailureKind::Generation);
    assert!(!failure.retry_exhausted);
    assert!(sink.steps().contains(&ProgressStep::AutoFixFailed));
    assert_eq!(oracle.calls(), 2);
    assert_eq!(failure.retry_count, 1);
    assert_eq!(failure.auto_fix_rounds, 0);
  }

  #[tokio::test]
  async fn exhausted_run_counts_code_and_fix_retries() {
    let always = TWO_PLUS_THREE.replace("const a = 2, b = 3;", "throw new Error(\"always\");");
    let fix = r#"{"analysis": "broken formula", "fix_description": "rewrote the formula", "can_fix": true,
      "fixed_data": {"question_number": "3", "question_text": "$2 + 3$ = ? (fixed)",
        "choices": [{"number": "①", "text": "4"}, {"number": "②", "text": "5"}]}}"#;
    let oracle = Arc::new(
      ScriptedOracle::new()
        .reply(fenced(&always))
        .reply(fenced(&always))
        .reply(fix)
        .reply(fenced(&always))
        .reply(fenced(&always)),
    );
    let settings = PipelineSettings { max_auto_retry: 1, ..settings(2) };
    let p = Pipeline::new(oracle.clone(), Arc::new(Prompts::default()), settings);
    let sink = RecordingSink::default();
    let failure = p.run_with_auto_fix(question(), None, &sink).await.unwrap_err();

    assert!(failure.retry_exhausted);
    assert_eq!(failure.auto_fix_rounds, 1);
    // four failed code attempts over two rounds, plus the repair round
    assert_eq!(failure.retry_count, 5);
    assert_eq!(oracle.calls(), 5);
    let last = sink.events().pop().unwrap();
    assert_eq!(last.step, ProgressStep::Error);
    assert_eq!(last.details["retry_count"], 5);
  }
}
