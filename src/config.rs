//! Loading agent configuration (prompts + pipeline settings) from TOML.
//!
//! See `AgentConfig`, `Prompts` and `PipelineSettings` for expected schema.
//! Every field is optional; missing ones keep their defaults.

use serde::Deserialize;
use tracing::{error, info};

use crate::sandbox::SandboxLimits;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AgentConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub pipeline: PipelineSettings,
}

/// Bounds of the generation pipeline.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
  /// Code-generation attempts per batch.
  pub max_retries: u32,
  /// Oracle-assisted question repairs after a failed batch.
  pub max_auto_retry: u32,
  /// Verified variants wanted per batch.
  pub target_verified: usize,
  /// Candidates considered by the verification stage before giving up.
  pub max_total_attempts: usize,
  /// An attempt is rejected when errored / slots reaches this rate.
  pub error_rate_threshold: f64,
  pub sandbox: SandboxLimits,
}

impl Default for PipelineSettings {
  fn default() -> Self {
    Self {
      max_retries: 3,
      max_auto_retry: 2,
      target_verified: 10,
      max_total_attempts: 20,
      error_rate_threshold: 0.5,
      sandbox: SandboxLimits::default(),
    }
  }
}

/// Prompts sent to the oracle. Placeholders in `{braces}` are filled per call;
/// any other braces are passed through untouched.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  // Variant code generation: {question}, {question_json}
  pub code_gen_system: String,
  pub code_gen_user_template: String,
  // Independent answer check: {question_text}, {choices}, {claimed_answer}, {claimed_explanation}
  pub verify_system: String,
  pub verify_user_template: String,
  // Solving the source question: {question_text}, {choices}, {question_type}
  pub solve_system: String,
  pub solve_user_template: String,
  // Question repair after a failed batch: {error_message}, {error_context}, {question_json}
  pub fix_error_system: String,
  pub fix_error_user_template: String,
  // Re-emitting broken JSON: {error_message}, {raw_response}
  pub fix_json_system: String,
  pub fix_json_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      code_gen_system: "You write small, deterministic JavaScript programs that generate exam question variants. Output ONLY code.".into(),
      code_gen_user_template: r#"Analyze the exam question below and write a JavaScript function that produces a NEW variant of it with fresh numbers.

## Question
{question}

## Question data (JSON)
{question_json}

## Requirements
1. Define exactly `function generate_variant(difficulty, variant_id)`; difficulty is "easy", "medium" or "hard".
2. Scale the numbers with the difficulty. Compute the correct answer in code, never by hand.
3. Return an object with keys: question_text, choices, answer, explanation, change_description.
4. choices: exactly 5 entries shaped {"number": "①", "text": "..."} using ① ② ③ ④ ⑤ in order; all texts distinct.
5. answer: the symbol of the correct choice (e.g. "③").
6. Use LaTeX ($...$) for math inside strings; remember to write backslashes as "\\" in JS strings.
7. explanation: "[Solution]\nConcept: ...\n$derivation$\n∴ Answer: ③".
8. No imports, no require, no I/O. Available helpers: random.randint/uniform/choice/shuffle/sample/random, math.*, Math, Fraction(n, d) with add/sub/mul/div/toLatex, re.sub/match/search/findall/split, range, len, str, int, float, list, dict, set, abs, round, min, max, sum, sorted, enumerate, zip, map, filter, pow, divmod, isinstance, bool, any, all, reversed, True, False, None.

Output only JavaScript code, without markdown fences."#.into(),
      verify_system: "You are a meticulous math teacher. Solve the problem yourself before judging. Respond ONLY with strict JSON.".into(),
      verify_user_template: r#"Solve the following problem yourself and check the given answer.

## Problem
{question_text}

## Choices
{choices}

## Given answer
{claimed_answer}

## Given explanation
{claimed_explanation}

Return JSON:
{"is_correct": true/false, "verified_answer": "answer you found (e.g. ② or a number)", "verification_steps": "short summary of your solution", "detailed_solution": "[Solution]\nConcept: ...\n$...$\n∴ Answer: ...", "confidence": "high/medium/low", "key_formula": "main formula or concept"}"#.into(),
      solve_system: "You are a math teacher writing model solutions. Respond ONLY with strict JSON.".into(),
      solve_user_template: r#"Solve the problem and give the answer with a step-by-step explanation.

## Problem
{question_text}

## Choices{choices}

## Question type
{question_type}

Return JSON:
{"answer": "answer (multiple choice: one of ①②③④⑤; free response: a number)", "explanation": "step-by-step solution using LaTeX ($...$)", "key_concepts": ["concept", "..."]}"#.into(),
      fix_error_system: "You repair exam question data that broke an automated pipeline. Respond ONLY with strict JSON.".into(),
      fix_error_user_template: r#"The following error occurred while generating variants. Fix the question data so the error goes away.

## Error message
{error_message}

## Error context
{error_context}

## Question data
{question_json}

## Instructions
1. Find the cause of the error.
2. Fix the parts of the question data that trigger it; formulas and special characters are common culprits.
3. Keep the same fields and meaning.

Return JSON:
{"analysis": "cause of the error", "fix_description": "what you changed", "fixed_data": { ...question data... }, "can_fix": true/false}"#.into(),
      fix_json_system: "You repair malformed JSON. Output ONLY the corrected JSON, no explanation.".into(),
      fix_json_user_template: r#"Fix this JSON parse error.

## Error
{error_message}

## Broken JSON
{raw_response}

Check escape sequences (\n, \t, \") and make sure LaTeX backslashes are escaped as \\. Return only the corrected JSON."#.into(),
    }
  }
}

/// Attempt to load `AgentConfig` from AGENT_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_agent_config_from_env() -> Option<AgentConfig> {
  let path = std::env::var("AGENT_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_agent_config(&s) {
      Ok(cfg) => {
        info!(target: "qvariant_backend", %path, "Loaded agent config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "qvariant_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "qvariant_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

pub fn parse_agent_config(text: &str) -> Result<AgentConfig, toml::de::Error> {
  toml::from_str::<AgentConfig>(text)
}
