//! Domain models: questions, choices, generated variants, verification results and batches.

use serde::{Deserialize, Serialize};

/// Choice markers, in presentation order.
pub const CHOICE_SYMBOLS: [&str; 5] = ["①", "②", "③", "④", "⑤"];

/// Slots executed per generation attempt: 3 easy, 4 medium, 3 hard.
pub const DIFFICULTY_DISTRIBUTION: [(Difficulty, usize); 3] =
  [(Difficulty::Easy, 3), (Difficulty::Medium, 4), (Difficulty::Hard, 3)];

/// Total slots of one attempt (sum of `DIFFICULTY_DISTRIBUTION`).
pub const VARIANTS_PER_ATTEMPT: usize = 10;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
  MultipleChoice,
  FreeResponse,
}
impl Default for QuestionType {
  fn default() -> Self { QuestionType::MultipleChoice }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
  Easy,
  Medium,
  Hard,
}

impl Difficulty {
  pub fn as_str(&self) -> &'static str {
    match self {
      Difficulty::Easy => "easy",
      Difficulty::Medium => "medium",
      Difficulty::Hard => "hard",
    }
  }
}

impl std::fmt::Display for Difficulty {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Choice {
  #[serde(rename = "number")]
  pub symbol: String,
  #[serde(default)]
  pub text: String,
}

/// Source question. Never mutated: a repaired revision replaces it wholesale.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Question {
  #[serde(rename = "question_number", default)]
  pub number: String,
  #[serde(rename = "question_text")]
  pub text: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub passage: Option<String>,
  #[serde(default)]
  pub choices: Vec<Choice>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub graph_info: Option<serde_json::Value>,
  #[serde(default)]
  pub question_type: QuestionType,
}

impl Question {
  /// Symbols must come from `CHOICE_SYMBOLS` and be unique.
  pub fn validate(&self) -> Result<(), String> {
    if self.text.trim().is_empty() {
      return Err("question_text is empty".into());
    }
    let mut seen: Vec<&str> = Vec::with_capacity(self.choices.len());
    for c in &self.choices {
      if !CHOICE_SYMBOLS.contains(&c.symbol.as_str()) {
        return Err(format!("unknown choice symbol '{}'", c.symbol));
      }
      if seen.contains(&c.symbol.as_str()) {
        return Err(format!("duplicate choice symbol '{}'", c.symbol));
      }
      seen.push(&c.symbol);
    }
    Ok(())
  }

  /// Prompt-friendly rendering used by code generation and fix requests.
  pub fn render_for_prompt(&self) -> String {
    let mut out = format!("Question {}: {}", self.number, self.text);
    if let Some(p) = self.passage.as_deref().filter(|p| !p.trim().is_empty()) {
      out.push_str(&format!("\n\n[Passage]\n{}", p));
    }
    if !self.choices.is_empty() {
      out.push_str("\n\n[Choices]");
      out.push_str(&render_choices(&self.choices));
    }
    out
  }
}

/// One `"\n{symbol} {text}"` line per choice.
pub fn render_choices(choices: &[Choice]) -> String {
  choices.iter().map(|c| format!("\n{} {}", c.symbol, c.text)).collect()
}

/// Tri-state judgement. `Unknown` means the judge itself failed; serialized as `null`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum Correctness {
  Correct,
  Incorrect,
  Unknown,
}

impl From<Option<bool>> for Correctness {
  fn from(v: Option<bool>) -> Self {
    match v {
      Some(true) => Correctness::Correct,
      Some(false) => Correctness::Incorrect,
      None => Correctness::Unknown,
    }
  }
}

impl From<Correctness> for Option<bool> {
  fn from(c: Correctness) -> Self {
    match c {
      Correctness::Correct => Some(true),
      Correctness::Incorrect => Some(false),
      Correctness::Unknown => None,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
  #[serde(alias = "High", alias = "HIGH")]
  High,
  #[serde(alias = "Medium", alias = "MEDIUM")]
  Medium,
  #[serde(alias = "Low", alias = "LOW")]
  Low,
}
impl Default for Confidence {
  fn default() -> Self { Confidence::Low }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Verification {
  #[serde(default = "unknown_correctness")]
  pub is_correct: Correctness,
  #[serde(default)]
  pub verified_answer: String,
  #[serde(rename = "verification_steps", default)]
  pub steps: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub detailed_solution: Option<String>,
  #[serde(default)]
  pub confidence: Confidence,
  #[serde(default)]
  pub key_formula: String,
}

fn unknown_correctness() -> Correctness { Correctness::Unknown }

impl Verification {
  /// Synthetic verdict for an answer found verbatim among the choices.
  pub fn local_pass(answer: &str) -> Self {
    Self {
      is_correct: Correctness::Correct,
      verified_answer: answer.to_string(),
      steps: "local check: answer matches a listed choice".into(),
      detailed_solution: None,
      confidence: Confidence::High,
      key_formula: String::new(),
    }
  }

  /// Verdict used when the judge could not be reached or understood.
  pub fn inconclusive(claimed_answer: &str, reason: &str) -> Self {
    Self {
      is_correct: Correctness::Unknown,
      verified_answer: claimed_answer.to_string(),
      steps: format!("verification failed: {}", reason),
      detailed_solution: None,
      confidence: Confidence::Low,
      key_formula: String::new(),
    }
  }
}

/// A generated question variant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Variant {
  pub variant_id: u32,
  pub difficulty: Difficulty,
  #[serde(default)]
  pub question_text: String,
  #[serde(default)]
  pub choices: Vec<Choice>,
  #[serde(default)]
  pub answer: String,
  #[serde(default)]
  pub explanation: String,
  #[serde(default)]
  pub change_description: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub graph_info: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub verification: Option<Verification>,
}

impl Variant {
  /// Variant standing in for a failed execution: empty answer and choices.
  pub fn failed(variant_id: u32, difficulty: Difficulty, error: impl Into<String>) -> Self {
    let error = error.into();
    Self {
      variant_id,
      difficulty,
      question_text: format!("code execution error: {}", error),
      choices: Vec::new(),
      answer: String::new(),
      explanation: format!("error: {}", error),
      change_description: "the generated code failed while building this variant".into(),
      graph_info: None,
      error: Some(error),
      verification: None,
    }
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }

  /// Choice the answer points at, when the answer is a symbol.
  pub fn answer_choice(&self) -> Option<&Choice> {
    let answer = self.answer.trim();
    self.choices.iter().find(|c| c.symbol == answer)
  }
}

/// Source question plus its oracle-produced solution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct OriginalSolution {
  #[serde(default)]
  pub answer: String,
  #[serde(default)]
  pub explanation: String,
  #[serde(default)]
  pub key_concepts: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OriginalEntry {
  #[serde(flatten)]
  pub question: Question,
  #[serde(flatten)]
  pub solution: OriginalSolution,
}

/// Final unit handed to persistence/transport. `verified_count == variants.len()`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationBatch {
  pub original: OriginalEntry,
  pub variants: Vec<Variant>,
  pub generation_method: String,
  pub generated_code: String,
  pub retry_count: u32,
  pub discarded_count: u32,
  pub verified_count: u32,
  pub llm_verified_count: u32,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_question() -> Question {
    Question {
      number: "3".into(),
      text: "2+3=?".into(),
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

  #[test]
  fn distribution_matches_slot_count() {
    let total: usize = DIFFICULTY_DISTRIBUTION.iter().map(|(_, n)| n).sum();
    assert_eq!(total, VARIANTS_PER_ATTEMPT);
  }

  #[test]
  fn question_wire_names() {
    let q = sample_question();
    let v = serde_json::to_value(&q).unwrap();
    assert_eq!(v["question_number"], "3");
    assert_eq!(v["choices"][3]["number"], "④");
    assert_eq!(v["question_type"], "multiple_choice");
    let back: Question = serde_json::from_value(v).unwrap();
    assert_eq!(back, q);
  }

  #[test]
  fn duplicate_symbols_are_rejected() {
    let mut q = sample_question();
    q.choices[1].symbol = "①".into();
    assert!(q.validate().unwrap_err().contains("duplicate"));
    assert!(sample_question().validate().is_ok());
  }

  #[test]
  fn correctness_is_tri_state_on_the_wire() {
    let v: Verification = serde_json::from_str(r#"{"is_correct": null, "confidence": "medium"}"#).unwrap();
    assert_eq!(v.is_correct, Correctness::Unknown);
    assert_eq!(v.confidence, Confidence::Medium);

    let v: Verification = serde_json::from_str(r#"{"is_correct": false}"#).unwrap();
    assert_eq!(v.is_correct, Correctness::Incorrect);

    let missing: Verification = serde_json::from_str("{}").unwrap();
    assert_eq!(missing.is_correct, Correctness::Unknown);

    let out = serde_json::to_value(Verification::local_pass("①")).unwrap();
    assert_eq!(out["is_correct"], serde_json::Value::Bool(true));
    assert_eq!(out["confidence"], "high");
  }

  #[test]
  fn failed_variant_has_no_answer() {
    let v = Variant::failed(4, Difficulty::Hard, "boom");
    assert!(v.is_error());
    assert!(v.answer.is_empty());
    assert!(v.choices.is_empty());
    assert!(v.question_text.contains("boom"));
  }
}
