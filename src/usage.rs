//! Oracle usage accounting: tokens, estimated cost, latency per model and operation.
//!
//! One `UsageTracker` is built at startup and shared as `Arc<dyn UsageRecorder>`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::util::is_hangul;

/// Calls kept in the rolling history.
const HISTORY_LIMIT: usize = 100;
/// Calls returned in a snapshot's `recent_calls`.
const RECENT_LIMIT: usize = 10;

/// USD per 1K tokens: (model, input, output).
const PRICING: &[(&str, f64, f64)] = &[
  ("gpt-4o", 0.0025, 0.01),
  ("gpt-4o-mini", 0.00015, 0.0006),
  ("gpt-4.1", 0.002, 0.008),
  ("gpt-4.1-mini", 0.0004, 0.0016),
  ("gemini-2.5-pro", 0.00125, 0.01),
  ("gemini-2.5-flash", 0.000015, 0.00006),
  ("gemini-2.0-flash", 0.00001875, 0.000075),
  ("gemini-1.5-pro", 0.00125, 0.005),
  ("gemini-1.5-flash", 0.00001875, 0.000075),
];
const DEFAULT_PRICING: (f64, f64) = (0.0001, 0.0003);

/// (input, output) USD per 1K tokens.
pub fn pricing_for(model: &str) -> (f64, f64) {
  PRICING
    .iter()
    .find(|(m, _, _)| *m == model)
    .map(|(_, i, o)| (*i, *o))
    .unwrap_or(DEFAULT_PRICING)
}

/// Rough token count: Hangul ≈ 1.5 chars/token, everything else ≈ 4 chars/token.
pub fn estimate_tokens(text: &str) -> u64 {
  if text.is_empty() {
    return 0;
  }
  let (hangul, other) = text
    .chars()
    .fold((0u64, 0u64), |(h, o), c| if is_hangul(c) { (h + 1, o) } else { (h, o + 1) });
  let estimated = (hangul as f64 / 1.5 + other as f64 / 4.0) as u64;
  estimated.max(1)
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UsageRecord {
  pub timestamp: DateTime<Utc>,
  pub model: String,
  pub operation: String,
  pub input_tokens: u64,
  pub output_tokens: u64,
  pub cost_usd: f64,
  pub latency_ms: u64,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl UsageRecord {
  pub fn new(model: &str, operation: &str, input_tokens: u64, output_tokens: u64, latency_ms: u64) -> Self {
    let (pin, pout) = pricing_for(model);
    let cost_usd = input_tokens as f64 / 1000.0 * pin + output_tokens as f64 / 1000.0 * pout;
    Self {
      timestamp: Utc::now(),
      model: model.to_string(),
      operation: operation.to_string(),
      input_tokens,
      output_tokens,
      cost_usd,
      latency_ms,
      success: true,
      error: None,
    }
  }

  pub fn failed(mut self, error: impl Into<String>) -> Self {
    self.success = false;
    self.error = Some(error.into());
    self
  }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct UsageAggregate {
  pub calls: u64,
  pub input_tokens: u64,
  pub output_tokens: u64,
  pub cost_usd: f64,
}

impl UsageAggregate {
  fn add(&mut self, r: &UsageRecord) {
    self.calls += 1;
    self.input_tokens += r.input_tokens;
    self.output_tokens += r.output_tokens;
    self.cost_usd += r.cost_usd;
  }
}

#[derive(Clone, Debug, Serialize)]
pub struct UsageSnapshot {
  pub session_start: DateTime<Utc>,
  pub total_calls: u64,
  pub successful_calls: u64,
  pub failed_calls: u64,
  pub total_input_tokens: u64,
  pub total_output_tokens: u64,
  pub total_tokens: u64,
  pub total_cost_usd: f64,
  pub by_model: BTreeMap<String, UsageAggregate>,
  pub by_operation: BTreeMap<String, UsageAggregate>,
  pub recent_calls: Vec<UsageRecord>,
}

impl UsageSnapshot {
  /// Human-readable multi-line summary.
  pub fn summary(&self) -> String {
    let mut lines = vec![
      format!(
        "oracle calls: {} (ok {}, failed {})",
        self.total_calls, self.successful_calls, self.failed_calls
      ),
      format!(
        "tokens: {} (in {}, out {})",
        self.total_tokens, self.total_input_tokens, self.total_output_tokens
      ),
      format!("cost: ${:.6}", self.total_cost_usd),
    ];
    for (model, agg) in &self.by_model {
      lines.push(format!(
        "  model {}: {} calls, {} tokens, ${:.6}",
        model,
        agg.calls,
        agg.input_tokens + agg.output_tokens,
        agg.cost_usd
      ));
    }
    for (op, agg) in &self.by_operation {
      lines.push(format!("  operation {}: {} calls, {} tokens", op, agg.calls, agg.input_tokens + agg.output_tokens));
    }
    lines.join("\n")
  }
}

/// Sink for per-call usage. Implementations are internally synchronized.
pub trait UsageRecorder: Send + Sync {
  fn record(&self, record: UsageRecord);
  fn snapshot(&self) -> UsageSnapshot;
  fn reset(&self);
}

#[derive(Debug)]
struct UsageState {
  session_start: DateTime<Utc>,
  successful_calls: u64,
  failed_calls: u64,
  total: UsageAggregate,
  by_model: BTreeMap<String, UsageAggregate>,
  by_operation: BTreeMap<String, UsageAggregate>,
  history: VecDeque<UsageRecord>,
}

impl Default for UsageState {
  fn default() -> Self {
    Self {
      session_start: Utc::now(),
      successful_calls: 0,
      failed_calls: 0,
      total: UsageAggregate::default(),
      by_model: BTreeMap::new(),
      by_operation: BTreeMap::new(),
      history: VecDeque::with_capacity(HISTORY_LIMIT),
    }
  }
}

/// In-memory recorder.
#[derive(Debug, Default)]
pub struct UsageTracker {
  inner: Mutex<UsageState>,
}

impl UsageTracker {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_state<R>(&self, f: impl FnOnce(&mut UsageState) -> R) -> R {
    // A panic while holding the lock leaves counters consistent enough to keep going.
    let mut guard = match self.inner.lock() {
      Ok(g) => g,
      Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
  }
}

impl UsageRecorder for UsageTracker {
  fn record(&self, record: UsageRecord) {
    self.with_state(|s| {
      if record.success {
        s.successful_calls += 1;
      } else {
        s.failed_calls += 1;
      }
      s.total.add(&record);
      s.by_model.entry(record.model.clone()).or_default().add(&record);
      s.by_operation.entry(record.operation.clone()).or_default().add(&record);
      if s.history.len() == HISTORY_LIMIT {
        s.history.pop_front();
      }
      s.history.push_back(record);
    });
  }

  fn snapshot(&self) -> UsageSnapshot {
    self.with_state(|s| UsageSnapshot {
      session_start: s.session_start,
      total_calls: s.total.calls,
      successful_calls: s.successful_calls,
      failed_calls: s.failed_calls,
      total_input_tokens: s.total.input_tokens,
      total_output_tokens: s.total.output_tokens,
      total_tokens: s.total.input_tokens + s.total.output_tokens,
      total_cost_usd: (s.total.cost_usd * 1e6).round() / 1e6,
      by_model: s.by_model.clone(),
      by_operation: s.by_operation.clone(),
      recent_calls: s.history.iter().skip(s.history.len().saturating_sub(RECENT_LIMIT)).cloned().collect(),
    })
  }

  fn reset(&self) {
    self.with_state(|s| *s = UsageState::default());
    info!(target: "oracle", "Usage statistics reset");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn token_estimate_weights_hangul() {
    assert_eq!(estimate_tokens(""), 0);
    assert_eq!(estimate_tokens("ab"), 1);
    assert_eq!(estimate_tokens("abcdefgh"), 2);
    // 3 hangul / 1.5 = 2
    assert_eq!(estimate_tokens("정답은"), 2);
  }

  #[test]
  fn unknown_models_use_default_pricing() {
    assert_eq!(pricing_for("some-new-model"), DEFAULT_PRICING);
    let r = UsageRecord::new("gpt-4o", "verify", 1000, 1000, 5);
    assert!((r.cost_usd - 0.0125).abs() < 1e-12);
  }

  #[test]
  fn aggregates_by_model_and_operation() {
    let t = UsageTracker::new();
    t.record(UsageRecord::new("gpt-4o", "code_gen", 100, 50, 10));
    t.record(UsageRecord::new("gpt-4o-mini", "verify", 10, 5, 3));
    t.record(UsageRecord::new("gpt-4o-mini", "verify", 0, 0, 3).failed("timeout"));

    let s = t.snapshot();
    assert_eq!(s.total_calls, 3);
    assert_eq!(s.successful_calls, 2);
    assert_eq!(s.failed_calls, 1);
    assert_eq!(s.total_tokens, 165);
    assert_eq!(s.by_model["gpt-4o-mini"].calls, 2);
    assert_eq!(s.by_operation["code_gen"].input_tokens, 100);
    assert!(s.summary().contains("oracle calls: 3"));
  }

  #[test]
  fn history_is_bounded_and_reset_clears() {
    let t = UsageTracker::new();
    for i in 0..(HISTORY_LIMIT as u64 + 5) {
      t.record(UsageRecord::new("m", "op", i, 0, 0));
    }
    let s = t.snapshot();
    assert_eq!(s.total_calls, HISTORY_LIMIT as u64 + 5);
    assert_eq!(s.recent_calls.len(), RECENT_LIMIT);
    assert_eq!(s.recent_calls.last().map(|r| r.input_tokens), Some(HISTORY_LIMIT as u64 + 4));
    assert_eq!(t.with_state(|st| st.history.len()), HISTORY_LIMIT);

    t.reset();
    assert_eq!(t.snapshot().total_calls, 0);
  }
}
