//! Best-effort JSON recovery for model output.
//!
//! Strategies, first success wins:
//!   1. parse as-is (unfenced text, then the extracted block)
//!   2. escape repair: double backslashes that do not start a valid JSON escape
//!   3. control-character strip, then 1-2 again
//!   4. raw newlines inside strings collapsed to a space, then 1-2 again
//!   5. all of the above combined
//!
//! Every strategy is idempotent and leaves valid JSON byte-identical.
//!
//! `repair_json` additionally runs `restore_escapes`: a LaTeX command such as
//! `\frac` or `\theta` is a *valid* JSON escape followed by letters, so the
//! decoder turns it into a control character. Those are mapped back to the
//! two-character form.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::RepairError;
use crate::extract::{extract_json_block, strip_fences};
use crate::util::trunc_for_log;

type Strategy = fn(&str) -> String;

const STRATEGIES: [(&str, Strategy); 6] = [
  ("escape_repair", repair_escapes),
  ("strip_control", strip_control_chars),
  ("strip_control+escape_repair", |s| repair_escapes(&strip_control_chars(s))),
  ("collapse_newlines", collapse_string_newlines),
  ("collapse_newlines+escape_repair", |s| repair_escapes(&collapse_string_newlines(s))),
  ("combined", |s| repair_escapes(&collapse_string_newlines(&strip_control_chars(s)))),
];

/// Parse model text into JSON, trying every repair strategy before giving up.
#[instrument(level = "debug", skip(text), fields(text_len = text.len()))]
pub fn repair(text: &str) -> Result<Value, RepairError> {
  if let Ok(v) = serde_json::from_str::<Value>(strip_fences(text)) {
    return Ok(v);
  }

  let candidate = extract_json_block(text);
  let first_err = match serde_json::from_str::<Value>(candidate) {
    Ok(v) => return Ok(v),
    Err(e) => e,
  };

  for (name, strategy) in STRATEGIES {
    if let Ok(v) = serde_json::from_str::<Value>(&strategy(candidate)) {
      debug!(target: "variants", strategy = name, "JSON recovered");
      return Ok(v);
    }
  }

  Err(RepairError::MalformedPayload {
    reason: first_err.to_string(),
    preview: trunc_for_log(candidate, 120),
  })
}

/// `repair` followed by the escape-restore pass.
pub fn repair_json(text: &str) -> Result<Value, RepairError> {
  repair(text).map(restore_escapes)
}

/// `repair_json` into a typed structure. Shape mismatches are reported as malformed payloads.
pub fn repair_json_as<T: DeserializeOwned>(text: &str) -> Result<T, RepairError> {
  let value = repair_json(text)?;
  serde_json::from_value(value).map_err(|e| RepairError::MalformedPayload {
    reason: format!("unexpected shape: {}", e),
    preview: trunc_for_log(text.trim(), 120),
  })
}

/// Number of consecutive backslashes directly before `idx`.
fn preceding_backslashes(chars: &[char], idx: usize) -> usize {
  chars[..idx].iter().rev().take_while(|c| **c == '\\').count()
}

fn is_valid_escape(chars: &[char], at: usize) -> bool {
  match chars.get(at) {
    Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't') => true,
    Some('u') => {
      chars.len() > at + 4 && chars[at + 1..at + 5].iter().all(|c| c.is_ascii_hexdigit())
    }
    _ => false,
  }
}

/// Double every in-string backslash that does not begin a valid JSON escape.
/// A quote toggles string state only when preceded by an even run of backslashes.
pub fn repair_escapes(text: &str) -> String {
  let chars: Vec<char> = text.chars().collect();
  let mut out = String::with_capacity(text.len() + 16);
  let mut in_string = false;
  let mut i = 0;

  while i < chars.len() {
    let c = chars[i];
    if c == '"' {
      if preceding_backslashes(&chars, i) % 2 == 0 {
        in_string = !in_string;
      }
      out.push(c);
      i += 1;
      continue;
    }

    if in_string && c == '\\' && i + 1 < chars.len() {
      if chars[i + 1] == '\\' {
        out.push_str("\\\\");
        i += 2;
        continue;
      }
      if !is_valid_escape(&chars, i + 1) {
        out.push_str("\\\\");
        i += 1;
        continue;
      }
    }

    out.push(c);
    i += 1;
  }
  out
}

/// Drop U+0000..U+001F except tab, LF and CR.
pub fn strip_control_chars(text: &str) -> String {
  text
    .chars()
    .filter(|c| !matches!(*c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}'))
    .collect()
}

/// Inside string literals, turn raw CR, LF, CRLF and tab into a single space.
pub fn collapse_string_newlines(text: &str) -> String {
  let chars: Vec<char> = text.chars().collect();
  let mut out = String::with_capacity(text.len());
  let mut in_string = false;
  let mut i = 0;

  while i < chars.len() {
    let c = chars[i];
    match c {
      '"' => {
        if preceding_backslashes(&chars, i) % 2 == 0 {
          in_string = !in_string;
        }
        out.push(c);
      }
      '\r' if in_string => {
        if chars.get(i + 1) == Some(&'\n') {
          i += 1;
        }
        out.push(' ');
      }
      '\n' | '\t' if in_string => out.push(' '),
      _ => out.push(c),
    }
    i += 1;
  }
  out
}

/// Rewrite decoded control characters back into their escape spelling, recursively.
pub fn restore_escapes(value: Value) -> Value {
  match value {
    Value::String(s) => Value::String(restore_str(&s)),
    Value::Array(items) => Value::Array(items.into_iter().map(restore_escapes).collect()),
    Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, restore_escapes(v))).collect()),
    other => other,
  }
}

fn restore_str(s: &str) -> String {
  if !s.contains(['\u{c}', '\t', '\n', '\r', '\u{8}']) {
    return s.to_string();
  }
  let mut out = String::with_capacity(s.len() + 8);
  for c in s.chars() {
    match c {
      '\u{c}' => out.push_str("\\f"),
      '\t' => out.push_str("\\t"),
      '\n' => out.push_str("\\n"),
      '\r' => out.push_str("\\r"),
      '\u{8}' => out.push_str("\\b"),
      other => out.push(other),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const CLEAN: &[&str] = &[
    r#"{"a": 1, "b": [true, false, null], "c": {"d": "e"}}"#,
    r#"[1, 2.5, -3e2, "x", {"y": []}]"#,
    r#"{"escaped": "quote \" slash \\ solidus \/ unicode \u00e9 \u4E2D"}"#,
    r#"{"latex": "$\\frac{a}{b}$ and \\theta"}"#,
    r#"{"korean": "정답은 ③ 입니다", "emoji": "✅"}"#,
    r#""just a string""#,
    "42",
  ];

  #[test]
  fn clean_json_round_trips_through_repair() {
    for text in CLEAN {
      let direct: Value = serde_json::from_str(text).unwrap();
      assert_eq!(repair(text).unwrap(), direct, "input: {}", text);
    }
  }

  #[test]
  fn strategies_are_noops_on_clean_json() {
    for text in CLEAN {
      for (name, strategy) in STRATEGIES {
        assert_eq!(strategy(text), *text, "strategy {} changed {}", name, text);
      }
    }
  }

  #[test]
  fn latex_commands_survive_restore_pass() {
    let text = r#"{"q": "$\frac{1}{2}$ and \theta"}"#;
    let v = repair_json(text).unwrap();
    let q = v["q"].as_str().unwrap();
    assert!(q.contains(r"\frac"), "got {:?}", q);
    assert!(q.contains(r"\theta"), "got {:?}", q);
    assert!(!q.contains('\u{c}') && !q.contains('\t'));
  }

  #[test]
  fn invalid_latex_escapes_are_doubled() {
    let text = r#"{"q": "$\sqrt{2}$ \alpha \underline{x} \{ \}"}"#;
    assert!(serde_json::from_str::<Value>(text).is_err());
    let v = repair_json(text).unwrap();
    assert_eq!(v["q"], r"$\sqrt{2}$ \alpha \underline{x} \{ \}");
  }

  #[test]
  fn escape_repair_is_idempotent() {
    let inputs = [
      r#"{"q": "\sqrt{x} \\ \" \frac \u12 \u00e9"}"#,
      r#"{"a": "\\\"", "b": "\q"}"#,
      r#"prose "with \unknown" and \outside"#,
      r#"{"trailing": "x\"#,
    ];
    for s in inputs {
      let once = repair_escapes(s);
      assert_eq!(repair_escapes(&once), once, "input: {}", s);
    }
  }

  #[test]
  fn backslashes_outside_strings_are_untouched() {
    assert_eq!(repair_escapes(r#"\x {"a": "\y"}"#), r#"\x {"a": "\\y"}"#);
  }

  #[test]
  fn control_characters_are_stripped() {
    let text = "{\"a\": \"x\u{1}y\u{1f}z\"}";
    assert_eq!(repair_json(text).unwrap(), json!({"a": "xyz"}));
    let once = strip_control_chars(text);
    assert_eq!(strip_control_chars(&once), once);
  }

  #[test]
  fn raw_newlines_in_strings_collapse_to_space() {
    let text = "{\"a\": \"line one\nline two\r\nline three\",\n\"b\": 2}";
    assert_eq!(repair_json(text).unwrap(), json!({"a": "line one line two line three", "b": 2}));
    let once = collapse_string_newlines(text);
    assert_eq!(collapse_string_newlines(&once), once);
  }

  #[test]
  fn mixed_damage_needs_combined_strategy() {
    let text = "Result:\n```json\n{\"q\": \"\\sqrt{2}\u{2}\nnext\"}\n```";
    assert_eq!(repair_json(text).unwrap(), json!({"q": "\\sqrt{2} next"}));
  }

  #[test]
  fn restore_walks_nested_structures() {
    let v = json!({"a": ["x\ny", {"b": "\u{8}eta"}], "n": 3, "t": "\theta"});
    assert_eq!(
      restore_escapes(v),
      json!({"a": ["x\\ny", {"b": "\\beta"}], "n": 3, "t": "\\theta"})
    );
  }

  #[test]
  fn hopeless_input_is_malformed_payload() {
    for text in ["no json here", "{\"a\": }", "```json\n{\"open\": [1, 2\n```"] {
      match repair(text) {
        Err(RepairError::MalformedPayload { reason, .. }) => assert!(!reason.is_empty()),
        other => panic!("expected malformed payload for {:?}, got {:?}", text, other),
      }
    }
  }

  #[test]
  fn typed_repair_reports_shape_errors() {
    #[derive(serde::Deserialize, Debug)]
    struct Shape {
      #[allow(dead_code)]
      n: u32,
    }
    assert!(repair_json_as::<Shape>("{\"n\": 4}").is_ok());
    let err = repair_json_as::<Shape>("{\"n\": \"four\"}").unwrap_err();
    assert!(err.to_string().contains("unexpected shape"));
  }
}
