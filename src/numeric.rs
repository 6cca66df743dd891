//! Cleanup of floating-point artifacts in generated variants.
//!
//! Generated code computes with plain doubles, so choice texts come back as
//! `0.30000000000000004` or `5.0`. Numbers are rounded to two decimals and
//! integral values lose their fraction. Strings are never touched.

use serde_json::Value;

use crate::domain::CHOICE_SYMBOLS;

/// Display form of a non-string scalar. `None` for strings, arrays, objects and null.
pub fn format_number(value: &Value) -> Option<String> {
  match value {
    Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        return Some(i.to_string());
      }
      if let Some(u) = n.as_u64() {
        return Some(u.to_string());
      }
      n.as_f64().map(format_float)
    }
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

fn format_float(x: f64) -> String {
  let rounded = (x * 100.0).round() / 100.0;
  if rounded.fract() == 0.0 && rounded.abs() < 1e15 {
    // `as i64` also folds -0.0 into 0
    (rounded as i64).to_string()
  } else {
    rounded.to_string()
  }
}

/// Normalize `choices[].text` and `answer` in a raw variant mapping, in place.
/// An answer that contains a choice symbol is left alone.
pub fn normalize_variant_json(variant: &mut Value) {
  let Some(obj) = variant.as_object_mut() else { return };

  if let Some(Value::Array(choices)) = obj.get_mut("choices") {
    for choice in choices.iter_mut() {
      if let Some(text) = choice.get_mut("text") {
        if let Some(s) = format_number(text) {
          *text = Value::String(s);
        }
      }
    }
  }

  if let Some(answer) = obj.get_mut("answer") {
    let is_symbol = answer
      .as_str()
      .map(|s| CHOICE_SYMBOLS.iter().any(|sym| s.contains(sym)))
      .unwrap_or(false);
    if !is_symbol {
      if let Some(s) = format_number(answer) {
        *answer = Value::String(s);
      }
    }
  }
}
