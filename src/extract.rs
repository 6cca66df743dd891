//! Isolating the interesting part of a model response.
//!
//! Models wrap JSON and code in markdown fences and surround it with prose.
//! `extract_json_block` returns the candidate JSON text; `extract_code_block`
//! returns the body of a fenced code response.

/// Strip a leading fence line (```` ``` ```` or ```` ```json ````) and a trailing fence line.
pub fn strip_fences(raw: &str) -> &str {
  let text = raw.trim();
  if !text.starts_with("```") {
    return text;
  }
  let body = match text.find('\n') {
    Some(nl) => &text[nl + 1..],
    None => text.trim_start_matches('`'),
  };
  let body = body.trim_end();
  let body = body.strip_suffix("```").unwrap_or(body);
  body.trim()
}

/// First `{...}` or `[...]` span. The span runs to the LAST closer of the same
/// kind, since LaTeX inside string values routinely carries nested braces.
/// Without any span the trimmed, unfenced text is returned.
pub fn extract_json_block(raw: &str) -> &str {
  let text = strip_fences(raw);
  for (start, ch) in text.char_indices() {
    let closer = match ch {
      '{' => '}',
      '[' => ']',
      _ => continue,
    };
    if let Some(end) = text.rfind(closer) {
      if end > start {
        return &text[start..=end];
      }
    }
  }
  text
}

/// Code body of a fenced response: drop the opening fence line and stop at the
/// next line that is a bare fence.
pub fn extract_code_block(raw: &str) -> String {
  let text = raw.trim();
  if !text.starts_with("```") {
    return text.to_string();
  }
  text
    .lines()
    .skip(1)
    .take_while(|line| line.trim() != "```")
    .collect::<Vec<_>>()
    .join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strips_language_tagged_fence() {
    let raw = "```json\n{\"a\": 1}\n```";
    assert_eq!(extract_json_block(raw), "{\"a\": 1}");
  }

  #[test]
  fn strips_bare_fence() {
    let raw = "```\n[1, 2, 3]\n```\n";
    assert_eq!(extract_json_block(raw), "[1, 2, 3]");
  }

  #[test]
  fn finds_object_inside_prose() {
    let raw = "Sure! Here is the result: {\"x\": \"$\\frac{1}{2}$\"} Hope it helps.";
    assert_eq!(extract_json_block(raw), "{\"x\": \"$\\frac{1}{2}$\"}");
  }

  #[test]
  fn span_is_greedy_to_last_brace() {
    let raw = "{\"a\": {\"b\": 1}} trailing {\"c\": 2}";
    assert_eq!(extract_json_block(raw), raw);
  }

  #[test]
  fn array_first_when_it_comes_first() {
    let raw = "list: [{\"a\": 1}, {\"a\": 2}] done";
    assert_eq!(extract_json_block(raw), "[{\"a\": 1}, {\"a\": 2}]");
  }

  #[test]
  fn no_span_returns_trimmed_text() {
    assert_eq!(extract_json_block("   not json at all  "), "not json at all");
    assert_eq!(extract_json_block("} backwards {"), "} backwards {");
  }

  #[test]
  fn code_block_stops_at_closing_fence() {
    let raw = "```javascript\nfunction f() {}\nreturn 1;\n```\nThis code does things.";
    assert_eq!(extract_code_block(raw), "function f() {}\nreturn 1;");
    assert_eq!(extract_code_block("  function g() {}  "), "function g() {}");
  }
}
