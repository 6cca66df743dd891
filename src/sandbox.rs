//! Restricted execution of model-generated variant code.
//!
//! The code is JavaScript evaluated in an embedded Boa context. Boa has no
//! filesystem, network or process bindings; on top of the ECMAScript globals
//! the context only sees the prelude below (`random`, `math`, `Fraction`, `re`
//! and a set of python-style builtins). `require` always throws `ImportError`.
//!
//! Every call builds a fresh context on a fresh thread, so nothing leaks
//! between slots and a runaway script never holds an async worker.
//!
//! Outcome mapping:
//! - SyntaxError / ImportError while loading the script -> `Err` (fatal)
//! - anything else (runtime errors, missing entry point, bad return shape,
//!   limits exceeded) -> `Ok(Variant)` with `error` set

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use boa_engine::{Context, JsError, JsValue, Source};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::domain::{Difficulty, Variant};
use crate::error::SandboxError;
use crate::numeric::normalize_variant_json;
use crate::util::trunc_for_log;

/// Bounds applied to every execution.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
  pub loop_iteration_limit: u64,
  pub recursion_limit: usize,
  pub timeout_ms: u64,
  /// Base seed of the prelude PRNG. Unset -> random per executor.
  pub seed: Option<u32>,
}

impl Default for SandboxLimits {
  fn default() -> Self {
    Self { loop_iteration_limit: 1_000_000, recursion_limit: 256, timeout_ms: 2_000, seed: None }
  }
}

const ENTRY_POINT: &str = "generate_variant";

const PRELUDE: &str = r#"
var True = true, False = false, None = null;

function __mulberry32(a) {
  return function () {
    a |= 0; a = a + 0x6D2B79F5 | 0;
    var t = Math.imul(a ^ a >>> 15, 1 | a);
    t = t + Math.imul(t ^ t >>> 7, 61 | t) ^ t;
    return ((t ^ t >>> 14) >>> 0) / 4294967296;
  };
}
var __rng = __mulberry32(1);
function __seed(s) { __rng = __mulberry32(s); }

function require(name) {
  var e = new Error("ImportError: module '" + name + "' is not available");
  e.name = "ImportError";
  throw e;
}

var random = {
  random: function () { return __rng(); },
  seed: function (s) { __seed(s | 0); },
  randint: function (a, b) { return a + Math.floor(__rng() * (b - a + 1)); },
  uniform: function (a, b) { return a + (b - a) * __rng(); },
  choice: function (seq) {
    var pool = Array.from(seq);
    if (!pool.length) throw new Error("IndexError: cannot choose from an empty sequence");
    return pool[Math.floor(__rng() * pool.length)];
  },
  shuffle: function (arr) {
    for (var i = arr.length - 1; i > 0; i--) {
      var j = Math.floor(__rng() * (i + 1));
      var t = arr[i]; arr[i] = arr[j]; arr[j] = t;
    }
    return null;
  },
  sample: function (seq, k) {
    var pool = Array.from(seq);
    if (k > pool.length) throw new Error("ValueError: sample larger than population");
    random.shuffle(pool);
    return pool.slice(0, k);
  }
};

function __gcd(a, b) {
  a = Math.abs(a); b = Math.abs(b);
  while (b) { var t = b; b = a % b; a = t; }
  return a;
}
function __factorial(n) {
  if (!Number.isInteger(n) || n < 0) throw new Error("ValueError: factorial() not defined for " + n);
  var r = 1;
  for (var i = 2; i <= n; i++) r *= i;
  return r;
}

var math = {
  pi: Math.PI, e: Math.E, inf: Infinity, tau: 2 * Math.PI,
  sqrt: Math.sqrt, floor: Math.floor, ceil: Math.ceil, trunc: Math.trunc,
  sin: Math.sin, cos: Math.cos, tan: Math.tan,
  asin: Math.asin, acos: Math.acos, atan: Math.atan, atan2: Math.atan2,
  exp: Math.exp, pow: Math.pow, fabs: Math.abs, hypot: Math.hypot,
  log: function (x, base) { return base === undefined ? Math.log(x) : Math.log(x) / Math.log(base); },
  log10: Math.log10, log2: Math.log2,
  gcd: __gcd,
  lcm: function (a, b) { return a && b ? Math.abs(a * b) / __gcd(a, b) : 0; },
  factorial: __factorial,
  comb: function (n, k) { return k < 0 || k > n ? 0 : Math.round(__factorial(n) / (__factorial(k) * __factorial(n - k))); },
  perm: function (n, k) { return k < 0 || k > n ? 0 : Math.round(__factorial(n) / __factorial(n - k)); },
  isclose: function (a, b, tol) { return Math.abs(a - b) <= (tol === undefined ? 1e-9 : tol) * Math.max(1, Math.abs(a), Math.abs(b)); },
  degrees: function (r) { return r * 180 / Math.PI; },
  radians: function (d) { return d * Math.PI / 180; }
};

function Fraction(n, d) {
  if (!(this instanceof Fraction)) return new Fraction(n, d);
  if (n instanceof Fraction) { d = n.d * (d === undefined ? 1 : d); n = n.n; }
  if (d === undefined) d = 1;
  if (!Number.isInteger(n) || !Number.isInteger(d)) throw new TypeError("Fraction expects integers");
  if (d === 0) throw new Error("ZeroDivisionError: Fraction(" + n + ", 0)");
  if (d < 0) { n = -n; d = -d; }
  var g = __gcd(n, d) || 1;
  this.n = n / g; this.d = d / g;
  this.numerator = this.n; this.denominator = this.d;
}
Fraction.prototype.add = function (o) { o = Fraction(o); return Fraction(this.n * o.d + o.n * this.d, this.d * o.d); };
Fraction.prototype.sub = function (o) { o = Fraction(o); return Fraction(this.n * o.d - o.n * this.d, this.d * o.d); };
Fraction.prototype.mul = function (o) { o = Fraction(o); return Fraction(this.n * o.n, this.d * o.d); };
Fraction.prototype.div = function (o) { o = Fraction(o); return Fraction(this.n * o.d, this.d * o.n); };
Fraction.prototype.eq = function (o) { o = Fraction(o); return this.n === o.n && this.d === o.d; };
Fraction.prototype.valueOf = function () { return this.n / this.d; };
Fraction.prototype.toString = function () { return this.d === 1 ? String(this.n) : this.n + "/" + this.d; };
Fraction.prototype.toLatex = function () {
  if (this.d === 1) return String(this.n);
  var sign = this.n < 0 ? "-" : "";
  return sign + "\\frac{" + Math.abs(this.n) + "}{" + this.d + "}";
};

var re = {
  sub: function (p, r, s) { return String(s).replace(new RegExp(p, "g"), r); },
  match: function (p, s) { return new RegExp("^(?:" + p + ")").exec(String(s)); },
  search: function (p, s) { return new RegExp(p).exec(String(s)); },
  findall: function (p, s) { return String(s).match(new RegExp(p, "g")) || []; },
  split: function (p, s) { return String(s).split(new RegExp(p)); }
};

function range(a, b, s) {
  if (b === undefined) { b = a; a = 0; }
  if (s === undefined) s = 1;
  if (s === 0) throw new Error("ValueError: range() arg 3 must not be zero");
  var out = [];
  if (s > 0) { for (var i = a; i < b; i += s) out.push(i); }
  else { for (var j = a; j > b; j += s) out.push(j); }
  return out;
}
function len(x) {
  if (x === null || x === undefined) throw new TypeError("object of type 'NoneType' has no len()");
  if (typeof x === "string" || Array.isArray(x)) return x.length;
  if (x instanceof Set || x instanceof Map) return x.size;
  return Object.keys(x).length;
}
function str(x) {
  if (x === null || x === undefined) return "None";
  if (x === true) return "True";
  if (x === false) return "False";
  return String(x);
}
function int(x) {
  var v = typeof x === "string" ? parseInt(x, 10) : Math.trunc(Number(x));
  if (isNaN(v)) throw new Error("ValueError: invalid literal for int(): " + x);
  return v;
}
function float(x) {
  var v = Number(x);
  if (isNaN(v)) throw new Error("ValueError: could not convert to float: " + x);
  return v;
}
function bool(x) {
  if (Array.isArray(x) || typeof x === "string") return x.length > 0;
  if (x instanceof Set || x instanceof Map) return x.size > 0;
  return !!x;
}
function list(x) {
  if (x === undefined) return [];
  if (x !== null && typeof x === "object" && typeof x[Symbol.iterator] !== "function") return Object.keys(x);
  return Array.from(x);
}
var tuple = list;
function dict(x) { return Object.assign({}, x || {}); }
function set(x) { return new Set(x === undefined ? [] : x); }
var abs = Math.abs;
function round(x, nd) {
  if (nd === undefined) return Math.round(x);
  var f = Math.pow(10, nd);
  return Math.round(x * f) / f;
}
function __args(a) { return a.length === 1 ? Array.from(a[0]) : Array.prototype.slice.call(a); }
function min() {
  var xs = __args(arguments);
  if (!xs.length) throw new Error("ValueError: min() arg is an empty sequence");
  return xs.reduce(function (m, v) { return v < m ? v : m; });
}
function max() {
  var xs = __args(arguments);
  if (!xs.length) throw new Error("ValueError: max() arg is an empty sequence");
  return xs.reduce(function (m, v) { return v > m ? v : m; });
}
function sum(xs, start) { return Array.from(xs).reduce(function (acc, v) { return acc + v; }, start === undefined ? 0 : start); }
function sorted(xs, key, reverse) {
  var k = typeof key === "function" ? key : function (v) { return v; };
  var out = Array.from(xs).sort(function (a, b) {
    var ka = k(a), kb = k(b);
    return ka < kb ? -1 : ka > kb ? 1 : 0;
  });
  return reverse ? out.reverse() : out;
}
function enumerate(xs, start) {
  var s = start === undefined ? 0 : start;
  return Array.from(xs).map(function (v, i) { return [i + s, v]; });
}
function zip() {
  var arrs = Array.prototype.slice.call(arguments).map(function (a) { return Array.from(a); });
  if (!arrs.length) return [];
  var n = Math.min.apply(null, arrs.map(function (a) { return a.length; }));
  var out = [];
  for (var i = 0; i < n; i++) out.push(arrs.map(function (a) { return a[i]; }));
  return out;
}
function map(f, xs) { return Array.from(xs).map(function (v) { return f(v); }); }
function filter(f, xs) { return Array.from(xs).filter(function (v) { return f === null || f === undefined ? bool(v) : bool(f(v)); }); }
function pow(a, b, m) {
  if (m === undefined) return Math.pow(a, b);
  var r = 1; a = a % m;
  for (var i = 0; i < b; i++) r = (r * a) % m;
  return r;
}
function divmod(a, b) {
  if (b === 0) throw new Error("ZeroDivisionError: integer division or modulo by zero");
  var q = Math.floor(a / b);
  return [q, a - b * q];
}
function isinstance(x, t) {
  if (Array.isArray(t)) return t.some(function (u) { return isinstance(x, u); });
  if (t === int) return Number.isInteger(x);
  if (t === float) return typeof x === "number";
  if (t === str) return typeof x === "string";
  if (t === bool) return typeof x === "boolean";
  if (t === list || t === tuple) return Array.isArray(x);
  if (t === dict) return x !== null && typeof x === "object" && !Array.isArray(x);
  return x instanceof t;
}
function any(xs) { return Array.from(xs).some(bool); }
function all(xs) { return Array.from(xs).every(bool); }
function reversed(xs) { return Array.from(xs).reverse(); }
var __printed = [];
function print() { __printed.push(Array.prototype.slice.call(arguments).map(str).join(" ")); }
"#;

/// Drops every line whose trimmed form starts with `import ` or `from `.
pub fn strip_imports(code: &str) -> String {
  code
    .lines()
    .filter(|line| {
      let t = line.trim_start();
      !(t.starts_with("import ") || t.starts_with("from "))
    })
    .collect::<Vec<_>>()
    .join("\n")
}

type SlotOutcome = Result<Variant, SandboxError>;

/// Upper bound on sandbox threads alive at once, abandoned ones included.
const MAX_LIVE_SLOTS: usize = 64;
static LIVE_SLOTS: AtomicUsize = AtomicUsize::new(0);

/// Counts a running sandbox thread until dropped.
struct LiveSlot;

impl LiveSlot {
  fn acquire() -> Option<Self> {
    LIVE_SLOTS
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < MAX_LIVE_SLOTS).then_some(n + 1))
      .ok()
      .map(|_| LiveSlot)
  }
}

impl Drop for LiveSlot {
  fn drop(&mut self) {
    LIVE_SLOTS.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Runs generated code one slot at a time.
#[derive(Clone, Debug)]
pub struct SandboxExecutor {
  limits: SandboxLimits,
  seed: u32,
}

impl SandboxExecutor {
  pub fn new(limits: SandboxLimits) -> Self {
    let seed = limits.seed.unwrap_or_else(rand::random::<u32>);
    Self { limits, seed }
  }

  /// Execute `generate_variant(difficulty, variant_id)` from `code`.
  ///
  /// The slot runs on its own thread. Once `timeout_ms` passes the slot
  /// becomes a `TimeoutError` variant and the thread is abandoned.
  #[instrument(level = "debug", skip(self, code), fields(%difficulty, variant_id, code_len = code.len()))]
  pub async fn execute(&self, code: &str, difficulty: Difficulty, variant_id: u32) -> Result<Variant, SandboxError> {
    let budget = Duration::from_millis(self.limits.timeout_ms);
    let started = Instant::now();
    let outcome = match self.spawn_slot(code, difficulty, variant_id) {
      Ok(rx) => match tokio::time::timeout(budget, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Ok(Variant::failed(variant_id, difficulty, "sandbox thread ended without a result")),
        Err(_) => {
          warn!(target: "sandbox", variant_id, elapsed_ms = started.elapsed().as_millis() as u64, "Execution over time budget, slot abandoned");
          Ok(Variant::failed(
            variant_id,
            difficulty,
            format!("TimeoutError: execution exceeded {} ms", self.limits.timeout_ms),
          ))
        }
      },
      Err(msg) => {
        warn!(target: "sandbox", variant_id, error = %msg, "Slot not started");
        Ok(Variant::failed(variant_id, difficulty, msg))
      }
    };

    match outcome {
      Ok(v) => {
        if let Some(err) = &v.error {
          debug!(target: "sandbox", variant_id, error = %trunc_for_log(err, 200), "Variant execution failed");
        }
        Ok(v)
      }
      Err(e) => {
        warn!(target: "sandbox", variant_id, error = %e, "Generated code rejected");
        Err(e)
      }
    }
  }

  fn spawn_slot(&self, code: &str, difficulty: Difficulty, variant_id: u32) -> Result<oneshot::Receiver<SlotOutcome>, String> {
    let slot = LiveSlot::acquire()
      .ok_or_else(|| format!("SandboxBusy: {} executions are still running", MAX_LIVE_SLOTS))?;
    let (tx, rx) = oneshot::channel();
    let runner = self.clone();
    let code = code.to_owned();
    std::thread::Builder::new()
      .name(format!("sandbox-{}", variant_id))
      .spawn(move || {
        let _slot = slot;
        // The receiver is gone when the slot timed out.
        let _ = tx.send(runner.run(&code, difficulty, variant_id));
      })
      .map_err(|e| format!("sandbox setup failed: {}", e))?;
    Ok(rx)
  }

  fn run(&self, code: &str, difficulty: Difficulty, variant_id: u32) -> Result<Variant, SandboxError> {
    let mut ctx = Context::default();
    ctx.runtime_limits_mut().set_loop_iteration_limit(self.limits.loop_iteration_limit);
    ctx.runtime_limits_mut().set_recursion_limit(self.limits.recursion_limit);

    if let Err(e) = ctx.eval(Source::from_bytes(PRELUDE)) {
      // Prelude is static; a failure here means the engine itself is unusable.
      let msg = describe(&e, &mut ctx);
      return Ok(Variant::failed(variant_id, difficulty, format!("sandbox setup failed: {}", msg)));
    }
    let seed = self.seed ^ variant_id.wrapping_mul(0x9E37_79B9);
    let seeded = ctx.eval(Source::from_bytes(&format!("__seed({});", seed)));
    if let Err(e) = seeded {
      let msg = describe(&e, &mut ctx);
      return Ok(Variant::failed(variant_id, difficulty, format!("sandbox setup failed: {}", msg)));
    }

    let script = strip_imports(code);
    if let Err(e) = ctx.eval(Source::from_bytes(&script)) {
      let msg = describe(&e, &mut ctx);
      if msg.starts_with("SyntaxError") {
        return Err(SandboxError::Syntax(msg));
      }
      if msg.contains("ImportError") {
        return Err(SandboxError::Import(msg));
      }
      return Ok(Variant::failed(variant_id, difficulty, msg));
    }

    let has_entry = ctx
      .eval(Source::from_bytes(&format!("typeof {} === 'function'", ENTRY_POINT)))
      .ok()
      .and_then(|v| v.as_boolean())
      .unwrap_or(false);
    if !has_entry {
      return Ok(Variant::failed(
        variant_id,
        difficulty,
        format!("EntryPointMissing: function '{}' is not defined", ENTRY_POINT),
      ));
    }

    let call = format!("{}(\"{}\", {})", ENTRY_POINT, difficulty.as_str(), variant_id);
    let returned = match ctx.eval(Source::from_bytes(&call)) {
      Ok(v) => v,
      Err(e) => {
        let msg = describe(&e, &mut ctx);
        return Ok(Variant::failed(variant_id, difficulty, msg));
      }
    };

    Ok(into_variant(returned, &mut ctx, difficulty, variant_id))
  }
}

/// Convert the entry point's return value into a normalized `Variant`.
fn into_variant(returned: JsValue, ctx: &mut Context, difficulty: Difficulty, variant_id: u32) -> Variant {
  if !returned.is_object() {
    let shown = returned.display().to_string();
    return Variant::failed(
      variant_id,
      difficulty,
      format!("TypeError: {} returned {} instead of an object", ENTRY_POINT, trunc_for_log(&shown, 60)),
    );
  }

  let mut json = match returned.to_json(ctx) {
    Ok(Value::Object(map)) => Value::Object(map),
    Ok(other) => {
      return Variant::failed(
        variant_id,
        difficulty,
        format!("TypeError: {} returned {} instead of an object", ENTRY_POINT, json_kind(&other)),
      )
    }
    Err(e) => {
      let msg = describe(&e, ctx);
      return Variant::failed(variant_id, difficulty, format!("could not convert result: {}", msg));
    }
  };

  normalize_variant_json(&mut json);
  if let Some(obj) = json.as_object_mut() {
    obj.insert("variant_id".into(), Value::from(variant_id));
    obj.insert("difficulty".into(), Value::from(difficulty.as_str()));
    obj.remove("verification");
    obj.retain(|_, v| !v.is_null());
  }

  match serde_json::from_value::<Variant>(json) {
    Ok(v) => v,
    Err(e) => Variant::failed(variant_id, difficulty, format!("invalid variant shape: {}", e)),
  }
}

fn json_kind(v: &Value) -> &'static str {
  match v {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

/// "Kind: message" for native errors; display form for anything else thrown.
fn describe(err: &JsError, ctx: &mut Context) -> String {
  match err.try_native(ctx) {
    Ok(native) => native.to_string(),
    Err(_) => err.to_string(),
  }
}
