//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! Each handler is instrumented and log include parameters and basic result info.

use std::sync::Arc;
use axum::{extract::State, http::StatusCode, Json, response::IntoResponse};
use tracing::{info, instrument, warn};

use crate::json_repair::repair_json;
use crate::protocol::*;
use crate::state::AppState;

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut { ok: true, oracle: state.oracle.is_some() })
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_usage(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  let snapshot = state.usage.snapshot();
  let summary = snapshot.summary();
  Json(UsageOut { snapshot, summary })
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_usage_reset(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  state.usage.reset();
  info!(target: "qvariant_backend", "Usage counters reset");
  Json(ResetOut { ok: true })
}

#[instrument(level = "info", skip(body), fields(text_len = body.text.len()))]
pub async fn http_post_repair_json(Json(body): Json<RepairJsonIn>) -> impl IntoResponse {
  match repair_json(&body.text) {
    Ok(value) => (StatusCode::OK, Json(RepairJsonOut { ok: true, value: Some(value), error: None })),
    Err(e) => {
      warn!(target: "qvariant_backend", error = %e, "repair_json rejected payload");
      (StatusCode::UNPROCESSABLE_ENTITY, Json(RepairJsonOut { ok: false, value: None, error: Some(e.to_string()) }))
    }
  }
}
