//! Router assembly: HTTP endpoints, WebSocket upgrade, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - WebSocket at `/ws` (variant generation with streamed progress)
/// - REST-ish API under `/api/v1/...`
/// - CORS (allow any origin/method/headers); adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws", get(ws::ws_upgrade))
        // HTTP API
        .route("/api/v1/health", get(http::http_health))
        .route("/api/v1/usage", get(http::http_get_usage))
        .route("/api/v1/usage/reset", post(http::http_post_usage_reset))
        .route("/api/v1/repair_json", post(http::http_post_repair_json))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::AgentConfig;
    use crate::oracle::testing::ScriptedOracle;
    use crate::oracle::{Oracle, OracleRequest};
    use crate::usage::{UsageRecorder, UsageTracker};

    fn state(oracle: Option<Arc<dyn Oracle>>) -> Arc<AppState> {
        let usage: Arc<dyn UsageRecorder> = Arc::new(UsageTracker::new());
        Arc::new(AppState::from_parts(oracle, usage, AgentConfig::default()))
    }

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_oracle_availability() {
        let st = state(None);
        let res = build_router(st)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let v = json_body(res).await;
        assert_eq!(v["ok"], true);
        assert_eq!(v["oracle"], false);
    }

    #[tokio::test]
    async fn repair_json_endpoint_restores_latex() {
        let st = state(None);
        let payload = serde_json::json!({ "text": "```json\n{\"q\": \"$\\frac{1}{2}$\"}\n```" });
        let res = build_router(st)
            .oneshot(
                Request::post("/api/v1/repair_json")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let v = json_body(res).await;
        assert_eq!(v["value"]["q"], "$\\frac{1}{2}$");

        let st = state(None);
        let res = build_router(st)
            .oneshot(
                Request::post("/api/v1/repair_json")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text": "no json at all"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(res).await["ok"], false);
    }

    #[tokio::test]
    async fn oracle_calls_show_up_in_usage_until_reset() {
        let scripted: Arc<dyn Oracle> = Arc::new(ScriptedOracle::new().reply("hello"));
        let st = state(Some(scripted));
        let oracle = st.oracle.clone().unwrap();
        oracle.generate(OracleRequest::new("verify", "sys", "prompt")).await.unwrap();

        let app = build_router(st);
        let res = app
            .clone()
            .oneshot(Request::get("/api/v1/usage").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let v = json_body(res).await;
        assert_eq!(v["total_calls"], 1);
        assert_eq!(v["by_operation"]["verify"]["calls"], 1);
        assert!(v["summary"].as_str().unwrap().contains("oracle calls: 1"));

        let res = app
            .clone()
            .oneshot(Request::post("/api/v1/usage/reset").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let res = app
            .oneshot(Request::get("/api/v1/usage").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(res).await["total_calls"], 0);
    }
}
