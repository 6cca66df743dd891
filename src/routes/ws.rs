//! WebSocket upgrade + message loop. Each client message is parsed as JSON and
//! dispatched. A generation request streams `progress` messages while the
//! pipeline runs on its own task, then ends with one `batch` or `error`.

use std::sync::Arc;
use std::time::Duration;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use tracing::{info, error, instrument, debug, warn};

use crate::domain::Question;
use crate::error::{OracleError, PipelineError};
use crate::oracle::image_data_url;
use crate::progress::{self, ProgressRelay};
use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::state::AppState;

const PROGRESS_CAPACITY: usize = 256;
const PROGRESS_POLL: Duration = Duration::from_millis(500);

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "qvariant_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "qvariant_backend", "WebSocket connected");
  while let Some(Ok(msg)) = socket.recv().await {
    match msg {
      Message::Text(txt) => {
        let sent = match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(ClientWsMessage::Ping) => send(&mut socket, &ServerWsMessage::Pong).await,
          Ok(ClientWsMessage::GenerateVariants { question, max_retries, image }) => {
            debug!(target: "qvariant_backend", question = %question.number, ?max_retries, has_image = image.is_some(), "WS generate_variants received");
            generate(&mut socket, &state, question, max_retries, image).await
          }
          Err(e) => send(&mut socket, &ServerWsMessage::bad_request(format!("Invalid JSON: {}", e))).await,
        };
        if !sent {
          break;
        }
      }
      Message::Ping(payload) => { let _ = socket.send(Message::Pong(payload)).await; }
      Message::Close(_) => break,
      _ => {}
    }
  }
  info!(target: "qvariant_backend", "WebSocket disconnected");
}

/// Run one generation and relay its progress. Returns false once the socket is gone.
async fn generate(
  socket: &mut WebSocket,
  state: &AppState,
  question: Question,
  max_retries: Option<u32>,
  image: Option<String>,
) -> bool {
  let image = match image.as_deref().map(image_data_url).transpose() {
    Ok(i) => i,
    Err(e) => return send(socket, &ServerWsMessage::bad_request(e)).await,
  };
  let Some(pipeline) = state.pipeline(max_retries) else {
    let err = PipelineError::from(OracleError::NotConfigured);
    let msg = ServerWsMessage::Error {
      message: err.to_string(),
      error_type: Some(err.failure_kind()),
      retry_exhausted: false,
      retry_count: None,
    };
    return send(socket, &msg).await;
  };

  let (sink, rx) = progress::channel(PROGRESS_CAPACITY);
  let worker = tokio::spawn(async move { pipeline.run_with_auto_fix(question, image, &sink).await });
  let mut relay = ProgressRelay::new(rx, worker, PROGRESS_POLL);

  while let Some(event) = relay.next().await {
    if !send(socket, &ServerWsMessage::Progress { event }).await {
      // Client left; the worker finishes on its own and its events are dropped.
      return false;
    }
  }

  let reply = match relay.finish().await {
    Ok(Ok(batch)) => {
      info!(target: "qvariant_backend", verified = batch.verified_count, retry_count = batch.retry_count, "WS batch delivered");
      ServerWsMessage::Batch { batch }
    }
    Ok(Err(failure)) => {
      warn!(target: "qvariant_backend", error_type = ?failure.error_type, message = %failure.message, "WS generation failed");
      failure.into()
    }
    Err(e) => {
      error!(target: "qvariant_backend", error = %e, "Generation task aborted");
      ServerWsMessage::bad_request(format!("generation task aborted: {}", e))
    }
  };
  send(socket, &reply).await
}

async fn send(socket: &mut WebSocket, msg: &ServerWsMessage) -> bool {
  let out = serde_json::to_string(msg).unwrap_or_else(|e| {
    serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
  });
  if let Err(e) = socket.send(Message::Text(out)).await {
    error!(target: "qvariant_backend", error = %e, "WS send error");
    return false;
  }
  true
}
