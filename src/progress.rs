//! Progress reporting across the worker/transport boundary.
//!
//! The pipeline reports through `ProgressSink` (synchronous, fire-and-forget).
//! `ChannelSink` pushes into a bounded tokio channel; `ProgressRelay` is the
//! consuming side: it polls with a short timeout while the worker runs and
//! drains whatever is left once it has finished.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStep {
  Start,
  Generate,
  AutoRetry,
  CodeGen,
  ExecCode,
  SolveOriginal,
  Verify,
  AutoFix,
  AutoFixed,
  AutoFixFailed,
  Generated,
  Complete,
  Error,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ProgressEvent {
  pub step: ProgressStep,
  /// 0..=100
  pub progress: u8,
  pub message: String,
  #[serde(skip_serializing_if = "Map::is_empty")]
  pub details: Map<String, Value>,
}

impl ProgressEvent {
  pub fn new(step: ProgressStep, progress: u8, message: impl Into<String>) -> Self {
    Self { step, progress: progress.min(100), message: message.into(), details: Map::new() }
  }

  pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
    self.details.insert(key.to_string(), value.into());
    self
  }
}

pub trait ProgressSink: Send + Sync {
  fn report(&self, event: ProgressEvent);
}

/// Forwards events with progress raised to the highest value seen so far.
pub struct MonotonicSink<'a> {
  inner: &'a dyn ProgressSink,
  high: AtomicU8,
}

impl<'a> MonotonicSink<'a> {
  pub fn new(inner: &'a dyn ProgressSink) -> Self {
    Self { inner, high: AtomicU8::new(0) }
  }
}

impl ProgressSink for MonotonicSink<'_> {
  fn report(&self, mut event: ProgressEvent) {
    let prev = self.high.fetch_max(event.progress, Ordering::SeqCst);
    event.progress = event.progress.max(prev);
    self.inner.report(event);
  }
}

/// Bounded channel producer. A full or closed channel drops the event.
#[derive(Clone)]
pub struct ChannelSink {
  tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSink for ChannelSink {
  fn report(&self, event: ProgressEvent) {
    if let Err(e) = self.tx.try_send(event) {
      debug!(target: "variants", error = %e, "Progress event dropped");
    }
  }
}

pub fn channel(capacity: usize) -> (ChannelSink, mpsc::Receiver<ProgressEvent>) {
  let (tx, rx) = mpsc::channel(capacity);
  (ChannelSink { tx }, rx)
}

/// Consumer side of a worker task and its progress channel.
pub struct ProgressRelay<T> {
  rx: mpsc::Receiver<ProgressEvent>,
  worker: JoinHandle<T>,
  poll: Duration,
}

impl<T> ProgressRelay<T> {
  pub fn new(rx: mpsc::Receiver<ProgressEvent>, worker: JoinHandle<T>, poll: Duration) -> Self {
    Self { rx, worker, poll }
  }

  /// Next event in report order; `None` once the worker is done and the queue is empty.
  pub async fn next(&mut self) -> Option<ProgressEvent> {
    loop {
      if self.worker.is_finished() {
        return self.rx.try_recv().ok();
      }
      match tokio::time::timeout(self.poll, self.rx.recv()).await {
        Ok(Some(ev)) => return Some(ev),
        Ok(None) => return None,
        Err(_) => continue,
      }
    }
  }

  /// Worker's result. Call after `next` returned `None`.
  pub async fn finish(self) -> Result<T, JoinError> {
    self.worker.await
  }
}
