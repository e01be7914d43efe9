//! Engine event stream.
//!
//! Every event goes to every attached sink, in emission order. Each sink has
//! its own bounded channel and forwarding task, so a slow sink applies
//! back-pressure to the engine instead of buffering without limit. Closing
//! the bus waits until every sink has handled every event.

use std::collections::BTreeMap;

use serde::Serialize;
use strata_core::{PropertyMap, Urn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::step::{ChangeKind, StepMetadata, StepStatus};
use crate::summary::{Operation, RunResult};
use crate::BoxFuture;

#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub sequence: u64,
    pub timestamp: jiff::Timestamp,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Prelude {
        run_id: Uuid,
        operation: Operation,
        stack: String,
        project: String,
        parallelism: usize,
    },
    ResourcePre {
        step: StepMetadata,
        preview: bool,
    },
    ResourcePost {
        step: StepMetadata,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Final outputs with secrets masked.
        #[serde(skip_serializing_if = "Option::is_none")]
        outputs: Option<PropertyMap>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
    },
    Diagnostic {
        severity: Severity,
        #[serde(skip_serializing_if = "Option::is_none")]
        urn: Option<Urn>,
        message: String,
    },
    Summary {
        result: RunResult,
        counts: BTreeMap<ChangeKind, usize>,
        failed: usize,
        skipped: usize,
        duration_ms: u64,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// A consumer of engine events.
pub trait EventSink: Send + 'static {
    fn handle(&mut self, event: EngineEvent) -> BoxFuture<'_, ()>;

    /// Called once after the last event.
    fn finish(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

struct Outlets {
    sequence: u64,
    senders: Vec<mpsc::Sender<EngineEvent>>,
}

pub struct EventBus {
    buffer: usize,
    outlets: Mutex<Outlets>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            outlets: Mutex::new(Outlets {
                sequence: 0,
                senders: Vec::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attach a sink. It receives events emitted after this call.
    pub fn attach<S: EventSink>(&mut self, mut sink: S) {
        let (tx, mut rx) = mpsc::channel::<EngineEvent>(self.buffer);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.handle(event).await;
            }
            sink.finish().await;
        });
        self.outlets.get_mut().senders.push(tx);
        self.tasks.get_mut().push(task);
    }

    pub fn with<S: EventSink>(mut self, sink: S) -> Self {
        self.attach(sink);
        self
    }

    pub async fn emit(&self, kind: EventKind) {
        let mut outlets = self.outlets.lock().await;
        outlets.sequence += 1;
        let event = EngineEvent {
            sequence: outlets.sequence,
            timestamp: jiff::Timestamp::now(),
            kind,
        };
        for sender in &outlets.senders {
            if sender.send(event.clone()).await.is_err() {
                tracing::debug!(sequence = event.sequence, "event sink already stopped");
            }
        }
    }

    pub async fn diagnostic(&self, severity: Severity, urn: Option<&Urn>, message: impl Into<String>) {
        self.emit(EventKind::Diagnostic {
            severity,
            urn: urn.cloned(),
            message: message.into(),
        })
        .await;
    }

    /// Stop accepting events and wait for every sink to drain.
    pub async fn close(&self) {
        self.outlets.lock().await.senders.clear();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "event sink task failed");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_EVENT_BUFFER)
    }
}

// ── Sinks ───────────────────────────────────────────────────────────────────

/// Forwards events to a bounded channel.
pub struct ChannelSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: EngineEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // A consumer that hung up does not stop the run.
            let _ = self.tx.send(event).await;
        })
    }
}

/// Logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&mut self, event: EngineEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match &event.kind {
                EventKind::Prelude {
                    run_id,
                    operation,
                    stack,
                    ..
                } => {
                    tracing::info!(run_id = %run_id, operation = ?operation, stack = %stack, "run started");
                }
                EventKind::ResourcePre { step, preview } => {
                    tracing::info!(urn = %step.urn, op = ?step.op, preview, "step started");
                }
                EventKind::ResourcePost {
                    step,
                    status,
                    error,
                    duration_ms,
                    ..
                } => match error {
                    Some(error) => tracing::warn!(
                        urn = %step.urn,
                        op = ?step.op,
                        status = ?status,
                        error = %error,
                        "step finished"
                    ),
                    None => tracing::info!(
                        urn = %step.urn,
                        op = ?step.op,
                        status = ?status,
                        duration_ms,
                        "step finished"
                    ),
                },
                EventKind::Diagnostic {
                    severity,
                    urn,
                    message,
                } => {
                    let urn = urn.as_ref().map(Urn::as_str).unwrap_or_default();
                    match severity {
                        Severity::Error => tracing::error!(urn, "{message}"),
                        Severity::Warning => tracing::warn!(urn, "{message}"),
                        Severity::Info => tracing::info!(urn, "{message}"),
                        Severity::Debug => tracing::debug!(urn, "{message}"),
                    }
                }
                EventKind::Summary {
                    result,
                    failed,
                    skipped,
                    duration_ms,
                    cancelled,
                    ..
                } => {
                    tracing::info!(
                        result = ?result,
                        failed,
                        skipped,
                        duration_ms,
                        cancelled,
                        "run finished"
                    );
                }
            }
        })
    }
}

/// Writes each event as one line of JSON.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W> EventSink for JsonLinesSink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn handle(&mut self, event: EngineEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(sequence = event.sequence, error = %e, "failed to encode event");
                    return;
                }
            };
            line.push(b'\n');
            if let Err(e) = self.writer.write_all(&line).await {
                tracing::warn!(error = %e, "failed to write event");
            }
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.writer.flush().await {
                tracing::warn!(error = %e, "failed to flush events");
            }
        })
    }
}
