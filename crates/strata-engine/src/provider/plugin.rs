use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{
    CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest, DiffRequest,
    DiffResponse, ReadRequest, ReadResponse, ResourceProvider, UpdateRequest, UpdateResponse,
};
use crate::error::{PartialState, ProviderError};
use crate::BoxFuture;

type Reply = Result<serde_json::Value, ProviderError>;
type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Reply>>>>;

#[derive(Serialize)]
struct WireRequest<'a, P> {
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct WireResponse {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    message: String,
    #[serde(default)]
    partial: Option<PartialState>,
}

/// A provider running as a child process, spoken to with newline-delimited
/// JSON over its stdin and stdout.
///
/// Requests are `{id, method, params}`; responses are `{id, result}` or
/// `{id, error: {message, partial?}}` and may arrive in any order. Calls
/// are matched to responses by id, so any number can be in flight.
pub struct PluginProvider {
    name: String,
    next_id: AtomicU64,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    reader: JoinHandle<()>,
    _child: Option<Child>,
}

impl PluginProvider {
    /// Launch `program` and connect to its stdio.
    pub fn spawn(name: &str, program: &Path, args: &[String]) -> Result<Self, ProviderError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::Unavailable(format!("failed to start {}: {e}", program.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Unavailable("plugin stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Unavailable("plugin stdout not captured".into()))?;

        tracing::info!(provider = %name, program = %program.display(), "provider plugin started");
        let mut provider = Self::connect(name, stdout, stdin);
        provider._child = Some(child);
        Ok(provider)
    }

    /// Speak the plugin protocol over an existing byte stream pair.
    pub fn connect<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::default();
        let reader = tokio::spawn(read_responses(
            name.to_string(),
            BufReader::new(reader),
            pending.clone(),
        ));
        Self {
            name: name.to_string(),
            next_id: AtomicU64::new(1),
            writer: Mutex::new(Box::new(writer)),
            pending,
            reader,
            _child: None,
        }
    }

    async fn call<P, T>(&self, method: &str, params: P) -> Result<T, ProviderError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            id,
            pending: &self.pending,
        };

        self.send(&WireRequest { id, method, params }).await?;

        let value = rx.await.map_err(|_| {
            ProviderError::Unavailable(format!("provider '{}' went away", self.name))
        })??;
        serde_json::from_value(value)
            .map_err(|e| ProviderError::Protocol(format!("bad {method} result: {e}")))
    }

    async fn send<P: Serialize>(&self, request: &WireRequest<'_, P>) -> Result<(), ProviderError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|e| ProviderError::Protocol(format!("cannot encode request: {e}")))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;
        written.map_err(|e| ProviderError::Unavailable(format!("write to '{}': {e}", self.name)))
    }
}

impl Drop for PluginProvider {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes a call's reply slot if the call is abandoned before the
/// response arrives.
struct PendingGuard<'a> {
    id: u64,
    pending: &'a PendingMap,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_responses<R>(name: String, reader: BufReader<R>, pending: PendingMap)
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(provider = %name, error = %e, "provider stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<WireResponse>(&line) {
            Ok(response) => response,
            Err(e) => {
                // Salvage the id so the caller fails instead of hanging.
                let id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64));
                tracing::warn!(provider = %name, error = %e, "malformed provider response");
                if let Some(tx) = id.and_then(|id| lock(&pending).remove(&id)) {
                    let _ = tx.send(Err(ProviderError::Protocol(format!(
                        "malformed response: {e}"
                    ))));
                }
                continue;
            }
        };

        let outcome = match (reply.result, reply.error) {
            (_, Some(error)) => Err(ProviderError::Failed {
                message: error.message,
                partial: error.partial,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        };

        match lock(&pending).remove(&reply.id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::debug!(provider = %name, id = reply.id, "response for unknown request");
            }
        }
    }

    tracing::info!(provider = %name, "provider stream closed");
    let orphaned: Vec<_> = lock(&pending).drain().collect();
    for (_, tx) in orphaned {
        let _ = tx.send(Err(ProviderError::Unavailable(format!(
            "provider '{name}' closed its output"
        ))));
    }
}

impl ResourceProvider for PluginProvider {
    fn check(&self, request: CheckRequest) -> BoxFuture<'_, Result<CheckResponse, ProviderError>> {
        Box::pin(self.call("check", request))
    }

    fn diff(&self, request: DiffRequest) -> BoxFuture<'_, Result<DiffResponse, ProviderError>> {
        Box::pin(self.call("diff", request))
    }

    fn create(&self, request: CreateRequest) -> BoxFuture<'_, Result<CreateResponse, ProviderError>> {
        Box::pin(self.call("create", request))
    }

    fn update(&self, request: UpdateRequest) -> BoxFuture<'_, Result<UpdateResponse, ProviderError>> {
        Box::pin(self.call("update", request))
    }

    fn delete(&self, request: DeleteRequest) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            let _: serde_json::Value = self.call("delete", request).await?;
            Ok(())
        })
    }

    fn read(&self, request: ReadRequest) -> BoxFuture<'_, Result<ReadResponse, ProviderError>> {
        Box::pin(self.call("read", request))
    }

    fn cancel(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Fire and forget: the plugin's acknowledgement, if any, is
            // dropped by the reader as an unknown id.
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let request = WireRequest {
                id,
                method: "cancel",
                params: serde_json::Value::Object(Default::default()),
            };
            if let Err(e) = self.send(&request).await {
                tracing::warn!(provider = %self.name, error = %e, "failed to deliver cancel");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use strata_core::{PropertyMap, PropertyValue, Urn};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    fn urn(name: &str) -> Urn {
        Urn::new("dev", "p", None, "fake:index:Thing", name)
    }

    /// Start a plugin whose responses are produced by `respond` from each
    /// request line, written in the order `respond` returns them.
    fn fake_plugin<F>(respond: F) -> PluginProvider
    where
        F: Fn(Vec<serde_json::Value>) -> Vec<String> + Send + 'static,
    {
        let (engine_side, plugin_side) = duplex(64 * 1024);
        let (engine_read, engine_write) = tokio::io::split(engine_side);
        let (plugin_read, mut plugin_write) = tokio::io::split(plugin_side);

        tokio::spawn(async move {
            let mut lines = BufReader::new(plugin_read).lines();
            let mut batch = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                batch.push(serde_json::from_str(&line).unwrap());
                let replies = respond(std::mem::take(&mut batch));
                if replies.is_empty() {
                    // Hold requests until the responder is ready.
                    continue;
                }
                for reply in replies {
                    plugin_write.write_all(reply.as_bytes()).await.unwrap();
                    plugin_write.write_all(b"\n").await.unwrap();
                }
            }
        });

        PluginProvider::connect("fake", engine_read, engine_write)
    }

    #[tokio::test]
    async fn create_round_trips_through_the_wire() {
        let plugin = fake_plugin(|requests| {
            requests
                .iter()
                .map(|r| {
                    assert_eq!(r["method"], "create");
                    format!(
                        r#"{{"id": {}, "result": {{"id": "thing-1", "outputs": {{"arn": "arn:1"}}}}}}"#,
                        r["id"]
                    )
                })
                .collect()
        });

        let response = plugin
            .create(CreateRequest {
                urn: urn("a"),
                news: PropertyMap::new(),
                timeout_secs: 10,
            })
            .await
            .unwrap();
        assert_eq!(response.id, "thing-1");
        assert_eq!(response.outputs["arn"], PropertyValue::string("arn:1"));
    }

    #[tokio::test]
    async fn error_carries_partial_state() {
        let plugin = fake_plugin(|requests| {
            requests
                .iter()
                .map(|r| {
                    format!(
                        r#"{{"id": {}, "error": {{"message": "quota exceeded", "partial": {{"id": "half-made"}}}}}}"#,
                        r["id"]
                    )
                })
                .collect()
        });

        let err = plugin
            .create(CreateRequest {
                urn: urn("a"),
                news: PropertyMap::new(),
                timeout_secs: 10,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
        assert_eq!(
            err.partial().and_then(|p| p.id.as_deref()),
            Some("half-made")
        );
    }

    #[tokio::test]
    async fn concurrent_calls_are_matched_by_id() {
        // Answer only once two requests are waiting, in reverse order.
        let waiting = std::sync::Mutex::new(Vec::new());
        let plugin = fake_plugin(move |requests| {
            let mut waiting = waiting.lock().unwrap();
            waiting.extend(requests);
            if waiting.len() < 2 {
                return Vec::new();
            }
            waiting
                .drain(..)
                .rev()
                .map(|r| {
                    format!(
                        r#"{{"id": {}, "result": {{"id": "{}", "outputs": {{}}}}}}"#,
                        r["id"], r["params"]["urn"].as_str().unwrap()
                    )
                })
                .collect()
        });

        let a = plugin.read(ReadRequest {
            urn: urn("a"),
            id: "a".into(),
            inputs: PropertyMap::new(),
        });
        let b = plugin.read(ReadRequest {
            urn: urn("b"),
            id: "b".into(),
            inputs: PropertyMap::new(),
        });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap().id.as_deref(), Some(urn("a").as_str()));
        assert_eq!(b.unwrap().id.as_deref(), Some(urn("b").as_str()));
    }

    #[tokio::test]
    async fn malformed_result_is_a_protocol_error() {
        let plugin = fake_plugin(|requests| {
            requests
                .iter()
                .map(|r| format!(r#"{{"id": {}, "result": {{"outputs": 7}}}}"#, r["id"]))
                .collect()
        });
        let err = plugin
            .update(UpdateRequest {
                urn: urn("a"),
                id: "a".into(),
                olds: PropertyMap::new(),
                news: PropertyMap::new(),
                timeout_secs: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Protocol(_)));
    }

    #[tokio::test]
    async fn closed_plugin_fails_outstanding_calls() {
        let plugin = fake_plugin(|_| panic!("plugin crashed"));
        let err = plugin
            .delete(DeleteRequest {
                urn: urn("a"),
                id: "a".into(),
                olds: PropertyMap::new(),
                timeout_secs: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
