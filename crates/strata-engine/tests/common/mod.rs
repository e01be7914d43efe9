#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_core::{Goal, PropertyMap, PropertyValue, Urn};
use strata_engine::provider::{
    CheckFailure, CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest,
    DiffChanges, DiffRequest, DiffResponse, ReadRequest, ReadResponse, UpdateRequest,
    UpdateResponse,
};
use strata_engine::{
    BoxFuture, ChannelSink, Engine, EngineConfig, EngineError, EngineEvent, EventBus,
    HookRegistry, PartialState, ProviderError, ProviderRegistry, ResourceProvider, RunSummary,
};
use strata_storage::MemoryStore;
use tokio_util::sync::CancellationToken;

pub const STACK: &str = "dev";
pub const PROJECT: &str = "shop";
pub const TYPE: &str = "test:index:Thing";

pub fn urn(name: &str) -> Urn {
    Urn::new(STACK, PROJECT, None, TYPE, name)
}

pub fn props(json: serde_json::Value) -> PropertyMap {
    serde_json::from_value(json).unwrap()
}

pub fn goal(name: &str, json: serde_json::Value) -> Goal {
    Goal {
        properties: props(json),
        ..Goal::new(TYPE, name, true)
    }
}

pub fn depends_on(mut goal: Goal, names: &[&str]) -> Goal {
    goal.dependencies = names.iter().map(|n| urn(n)).collect();
    goal
}

/// In-memory provider that records every call as `"<method> <name>"`.
#[derive(Default)]
pub struct FakeProvider {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<String>,
    next_id: u64,
    live: BTreeMap<String, PropertyMap>,
    fail_create: HashSet<String>,
    partial_create: HashSet<String>,
    invalid: HashSet<String>,
    replace_keys: Vec<String>,
    delete_before_replace: bool,
    slow: BTreeMap<String, Duration>,
    gone: HashSet<String>,
    drift: BTreeMap<String, PropertyMap>,
    in_flight: usize,
    peak_in_flight: usize,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|i| i.calls.clone())
    }

    pub fn calls_of(&self, method: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&format!("{method} ")))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.with(|i| i.calls.clear());
    }

    pub fn fail_create(&self, name: &str) {
        self.with(|i| i.fail_create.insert(name.to_string()));
    }

    /// Creates of `name` fail but leave a resource behind.
    pub fn partial_create(&self, name: &str) {
        self.with(|i| i.partial_create.insert(name.to_string()));
    }

    pub fn reject(&self, name: &str) {
        self.with(|i| i.invalid.insert(name.to_string()));
    }

    /// Changing `key` forces a replacement.
    pub fn replace_on(&self, key: &str, delete_before_replace: bool) {
        self.with(|i| {
            i.replace_keys.push(key.to_string());
            i.delete_before_replace = delete_before_replace;
        });
    }

    pub fn slow(&self, name: &str, delay: Duration) {
        self.with(|i| i.slow.insert(name.to_string(), delay));
    }

    /// The resource with `id` has disappeared out of band.
    pub fn vanish(&self, id: &str) {
        self.with(|i| i.gone.insert(id.to_string()));
    }

    /// The resource with `id` now reports `outputs`.
    pub fn drift(&self, id: &str, outputs: PropertyMap) {
        self.with(|i| i.drift.insert(id.to_string(), outputs));
    }

    /// Most creates that were ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.with(|i| i.peak_in_flight)
    }

    pub fn live(&self) -> Vec<String> {
        self.with(|i| i.live.keys().cloned().collect())
    }

    fn record(&self, method: &str, urn: &Urn) {
        self.with(|i| i.calls.push(format!("{method} {}", urn.name())));
    }

    fn delay_for(&self, urn: &Urn) -> Option<Duration> {
        self.with(|i| i.slow.get(urn.name()).copied())
    }
}

fn with_arn(urn: &Urn, id: &str, mut outputs: PropertyMap) -> PropertyMap {
    outputs.insert(
        "arn".into(),
        PropertyValue::string(format!("arn:test:{}:{id}", urn.name())),
    );
    outputs
}

impl FakeProvider {
    async fn create_now(&self, request: CreateRequest) -> Result<CreateResponse, ProviderError> {
        self.record("create", &request.urn);
        if let Some(delay) = self.delay_for(&request.urn) {
            tokio::time::sleep(delay).await;
        }
        let name = request.urn.name().to_string();
        if self.with(|i| i.fail_create.contains(&name)) {
            return Err(ProviderError::failed(format!("cannot create {name}")));
        }
        let id = self.with(|i| {
            i.next_id += 1;
            format!("{name}-{}", i.next_id)
        });
        let outputs = with_arn(&request.urn, &id, request.news);
        self.with(|i| i.live.insert(id.clone(), outputs.clone()));
        if self.with(|i| i.partial_create.contains(&name)) {
            return Err(ProviderError::Failed {
                message: "created but failed to configure".into(),
                partial: Some(PartialState {
                    id: Some(id),
                    outputs,
                }),
            });
        }
        Ok(CreateResponse { id, outputs })
    }
}

impl ResourceProvider for FakeProvider {
    fn check(&self, request: CheckRequest) -> BoxFuture<'_, Result<CheckResponse, ProviderError>> {
        Box::pin(async move {
            self.record("check", &request.urn);
            let failures = if self.with(|i| i.invalid.contains(request.urn.name())) {
                vec![CheckFailure {
                    property: "size".into(),
                    reason: "must be positive".into(),
                }]
            } else {
                Vec::new()
            };
            Ok(CheckResponse {
                inputs: request.news,
                failures,
            })
        })
    }

    fn diff(&self, request: DiffRequest) -> BoxFuture<'_, Result<DiffResponse, ProviderError>> {
        Box::pin(async move {
            self.record("diff", &request.urn);
            let (replace_keys, delete_before_replace) =
                self.with(|i| (i.replace_keys.clone(), i.delete_before_replace));
            let replaces = replace_keys
                .into_iter()
                .filter(|k| request.old_inputs.get(k) != request.news.get(k))
                .collect();
            Ok(DiffResponse {
                changes: DiffChanges::Unknown,
                replaces,
                delete_before_replace,
                ..DiffResponse::default()
            })
        })
    }

    fn create(&self, request: CreateRequest) -> BoxFuture<'_, Result<CreateResponse, ProviderError>> {
        Box::pin(async move {
            self.with(|i| {
                i.in_flight += 1;
                i.peak_in_flight = i.peak_in_flight.max(i.in_flight);
            });
            let result = self.create_now(request).await;
            self.with(|i| i.in_flight -= 1);
            result
        })
    }

    fn update(&self, request: UpdateRequest) -> BoxFuture<'_, Result<UpdateResponse, ProviderError>> {
        Box::pin(async move {
            self.record("update", &request.urn);
            let outputs = with_arn(&request.urn, &request.id, request.news);
            self.with(|i| i.live.insert(request.id.clone(), outputs.clone()));
            Ok(UpdateResponse { outputs })
        })
    }

    fn delete(&self, request: DeleteRequest) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(async move {
            self.record("delete", &request.urn);
            self.with(|i| i.live.remove(&request.id));
            Ok(())
        })
    }

    fn read(&self, request: ReadRequest) -> BoxFuture<'_, Result<ReadResponse, ProviderError>> {
        Box::pin(async move {
            self.record("read", &request.urn);
            if self.with(|i| i.gone.contains(&request.id)) {
                return Ok(ReadResponse::default());
            }
            let outputs = self
                .with(|i| i.drift.get(&request.id).cloned())
                .unwrap_or_default();
            Ok(ReadResponse {
                id: Some(request.id),
                inputs: PropertyMap::new(),
                outputs,
            })
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self::build(Arc::new(store), FakeProvider::new(), EngineConfig::default())
    }

    pub fn build(store: Arc<MemoryStore>, provider: Arc<FakeProvider>, config: EngineConfig) -> Self {
        let engine = Engine::new(
            STACK,
            PROJECT,
            store.clone(),
            ProviderRegistry::new().with("test", provider.clone()),
            config,
        );
        Self {
            store,
            provider,
            engine,
        }
    }

    pub fn hooks(self, hooks: HookRegistry) -> Self {
        Self {
            engine: self.engine.with_hooks(hooks),
            ..self
        }
    }

    pub async fn deploy(&self, goals: Vec<Goal>) -> Run {
        self.deploy_with(goals, &CancellationToken::new()).await
    }

    pub async fn deploy_with(&self, goals: Vec<Goal>, cancel: &CancellationToken) -> Run {
        let (bus, rx) = bus();
        let result = self.engine.deploy(goals, bus, cancel).await;
        Run::collect(result, rx).await
    }

    pub async fn preview(&self, goals: Vec<Goal>) -> Run {
        let (bus, rx) = bus();
        let result = self
            .engine
            .preview(goals, bus, &CancellationToken::new())
            .await;
        Run::collect(result, rx).await
    }

    pub async fn destroy(&self) -> Run {
        let (bus, rx) = bus();
        let result = self.engine.destroy(bus, &CancellationToken::new()).await;
        Run::collect(result, rx).await
    }

    pub async fn refresh(&self) -> Run {
        let (bus, rx) = bus();
        let result = self.engine.refresh(bus, &CancellationToken::new()).await;
        Run::collect(result, rx).await
    }

    /// The last snapshot written, if any.
    pub fn snapshot(&self) -> Option<strata_core::Snapshot> {
        self.store.history().pop()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .map(|s| {
                s.resources
                    .iter()
                    .map(|r| r.urn.name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn bus() -> (EventBus, tokio::sync::mpsc::Receiver<EngineEvent>) {
    let (sink, rx) = ChannelSink::new(4096);
    (EventBus::new(8).with(sink), rx)
}

pub struct Run {
    pub result: Result<RunSummary, EngineError>,
    pub events: Vec<EngineEvent>,
}

impl Run {
    async fn collect(
        result: Result<RunSummary, EngineError>,
        mut rx: tokio::sync::mpsc::Receiver<EngineEvent>,
    ) -> Self {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        Self { result, events }
    }

    pub fn summary(&self) -> &RunSummary {
        self.result.as_ref().expect("run failed")
    }

    pub fn json(&self) -> Vec<serde_json::Value> {
        self.events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap())
            .collect()
    }

    /// `(type, op, name, status)` for every resource event, in order.
    pub fn steps(&self) -> Vec<(String, String, String, String)> {
        self.json()
            .into_iter()
            .filter(|e| e["type"] == "resource_pre" || e["type"] == "resource_post")
            .map(|e| {
                let urn = e["step"]["urn"].as_str().unwrap_or_default().to_string();
                let name = urn.rsplit("::").next().unwrap_or_default().to_string();
                (
                    e["type"].as_str().unwrap_or_default().to_string(),
                    e["step"]["op"].as_str().unwrap_or_default().to_string(),
                    name,
                    e["status"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    pub fn post_status(&self, name: &str) -> Option<String> {
        self.steps()
            .into_iter()
            .find(|(kind, _, n, _)| kind == "resource_post" && n == name)
            .map(|(_, _, _, status)| status)
    }

    pub fn diagnostics(&self, severity: &str) -> Vec<String> {
        self.json()
            .into_iter()
            .filter(|e| e["type"] == "diagnostic" && e["severity"] == severity)
            .map(|e| e["message"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}
