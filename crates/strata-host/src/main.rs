//! strata-host
//!
//! Runs one engine operation for a stack. Goals arrive as newline-delimited
//! JSON on stdin; engine events leave as JSON lines on stdout; logs go to
//! stderr.

use std::sync::Arc;

use eyre::Result;
use strata_engine::{
    Engine, EventBus, JsonLinesSink, PluginProvider, ProviderRegistry, RunResult, TracingSink,
};
use strata_storage::{CheckpointStore, DualStore, FileStore, S3Store};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod goals;

use config::HostConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Deploy,
    Preview,
    Destroy,
    Refresh,
}

impl Command {
    fn parse(arg: Option<&str>) -> Result<Self> {
        match arg {
            Some("deploy") | None => Ok(Self::Deploy),
            Some("preview") => Ok(Self::Preview),
            Some("destroy") => Ok(Self::Destroy),
            Some("refresh") => Ok(Self::Refresh),
            Some(other) => Err(eyre::eyre!(
                "unknown operation {other:?} (expected deploy, preview, destroy or refresh)"
            )),
        }
    }

    fn reads_goals(self) -> bool {
        matches!(self, Self::Deploy | Self::Preview)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Structured JSON logs on stderr; stdout carries the event stream.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let command = Command::parse(std::env::args().nth(1).as_deref())?;
    let config = config::load_config()?;

    let store = build_store(&config).await?;
    let providers = spawn_providers(&config)?;
    let engine = Engine::new(
        config.stack.clone(),
        config.project.clone(),
        store,
        providers,
        config.engine.clone(),
    );

    let goals = if command.reads_goals() {
        goals::read_goals(tokio::io::BufReader::new(tokio::io::stdin())).await?
    } else {
        Vec::new()
    };

    let mut events = EventBus::new(engine.config().event_buffer());
    events.attach(JsonLinesSink::new(tokio::io::stdout()));
    events.attach(TracingSink);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let summary = match command {
        Command::Deploy => engine.deploy(goals, events, &cancel).await?,
        Command::Preview => engine.preview(goals, events, &cancel).await?,
        Command::Destroy => engine.destroy(events, &cancel).await?,
        Command::Refresh => engine.refresh(events, &cancel).await?,
    };

    match summary.result {
        RunResult::Succeeded => Ok(()),
        other => Err(eyre::eyre!(
            "run {} finished {other:?}: {} failed, {} skipped",
            summary.run_id,
            summary.failed,
            summary.skipped
        )),
    }
}

async fn build_store(config: &HostConfig) -> Result<Arc<dyn CheckpointStore>> {
    let path = match &config.state.path {
        Some(path) => path.clone(),
        None if config.state.s3.is_none() => config::default_state_path(&config.stack)?,
        None => {
            let s3 = remote_store(config).await;
            return Ok(Arc::new(s3.ok_or_else(|| eyre::eyre!("no state location configured"))?));
        }
    };
    let local = FileStore::new(path);
    match remote_store(config).await {
        Some(remote) => Ok(Arc::new(DualStore::new(local, remote))),
        None => Ok(Arc::new(local)),
    }
}

async fn remote_store(config: &HostConfig) -> Option<S3Store> {
    let location = config.state.s3.as_ref()?;
    let client = strata_storage::client::build_client(location.region.as_deref()).await;
    Some(S3Store::new(client, &location.bucket, &location.key))
}

fn spawn_providers(config: &HostConfig) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for (package, plugin) in &config.providers {
        let provider = PluginProvider::spawn(package, &plugin.program, &plugin.args)?;
        registry.register(package.clone(), Arc::new(provider));
    }
    Ok(registry)
}
