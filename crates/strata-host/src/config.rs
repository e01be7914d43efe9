use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_engine::EngineConfig;

/// Current config version. Bump this when adding fields or changing shape.
/// Each bump requires a corresponding entry in [`migrate`].
const CURRENT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Schema version. Missing or 0 = pre-versioned config.
    #[serde(default)]
    pub config_version: u32,
    pub stack: String,
    pub project: String,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Provider plugins by package name.
    #[serde(default)]
    pub providers: BTreeMap<String, PluginConfig>,
}

/// Where checkpoints live. With both a path and an S3 location the local
/// file is written first and S3 second.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

fn config_dir() -> eyre::Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| eyre::eyre!("no config directory found"))?;
    Ok(base.join("strata"))
}

/// `STRATA_CONFIG` if set, otherwise `config.json` in the platform config
/// directory.
pub fn config_path() -> eyre::Result<PathBuf> {
    match std::env::var_os("STRATA_CONFIG") {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(config_dir()?.join("config.json")),
    }
}

/// Default checkpoint file for `stack` when the config names none.
pub fn default_state_path(stack: &str) -> eyre::Result<PathBuf> {
    let base = dirs::data_dir().ok_or_else(|| eyre::eyre!("no data directory found"))?;
    Ok(base.join("strata").join("stacks").join(format!("{stack}.json")))
}

/// Load the config and apply environment overrides.
pub fn load_config() -> eyre::Result<HostConfig> {
    let path = config_path()?;
    let config = load_from(&path)?;
    apply_overrides(config, |name| std::env::var(name).ok())
}

pub fn load_from(path: &Path) -> eyre::Result<HostConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("failed to read config at {}: {e}", path.display()))?;

    // Parse as raw JSON so we can run migrations before deserializing.
    let json: serde_json::Value = serde_json::from_str(&contents)?;
    let on_disk_version = json
        .get("config_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;

    let migrated = migrate(json, on_disk_version)?;
    let config: HostConfig = serde_json::from_value(migrated)?;
    tracing::debug!(path = %path.display(), version = on_disk_version, "config loaded");

    // Write the upgraded layout back.
    if on_disk_version < CURRENT_VERSION {
        save_config(&config, path)?;
    }
    Ok(config)
}

/// Run sequential migrations from `from_version` up to [`CURRENT_VERSION`].
///
/// Each migration is a pure transform on the raw JSON value.
fn migrate(mut json: serde_json::Value, from_version: u32) -> eyre::Result<serde_json::Value> {
    if from_version > CURRENT_VERSION {
        return Err(eyre::eyre!(
            "config_version {from_version} is newer than this build supports ({CURRENT_VERSION}). \
             Please update strata-host."
        ));
    }
    let obj = json
        .as_object_mut()
        .ok_or_else(|| eyre::eyre!("config is not a JSON object"))?;

    // v0 → v1: top-level `parallelism` moved into the `engine` section
    if from_version < 1 {
        if let Some(parallelism) = obj.remove("parallelism") {
            let engine = obj
                .entry("engine")
                .or_insert_with(|| serde_json::json!({}));
            if let Some(engine) = engine.as_object_mut() {
                engine.entry("parallelism").or_insert(parallelism);
            }
        }
        obj.insert("config_version".to_string(), 1.into());
        tracing::info!("migrated config v0 → v1 (moved parallelism into engine)");
    }

    // v1 → v2: `state_path` became `state.path`, next to the optional S3 location
    if from_version < 2 {
        if let Some(path) = obj.remove("state_path") {
            let state = obj
                .entry("state")
                .or_insert_with(|| serde_json::json!({}));
            if let Some(state) = state.as_object_mut() {
                state.entry("path").or_insert(path);
            }
        }
        obj.insert("config_version".to_string(), 2.into());
        tracing::info!("migrated config v1 → v2 (state_path moved to state.path)");
    }

    Ok(json)
}

/// Apply `STRATA_STACK`, `STRATA_PROJECT`, `STRATA_PARALLELISM` and
/// `STRATA_STATE_PATH` from `lookup`.
pub fn apply_overrides(
    mut config: HostConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> eyre::Result<HostConfig> {
    if let Some(stack) = lookup("STRATA_STACK") {
        config.stack = stack;
    }
    if let Some(project) = lookup("STRATA_PROJECT") {
        config.project = project;
    }
    if let Some(raw) = lookup("STRATA_PARALLELISM") {
        config.engine.parallelism = raw
            .parse()
            .map_err(|e| eyre::eyre!("STRATA_PARALLELISM must be a positive integer: {e}"))?;
    }
    if let Some(path) = lookup("STRATA_STATE_PATH") {
        config.state.path = Some(PathBuf::from(path));
    }
    Ok(config)
}

pub fn save_config(config: &HostConfig, path: &Path) -> eyre::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| eyre::eyre!("config path {} has no parent", path.display()))?;
    std::fs::create_dir_all(dir)?;

    // Always write the current version, regardless of what was loaded.
    let mut stamped = config.clone();
    stamped.config_version = CURRENT_VERSION;
    let json = serde_json::to_string_pretty(&stamped)?;

    // Write to a temp file then rename for atomicity
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;

    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
