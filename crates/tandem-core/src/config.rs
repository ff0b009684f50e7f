use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub lease_ttl_ms: u64,
    pub launch_max_attempts: u32,
    pub launch_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            lease_ttl_ms: 30_000,
            launch_max_attempts: 3,
            launch_backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_concurrent_runs: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Run the built-in artifact gate on items entering review.
    pub auto_gates: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            max_attempts: 3,
            backoff_ms: 200,
            auto_gates: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 10_000,
        }
    }
}

/// Catalog entry for a mission entrypoint routines may launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EntrypointConfig {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub launcher: LauncherConfig,
    pub entrypoints: BTreeMap<String, EntrypointConfig>,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON configuration. Later layers win:
/// global < project < env < runtime < cli.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        Self::open(path, global_path.as_deref(), env_layer(), cli_overrides).await
    }

    pub async fn open(
        path: impl AsRef<Path>,
        global_path: Option<&Path>,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let global = match global_path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let project = read_json_file(&project_path).await?;
        let layers = ConfigLayers {
            global,
            project,
            env,
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> anyhow::Result<EngineConfig> {
        let merged = self.get_effective_value().await;
        Ok(serde_json::from_value(merged)?)
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> Value {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.get_effective_value().await
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!("ignoring unreadable config {}: {}", path.display(), err);
            Ok(empty_object())
        }
    }
}

fn resolve_global_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TANDEM_GLOBAL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("tandem").join("engine.json"))
}

pub fn env_layer() -> Value {
    env_layer_from(|name| std::env::var(name).ok())
}

pub fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let number = |name: &str| {
        lookup(name)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
    };

    if let Some(ms) = number("TANDEM_SCHEDULER_POLL_MS") {
        deep_merge(&mut root, &json!({ "scheduler": { "poll_interval_ms": ms } }));
    }
    if let Some(ms) = number("TANDEM_LEASE_TTL_MS") {
        deep_merge(&mut root, &json!({ "scheduler": { "lease_ttl_ms": ms } }));
    }
    if let Some(limit) = number("TANDEM_MAX_CONCURRENT_RUNS") {
        deep_merge(
            &mut root,
            &json!({ "dispatch": { "max_concurrent_runs": limit } }),
        );
    }
    if let Some(enabled) = lookup("TANDEM_AUTO_GATES").and_then(|raw| parse_bool_like(&raw)) {
        deep_merge(&mut root, &json!({ "dispatch": { "auto_gates": enabled } }));
    }
    if let Some(url) = lookup("TANDEM_RUN_API_URL") {
        if !url.trim().is_empty() {
            deep_merge(
                &mut root,
                &json!({ "launcher": { "base_url": url.trim_end_matches('/') } }),
            );
        }
    }

    root
}

pub fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
