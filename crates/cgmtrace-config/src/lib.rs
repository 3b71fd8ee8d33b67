use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LOGAN_KEY_ENV: &str = "CGMTRACE_LOGAN_KEY";
pub const LOGAN_IV_ENV: &str = "CGMTRACE_LOGAN_IV";
pub const CONFIG_ENV: &str = "CGMTRACE_CONFIG";

const CIPHER_BLOCK_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("decoder {field} must be exactly {expected} bytes, got {actual}")]
    InvalidCipherMaterial {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("flow template has no stages")]
    EmptyTemplate,
    #[error("flow stage `{0}` has no events")]
    EmptyStage(String),
    #[error("flow stage name `{0}` is used more than once")]
    DuplicateStage(String),
    #[error("catalog category `{0}` is used more than once")]
    DuplicateCategory(String),
    #[error("catalog event `{event}` has severity {severity}; expected 1..=5")]
    InvalidSeverity { event: String, severity: u8 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    #[serde(default = "default_logan_key")]
    pub key: String,
    #[serde(default = "default_logan_iv")]
    pub iv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_max_file_workers")]
    pub max_file_workers: usize,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_sample_error_lines")]
    pub sample_error_lines: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnomalyConfig {
    #[serde(default = "default_disconnect_window_ms")]
    pub disconnect_window_ms: i64,
    #[serde(default = "default_disconnect_threshold")]
    pub disconnect_threshold: usize,
    #[serde(default = "default_timeout_window_ms")]
    pub timeout_window_ms: i64,
    #[serde(default = "default_timeout_threshold")]
    pub timeout_threshold: usize,
    #[serde(default = "default_error_window_ms")]
    pub error_window_ms: i64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: usize,
    #[serde(default = "default_slow_connection_ms")]
    pub slow_connection_ms: i64,
    #[serde(default = "default_command_failure_rate")]
    pub command_failure_rate: f64,
    #[serde(default = "default_command_failure_min_samples")]
    pub command_failure_min_samples: usize,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageEvent {
    pub event_name: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowStage {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub max_duration_ms: Option<i64>,
    #[serde(default)]
    pub events: Vec<StageEvent>,
}

impl FlowStage {
    /// The first stage event opens an interval; every other event closes one.
    pub fn start_marker(&self) -> Option<&str> {
        self.events.first().map(|event| event.event_name.as_str())
    }

    pub fn is_end_marker(&self, event_name: &str) -> bool {
        self.events
            .iter()
            .skip(1)
            .any(|event| event.event_name == event_name)
    }

    pub fn contains_event(&self, event_name: &str) -> bool {
        self.events.iter().any(|event| event.event_name == event_name)
    }

    pub fn required_events(&self) -> impl Iterator<Item = &StageEvent> {
        self.events.iter().filter(|event| event.required)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowTemplate {
    #[serde(default = "default_flow_version")]
    pub version: String,
    #[serde(default = "default_sample_sessions")]
    pub sample_sessions: usize,
    #[serde(default = "default_flow_stages")]
    pub stages: Vec<FlowStage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogEvent {
    pub event_name: String,
    #[serde(default = "default_catalog_severity")]
    pub severity: u8,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogCategory {
    pub name: String,
    #[serde(default)]
    pub events: Vec<CatalogEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventCatalog {
    #[serde(default = "default_catalog_categories")]
    pub categories: Vec<CatalogCategory>,
}

impl EventCatalog {
    pub fn contains(&self, event_name: &str) -> bool {
        self.categories
            .iter()
            .any(|category| category.events.iter().any(|e| e.event_name == event_name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub flow: FlowTemplate,
    #[serde(default)]
    pub catalog: EventCatalog,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            key: default_logan_key(),
            iv: default_logan_iv(),
        }
    }
}

impl DecoderConfig {
    pub fn key_bytes(&self) -> std::result::Result<[u8; 16], ConfigError> {
        cipher_material("key", &self.key)
    }

    pub fn iv_bytes(&self) -> std::result::Result<[u8; 16], ConfigError> {
        cipher_material("iv", &self.iv)
    }
}

fn cipher_material(
    field: &'static str,
    value: &str,
) -> std::result::Result<[u8; 16], ConfigError> {
    let bytes = value.as_bytes();
    <[u8; 16]>::try_from(bytes).map_err(|_| ConfigError::InvalidCipherMaterial {
        field,
        expected: CIPHER_BLOCK_LEN,
        actual: bytes.len(),
    })
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_file_workers: default_max_file_workers(),
            max_line_bytes: default_max_line_bytes(),
            sample_error_lines: default_sample_error_lines(),
            page_size: default_page_size(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            disconnect_window_ms: default_disconnect_window_ms(),
            disconnect_threshold: default_disconnect_threshold(),
            timeout_window_ms: default_timeout_window_ms(),
            timeout_threshold: default_timeout_threshold(),
            error_window_ms: default_error_window_ms(),
            error_threshold: default_error_threshold(),
            slow_connection_ms: default_slow_connection_ms(),
            command_failure_rate: default_command_failure_rate(),
            command_failure_min_samples: default_command_failure_min_samples(),
            max_samples: default_max_samples(),
        }
    }
}

impl Default for FlowTemplate {
    fn default() -> Self {
        Self {
            version: default_flow_version(),
            sample_sessions: default_sample_sessions(),
            stages: default_flow_stages(),
        }
    }
}

impl Default for EventCatalog {
    fn default() -> Self {
        Self {
            categories: default_catalog_categories(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderConfig::default(),
            ingest: IngestConfig::default(),
            anomaly: AnomalyConfig::default(),
            flow: FlowTemplate::default(),
            catalog: EventCatalog::default(),
        }
    }
}

fn default_logan_key() -> String {
    "0123456789012345".to_string()
}

fn default_logan_iv() -> String {
    "0123456789012345".to_string()
}

fn default_max_file_workers() -> usize {
    4
}

fn default_max_line_bytes() -> usize {
    1_048_576
}

fn default_sample_error_lines() -> usize {
    20
}

fn default_page_size() -> usize {
    200_000
}

fn default_disconnect_window_ms() -> i64 {
    60_000
}

fn default_disconnect_threshold() -> usize {
    3
}

fn default_timeout_window_ms() -> i64 {
    30_000
}

fn default_timeout_threshold() -> usize {
    2
}

fn default_error_window_ms() -> i64 {
    10_000
}

fn default_error_threshold() -> usize {
    5
}

fn default_slow_connection_ms() -> i64 {
    10_000
}

fn default_command_failure_rate() -> f64 {
    0.3
}

fn default_command_failure_min_samples() -> usize {
    5
}

fn default_max_samples() -> usize {
    5
}

fn default_flow_version() -> String {
    "2024.1".to_string()
}

fn default_sample_sessions() -> usize {
    3
}

fn default_catalog_severity() -> u8 {
    2
}

fn default_true() -> bool {
    true
}

fn stage_event(event_name: &str, required: bool) -> StageEvent {
    StageEvent {
        event_name: event_name.to_string(),
        required,
    }
}

fn default_flow_stages() -> Vec<FlowStage> {
    vec![
        FlowStage {
            name: "scan".to_string(),
            required: true,
            max_duration_ms: Some(15_000),
            events: vec![
                stage_event("BLE_SCAN_START", true),
                stage_event("BLE_SCAN_DEVICE_FOUND", true),
            ],
        },
        FlowStage {
            name: "connect".to_string(),
            required: true,
            max_duration_ms: Some(10_000),
            events: vec![
                stage_event("BLE_CONNECT_START", true),
                stage_event("BLE_CONNECTED", true),
            ],
        },
        FlowStage {
            name: "pair".to_string(),
            required: true,
            max_duration_ms: Some(20_000),
            events: vec![
                stage_event("BLE_PAIR_START", true),
                stage_event("BLE_PAIR_SUCCESS", true),
            ],
        },
        FlowStage {
            name: "service_discovery".to_string(),
            required: false,
            max_duration_ms: Some(5_000),
            events: vec![
                stage_event("BLE_DISCOVER_SERVICES_START", true),
                stage_event("BLE_SERVICES_DISCOVERED", true),
            ],
        },
        FlowStage {
            name: "data_sync".to_string(),
            required: false,
            max_duration_ms: Some(30_000),
            events: vec![
                stage_event("CGM_SYNC_START", true),
                stage_event("CGM_SYNC_COMPLETE", true),
                stage_event("CGM_SYNC_PARTIAL", false),
            ],
        },
    ]
}

fn catalog_event(event_name: &str, severity: u8, description: &str) -> CatalogEvent {
    CatalogEvent {
        event_name: event_name.to_string(),
        severity,
        description: description.to_string(),
    }
}

fn default_catalog_categories() -> Vec<CatalogCategory> {
    vec![
        CatalogCategory {
            name: "scan".to_string(),
            events: vec![
                catalog_event("BLE_SCAN_START", 1, "scan started"),
                catalog_event("BLE_SCAN_DEVICE_FOUND", 1, "target sensor advertised"),
                catalog_event("BLE_SCAN_STOP", 1, "scan stopped"),
                catalog_event("BLE_SCAN_TIMEOUT", 3, "no sensor found before deadline"),
            ],
        },
        CatalogCategory {
            name: "connection".to_string(),
            events: vec![
                catalog_event("BLE_CONNECT_START", 1, "GATT connect requested"),
                catalog_event("BLE_CONNECTED", 1, "GATT link established"),
                catalog_event("BLE_DISCONNECTED", 2, "GATT link closed"),
                catalog_event("BLE_CONNECT_TIMEOUT", 3, "connect did not complete"),
                catalog_event("BLE_CONNECT_FAILED", 4, "connect rejected by stack"),
            ],
        },
        CatalogCategory {
            name: "pairing".to_string(),
            events: vec![
                catalog_event("BLE_PAIR_START", 1, "bonding requested"),
                catalog_event("BLE_PAIR_SUCCESS", 1, "bond established"),
                catalog_event("BLE_PAIR_FAILED", 4, "bond rejected"),
            ],
        },
        CatalogCategory {
            name: "data".to_string(),
            events: vec![
                catalog_event("BLE_DISCOVER_SERVICES_START", 1, "service discovery started"),
                catalog_event("BLE_SERVICES_DISCOVERED", 1, "service table received"),
                catalog_event("CGM_SYNC_START", 1, "glucose backfill started"),
                catalog_event("CGM_SYNC_PARTIAL", 2, "backfill returned a partial page"),
                catalog_event("CGM_SYNC_COMPLETE", 1, "glucose backfill finished"),
                catalog_event("COMMAND_WRITE", 1, "command written to control point"),
                catalog_event("COMMAND_RESPONSE", 1, "control point response"),
            ],
        },
    ]
}

fn validate_config(cfg: &AppConfig) -> std::result::Result<(), ConfigError> {
    cfg.decoder.key_bytes()?;
    cfg.decoder.iv_bytes()?;

    if cfg.flow.stages.is_empty() {
        return Err(ConfigError::EmptyTemplate);
    }

    let mut stage_names = HashSet::new();
    for stage in &cfg.flow.stages {
        if stage.events.is_empty() {
            return Err(ConfigError::EmptyStage(stage.name.clone()));
        }
        if !stage_names.insert(stage.name.as_str()) {
            return Err(ConfigError::DuplicateStage(stage.name.clone()));
        }
    }

    let mut category_names = HashSet::new();
    for category in &cfg.catalog.categories {
        if !category_names.insert(category.name.as_str()) {
            return Err(ConfigError::DuplicateCategory(category.name.clone()));
        }
        for event in &category.events {
            if !(1..=5).contains(&event.severity) {
                return Err(ConfigError::InvalidSeverity {
                    event: event.event_name.clone(),
                    severity: event.severity,
                });
            }
        }
    }

    Ok(())
}

fn apply_env_overrides(mut cfg: AppConfig, lookup: impl Fn(&str) -> Option<String>) -> AppConfig {
    if let Some(key) = lookup(LOGAN_KEY_ENV) {
        cfg.decoder.key = key;
    }
    if let Some(iv) = lookup(LOGAN_IV_ENV) {
        cfg.decoder.iv = iv;
    }
    cfg
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn finalize_config(cfg: AppConfig) -> Result<AppConfig> {
    let cfg = apply_env_overrides(cfg, env_non_empty);
    validate_config(&cfg).context("invalid configuration")?;
    Ok(cfg)
}

pub fn expand_path(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{}", home.to_string_lossy(), stripped);
        }
    }
    path.to_string()
}

fn home_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cgmtrace").join("config.toml"))
}

fn repo_default_config_path() -> PathBuf {
    PathBuf::from("config/cgmtrace.toml")
}

fn resolve_config_path_with_overrides(
    raw_path: Option<PathBuf>,
    env_keys: &[&str],
    home_path: Option<PathBuf>,
    repo_default: PathBuf,
) -> PathBuf {
    if let Some(path) = raw_path {
        return path;
    }

    for key in env_keys {
        if let Some(value) = env_non_empty(key) {
            return PathBuf::from(expand_path(value.trim()));
        }
    }

    if let Some(path) = home_path {
        if path.exists() {
            return path;
        }
    }

    repo_default
}

pub fn resolve_config_path(raw_path: Option<PathBuf>) -> PathBuf {
    resolve_config_path_with_overrides(
        raw_path,
        &[CONFIG_ENV],
        home_config_path(),
        repo_default_config_path(),
    )
}

pub fn parse_config(content: &str) -> Result<AppConfig> {
    let cfg: AppConfig = toml::from_str(content).context("failed to parse TOML config")?;
    finalize_config(cfg)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
    parse_config(&content)
}

/// Like [`load_config`], but a missing file yields the built-in defaults.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<AppConfig> {
    if !path.as_ref().exists() {
        return finalize_config(AppConfig::default());
    }
    load_config(path)
}
