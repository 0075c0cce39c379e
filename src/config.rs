use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::features::{FlatQuery, ModelMode};

pub const DEFAULT_CONFIG_PATH: &str = "config/service.json";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub port: u16,
    pub artifacts: ArtifactsConfig,
    pub flat_age: FlatAgePolicy,
    pub defaults: RequestDefaults,
    /// Log a summary of every feature vector sent to a model.
    pub log_features: bool,
    /// Browser origins allowed to call the API; empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            artifacts: ArtifactsConfig::default(),
            flat_age: FlatAgePolicy::default(),
            defaults: RequestDefaults::default(),
            log_features: false,
            cors_origins: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("invalid config JSON in {}", path.display()))
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Resolve the config file from `HDB_CONFIG` and apply environment overrides.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("HDB_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_or_default(Path::new(&path))?;
        cfg.apply_overrides(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// `PORT`, `BIND_ADDR`, `ARTIFACT_DIR` and `LOG_PRED` take precedence over the file.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = var("PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("PORT must be a port number, got {port:?}"))?;
        }
        if let Some(addr) = var("BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(dir) = var("ARTIFACT_DIR") {
            self.artifacts.root = PathBuf::from(dir);
        }
        if let Some(flag) = var("LOG_PRED") {
            self.log_features = flag == "1";
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.bind_addr, self.port))
    }
}

/// Regressor artifact format.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelBackend {
    /// XGBoost `save_model` JSON, evaluated natively.
    #[default]
    XgboostJson,
    /// TorchScript module; needs the `torch` feature.
    Torchscript,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub root: PathBuf,
    pub present: ModeFiles,
    pub future: ModeFiles,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("static/models"),
            present: ModeFiles::default(),
            future: ModeFiles::default(),
        }
    }
}

/// File names for one mode, relative to `<root>/<mode>/` unless `dir` is set.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ModeFiles {
    pub dir: Option<PathBuf>,
    pub street_registry: PathBuf,
    pub flat_type_registry: PathBuf,
    pub scaler: PathBuf,
    pub model: PathBuf,
    pub backend: ModelBackend,
    /// One-hot widths; the trained defaults apply when unset.
    pub street_slots: Option<usize>,
    pub flat_type_slots: Option<usize>,
}

impl Default for ModeFiles {
    fn default() -> Self {
        Self {
            dir: None,
            street_registry: PathBuf::from("cols_street_name.json"),
            flat_type_registry: PathBuf::from("cols_flat_type.json"),
            scaler: PathBuf::from("scaler.json"),
            model: PathBuf::from("model.json"),
            backend: ModelBackend::default(),
            street_slots: None,
            flat_type_slots: None,
        }
    }
}

/// Fully resolved artifact locations for one mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ModePaths {
    pub mode: ModelMode,
    pub street_registry: PathBuf,
    pub flat_type_registry: PathBuf,
    pub scaler: PathBuf,
    pub model: PathBuf,
    pub backend: ModelBackend,
    pub street_slots: usize,
    pub flat_type_slots: usize,
}

impl ArtifactsConfig {
    pub fn files(&self, mode: ModelMode) -> &ModeFiles {
        match mode {
            ModelMode::Present => &self.present,
            ModelMode::Future => &self.future,
        }
    }

    pub fn paths(&self, mode: ModelMode) -> ModePaths {
        let files = self.files(mode);
        let dir = files
            .dir
            .clone()
            .unwrap_or_else(|| self.root.join(mode.to_string()));
        ModePaths {
            mode,
            street_registry: dir.join(&files.street_registry),
            flat_type_registry: dir.join(&files.flat_type_registry),
            scaler: dir.join(&files.scaler),
            model: dir.join(&files.model),
            backend: files.backend,
            street_slots: files
                .street_slots
                .unwrap_or_else(|| mode.default_street_cardinality()),
            flat_type_slots: files
                .flat_type_slots
                .unwrap_or_else(|| mode.default_flat_type_cardinality()),
        }
    }
}

/// Acceptable flat-age range. Ages outside it are always logged; they are
/// rejected only when `enforce` is set.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FlatAgePolicy {
    pub min: Option<i32>,
    pub max: Option<i32>,
    pub enforce: bool,
}

impl FlatAgePolicy {
    pub fn contains(&self, age: i32) -> bool {
        self.min.map_or(true, |min| age >= min) && self.max.map_or(true, |max| age <= max)
    }
}

/// Values used for omitted request parameters.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RequestDefaults {
    pub street_name: String,
    pub floor_area: f64,
    pub storey_range: i32,
    pub lease_start: i32,
    pub flat_type: String,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            street_name: "CLEMENTI AVE 1".to_string(),
            floor_area: 70.0,
            storey_range: 1,
            lease_start: 2000,
            flat_type: "2 ROOM".to_string(),
        }
    }
}

impl From<&RequestDefaults> for FlatQuery {
    fn from(d: &RequestDefaults) -> Self {
        FlatQuery {
            street_name: d.street_name.clone(),
            floor_area: d.floor_area,
            storey_range: d.storey_range,
            lease_start: d.lease_start,
            flat_type: d.flat_type.clone(),
        }
    }
}
