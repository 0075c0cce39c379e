use std::sync::Arc;

use crate::config::{ArtifactsConfig, ModePaths, ModelBackend};
use crate::features::{ModelMode, Schema, SchemaError};
use crate::model::{ModelError, Regressor, TreeEnsemble};
use crate::registry::{CategoryIndexRegistry, CategoryKind, RegistryError};
use crate::scaler::{ScalerError, StandardScaler};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("{mode} {kind} registry: {source}")]
    Registry {
        mode: ModelMode,
        kind: CategoryKind,
        source: RegistryError,
    },
    #[error("{mode} scaler: {source}")]
    Scaler {
        mode: ModelMode,
        source: ScalerError,
    },
    #[error("{mode} model: {source}")]
    Model {
        mode: ModelMode,
        source: ModelError,
    },
    #[error("{mode} artifacts do not fit the feature schema: {source}")]
    Schema {
        mode: ModelMode,
        source: SchemaError,
    },
    #[error("{kind} registry handed to the {expected} slot of a bundle")]
    WrongRegistry {
        expected: CategoryKind,
        kind: CategoryKind,
    },
    #[error("{0} model uses the torchscript backend; rebuild with --features torch")]
    TorchUnavailable(ModelMode),
}

/// Everything one mode needs at inference time. Immutable once built.
pub struct ModeArtifacts {
    mode: ModelMode,
    street: CategoryIndexRegistry,
    flat_type: CategoryIndexRegistry,
    scaler: StandardScaler,
    regressor: Arc<dyn Regressor>,
    schema: Schema,
}

impl std::fmt::Debug for ModeArtifacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeArtifacts")
            .field("mode", &self.mode)
            .field("street_slots", &self.street.cardinality())
            .field("flat_type_slots", &self.flat_type.cardinality())
            .field("regressor", &self.regressor.describe())
            .finish()
    }
}

impl ModeArtifacts {
    /// Assemble a mode bundle and check that the scaler and regressor agree
    /// with the column layout the registries imply.
    pub fn new(
        mode: ModelMode,
        street: CategoryIndexRegistry,
        flat_type: CategoryIndexRegistry,
        scaler: StandardScaler,
        regressor: Arc<dyn Regressor>,
    ) -> Result<Self, ArtifactError> {
        for (expected, reg) in [(CategoryKind::Street, &street), (CategoryKind::FlatType, &flat_type)] {
            if reg.kind() != expected {
                return Err(ArtifactError::WrongRegistry {
                    expected,
                    kind: reg.kind(),
                });
            }
        }

        let schema = Schema::new(mode, &street, &flat_type);
        let schema_err = |source| ArtifactError::Schema { mode, source };

        scaler.check_schema(&schema).map_err(schema_err)?;
        if let Some(expected) = regressor.num_features() {
            if expected != schema.len() {
                return Err(schema_err(SchemaError::Width {
                    expected,
                    found: schema.len(),
                }));
            }
        }
        if let Some(trained) = regressor.feature_names() {
            if let Some((position, (exp, found))) = trained
                .iter()
                .zip(schema.names())
                .enumerate()
                .find(|(_, (a, b))| a != b)
            {
                return Err(schema_err(SchemaError::ColumnName {
                    position,
                    expected: exp.clone(),
                    found: found.clone(),
                }));
            }
        }

        Ok(Self {
            mode,
            street,
            flat_type,
            scaler,
            regressor,
            schema,
        })
    }

    pub fn load(paths: &ModePaths) -> Result<Self, ArtifactError> {
        let mode = paths.mode;
        let registry = |kind, slots, path: &std::path::Path| {
            CategoryIndexRegistry::load(kind, slots, path)
                .map_err(|source| ArtifactError::Registry { mode, kind, source })
        };
        let street = registry(CategoryKind::Street, paths.street_slots, &paths.street_registry)?;
        let flat_type = registry(
            CategoryKind::FlatType,
            paths.flat_type_slots,
            &paths.flat_type_registry,
        )?;
        let scaler = StandardScaler::load(&paths.scaler)
            .map_err(|source| ArtifactError::Scaler { mode, source })?;
        let width = Schema::new(mode, &street, &flat_type).len();
        let regressor = load_regressor(paths, width)?;

        let artifacts = Self::new(mode, street, flat_type, scaler, regressor)?;
        tracing::info!(
            "{} artifacts ready: {} columns, {}",
            mode,
            artifacts.schema.len(),
            artifacts.regressor.describe()
        );
        Ok(artifacts)
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    pub fn street(&self) -> &CategoryIndexRegistry {
        &self.street
    }

    pub fn flat_type(&self) -> &CategoryIndexRegistry {
        &self.flat_type
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    pub fn regressor(&self) -> &dyn Regressor {
        self.regressor.as_ref()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

fn load_regressor(paths: &ModePaths, width: usize) -> Result<Arc<dyn Regressor>, ArtifactError> {
    let mode = paths.mode;
    let model_err = |source| ArtifactError::Model { mode, source };
    match paths.backend {
        ModelBackend::XgboostJson => Ok(Arc::new(
            TreeEnsemble::load(&paths.model).map_err(model_err)?,
        )),
        #[cfg(feature = "torch")]
        ModelBackend::Torchscript => Ok(Arc::new(
            crate::torch::TorchRegressor::load(&paths.model, width).map_err(model_err)?,
        )),
        #[cfg(not(feature = "torch"))]
        ModelBackend::Torchscript => {
            let _ = width;
            Err(ArtifactError::TorchUnavailable(mode))
        }
    }
}

/// Present and future artifacts, loaded together at startup.
#[derive(Debug)]
pub struct ArtifactBundle {
    present: ModeArtifacts,
    future: ModeArtifacts,
}

impl ArtifactBundle {
    pub fn new(present: ModeArtifacts, future: ModeArtifacts) -> Result<Self, ArtifactError> {
        for (expected, artifacts) in [(ModelMode::Present, &present), (ModelMode::Future, &future)] {
            if artifacts.mode() != expected {
                return Err(ArtifactError::Schema {
                    mode: expected,
                    source: SchemaError::ModeMismatch {
                        expected,
                        found: artifacts.mode(),
                    },
                });
            }
        }
        Ok(Self { present, future })
    }

    pub fn load(cfg: &ArtifactsConfig) -> Result<Self, ArtifactError> {
        let present = ModeArtifacts::load(&cfg.paths(ModelMode::Present))?;
        let future = ModeArtifacts::load(&cfg.paths(ModelMode::Future))?;
        Self::new(present, future)
    }

    pub fn present(&self) -> &ModeArtifacts {
        &self.present
    }

    pub fn future(&self) -> &ModeArtifacts {
        &self.future
    }

    pub fn get(&self, mode: ModelMode) -> &ModeArtifacts {
        match mode {
            ModelMode::Present => &self.present,
            ModelMode::Future => &self.future,
        }
    }
}
