use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::features::{Column, FeatureMatrix, Schema, SchemaError};

/// Standard-score parameters exported from the training scaler.
///
/// Loaded from a JSON sidecar so inference standardises exactly the columns
/// training did, with the same statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerParameters {
    pub feature_names: Vec<String>,
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScalerError {
    #[error("failed to read scaler {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse scaler: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("scaler has {names} feature names, {means} means and {scales} scales")]
    LengthMismatch {
        names: usize,
        means: usize,
        scales: usize,
    },
    #[error("scaler column {0:?} is not one of floor_area_sqm, storey_median, flat_age")]
    UnexpectedColumn(String),
    #[error("scaler does not cover column {0:?}")]
    MissingColumn(&'static str),
    #[error("scaler column {name:?} has unusable scale {scale}")]
    BadScale { name: String, scale: f64 },
    #[error("scaler column {name:?} has non-finite mean")]
    BadMean { name: String },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ColumnStats {
    column: Column,
    name: &'static str,
    mean: f64,
    scale: f64,
}

/// Applies `(x - mean) / scale` to the three standardised columns of a
/// feature matrix, located by name. Every other column is left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    stats: Vec<ColumnStats>,
}

impl StandardScaler {
    pub fn new(params: &ScalerParameters) -> Result<Self, ScalerError> {
        let ScalerParameters {
            feature_names,
            mean,
            scale,
        } = params;
        if feature_names.len() != mean.len() || feature_names.len() != scale.len() {
            return Err(ScalerError::LengthMismatch {
                names: feature_names.len(),
                means: mean.len(),
                scales: scale.len(),
            });
        }

        let mut stats = Vec::with_capacity(feature_names.len());
        for ((name, &mean), &scale) in feature_names.iter().zip(mean).zip(scale) {
            let column = Column::from_scalar_name(name)
                .filter(|c| Column::SCALED.contains(c))
                .ok_or_else(|| ScalerError::UnexpectedColumn(name.clone()))?;
            if !scale.is_finite() || scale == 0.0 {
                return Err(ScalerError::BadScale {
                    name: name.clone(),
                    scale,
                });
            }
            if !mean.is_finite() {
                return Err(ScalerError::BadMean { name: name.clone() });
            }
            stats.push(ColumnStats {
                column,
                name: column.scalar_name().unwrap_or_default(),
                mean,
                scale,
            });
        }

        for required in Column::SCALED {
            if !stats.iter().any(|s| s.column == required) {
                return Err(ScalerError::MissingColumn(
                    required.scalar_name().unwrap_or_default(),
                ));
            }
        }

        Ok(Self { stats })
    }

    pub fn from_json(json: &str) -> Result<Self, ScalerError> {
        let params: ScalerParameters = serde_json::from_str(json)?;
        Self::new(&params)
    }

    pub fn load(path: &Path) -> Result<Self, ScalerError> {
        let txt = fs::read_to_string(path).map_err(|source| ScalerError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let scaler = Self::from_json(&txt)?;
        tracing::info!("loaded scaler {} ({} columns)", path.display(), scaler.stats.len());
        Ok(scaler)
    }

    /// Check that a schema carries every standardised column.
    pub fn check_schema(&self, schema: &Schema) -> Result<(), SchemaError> {
        for s in &self.stats {
            if schema.position(s.column).is_none() {
                return Err(SchemaError::MissingColumn(s.name.to_owned()));
            }
        }
        Ok(())
    }

    /// Standardise the scaled columns of every row in place.
    pub fn apply(&self, matrix: &mut FeatureMatrix) -> Result<(), ScalerError> {
        // resolve all positions before touching any value
        let positions = self
            .stats
            .iter()
            .map(|s| {
                matrix
                    .column_position(s.name)
                    .ok_or_else(|| SchemaError::MissingColumn(s.name.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (s, pos) in self.stats.iter().zip(positions) {
            for x in matrix.column_mut(pos) {
                *x = (*x - s.mean) / s.scale;
            }
        }
        Ok(())
    }

    /// Scaled column names, in parameter order.
    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stats.iter().map(|s| s.name)
    }
}
