//! TorchScript regressor backend, for tree models exported to TorchScript
//! (e.g. with hummingbird).

use std::path::Path;
use tch::{kind::Kind, CModule, Device, Tensor};

use crate::features::{FeatureMatrix, SchemaError};
use crate::model::{ModelError, Regressor};

pub struct TorchRegressor {
    model: CModule,
    device: Device,
    in_dim: usize,
}

impl TorchRegressor {
    /// Load a TorchScript module and probe it with a zero row.
    pub fn load(path: &Path, in_dim: usize) -> Result<Self, ModelError> {
        let device = Device::Cpu;
        let model = CModule::load_on_device(path, device).map_err(|e| ModelError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        })?;

        let reg = Self {
            model,
            device,
            in_dim,
        };
        // Probe output shape with a dummy forward; expect [B] or [B, 1]
        let probe = reg.forward(&vec![0f32; in_dim], 1)?;
        if probe.len() != 1 {
            return Err(ModelError::Unsupported(format!(
                "TorchScript module returned {} values for one row",
                probe.len()
            )));
        }
        tracing::info!("loaded {} from {}", reg.describe(), path.display());
        Ok(reg)
    }

    fn forward(&self, x: &[f32], rows: usize) -> Result<Vec<f32>, ModelError> {
        let input = Tensor::from_slice(x)
            .reshape([rows as i64, self.in_dim as i64])
            .to_device(self.device);
        let out = self
            .model
            .forward_ts(&[input])
            .map_err(|e| ModelError::Backend(e.to_string()))?;
        let sz = out.size();
        let flat_ok = match sz.as_slice() {
            [b] => *b == rows as i64,
            [b, 1] => *b == rows as i64,
            _ => false,
        };
        if !flat_ok {
            return Err(ModelError::Backend(format!("unexpected output size: {sz:?}")));
        }
        let out = out.to_kind(Kind::Float).flatten(0, -1);
        Vec::<f32>::try_from(&out).map_err(|e| ModelError::Backend(e.to_string()))
    }
}

impl Regressor for TorchRegressor {
    fn predict(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>, ModelError> {
        if matrix.n_cols() != self.in_dim {
            return Err(SchemaError::Width {
                expected: self.in_dim,
                found: matrix.n_cols(),
            }
            .into());
        }
        let x: Vec<f32> = matrix.values().iter().map(|&v| v as f32).collect();
        let out = self.forward(&x, matrix.n_rows())?;
        Ok(out.into_iter().map(f64::from).collect())
    }

    fn num_features(&self) -> Option<usize> {
        Some(self.in_dim)
    }

    fn describe(&self) -> String {
        format!("torchscript regressor ({} features)", self.in_dim)
    }
}
