//! Resale price inference for HDB flats.
//!
//! A request's raw attributes are rebuilt into the exact feature row a
//! pretrained regressor was trained on, standardised with the persisted
//! scaler and fed to the regressor, either for the present month or for each
//! of the next three months.

pub mod artifacts;
pub mod calendar;
pub mod config;
pub mod features;
pub mod model;
pub mod predictor;
pub mod registry;
pub mod scaler;
pub mod server;
#[cfg(feature = "torch")]
pub mod torch;
pub mod types;

pub use artifacts::{ArtifactBundle, ArtifactError, ModeArtifacts};
pub use features::{FlatQuery, ModelMode};
pub use predictor::{FuturePrices, PredictError, PresentPrice, Predictor};
