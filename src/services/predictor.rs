use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::prediction::Features;

/// Maps a job's features to a numeric prediction. Must be synchronous and
/// free of side effects; the worker may call it more than once per job.
pub trait Predictor: Send + Sync {
    fn predict(&self, features: &Features) -> Result<f64, PredictionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("model produced a non-finite value: {0}")]
    NonFinite(f64),

    #[error("model rejected input: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse model coefficients: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Linear house-price model:
/// `price = intercept + rooms * w_rooms + area * w_area + floor * w_floor`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinearPriceModel {
    pub intercept: f64,
    pub rooms: f64,
    pub area: f64,
    pub floor: f64,
}

impl Default for LinearPriceModel {
    /// Coefficients of the synthetic pricing data the model was trained on.
    fn default() -> Self {
        Self {
            intercept: 0.0,
            rooms: 50_000.0,
            area: 3_000.0,
            floor: 10_000.0,
        }
    }
}

impl LinearPriceModel {
    /// Load coefficients from a JSON file such as
    /// `{"intercept": 1200.0, "rooms": 49800.0, "area": 3010.5, "floor": 9950.0}`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl Predictor for LinearPriceModel {
    fn predict(&self, features: &Features) -> Result<f64, PredictionError> {
        let price = self.intercept
            + f64::from(features.rooms) * self.rooms
            + features.area * self.area
            + f64::from(features.floor) * self.floor;

        if !price.is_finite() {
            return Err(PredictionError::NonFinite(price));
        }
        Ok(price)
    }
}
