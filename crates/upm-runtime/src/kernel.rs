//! Numeric training kernel seam.
//!
//! The trainer owns a boxed [`TrainingKernel`] and is the only caller that
//! mutates it. [`LinearKernel`] is a small SGD regressor used by tests and the
//! simulation CLI.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use upm_core::FeatureBatch;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Numeric failure: {0}")]
    Numeric(String),

    #[error("Parameter serialization failed: {0}")]
    Serialization(String),
}

/// A model that learns incrementally from one batch at a time.
pub trait TrainingKernel: Send + Sync {
    /// Apply one update and return the batch loss.
    fn apply_update(&mut self, batch: &FeatureBatch) -> Result<f64, KernelError>;

    /// Serialize the current parameters.
    fn export_params(&self) -> Result<Vec<u8>, KernelError>;

    /// Replace the current parameters.
    fn import_params(&mut self, bytes: &[u8]) -> Result<(), KernelError>;
}

/// Builds a fresh kernel, e.g. after the supervisor restarts a trainer.
pub type KernelFactory = Arc<dyn Fn() -> Box<dyn TrainingKernel> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearParams {
    pub weights: Vec<f64>,
    pub bias: f64,
}

/// Linear regression trained with mini-batch gradient descent on squared error.
#[derive(Debug, Clone)]
pub struct LinearKernel {
    params: LinearParams,
    learning_rate: f64,
}

impl LinearKernel {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            params: LinearParams::default(),
            learning_rate,
        }
    }

    pub fn factory(learning_rate: f64) -> KernelFactory {
        Arc::new(move || Box::new(LinearKernel::new(learning_rate)) as Box<dyn TrainingKernel>)
    }

    pub fn params(&self) -> &LinearParams {
        &self.params
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        self.params
            .weights
            .iter()
            .zip(row)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.params.bias
    }
}

impl Default for LinearKernel {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl TrainingKernel for LinearKernel {
    fn apply_update(&mut self, batch: &FeatureBatch) -> Result<f64, KernelError> {
        let labels = batch
            .labels
            .as_ref()
            .ok_or_else(|| KernelError::InvalidBatch(format!("batch {} has no labels", batch.id)))?;
        if batch.features.is_empty() {
            return Err(KernelError::InvalidBatch(format!(
                "batch {} has no rows",
                batch.id
            )));
        }
        if batch.features.len() != labels.len() {
            return Err(KernelError::InvalidBatch(format!(
                "batch {} has {} rows but {} labels",
                batch.id,
                batch.features.len(),
                labels.len()
            )));
        }

        let dim = batch.features[0].len();
        if batch.features.iter().any(|row| row.len() != dim) {
            return Err(KernelError::InvalidBatch(format!(
                "batch {} has ragged feature rows",
                batch.id
            )));
        }
        if self.params.weights.is_empty() {
            self.params.weights = vec![0.0; dim];
        } else if self.params.weights.len() != dim {
            return Err(KernelError::InvalidBatch(format!(
                "batch {} has {} features, model expects {}",
                batch.id,
                dim,
                self.params.weights.len()
            )));
        }

        let n = labels.len() as f64;
        let mut grad_w = vec![0.0; dim];
        let mut grad_b = 0.0;
        let mut loss = 0.0;
        for (row, &y) in batch.features.iter().zip(labels) {
            let err = self.predict(row) - y;
            loss += err * err;
            grad_b += err;
            for (g, x) in grad_w.iter_mut().zip(row) {
                *g += err * x;
            }
        }
        loss /= n;
        if !loss.is_finite() {
            return Err(KernelError::Numeric(format!(
                "non-finite loss on batch {}",
                batch.id
            )));
        }

        let step = 2.0 * self.learning_rate / n;
        for (w, g) in self.params.weights.iter_mut().zip(&grad_w) {
            *w -= step * g;
        }
        self.params.bias -= step * grad_b;
        Ok(loss)
    }

    fn export_params(&self) -> Result<Vec<u8>, KernelError> {
        serde_json::to_vec(&self.params).map_err(|e| KernelError::Serialization(e.to_string()))
    }

    fn import_params(&mut self, bytes: &[u8]) -> Result<(), KernelError> {
        self.params =
            serde_json::from_slice(bytes).map_err(|e| KernelError::Serialization(e.to_string()))?;
        Ok(())
    }
}
