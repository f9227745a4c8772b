use std::sync::Arc;

use super::operations::{self, GraphError};
use super::Tensor;

/// A training objective: builds a `(1, 1)` graph node comparing a
/// prediction against a target, so calling `backward` on the result drives
/// gradients into the prediction's subgraph.
pub trait Loss: Send + Sync {
    fn loss(
        &self,
        prediction: &Arc<Tensor>,
        target: &Arc<Tensor>,
    ) -> Result<Arc<Tensor>, GraphError>;
}

/// Mean of the squared element-wise differences. Composed from generic
/// operators rather than fused, as a demonstration that plain graph
/// composition differentiates correctly.
pub struct MeanSquaredError;

impl Loss for MeanSquaredError {
    fn loss(
        &self,
        prediction: &Arc<Tensor>,
        target: &Arc<Tensor>,
    ) -> Result<Arc<Tensor>, GraphError> {
        let difference = operations::subtract(prediction, target)?;
        let squared = operations::multiply(&difference, &difference)?;
        let column_totals = operations::sum(&squared, 0)?;
        let total = operations::sum(&column_totals, 1)?;
        let (rows, cols) = prediction.dims();
        Ok(operations::scale(&total, 1. / (rows * cols) as f32))
    }
}

pub struct MeanAbsoluteError;

impl Loss for MeanAbsoluteError {
    fn loss(
        &self,
        prediction: &Arc<Tensor>,
        target: &Arc<Tensor>,
    ) -> Result<Arc<Tensor>, GraphError> {
        operations::mean_absolute_error(prediction, target)
    }
}

/// Quadratic within `delta` of the target, linear outside: robust to
/// outliers while staying smooth near zero error.
pub struct HuberLoss {
    delta: f32,
}

impl HuberLoss {
    pub fn new(delta: f32) -> Self {
        assert!(delta > 0., "Huber delta should be positive");
        Self { delta }
    }
}

impl Loss for HuberLoss {
    fn loss(
        &self,
        prediction: &Arc<Tensor>,
        target: &Arc<Tensor>,
    ) -> Result<Arc<Tensor>, GraphError> {
        operations::huber(prediction, target, self.delta)
    }
}

/// Binary cross-entropy over raw logits, fusing the sigmoid into the loss
/// for numerical stability.
pub struct SigmoidCrossEntropy;

impl Loss for SigmoidCrossEntropy {
    fn loss(
        &self,
        prediction: &Arc<Tensor>,
        target: &Arc<Tensor>,
    ) -> Result<Arc<Tensor>, GraphError> {
        operations::sigmoid_cross_entropy(prediction, target)
    }
}

/// Categorical cross-entropy over raw logits, one distribution per row,
/// averaged over rows. Temperatures above 1 soften the implied softmax and
/// shrink the gradient.
pub struct SoftmaxCrossEntropy {
    temperature: f32,
}

impl SoftmaxCrossEntropy {
    pub fn new(temperature: f32) -> Self {
        assert!(temperature > 0., "temperature should be positive");
        Self { temperature }
    }
}

impl Default for SoftmaxCrossEntropy {
    fn default() -> Self {
        Self::new(1.)
    }
}

impl Loss for SoftmaxCrossEntropy {
    fn loss(
        &self,
        prediction: &Arc<Tensor>,
        target: &Arc<Tensor>,
    ) -> Result<Arc<Tensor>, GraphError> {
        operations::softmax_cross_entropy(prediction, target, self.temperature)
    }
}
