use std::sync::Arc;

use ndarray::prelude::*;

use super::initialization::{ConstantInitializer, Initializer, NormalInitializer, ZeroInitializer};
use super::operations::{self, GraphError};
use super::{Layer, ParameterStore, Tensor, TensorBuilder};

/// When the causal mask applies. `Always` is the autoregressive setting;
/// `TrainingOnly` supports encoder-style uses that mask during training
/// runs but attend freely at inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Masking {
    Always,
    TrainingOnly,
    Never,
}

/// Single-head scaled dot-product self-attention over a
/// `(sequence length, embedding width)` input.
///
/// Rows attend to each other via `softmax(QKᵀ/√d)·V`, followed by an output
/// projection back to the embedding width. With causal masking, position `i`
/// only attends to positions `≤ i`.
pub struct SelfAttention {
    identifier: String,
    attention_dimensionality: usize,
    masking: Masking,
    initializer: Box<dyn Initializer>,
    parameters: ParameterStore,
}

impl SelfAttention {
    pub fn new(identifier: &str, attention_dimensionality: usize, masking: Masking) -> Self {
        Self::with_initializer(
            identifier,
            attention_dimensionality,
            masking,
            Box::new(NormalInitializer::new(0., 0.02)),
        )
    }

    pub fn with_initializer(
        identifier: &str,
        attention_dimensionality: usize,
        masking: Masking,
        initializer: Box<dyn Initializer>,
    ) -> Self {
        Self {
            identifier: identifier.to_owned(),
            attention_dimensionality,
            masking,
            initializer,
            parameters: ParameterStore::new(),
        }
    }

    fn projection(&self, name: &str, rows: usize, cols: usize) -> Arc<Tensor> {
        self.parameters.get_or_init(name, || {
            log::debug!(
                "initializing {}::{} as ({}, {})",
                self.identifier,
                name,
                rows,
                cols
            );
            Arc::new(
                TensorBuilder::new(self.initializer.rand_shape(rows, cols))
                    .identifier(format!("{}::{}", self.identifier, name))
                    .requires_gradient(true)
                    .build(),
            )
        })
    }

    fn masked(&self, training: bool) -> bool {
        match self.masking {
            Masking::Always => true,
            Masking::TrainingOnly => training,
            Masking::Never => false,
        }
    }
}

impl Layer for SelfAttention {
    fn kind(&self) -> &'static str {
        "self_attention"
    }

    fn forward(&self, input: &Arc<Tensor>, training: bool) -> Result<Arc<Tensor>, GraphError> {
        let (sequence_length, embedding_dimensionality) = input.dims();
        let query_weights = self.projection(
            "query_weights",
            embedding_dimensionality,
            self.attention_dimensionality,
        );
        let key_weights = self.projection(
            "key_weights",
            embedding_dimensionality,
            self.attention_dimensionality,
        );
        let value_weights = self.projection(
            "value_weights",
            embedding_dimensionality,
            self.attention_dimensionality,
        );
        let output_weights = self.projection(
            "output_weights",
            self.attention_dimensionality,
            embedding_dimensionality,
        );

        let queries = operations::matmul(input, &query_weights)?;
        let keys = operations::matmul(input, &key_weights)?;
        let values = operations::matmul(input, &value_weights)?;

        let scores = operations::matmul(&queries, &operations::transpose(&keys))?;
        let mut scaled = operations::scale(
            &scores,
            1. / (self.attention_dimensionality as f32).sqrt(),
        );

        if self.masked(training) {
            // Zeros above the diagonal mark the positions to be pushed to
            // −∞ before the softmax.
            let causal = Arc::new(
                TensorBuilder::new(Array2::from_shape_fn(
                    (sequence_length, sequence_length),
                    |(i, j)| if j > i { 0. } else { 1. },
                ))
                .requires_gradient(false)
                .build(),
            );
            scaled = operations::mask(&scaled, &causal)?;
        }

        let attention_weights = operations::softmax_along(&scaled, 1)?;
        let context = operations::matmul(&attention_weights, &values)?;
        operations::matmul(&context, &output_weights)
    }

    fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }
}

/// Per-row normalization to zero mean and unit variance, then a learned
/// element-wise rescale and shift (both single broadcast rows, initialized
/// to ones and zeros respectively).
pub struct LayerNorm {
    identifier: String,
    epsilon: f32,
    parameters: ParameterStore,
}

impl LayerNorm {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_owned(),
            epsilon: 1e-5,
            parameters: ParameterStore::new(),
        }
    }

    fn row_parameter(
        &self,
        name: &str,
        width: usize,
        initializer: &dyn Initializer,
    ) -> Arc<Tensor> {
        self.parameters.get_or_init(name, || {
            Arc::new(
                TensorBuilder::new(initializer.rand_shape(1, width))
                    .identifier(format!("{}::{}", self.identifier, name))
                    .requires_gradient(true)
                    .build(),
            )
        })
    }
}

impl Layer for LayerNorm {
    fn kind(&self) -> &'static str {
        "layer_norm"
    }

    fn forward(&self, input: &Arc<Tensor>, _training: bool) -> Result<Arc<Tensor>, GraphError> {
        let (rows, cols) = input.dims();
        let scale = self.row_parameter("scale", cols, &ConstantInitializer::new(1.));
        let shift = self.row_parameter("shift", cols, &ZeroInitializer);

        let mean = operations::mean(input, 1)?;
        let centered = operations::subtract(input, &mean)?;
        let variance = operations::variance(input, 1)?;
        // The epsilon keeps the square root differentiable (and the division
        // finite) on constant rows.
        let epsilon = Arc::new(
            TensorBuilder::new(Array2::from_elem((rows, 1), self.epsilon))
                .requires_gradient(false)
                .build(),
        );
        let deviation = operations::sqrt(&operations::add(&variance, &epsilon)?);
        let normalized = operations::divide(&centered, &deviation)?;

        // Element-wise multiplication doesn't broadcast, so the learned row
        // is stacked up to the input's height; the concatenation's backward
        // sums the per-row contributions back into the single parameter row.
        let replicated_scale = operations::concatenate(&vec![scale; rows], 0)?;
        let rescaled = operations::multiply(&normalized, &replicated_scale)?;
        operations::add(&rescaled, &shift)
    }

    fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assert_gradients_match;
    use approx::assert_abs_diff_eq;

    fn input(array: Array2<f32>) -> Arc<Tensor> {
        Arc::new(TensorBuilder::new(array).requires_gradient(false).build())
    }

    fn sequence_a() -> Array2<f32> {
        array![
            [0.5, -0.2, 1.0, 0.3],
            [1.1, 0.4, -0.6, 0.9],
            [-0.3, 0.7, 0.2, -1.0]
        ]
    }

    fn sequence_b_same_first_row() -> Array2<f32> {
        array![
            [0.5, -0.2, 1.0, 0.3],
            [-2.0, 3.0, 0.1, -0.5],
            [1.7, -0.9, 2.2, 0.4]
        ]
    }

    #[test]
    fn test_attention_preserves_embedding_width() {
        let layer = SelfAttention::new("attention", 5, Masking::Never);
        let output = layer.forward(&input(sequence_a()), true).unwrap();
        assert_eq!(output.dims(), (3, 4));
        assert_eq!(layer.parameters().len(), 4);
        assert_eq!(
            layer.parameters().get("query_weights").unwrap().dims(),
            (4, 5)
        );
        assert_eq!(
            layer.parameters().get("output_weights").unwrap().dims(),
            (5, 4)
        );
    }

    #[test]
    fn test_causal_masking_hides_later_positions_from_the_first() {
        let layer = SelfAttention::new("masked", 5, Masking::Always);
        // Same first row, completely different continuations: under the
        // causal mask, position 0 attends only to itself, so its output
        // can't see the difference.
        let one = layer.forward(&input(sequence_a()), false).unwrap().value();
        let other = layer
            .forward(&input(sequence_b_same_first_row()), false)
            .unwrap()
            .value();
        for (&a, &b) in one.row(0).iter().zip(other.row(0).iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_unmasked_attention_sees_later_positions() {
        let layer = SelfAttention::new("unmasked", 5, Masking::Never);
        let one = layer.forward(&input(sequence_a()), false).unwrap().value();
        let other = layer
            .forward(&input(sequence_b_same_first_row()), false)
            .unwrap()
            .value();
        let first_row_difference: f32 = (&one.row(0) - &other.row(0)).mapv(f32::abs).sum();
        assert!(first_row_difference > 1e-4);
    }

    #[test]
    fn test_training_only_masking_toggles_with_the_flag() {
        let layer = SelfAttention::new("toggled", 5, Masking::TrainingOnly);
        let a = input(sequence_a());
        let b = input(sequence_b_same_first_row());

        let trained_one = layer.forward(&a, true).unwrap().value();
        let trained_other = layer.forward(&b, true).unwrap().value();
        for (&x, &y) in trained_one.row(0).iter().zip(trained_other.row(0).iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }

        let inferred_one = layer.forward(&a, false).unwrap().value();
        let inferred_other = layer.forward(&b, false).unwrap().value();
        let difference: f32 = (&inferred_one.row(0) - &inferred_other.row(0))
            .mapv(f32::abs)
            .sum();
        assert!(difference > 1e-4);
    }

    #[test]
    fn test_attention_gradient_check() {
        let layer = SelfAttention::new("checked", 3, Masking::Always);
        let output = layer.forward(&input(sequence_a()), true).unwrap();
        let value_weights = layer.parameters().get("value_weights").unwrap();
        let output_weights = layer.parameters().get("output_weights").unwrap();
        assert_gradients_match(&output, &value_weights, 1e-2);
        assert_gradients_match(&output, &output_weights, 1e-2);
    }

    #[test]
    fn test_layer_norm_normalizes_each_row() {
        let layer = LayerNorm::new("norm");
        let normalized = layer.forward(&input(sequence_a()), true).unwrap().value();
        for row in normalized.rows() {
            let mean = row.mean().unwrap();
            let variance = row.mapv(|x| (x - mean).powi(2)).mean().unwrap();
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
            assert_abs_diff_eq!(variance, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_layer_norm_gradient_check() {
        let layer = LayerNorm::new("checked_norm");
        let x = Arc::new(
            TensorBuilder::new(sequence_a())
                .requires_gradient(true)
                .build(),
        );
        let output = layer.forward(&x, true).unwrap();
        let scale = layer.parameters().get("scale").unwrap();
        let shift = layer.parameters().get("shift").unwrap();
        assert_gradients_match(&output, &scale, 1e-2);
        assert_gradients_match(&output, &shift, 1e-2);
        assert_gradients_match(&output, &x, 1e-2);
    }
}
