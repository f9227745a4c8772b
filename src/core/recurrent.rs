use std::sync::Arc;

use ndarray::prelude::*;

use super::initialization::{Initializer, ScaledUniformInitializer};
use super::operations::{self, GraphError};
use super::{Layer, ParameterStore, Tensor, TensorBuilder};

/// An Elman-style recurrent layer over a `(time steps, input width)` input:
///
/// h_t = tanh(x_t·W_x + h_{t−1}·W_h + b)
///
/// with h_0 = 0. The output stacks the hidden states, one row per step, so
/// downstream layers see a `(time steps, hidden width)` matrix. The whole
/// recurrence is one computation graph; backward through it is
/// backpropagation through time.
pub struct Recurrent {
    identifier: String,
    hidden_dimensionality: usize,
    initializer: Box<dyn Initializer>,
    parameters: ParameterStore,
}

impl Recurrent {
    pub fn new(identifier: &str, hidden_dimensionality: usize) -> Self {
        Self::with_initializer(
            identifier,
            hidden_dimensionality,
            Box::new(ScaledUniformInitializer),
        )
    }

    pub fn with_initializer(
        identifier: &str,
        hidden_dimensionality: usize,
        initializer: Box<dyn Initializer>,
    ) -> Self {
        Self {
            identifier: identifier.to_owned(),
            hidden_dimensionality,
            initializer,
            parameters: ParameterStore::new(),
        }
    }

    fn parameter(&self, name: &str, rows: usize, cols: usize) -> Arc<Tensor> {
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
}

impl Layer for Recurrent {
    fn kind(&self) -> &'static str {
        "recurrent"
    }

    fn forward(&self, input: &Arc<Tensor>, _training: bool) -> Result<Arc<Tensor>, GraphError> {
        let (steps, input_dimensionality) = input.dims();
        let input_weights = self.parameter(
            "input_weights",
            input_dimensionality,
            self.hidden_dimensionality,
        );
        let hidden_weights = self.parameter(
            "hidden_weights",
            self.hidden_dimensionality,
            self.hidden_dimensionality,
        );
        let biases = self.parameter("biases", 1, self.hidden_dimensionality);

        let mut hidden = Arc::new(
            TensorBuilder::new(Array2::zeros((1, self.hidden_dimensionality)))
                .requires_gradient(false)
                .build(),
        );
        let mut states = Vec::with_capacity(steps);
        for step in 0..steps {
            let row = operations::slice(input, step..step + 1, 0..input_dimensionality)?;
            let preactivation = operations::add(
                &operations::add(
                    &operations::matmul(&row, &input_weights)?,
                    &operations::matmul(&hidden, &hidden_weights)?,
                )?,
                &biases,
            )?;
            hidden = operations::tanh(&preactivation);
            states.push(hidden.clone());
        }
        operations::concatenate(&states, 0)
    }

    fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assert_gradients_match;
    use crate::core::initialization::ConstantInitializer;
    use approx::assert_abs_diff_eq;

    fn input(array: Array2<f32>) -> Arc<Tensor> {
        Arc::new(TensorBuilder::new(array).requires_gradient(false).build())
    }

    #[test]
    fn test_recurrent_stacks_one_hidden_state_per_step() {
        let layer = Recurrent::new("rnn", 5);
        let output = layer.forward(&input(Array2::zeros((4, 3))), true).unwrap();
        assert_eq!(output.dims(), (4, 5));
        assert_eq!(layer.parameters().len(), 3);
        assert_eq!(
            layer.parameters().get("input_weights").unwrap().dims(),
            (3, 5)
        );
        assert_eq!(
            layer.parameters().get("hidden_weights").unwrap().dims(),
            (5, 5)
        );
        assert_eq!(layer.parameters().get("biases").unwrap().dims(), (1, 5));
    }

    #[test]
    fn test_hidden_state_carries_between_identical_steps() {
        // With every weight and bias pinned to 0.5 and two identical input
        // rows, the second step still differs from the first through the
        // carried hidden state: h1 = tanh(1.5), h2 = tanh(1.5 + h1).
        let layer = Recurrent::with_initializer("pinned", 2, Box::new(ConstantInitializer::new(0.5)));
        let output = layer
            .forward(&input(array![[1., 1.], [1., 1.]]), true)
            .unwrap()
            .value();
        let h1 = (1.5f32).tanh();
        let h2 = (1.5 + h1).tanh();
        for j in 0..2 {
            assert_abs_diff_eq!(output[[0, j]], h1, epsilon = 1e-6);
            assert_abs_diff_eq!(output[[1, j]], h2, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_backpropagation_through_time_gradient_check() {
        let layer = Recurrent::new("checked", 3);
        let sequence = input(array![[0.5, -0.2], [1.1, 0.4], [-0.3, 0.7]]);
        let output = layer.forward(&sequence, true).unwrap();
        let input_weights = layer.parameters().get("input_weights").unwrap();
        let hidden_weights = layer.parameters().get("hidden_weights").unwrap();
        let biases = layer.parameters().get("biases").unwrap();
        assert_gradients_match(&output, &input_weights, 1e-2);
        assert_gradients_match(&output, &hidden_weights, 1e-2);
        assert_gradients_match(&output, &biases, 1e-2);
    }
}
