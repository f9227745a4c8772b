use std::sync::Arc;

use ndarray::prelude::*;

use super::initialization::{BinomialInitializer, Initializer, XavierUniformInitializer};
use super::operations::{self, GraphError};
use super::{Layer, ParameterStore, Tensor, TensorBuilder};

/// A fully-connected layer, `y = x·W + b`, with `W` shaped
/// `(input width, output width)` and `b` a single broadcast row.
///
/// The input width is not declared up front: the first forward call resolves
/// it from the observed input and freezes the weight shapes. Later inputs of
/// a different width fail the matmul's shape validation.
pub struct Dense {
    identifier: String,
    output_dimensionality: usize,
    initializer: Box<dyn Initializer>,
    parameters: ParameterStore,
}

impl Dense {
    pub fn new(identifier: &str, output_dimensionality: usize) -> Self {
        Self::with_initializer(
            identifier,
            output_dimensionality,
            Box::new(XavierUniformInitializer),
        )
    }

    pub fn with_initializer(
        identifier: &str,
        output_dimensionality: usize,
        initializer: Box<dyn Initializer>,
    ) -> Self {
        Self {
            identifier: identifier.to_owned(),
            output_dimensionality,
            initializer,
            parameters: ParameterStore::new(),
        }
    }

    /// Builds the layer around explicit weight and bias values (pretrained
    /// or hand-picked for tests), skipping lazy initialization.
    pub fn from_weights(identifier: &str, weights: Array2<f32>, biases: Array2<f32>) -> Self {
        assert_eq!(
            biases.dim(),
            (1, weights.ncols()),
            "biases should be a single row matching the weights' output width"
        );
        let output_dimensionality = weights.ncols();
        let layer = Self::with_initializer(
            identifier,
            output_dimensionality,
            Box::new(XavierUniformInitializer),
        );
        layer.parameters.insert(
            "weights",
            Arc::new(
                TensorBuilder::new(weights)
                    .identifier(format!("{}::weights", identifier))
                    .requires_gradient(true)
                    .build(),
            ),
        );
        layer.parameters.insert(
            "biases",
            Arc::new(
                TensorBuilder::new(biases)
                    .identifier(format!("{}::biases", identifier))
                    .requires_gradient(true)
                    .build(),
            ),
        );
        layer
    }

    fn weights(&self, input_dimensionality: usize) -> Arc<Tensor> {
        self.parameters.get_or_init("weights", || {
            log::debug!(
                "initializing {}::weights as ({}, {})",
                self.identifier,
                input_dimensionality,
                self.output_dimensionality
            );
            Arc::new(
                TensorBuilder::new(
                    self.initializer
                        .rand_shape(input_dimensionality, self.output_dimensionality),
                )
                .identifier(format!("{}::weights", self.identifier))
                .requires_gradient(true)
                .build(),
            )
        })
    }

    fn biases(&self) -> Arc<Tensor> {
        self.parameters.get_or_init("biases", || {
            Arc::new(
                TensorBuilder::new(self.initializer.rand_shape(1, self.output_dimensionality))
                    .identifier(format!("{}::biases", self.identifier))
                    .requires_gradient(true)
                    .build(),
            )
        })
    }
}

impl Layer for Dense {
    fn kind(&self) -> &'static str {
        "dense"
    }

    fn forward(&self, input: &Arc<Tensor>, _training: bool) -> Result<Arc<Tensor>, GraphError> {
        let (_, input_dimensionality) = input.dims();
        let weights = self.weights(input_dimensionality);
        let biases = self.biases();
        operations::add(&operations::matmul(input, &weights)?, &biases)
    }

    fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }
}

macro_rules! activation_layer {
    ($name:ident, $kind:literal, $operation:path) => {
        /// Stateless activation layer wrapping the pointwise operation.
        #[derive(Default)]
        pub struct $name {
            parameters: ParameterStore,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }
        }

        impl Layer for $name {
            fn kind(&self) -> &'static str {
                $kind
            }

            fn forward(
                &self,
                input: &Arc<Tensor>,
                _training: bool,
            ) -> Result<Arc<Tensor>, GraphError> {
                Ok($operation(input))
            }

            fn parameters(&self) -> &ParameterStore {
                &self.parameters
            }
        }
    };
}

activation_layer!(Relu, "relu", operations::relu);
activation_layer!(Sigmoid, "sigmoid", operations::sigmoid);
activation_layer!(Tanh, "tanh", operations::tanh);

/// Inverted dropout: during training each entry is zeroed with probability
/// `rate` and the survivors are scaled by `1/(1 − rate)`, so the expected
/// activation is unchanged and inference needs no correction. Outside
/// training the input passes through untouched.
pub struct Dropout {
    rate: f32,
    parameters: ParameterStore,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        assert!((0. ..1.).contains(&rate), "dropout rate should be in [0, 1)");
        Self {
            rate,
            parameters: ParameterStore::new(),
        }
    }
}

impl Layer for Dropout {
    fn kind(&self) -> &'static str {
        "dropout"
    }

    fn forward(&self, input: &Arc<Tensor>, training: bool) -> Result<Arc<Tensor>, GraphError> {
        if !training || self.rate == 0. {
            return Ok(input.clone());
        }
        let (rows, cols) = input.dims();
        // A fresh mask per forward call; the mask is a constant with respect
        // to differentiation.
        let keep = Arc::new(
            TensorBuilder::new(BinomialInitializer::new(1. - self.rate).rand_shape(rows, cols))
                .requires_gradient(false)
                .build(),
        );
        Ok(operations::scale(
            &operations::multiply(input, &keep)?,
            1. / (1. - self.rate),
        ))
    }

    fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assert_gradients_match;

    fn input(array: Array2<f32>) -> Arc<Tensor> {
        Arc::new(TensorBuilder::new(array).requires_gradient(false).build())
    }

    #[test]
    fn test_dense_resolves_width_from_first_input() {
        let layer = Dense::new("hidden", 3);
        assert!(layer.parameters().is_empty());

        let output = layer.forward(&input(Array2::zeros((2, 4))), true).unwrap();
        assert_eq!(output.dims(), (2, 3));
        assert_eq!(layer.parameters().len(), 2);
        assert_eq!(layer.parameters().get("weights").unwrap().dims(), (4, 3));
        assert_eq!(layer.parameters().get("biases").unwrap().dims(), (1, 3));

        // The shapes are frozen now: a different input width no longer fits.
        assert!(layer.forward(&input(Array2::zeros((2, 5))), true).is_err());
    }

    #[test]
    fn test_dense_forward_values() {
        let layer = Dense::from_weights(
            "fixed",
            array![[1., 2.], [3., 4.]],
            array![[0.5, -0.5]],
        );
        let output = layer.forward(&input(array![[1., 1.]]), false).unwrap();
        assert_eq!(output.value(), array![[4.5, 5.5]]);
    }

    #[test]
    fn test_dense_bias_gradient_sums_over_batch_rows() {
        let layer = Dense::from_weights(
            "fixed",
            array![[1., 2.], [3., 4.]],
            array![[0.5, -0.5]],
        );
        let output = layer
            .forward(&input(array![[1., 0.], [0., 1.], [1., 1.]]), true)
            .unwrap();
        crate::core::backprop(&output);
        // Three batch rows each contribute ones to the broadcast bias row.
        assert_eq!(
            layer.parameters().get("biases").unwrap().gradient().unwrap(),
            array![[3., 3.]]
        );
    }

    #[test]
    fn test_dense_gradient_check() {
        let layer = Dense::from_weights(
            "checked",
            array![[0.5, -1.2], [1.5, 0.3], [-0.7, 0.8]],
            array![[0.1, -0.4]],
        );
        let output = layer
            .forward(&input(array![[1., 2., -1.], [0.5, -0.3, 1.1]]), true)
            .unwrap();
        let weights = layer.parameters().get("weights").unwrap();
        let biases = layer.parameters().get("biases").unwrap();
        assert_gradients_match(&output, &weights, 1e-2);
        assert_gradients_match(&output, &biases, 1e-2);
    }

    #[test]
    fn test_activation_layers() {
        let x = input(array![[-1.0, 0.0, 2.0]]);
        assert_eq!(
            Relu::new().forward(&x, true).unwrap().value(),
            array![[0.0, 0.0, 2.0]]
        );
        let squashed = Sigmoid::new().forward(&x, true).unwrap().value();
        assert!(squashed.iter().all(|&s| s > 0. && s < 1.));
        let tanhed = Tanh::new().forward(&x, true).unwrap().value();
        assert!(tanhed.iter().all(|&t| t > -1. && t < 1.));
    }

    #[test]
    fn test_dropout_passes_through_outside_training() {
        let layer = Dropout::new(0.5);
        let x = input(Array2::ones((3, 3)));
        let output = layer.forward(&x, false).unwrap();
        assert!(Arc::ptr_eq(&x, &output));
    }

    #[test]
    fn test_dropout_zeroes_and_rescales_during_training() {
        let layer = Dropout::new(0.5);
        let x = input(Array2::ones((8, 8)));
        let output = layer.forward(&x, true).unwrap().value();
        // Survivors are scaled by 1/(1 − rate) = 2; the rest are zeroed.
        assert!(output.iter().all(|&v| v == 0. || v == 2.));
    }
}
