use std::sync::Arc;
use std::time::Instant;

use ndarray::prelude::*;
use rayon::prelude::*;

use super::loss::Loss;
use super::operations::GraphError;
use super::optimization::Optimizer;
use super::{backprop, Layer, Tensor, TensorBuilder};

/// An ordered stack of layers, applied first to last.
pub struct Sequential {
    identifier: String,
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_owned(),
            layers: Vec::new(),
        }
    }

    pub fn add(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn forward(&self, input: &Arc<Tensor>, training: bool) -> Result<Arc<Tensor>, GraphError> {
        let mut current = input.clone();
        for layer in &self.layers {
            current = layer.forward(&current, training)?;
        }
        Ok(current)
    }

    /// Every layer's parameters, flattened in layer order. Layers that
    /// resolve shapes lazily contribute nothing until their first forward
    /// call, so the list can grow during the first training epoch.
    pub fn parameters(&self) -> Vec<Arc<Tensor>> {
        self.layers
            .iter()
            .flat_map(|layer| layer.parameters().parameters())
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|parameter| {
                let (rows, cols) = parameter.dims();
                rows * cols
            })
            .sum()
    }
}

/// A network bound to a loss and an optimizer, with the mini-batch training
/// loop.
pub struct Model {
    network: Sequential,
    loss: Box<dyn Loss>,
    optimizer: Box<dyn Optimizer>,
}

impl Model {
    pub fn new(network: Sequential, loss: Box<dyn Loss>, optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            network,
            loss,
            optimizer,
        }
    }

    pub fn network(&self) -> &Sequential {
        &self.network
    }

    pub fn predict(&self, input: &Array2<f32>) -> Result<Array2<f32>, GraphError> {
        let input = Arc::new(
            TensorBuilder::new(input.clone())
                .requires_gradient(false)
                .build(),
        );
        Ok(self.network.forward(&input, false)?.value())
    }

    /// Runs `epochs` passes over the batches. Within an epoch the batches
    /// are processed by a worker pool: each worker builds a private graph
    /// over the shared parameter leaves, evaluates the loss, and
    /// backpropagates, accumulating into the parameters' locked gradient
    /// buffers. The pool's join is the barrier; only then does the optimizer
    /// take its step over the summed gradients.
    ///
    /// Returns the mean per-batch loss of each epoch.
    pub fn train(
        &self,
        batches: &[(Array2<f32>, Array2<f32>)],
        epochs: usize,
    ) -> Result<Vec<f32>, GraphError> {
        assert!(!batches.is_empty(), "training requires at least one batch");
        let start = Instant::now();
        let mut last_report = Instant::now();
        let mut epoch_losses = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            self.optimizer.zero_gradients(&self.network.parameters());
            let total = batches
                .par_iter()
                .map(|(input, target)| {
                    let input = Arc::new(
                        TensorBuilder::new(input.clone())
                            .requires_gradient(false)
                            .build(),
                    );
                    let target = Arc::new(
                        TensorBuilder::new(target.clone())
                            .requires_gradient(false)
                            .build(),
                    );
                    let prediction = self.network.forward(&input, true)?;
                    let loss = self.loss.loss(&prediction, &target)?;
                    let batch_loss = loss.item();
                    backprop(&loss);
                    Ok(batch_loss)
                })
                .sum::<Result<f32, GraphError>>()?;
            // Re-gather: the epoch's forward passes may have lazily created
            // parameters that the pre-epoch snapshot didn't contain.
            self.optimizer.step(&self.network.parameters());
            let mean_loss = total / batches.len() as f32;
            epoch_losses.push(mean_loss);
            log::debug!(
                "{}: epoch {} mean loss {}",
                self.network.identifier(),
                epoch + 1,
                mean_loss
            );
            if last_report.elapsed().as_secs() >= 10 {
                log::info!(
                    "{}: epoch {}/{}, mean loss {}, {:?} elapsed",
                    self.network.identifier(),
                    epoch + 1,
                    epochs,
                    mean_loss,
                    start.elapsed()
                );
                last_report = Instant::now();
            }
        }
        Ok(epoch_losses)
    }
}
