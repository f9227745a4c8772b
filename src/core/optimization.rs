use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ndarray::prelude::*;

use super::Tensor;

/// Applies accumulated gradients to parameters. Implementations hold their
/// own slot state (momentum, moment estimates) per instance, keyed by
/// parameter identifier, so two models never share optimizer state and a
/// parameter that first appears mid-training (lazy shape resolution) just
/// gets a fresh slot.
///
/// Parameters whose gradient buffer is unset are skipped: an unset buffer
/// reads as zero, and a zero gradient moves nothing.
pub trait Optimizer: Send + Sync {
    fn step(&self, parameters: &[Arc<Tensor>]);

    /// How many `step` calls this instance has performed.
    fn step_count(&self) -> usize;

    fn zero_gradients(&self, parameters: &[Arc<Tensor>]) {
        for parameter in parameters {
            parameter.unset_gradient();
        }
    }
}

pub struct StochasticGradientDescentOptimizer {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocities: Mutex<BTreeMap<String, Array2<f32>>>,
    step_count: AtomicUsize,
}

impl StochasticGradientDescentOptimizer {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: 0.,
            weight_decay: 0.,
            velocities: Mutex::new(BTreeMap::new()),
            step_count: AtomicUsize::new(0),
        }
    }

    pub fn momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for StochasticGradientDescentOptimizer {
    fn step(&self, parameters: &[Arc<Tensor>]) {
        self.step_count.fetch_add(1, Ordering::SeqCst);
        for parameter in parameters {
            let Some(gradient) = parameter.gradient() else {
                continue;
            };
            let mut update = gradient;
            if self.weight_decay != 0. {
                update = update + self.weight_decay * &parameter.value();
            }
            if self.momentum != 0. {
                let mut velocities = self
                    .velocities
                    .lock()
                    .expect("velocity lock should not be poisoned");
                let velocity = match velocities.get(parameter.identifier()) {
                    Some(previous) => self.momentum * previous + &update,
                    None => update,
                };
                velocities.insert(parameter.identifier().to_owned(), velocity.clone());
                update = velocity;
            }
            parameter.apply_delta(&(-self.learning_rate * &update));
        }
    }

    fn step_count(&self) -> usize {
        self.step_count.load(Ordering::SeqCst)
    }
}

/// Adagrad: the per-entry learning rate decays with the running sum of
/// squared gradients, so frequently-updated entries take smaller steps.
pub struct AdagradOptimizer {
    learning_rate: f32,
    epsilon: f32,
    accumulators: Mutex<BTreeMap<String, Array2<f32>>>,
    step_count: AtomicUsize,
}

impl AdagradOptimizer {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            epsilon: 1e-8,
            accumulators: Mutex::new(BTreeMap::new()),
            step_count: AtomicUsize::new(0),
        }
    }
}

impl Optimizer for AdagradOptimizer {
    fn step(&self, parameters: &[Arc<Tensor>]) {
        self.step_count.fetch_add(1, Ordering::SeqCst);
        for parameter in parameters {
            let Some(gradient) = parameter.gradient() else {
                continue;
            };
            let mut accumulators = self
                .accumulators
                .lock()
                .expect("accumulator lock should not be poisoned");
            let accumulated = match accumulators.get(parameter.identifier()) {
                Some(previous) => previous + &(&gradient * &gradient),
                None => &gradient * &gradient,
            };
            let update = &gradient / &(accumulated.mapv(f32::sqrt) + self.epsilon);
            accumulators.insert(parameter.identifier().to_owned(), accumulated);
            drop(accumulators);
            parameter.apply_delta(&(-self.learning_rate * &update));
        }
    }

    fn step_count(&self) -> usize {
        self.step_count.load(Ordering::SeqCst)
    }
}

struct MomentEstimates {
    first: Array2<f32>,
    second: Array2<f32>,
    /// Updates applied to this particular parameter, for bias correction —
    /// distinct from the instance-wide step count when a parameter joins
    /// training late.
    updates: usize,
}

/// Adam (Kingma and Ba 2014): exponentially decayed estimates of the
/// gradient's first and second moments, bias-corrected for the early steps.
pub struct AdaptiveMomentEstimationOptimizer {
    learning_rate: f32,
    first_moment_decay: f32,
    second_moment_decay: f32,
    epsilon: f32,
    moments: Mutex<BTreeMap<String, MomentEstimates>>,
    step_count: AtomicUsize,
}

impl AdaptiveMomentEstimationOptimizer {
    pub fn new(learning_rate: f32) -> Self {
        Self::with_decay_rates(learning_rate, 0.9, 0.999)
    }

    pub fn with_decay_rates(
        learning_rate: f32,
        first_moment_decay: f32,
        second_moment_decay: f32,
    ) -> Self {
        Self {
            learning_rate,
            first_moment_decay,
            second_moment_decay,
            epsilon: 1e-8,
            moments: Mutex::new(BTreeMap::new()),
            step_count: AtomicUsize::new(0),
        }
    }
}

impl Optimizer for AdaptiveMomentEstimationOptimizer {
    fn step(&self, parameters: &[Arc<Tensor>]) {
        self.step_count.fetch_add(1, Ordering::SeqCst);
        for parameter in parameters {
            let Some(gradient) = parameter.gradient() else {
                continue;
            };
            let mut moments = self
                .moments
                .lock()
                .expect("moment lock should not be poisoned");
            let (rows, cols) = parameter.dims();
            let slot = moments
                .entry(parameter.identifier().to_owned())
                .or_insert_with(|| MomentEstimates {
                    first: Array2::zeros((rows, cols)),
                    second: Array2::zeros((rows, cols)),
                    updates: 0,
                });
            slot.updates += 1;
            slot.first = self.first_moment_decay * &slot.first
                + (1. - self.first_moment_decay) * &gradient;
            slot.second = self.second_moment_decay * &slot.second
                + (1. - self.second_moment_decay) * &(&gradient * &gradient);
            let t = slot.updates as i32;
            let corrected_first = &slot.first / (1. - self.first_moment_decay.powi(t));
            let corrected_second = &slot.second / (1. - self.second_moment_decay.powi(t));
            let update = &corrected_first / &(corrected_second.mapv(f32::sqrt) + self.epsilon);
            drop(moments);
            parameter.apply_delta(&(-self.learning_rate * &update));
        }
    }

    fn step_count(&self) -> usize {
        self.step_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TensorBuilder;
    use approx::assert_abs_diff_eq;

    fn parameter(array: Array2<f32>) -> Arc<Tensor> {
        Arc::new(TensorBuilder::new(array).requires_gradient(true).build())
    }

    #[test]
    fn test_sgd_step() {
        let weights = parameter(array![[1., 2.], [3., 4.]]);
        weights.add_gradient(&array![[0.1, 0.1], [0.1, 0.1]]);

        let optimizer = StochasticGradientDescentOptimizer::new(0.1);
        optimizer.step(&[weights.clone()]);

        let expected = array![[0.99, 1.99], [2.99, 3.99]];
        for (&actual, &expected) in weights.value().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(actual, expected, epsilon = 1e-6);
        }
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn test_sgd_momentum_accumulates_velocity() {
        let θ = parameter(array![[0.]]);
        let optimizer = StochasticGradientDescentOptimizer::new(0.1).momentum(0.9);

        // v1 = 1, θ = −0.1; v2 = 0.9 + 1 = 1.9, θ = −0.1 − 0.19 = −0.29.
        θ.add_gradient(&array![[1.]]);
        optimizer.step(&[θ.clone()]);
        assert_abs_diff_eq!(θ.value()[[0, 0]], -0.1, epsilon = 1e-6);

        θ.unset_gradient();
        θ.add_gradient(&array![[1.]]);
        optimizer.step(&[θ.clone()]);
        assert_abs_diff_eq!(θ.value()[[0, 0]], -0.29, epsilon = 1e-6);
    }

    #[test]
    fn test_sgd_weight_decay_shrinks_parameters() {
        let θ = parameter(array![[1.]]);
        // A zero gradient still decays the weight itself.
        θ.add_gradient(&array![[0.]]);
        let optimizer = StochasticGradientDescentOptimizer::new(0.1).weight_decay(0.1);
        optimizer.step(&[θ.clone()]);
        assert_abs_diff_eq!(θ.value()[[0, 0]], 0.99, epsilon = 1e-6);
    }

    #[test]
    fn test_parameters_without_gradients_are_skipped() {
        let untouched = parameter(array![[5.]]);
        let optimizer = StochasticGradientDescentOptimizer::new(0.1);
        optimizer.step(&[untouched.clone()]);
        assert_eq!(untouched.value(), array![[5.]]);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn test_adagrad_decays_effective_learning_rate() {
        let θ = parameter(array![[0.]]);
        let optimizer = AdagradOptimizer::new(0.1);

        // Step 1: accumulator 1, update −0.1/√1 = −0.1.
        θ.add_gradient(&array![[1.]]);
        optimizer.step(&[θ.clone()]);
        assert_abs_diff_eq!(θ.value()[[0, 0]], -0.1, epsilon = 1e-4);

        // Step 2: accumulator 2, update −0.1/√2 ≈ −0.0707.
        θ.unset_gradient();
        θ.add_gradient(&array![[1.]]);
        optimizer.step(&[θ.clone()]);
        assert_abs_diff_eq!(θ.value()[[0, 0]], -0.1 - 0.1 / 2.0f32.sqrt(), epsilon = 1e-4);
    }

    #[test]
    fn test_adam_bias_corrected_steps() {
        // With a constant unit gradient, the bias-corrected moments are both
        // 1 at every step, so each update is ≈ −learning rate.
        let θ = parameter(array![[0.]]);
        let optimizer = AdaptiveMomentEstimationOptimizer::new(0.1);

        θ.add_gradient(&array![[1.]]);
        optimizer.step(&[θ.clone()]);
        assert_abs_diff_eq!(θ.value()[[0, 0]], -0.1, epsilon = 1e-4);

        θ.unset_gradient();
        θ.add_gradient(&array![[1.]]);
        optimizer.step(&[θ.clone()]);
        assert_abs_diff_eq!(θ.value()[[0, 0]], -0.2, epsilon = 1e-4);
        assert_eq!(optimizer.step_count(), 2);
    }

    #[test]
    fn test_adam_slots_are_independent_per_parameter() {
        // A parameter that joins at step 2 gets fresh moments and its own
        // bias-correction clock, so its first update is also ≈ −lr.
        let early = parameter(array![[0.]]);
        let late = parameter(array![[0.]]);
        let optimizer = AdaptiveMomentEstimationOptimizer::new(0.1);

        early.add_gradient(&array![[1.]]);
        optimizer.step(&[early.clone()]);

        early.unset_gradient();
        early.add_gradient(&array![[1.]]);
        late.add_gradient(&array![[1.]]);
        optimizer.step(&[early.clone(), late.clone()]);

        assert_abs_diff_eq!(late.value()[[0, 0]], -0.1, epsilon = 1e-4);
    }

    #[test]
    fn test_zero_gradients_clears_buffers() {
        let θ = parameter(array![[1.]]);
        θ.add_gradient(&array![[0.5]]);
        let optimizer = StochasticGradientDescentOptimizer::new(0.1);
        optimizer.zero_gradients(&[θ.clone()]);
        assert!(θ.gradient().is_none());
    }
}
