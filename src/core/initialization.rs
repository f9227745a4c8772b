use ndarray::prelude::*;
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;

/// Sources of initial parameter values. Layers take one of these boxed, so
/// the weight distribution is swappable without touching the layer itself
/// (and tests can pin deterministic values).
pub trait Initializer: Send + Sync {
    fn rand_shape(&self, rows: usize, cols: usize) -> Array2<f32>;

    fn rand_vector(&self, n: usize) -> Array1<f32> {
        self.rand_shape(1, n).row(0).to_owned()
    }

    fn rand(&self) -> f32 {
        self.rand_shape(1, 1)[[0, 0]]
    }
}

/// Glorot and Bengio's uniform fan-in/fan-out scaling,
/// U(−√(6/(fan_in + fan_out)), √(6/(fan_in + fan_out))).
pub struct XavierUniformInitializer;

impl Initializer for XavierUniformInitializer {
    fn rand_shape(&self, rows: usize, cols: usize) -> Array2<f32> {
        let limit = (6. / (rows + cols) as f32).sqrt();
        Array::random((rows, cols), Uniform::new(-limit, limit))
    }
}

/// U(−√(1/fan_in), √(1/fan_in)), the scaling torch.nn.Linear defaults to.
pub struct ScaledUniformInitializer;

impl Initializer for ScaledUniformInitializer {
    fn rand_shape(&self, rows: usize, cols: usize) -> Array2<f32> {
        let limit = (1. / rows as f32).sqrt();
        Array::random((rows, cols), Uniform::new(-limit, limit))
    }
}

pub struct UniformInitializer {
    low: f32,
    high: f32,
}

impl UniformInitializer {
    pub fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }
}

impl Initializer for UniformInitializer {
    fn rand_shape(&self, rows: usize, cols: usize) -> Array2<f32> {
        Array::random((rows, cols), Uniform::new(self.low, self.high))
    }
}

pub struct NormalInitializer {
    mean: f32,
    standard_deviation: f32,
}

impl NormalInitializer {
    pub fn new(mean: f32, standard_deviation: f32) -> Self {
        Self {
            mean,
            standard_deviation,
        }
    }
}

impl Initializer for NormalInitializer {
    fn rand_shape(&self, rows: usize, cols: usize) -> Array2<f32> {
        let distribution = Normal::new(self.mean, self.standard_deviation)
            .expect("standard deviation should be finite and non-negative");
        Array::random((rows, cols), distribution)
    }
}

/// Entries are 1.0 with the given probability and 0.0 otherwise. Used for
/// dropout masks.
pub struct BinomialInitializer {
    probability: f32,
}

impl BinomialInitializer {
    pub fn new(probability: f32) -> Self {
        assert!(
            (0. ..=1.).contains(&probability),
            "probability should be in [0, 1]"
        );
        Self { probability }
    }
}

impl Initializer for BinomialInitializer {
    fn rand_shape(&self, rows: usize, cols: usize) -> Array2<f32> {
        let mut rng = rand::thread_rng();
        Array2::from_shape_fn((rows, cols), |_| {
            if rng.gen_bool(self.probability as f64) {
                1.
            } else {
                0.
            }
        })
    }
}

pub struct ZeroInitializer;

impl Initializer for ZeroInitializer {
    fn rand_shape(&self, rows: usize, cols: usize) -> Array2<f32> {
        Array2::zeros((rows, cols))
    }
}

pub struct ConstantInitializer {
    value: f32,
}

impl ConstantInitializer {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl Initializer for ConstantInitializer {
    fn rand_shape(&self, rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_elem((rows, cols), self.value)
    }
}
