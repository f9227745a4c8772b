use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};

use lazy_static::lazy_static;
use ndarray::prelude::*;

pub mod attention;
pub mod dense;
pub mod initialization;
pub mod loss;
pub mod network;
pub mod operations;
pub mod optimization;
pub mod recurrent;

use self::operations::{GraphError, Operation};

lazy_static! {
    static ref COUNTER: Mutex<u64> = Mutex::new(0);
}

fn generate_sequential_tensor_id() -> String {
    let mut num = COUNTER.lock().unwrap();
    *num += 1;
    format!("Tensor{}", num)
}

/// A node in a computation graph: either a leaf holding directly-set data
/// (parameters, inputs), or a derived node whose value is recomputed on
/// demand from its operation's operands.
///
/// Leaves are shared between worker threads (the same parameter tensor
/// appears in many per-batch subgraphs), so the data buffer sits behind an
/// `RwLock` and the accumulated gradient behind a `Mutex`: gradient
/// accumulation is a read-modify-write and must be exclusive.
pub struct Tensor {
    identifier: String,
    data: RwLock<Option<Array2<f32>>>,
    operation: Option<Operation>,
    rows: usize,
    cols: usize,
    requires_gradient: bool,
    needs_gradient: bool,
    gradient: Mutex<Option<Array2<f32>>>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("identifier", &self.identifier)
            .field("dims", &(self.rows, self.cols))
            .field("requires_gradient", &self.requires_gradient)
            .field("gradient", &self.gradient)
            .finish()
    }
}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for Tensor {}

impl Tensor {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Shape of this node's value, fixed at construction.
    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_leaf(&self) -> bool {
        self.operation.is_none()
    }

    pub fn requires_gradient(&self) -> bool {
        self.requires_gradient
    }

    /// Whether any tensor at or below this node requires gradient tracking.
    pub(crate) fn needs_gradient(&self) -> bool {
        self.needs_gradient
    }

    /// The materialized value of this node. A derived node re-runs its
    /// operation's forward function on every call (recursively re-evaluating
    /// its operands): nothing is cached, so a node built over a parameter
    /// always sees the parameter's current contents, even after an optimizer
    /// update.
    pub fn value(&self) -> Array2<f32> {
        match &self.operation {
            Some(operation) => operation.forward(),
            None => self
                .data
                .read()
                .expect("data lock should not be poisoned")
                .clone()
                .expect("leaf tensor should hold data"),
        }
    }

    /// The single entry of a `(1, 1)`-shaped node, e.g. a loss.
    pub fn item(&self) -> f32 {
        assert_eq!(self.dims(), (1, 1), "item() expects a scalar-shaped tensor");
        self.value()[[0, 0]]
    }

    /// Replaces a leaf's buffer, keeping its shape. This is how an external
    /// deserializer restores trained weights.
    pub fn set_value(&self, array: Array2<f32>) {
        assert!(self.is_leaf(), "only leaf tensors hold settable data");
        assert_eq!(
            array.dim(),
            (self.rows, self.cols),
            "replacement data must keep the tensor's shape"
        );
        *self.data.write().expect("data lock should not be poisoned") = Some(array);
    }

    /// Adds a delta element-wise into a leaf's buffer, in place. Optimizers
    /// apply their parameter updates through this.
    pub fn apply_delta(&self, delta: &Array2<f32>) {
        assert!(self.is_leaf(), "only leaf tensors can be updated in place");
        let mut guard = self.data.write().expect("data lock should not be poisoned");
        let array = guard.as_mut().expect("leaf tensor should hold data");
        assert_eq!(
            array.dim(),
            delta.dim(),
            "delta must match the parameter's shape"
        );
        *array += delta;
    }

    pub fn gradient(&self) -> Option<Array2<f32>> {
        self.gradient
            .lock()
            .expect("gradient lock should not be poisoned")
            .clone()
    }

    /// Adds a contribution into the accumulated-gradient buffer, allocating
    /// it on first use. Contributions are always summed, never overwritten:
    /// a tensor read by several paths in the graph (or by several worker
    /// threads) receives the sum of every path's gradient.
    pub fn add_gradient(&self, contribution: &Array2<f32>) {
        let mut guard = self
            .gradient
            .lock()
            .expect("gradient lock should not be poisoned");
        match guard.as_mut() {
            Some(accumulated) => *accumulated += contribution,
            None => *guard = Some(contribution.clone()),
        }
    }

    /// Clears this node's gradient buffer. A cleared buffer reads as zero.
    pub fn unset_gradient(&self) {
        *self
            .gradient
            .lock()
            .expect("gradient lock should not be poisoned") = None;
    }

    /// Propagates a gradient seed backward through the graph below this
    /// node. The operation computes each operand's local gradient in closed
    /// form; operands that need gradient tracking accumulate it and recurse
    /// with the local gradient as their own seed. Leaves stop the walk.
    pub fn backward(&self, seed: Array2<f32>) {
        assert_eq!(
            seed.dim(),
            (self.rows, self.cols),
            "gradient seed must match the tensor's shape"
        );
        if let Some(operation) = &self.operation {
            for (operand, local_gradient) in operation.backward(&seed) {
                if operand.needs_gradient() {
                    operand.add_gradient(&local_gradient);
                    operand.backward(local_gradient);
                }
            }
        }
    }

    /// Clears the gradient buffer of every node reachable from this one,
    /// visiting each node exactly once. Must run before `backward` in each
    /// training step, since accumulation is additive across calls.
    pub fn zero_gradients(&self) {
        let mut visited = HashSet::new();
        self.zero_gradients_walk(&mut visited);
    }

    fn zero_gradients_walk(&self, visited: &mut HashSet<String>) {
        if !visited.insert(self.identifier.clone()) {
            return;
        }
        self.unset_gradient();
        if let Some(operation) = &self.operation {
            for operand in operation.operands() {
                operand.zero_gradients_walk(&mut *visited);
            }
        }
    }

    pub(crate) fn from_operation(operation: Operation, rows: usize, cols: usize) -> Arc<Tensor> {
        let needs_gradient = operation
            .operands()
            .iter()
            .any(|operand| operand.needs_gradient());
        Arc::new(Tensor {
            identifier: generate_sequential_tensor_id(),
            data: RwLock::new(None),
            operation: Some(operation),
            rows,
            cols,
            requires_gradient: false,
            needs_gradient,
            gradient: Mutex::new(None),
        })
    }
}

/// Seeds the culmination node with a gradient of ones and propagates it
/// backward through the whole graph.
pub fn backprop(culmination: &Arc<Tensor>) {
    let (rows, cols) = culmination.dims();
    culmination.backward(Array2::ones((rows, cols)));
}

pub struct TensorBuilder {
    array: Array2<f32>,
    identifier: Option<String>,
    requires_gradient: bool,
    gradient: Option<Array2<f32>>,
}

impl TensorBuilder {
    pub fn new(array: Array2<f32>) -> TensorBuilder {
        TensorBuilder {
            array,
            identifier: None,
            requires_gradient: true,
            gradient: None,
        }
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> TensorBuilder {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn requires_gradient(mut self, requires: bool) -> TensorBuilder {
        self.requires_gradient = requires;
        self
    }

    pub fn gradient(mut self, gradient: Array2<f32>) -> TensorBuilder {
        self.gradient = Some(gradient);
        self
    }

    pub fn build(self) -> Tensor {
        let (rows, cols) = self.array.dim();
        Tensor {
            identifier: match self.identifier {
                Some(identifier) => identifier,
                None => generate_sequential_tensor_id(),
            },
            data: RwLock::new(Some(self.array)),
            operation: None,
            rows,
            cols,
            requires_gradient: self.requires_gradient,
            needs_gradient: self.requires_gradient,
            gradient: Mutex::new(self.gradient),
        }
    }
}

/// A layer's named parameters: a name → leaf-tensor map with unique keys.
///
/// Interior mutability supports the initialize-once pattern for lazy shape
/// resolution: a layer whose weight shapes depend on the first observed
/// input inserts them from `forward(&self, ...)`, possibly racing with
/// other workers' first forward calls.
#[derive(Default)]
pub struct ParameterStore {
    entries: RwLock<BTreeMap<String, Arc<Tensor>>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, parameter: Arc<Tensor>) {
        let name = name.into();
        let mut entries = self
            .entries
            .write()
            .expect("parameter lock should not be poisoned");
        assert!(
            !entries.contains_key(&name),
            "parameter names are unique per store"
        );
        entries.insert(name, parameter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tensor>> {
        self.entries
            .read()
            .expect("parameter lock should not be poisoned")
            .get(name)
            .cloned()
    }

    /// Fetches a parameter, creating it with `init` if it doesn't exist yet.
    /// The write lock makes initialization happen exactly once even when
    /// several workers' first forward passes race.
    pub fn get_or_init(&self, name: &str, init: impl FnOnce() -> Arc<Tensor>) -> Arc<Tensor> {
        let mut entries = self
            .entries
            .write()
            .expect("parameter lock should not be poisoned");
        entries.entry(name.to_owned()).or_insert_with(init).clone()
    }

    /// Name–tensor pairs in deterministic (sorted-name) order.
    pub fn tensors(&self) -> Vec<(String, Arc<Tensor>)> {
        self.entries
            .read()
            .expect("parameter lock should not be poisoned")
            .iter()
            .map(|(name, parameter)| (name.clone(), parameter.clone()))
            .collect()
    }

    pub fn parameters(&self) -> Vec<Arc<Tensor>> {
        self.tensors()
            .into_iter()
            .map(|(_, parameter)| parameter)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("parameter lock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn zero_gradients(&self) {
        for parameter in self.parameters() {
            parameter.unset_gradient();
        }
    }
}

/// A parameterized (or parameterless) transform over a tensor.
pub trait Layer: Send + Sync {
    /// Class tag, exposed so an external serializer can record what kind of
    /// layer each parameter store belongs to.
    fn kind(&self) -> &'static str;

    /// Applies the layer's transform, extending the computation graph. On
    /// the first call, layers with shape-dependent weights resolve them from
    /// the observed input dimensions; later calls reuse the frozen shapes.
    fn forward(&self, input: &Arc<Tensor>, training: bool) -> Result<Arc<Tensor>, GraphError>;

    fn parameters(&self) -> &ParameterStore;
}

/// Compares the analytic gradient at `leaf` (backward with a seed of ones,
/// i.e. the gradient of the sum of `output`'s entries) against a central
/// finite difference of the recomputed forward value.
#[cfg(test)]
pub(crate) fn assert_gradients_match(output: &Arc<Tensor>, leaf: &Arc<Tensor>, tolerance: f32) {
    use approx::assert_abs_diff_eq;

    output.zero_gradients();
    backprop(output);
    let analytic = leaf.gradient().expect("backward should reach the leaf");

    let h = 1e-3;
    let (rows, cols) = leaf.dims();
    for i in 0..rows {
        for j in 0..cols {
            let mut bump = Array2::<f32>::zeros((rows, cols));
            bump[[i, j]] = h;
            leaf.apply_delta(&bump);
            let plus = output.value().sum();
            bump[[i, j]] = -2. * h;
            leaf.apply_delta(&bump);
            let minus = output.value().sum();
            bump[[i, j]] = h;
            leaf.apply_delta(&bump); // restore the original entry
            let numerical = (plus - minus) / (2. * h);
            assert_abs_diff_eq!(analytic[[i, j]], numerical, epsilon = tolerance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backprop() {
        let a = Arc::new(
            TensorBuilder::new(array![[2.0]])
                .identifier("a")
                .requires_gradient(true)
                .build(),
        );
        let b = Arc::new(
            TensorBuilder::new(array![[3.0]])
                .identifier("b")
                .requires_gradient(true)
                .build(),
        );
        let c = Arc::new(
            TensorBuilder::new(array![[4.0]])
                .identifier("c")
                .requires_gradient(true)
                .build(),
        );

        let mul = operations::multiply(&a, &b).unwrap();
        let result = operations::add(&mul, &c).unwrap();

        backprop(&result);

        assert_eq!(a.gradient().unwrap(), array![[3.0]]);
        assert_eq!(b.gradient().unwrap(), array![[2.0]]);
        assert_eq!(c.gradient().unwrap(), array![[1.0]]);
    }

    #[test]
    fn test_backprop_with_reuse_sums_path_contributions() {
        let a = Arc::new(
            TensorBuilder::new(array![[2.0]])
                .identifier("a")
                .requires_gradient(true)
                .build(),
        );
        let b = Arc::new(
            TensorBuilder::new(array![[3.0]])
                .identifier("b")
                .requires_gradient(true)
                .build(),
        );

        // Each path's gradient in isolation:
        let product = operations::multiply(&a, &b).unwrap();
        backprop(&product);
        let a_product_gradient = a.gradient().unwrap();
        assert_eq!(a_product_gradient, array![[3.0]]);
        a.unset_gradient();
        b.unset_gradient();

        let sum = operations::add(&a, &b).unwrap();
        backprop(&sum);
        let a_sum_gradient = a.gradient().unwrap();
        assert_eq!(a_sum_gradient, array![[1.0]]);
        a.unset_gradient();
        b.unset_gradient();

        // Compute (a * b) + (a + b): both paths read `a`, and its
        // accumulated gradient is the sum of the isolated gradients.
        let mul = operations::multiply(&a, &b).unwrap();
        let add = operations::add(&a, &b).unwrap();
        let result = operations::add(&mul, &add).unwrap();

        backprop(&result);

        assert_eq!(
            a.gradient().unwrap(),
            a_product_gradient + a_sum_gradient // 3 + 1
        );
        assert_eq!(b.gradient().unwrap(), array![[3.0]]); // 2 + 1
    }

    #[test]
    fn test_derived_values_recompute_after_leaf_mutation() {
        let leaf = Arc::new(TensorBuilder::new(array![[2.0]]).build());
        let squared = operations::multiply(&leaf, &leaf).unwrap();
        assert_eq!(squared.value(), array![[4.0]]);

        // The graph holds no cached forward results, so an in-place update
        // (as an optimizer would make) is visible on the next evaluation.
        leaf.set_value(array![[3.0]]);
        assert_eq!(squared.value(), array![[9.0]]);

        leaf.apply_delta(&array![[1.0]]);
        assert_eq!(squared.value(), array![[16.0]]);
    }

    #[test]
    fn test_zero_gradients_is_idempotent() {
        let a = Arc::new(
            TensorBuilder::new(array![[1.0, 2.0]])
                .requires_gradient(true)
                .build(),
        );
        let b = Arc::new(
            TensorBuilder::new(array![[3.0, 4.0]])
                .requires_gradient(true)
                .build(),
        );
        let result = operations::add(&a, &b).unwrap();

        backprop(&result);
        assert!(a.gradient().is_some());
        assert!(b.gradient().is_some());

        result.zero_gradients();
        assert!(a.gradient().is_none());
        assert!(b.gradient().is_none());

        result.zero_gradients();
        assert!(a.gradient().is_none());
        assert!(b.gradient().is_none());
    }

    #[test]
    fn test_concurrent_accumulation_into_shared_leaf() {
        let parameter = Arc::new(
            TensorBuilder::new(array![[1.0, 2.0]])
                .identifier("shared_parameter")
                .requires_gradient(true)
                .build(),
        );

        // Four workers each build a private subgraph over the same leaf and
        // run backward concurrently; the leaf's gradient is the sum of all
        // four seeds-of-ones scaled by 2.
        let handles = (0..4)
            .map(|_| {
                let parameter = parameter.clone();
                std::thread::spawn(move || {
                    let doubled = operations::scale(&parameter, 2.0);
                    backprop(&doubled);
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("worker should finish");
        }

        assert_eq!(parameter.gradient().unwrap(), array![[8.0, 8.0]]);
    }

    #[test]
    fn test_dims_are_stable_without_evaluation() {
        let a = Arc::new(TensorBuilder::new(Array2::zeros((3, 4))).build());
        let transposed = operations::transpose(&a);
        assert_eq!(transposed.dims(), (4, 3));
        let product = operations::matmul(&a, &transposed).unwrap();
        assert_eq!(product.dims(), (3, 3));
    }
}
