use std::ops::Range;
use std::sync::Arc;

use ndarray::prelude::*;
use ndarray::Zip;
use thiserror::Error;

use super::Tensor;

/// Errors surfaced when a graph node is built over incompatible operands.
///
/// Construction is the validation boundary: once a node exists, its forward
/// and backward functions assume the shapes already fit and do not re-check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("{operation}: incompatible shapes {left:?} and {right:?}")]
    ShapeMismatch {
        operation: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },
    #[error("{operation}: axis {axis} out of range for 2-D tensors")]
    InvalidAxis {
        operation: &'static str,
        axis: usize,
    },
    #[error("{operation}: range {start}..{end} exceeds extent {extent}")]
    RangeOutOfBounds {
        operation: &'static str,
        start: usize,
        end: usize,
        extent: usize,
    },
    #[error("{operation}: cannot reshape {dims:?} into ({rows}, {cols})")]
    IncompatibleReshape {
        operation: &'static str,
        dims: (usize, usize),
        rows: usize,
        cols: usize,
    },
    #[error("{operation}: at least one operand required")]
    NoOperands { operation: &'static str },
}

/// How the right operand of an element-wise operation is expanded to match
/// the left. Decided once, when the node is constructed, from the operands'
/// declared dims — never re-inferred from shapes at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Broadcast {
    None,
    /// The right operand is a single row, replicated across the left's rows.
    /// Its gradient is the incoming gradient summed over the rows.
    AcrossRows,
    /// The right operand is a single column, replicated across the left's
    /// columns. Its gradient is the incoming gradient summed over columns.
    AcrossColumns,
}

fn elementwise_broadcast(
    operation: &'static str,
    a: &Tensor,
    b: &Tensor,
) -> Result<Broadcast, GraphError> {
    let (rows, cols) = a.dims();
    match b.dims() {
        dims if dims == (rows, cols) => Ok(Broadcast::None),
        (1, c) if c == cols => Ok(Broadcast::AcrossRows),
        (r, 1) if r == rows => Ok(Broadcast::AcrossColumns),
        right => Err(GraphError::ShapeMismatch {
            operation,
            left: (rows, cols),
            right,
        }),
    }
}

fn reduce_broadcast(gradient: &Array2<f32>, broadcast: Broadcast) -> Array2<f32> {
    match broadcast {
        Broadcast::None => gradient.clone(),
        Broadcast::AcrossRows => gradient.sum_axis(Axis(0)).insert_axis(Axis(0)),
        Broadcast::AcrossColumns => gradient.sum_axis(Axis(1)).insert_axis(Axis(1)),
    }
}

fn validate_axis(operation: &'static str, axis: usize) -> Result<(), GraphError> {
    if axis < 2 {
        Ok(())
    } else {
        Err(GraphError::InvalidAxis { operation, axis })
    }
}

fn validate_same_dims(
    operation: &'static str,
    a: &Tensor,
    b: &Tensor,
) -> Result<(), GraphError> {
    if a.dims() == b.dims() {
        Ok(())
    } else {
        Err(GraphError::ShapeMismatch {
            operation,
            left: a.dims(),
            right: b.dims(),
        })
    }
}

/// Numerically stable softmax of a vector: the maximum is shifted to zero
/// before exponentiating.
pub fn softmax(x: Array1<f32>) -> Array1<f32> {
    let max = x.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let exponentiated = x.mapv(|v| (v - max).exp());
    let scale: f32 = exponentiated.sum();
    exponentiated / scale
}

fn δ(i: usize, j: usize) -> f32 {
    if i == j {
        1.
    } else {
        0.
    }
}

/// Softmax along `axis`: `axis = 1` normalizes each row, `axis = 0` each
/// column.
fn softmax_lanes(x: &Array2<f32>, axis: usize) -> Array2<f32> {
    match axis {
        1 => {
            let mut softmaxed = Array2::zeros((0, x.ncols()));
            for row in x.rows() {
                softmaxed
                    .push_row(softmax(row.to_owned()).view())
                    .expect("row should fit");
            }
            softmaxed
        }
        0 => softmax_lanes(&x.t().to_owned(), 1).t().to_owned(),
        _ => unreachable!("axis was validated at construction"),
    }
}

/// Per lane, the derivative matrix dS_i/dx_j is
///
/// softmax(x)_i · (δ_ij − softmax(x)_j)
///
/// which says how the softmax outputs vary with their inputs; multiplying it
/// with the out-gradient dL/dS_i gives dL/dx_j. Quadratic in the lane width,
/// which is fine for the small feature/vocabulary widths this engine runs.
fn softmax_backward_lanes(
    x: &Array2<f32>,
    out_gradient: &Array2<f32>,
    axis: usize,
) -> Array2<f32> {
    match axis {
        1 => {
            let softmaxed = softmax_lanes(x, 1);
            let n = x.ncols();
            let mut gradient = Array2::zeros((0, n));
            for i in 0..x.nrows() {
                let p = softmaxed.row(i);
                let d = Array2::from_shape_fn((n, n), |(j, k)| p[j] * (δ(j, k) - p[k]));
                let gradient_row = d.dot(&out_gradient.row(i));
                gradient
                    .push_row(gradient_row.view())
                    .expect("row should fit");
            }
            gradient
        }
        0 => softmax_backward_lanes(&x.t().to_owned(), &out_gradient.t().to_owned(), 1)
            .t()
            .to_owned(),
        _ => unreachable!("axis was validated at construction"),
    }
}

fn sigmoid_scalar(z: f32) -> f32 {
    1. / (1. + (-z).exp())
}

/// The operator set, as a tagged sum over operand handles: adding a new
/// operator means adding a variant and satisfying the exhaustive matches in
/// `forward`, `backward`, and `operands`.
pub(crate) enum Operation {
    Addition {
        a: Arc<Tensor>,
        b: Arc<Tensor>,
        broadcast: Broadcast,
    },
    Subtraction {
        a: Arc<Tensor>,
        b: Arc<Tensor>,
        broadcast: Broadcast,
    },
    Multiplication {
        a: Arc<Tensor>,
        b: Arc<Tensor>,
    },
    Division {
        a: Arc<Tensor>,
        b: Arc<Tensor>,
        broadcast: Broadcast,
    },
    MatrixMultiplication {
        a: Arc<Tensor>,
        b: Arc<Tensor>,
    },
    Scale {
        a: Arc<Tensor>,
        factor: f32,
    },
    Transpose {
        a: Arc<Tensor>,
    },
    Slice {
        a: Arc<Tensor>,
        rows: Range<usize>,
        cols: Range<usize>,
    },
    Concatenation {
        parts: Vec<Arc<Tensor>>,
        axis: usize,
    },
    Reshape {
        a: Arc<Tensor>,
        rows: usize,
        cols: usize,
    },
    Exponentiation {
        a: Arc<Tensor>,
    },
    Logarithm {
        a: Arc<Tensor>,
    },
    Power {
        a: Arc<Tensor>,
        exponent: f32,
    },
    SquareRoot {
        a: Arc<Tensor>,
    },
    HyperbolicTangent {
        a: Arc<Tensor>,
    },
    RectifiedLinearUnit {
        a: Arc<Tensor>,
    },
    Sigmoid {
        a: Arc<Tensor>,
    },
    SumAlong {
        a: Arc<Tensor>,
        axis: usize,
    },
    MeanAlong {
        a: Arc<Tensor>,
        axis: usize,
    },
    VarianceAlong {
        a: Arc<Tensor>,
        axis: usize,
    },
    MaxAlong {
        a: Arc<Tensor>,
        axis: usize,
    },
    Softmax {
        a: Arc<Tensor>,
        axis: usize,
    },
    Mask {
        a: Arc<Tensor>,
        mask: Arc<Tensor>,
    },
    MeanAbsoluteError {
        prediction: Arc<Tensor>,
        target: Arc<Tensor>,
    },
    Huber {
        prediction: Arc<Tensor>,
        target: Arc<Tensor>,
        delta: f32,
    },
    SigmoidCrossEntropy {
        prediction: Arc<Tensor>,
        target: Arc<Tensor>,
    },
    SoftmaxCrossEntropy {
        prediction: Arc<Tensor>,
        target: Arc<Tensor>,
        temperature: f32,
    },
}

impl Operation {
    pub(crate) fn operands(&self) -> Vec<Arc<Tensor>> {
        use Operation::*;
        match self {
            Addition { a, b, .. }
            | Subtraction { a, b, .. }
            | Multiplication { a, b }
            | Division { a, b, .. }
            | MatrixMultiplication { a, b } => vec![a.clone(), b.clone()],
            Scale { a, .. }
            | Transpose { a }
            | Slice { a, .. }
            | Reshape { a, .. }
            | Exponentiation { a }
            | Logarithm { a }
            | Power { a, .. }
            | SquareRoot { a }
            | HyperbolicTangent { a }
            | RectifiedLinearUnit { a }
            | Sigmoid { a }
            | SumAlong { a, .. }
            | MeanAlong { a, .. }
            | VarianceAlong { a, .. }
            | MaxAlong { a, .. }
            | Softmax { a, .. } => vec![a.clone()],
            Concatenation { parts, .. } => parts.clone(),
            Mask { a, mask } => vec![a.clone(), mask.clone()],
            MeanAbsoluteError { prediction, target }
            | Huber {
                prediction, target, ..
            }
            | SigmoidCrossEntropy { prediction, target }
            | SoftmaxCrossEntropy {
                prediction, target, ..
            } => vec![prediction.clone(), target.clone()],
        }
    }

    /// Computes this node's value from the current values of its operands.
    pub(crate) fn forward(&self) -> Array2<f32> {
        use Operation::*;
        match self {
            Addition { a, b, .. } => a.value() + &b.value(),
            Subtraction { a, b, .. } => a.value() - &b.value(),
            Multiplication { a, b } => a.value() * &b.value(),
            // Division and Logarithm assume well-conditioned inputs: a zero
            // divisor or non-positive logarithm argument produces NaN/Inf
            // that propagates silently. Callers add a stabilizing epsilon.
            Division { a, b, .. } => a.value() / &b.value(),
            MatrixMultiplication { a, b } => a.value().dot(&b.value()),
            Scale { a, factor } => a.value() * *factor,
            Transpose { a } => a.value().t().to_owned(),
            Slice { a, rows, cols } => a
                .value()
                .slice(s![rows.clone(), cols.clone()])
                .to_owned(),
            Concatenation { parts, axis } => {
                let arrays = parts.iter().map(|part| part.value()).collect::<Vec<_>>();
                let views = arrays.iter().map(|array| array.view()).collect::<Vec<_>>();
                ndarray::concatenate(Axis(*axis), &views).expect("shapes were validated")
            }
            Reshape { a, rows, cols } => a
                .value()
                .into_shape_with_order((*rows, *cols))
                .expect("element count was validated"),
            Exponentiation { a } => a.value().mapv(f32::exp),
            Logarithm { a } => a.value().mapv(f32::ln),
            Power { a, exponent } => a.value().mapv(|x| x.powf(*exponent)),
            SquareRoot { a } => a.value().mapv(f32::sqrt),
            HyperbolicTangent { a } => a.value().mapv(f32::tanh),
            RectifiedLinearUnit { a } => a.value().mapv(|x| if x > 0. { x } else { 0. }),
            Sigmoid { a } => a.value().mapv(sigmoid_scalar),
            SumAlong { a, axis } => a.value().sum_axis(Axis(*axis)).insert_axis(Axis(*axis)),
            MeanAlong { a, axis } => a
                .value()
                .mean_axis(Axis(*axis))
                .expect("reduced axis should be non-empty")
                .insert_axis(Axis(*axis)),
            VarianceAlong { a, axis } => {
                let array = a.value();
                let n = array.len_of(Axis(*axis)) as f32;
                let mean = array
                    .mean_axis(Axis(*axis))
                    .expect("reduced axis should be non-empty")
                    .insert_axis(Axis(*axis));
                let deviations = &array - &mean;
                ((&deviations * &deviations).sum_axis(Axis(*axis)) / n).insert_axis(Axis(*axis))
            }
            MaxAlong { a, axis } => a
                .value()
                .fold_axis(Axis(*axis), f32::NEG_INFINITY, |acc, &x| acc.max(x))
                .insert_axis(Axis(*axis)),
            Softmax { a, axis } => softmax_lanes(&a.value(), *axis),
            Mask { a, mask } => {
                let array = a.value();
                let mask_values = mask.value();
                Array2::from_shape_fn(array.raw_dim(), |(i, j)| {
                    if mask_values[[i, j]] == 0. {
                        f32::NEG_INFINITY
                    } else {
                        array[[i, j]]
                    }
                })
            }
            MeanAbsoluteError { prediction, target } => {
                let difference = prediction.value() - &target.value();
                let n = difference.len() as f32;
                array![[difference.mapv(f32::abs).sum() / n]]
            }
            Huber {
                prediction,
                target,
                delta,
            } => {
                let difference = prediction.value() - &target.value();
                let n = difference.len() as f32;
                let total = difference
                    .mapv(|e| {
                        if e.abs() <= *delta {
                            0.5 * e * e
                        } else {
                            delta * (e.abs() - 0.5 * delta)
                        }
                    })
                    .sum();
                array![[total / n]]
            }
            SigmoidCrossEntropy { prediction, target } => {
                // The stable formulation max(z, 0) − z·y + ln(1 + e^(−|z|)).
                let logits = prediction.value();
                let labels = target.value();
                let n = logits.len() as f32;
                let mut total = 0.;
                Zip::from(&logits).and(&labels).for_each(|&z, &y| {
                    total += z.max(0.) - z * y + (-z.abs()).exp().ln_1p();
                });
                array![[total / n]]
            }
            SoftmaxCrossEntropy {
                prediction,
                target,
                temperature,
            } => {
                // − Σ_j y_ij · log softmax(x_i/T)_j, averaged over rows i.
                let scaled = prediction.value().mapv(|v| v / temperature);
                let softmaxed = softmax_lanes(&scaled, 1);
                let labels = target.value();
                let rows = labels.nrows() as f32;
                let mut total = 0.;
                Zip::from(&labels).and(&softmaxed).for_each(|&y, &s| {
                    total -= y * s.ln();
                });
                array![[total / rows]]
            }
        }
    }

    /// Distributes the incoming gradient to each operand via this
    /// operation's closed-form derivative. Returns one (operand, local
    /// gradient) pair per operand, each gradient shaped like its operand.
    pub(crate) fn backward(&self, out_gradient: &Array2<f32>) -> Vec<(Arc<Tensor>, Array2<f32>)> {
        use Operation::*;
        match self {
            Addition { a, b, broadcast } => vec![
                (a.clone(), out_gradient.clone()),
                (b.clone(), reduce_broadcast(out_gradient, *broadcast)),
            ],
            Subtraction { a, b, broadcast } => vec![
                (a.clone(), out_gradient.clone()),
                (b.clone(), -reduce_broadcast(out_gradient, *broadcast)),
            ],
            Multiplication { a, b } => vec![
                (a.clone(), out_gradient * &b.value()),
                (b.clone(), out_gradient * &a.value()),
            ],
            Division { a, b, broadcast } => {
                let numerator = a.value();
                let divisor = b.value();
                let a_gradient = out_gradient / &divisor;
                let b_gradient_full = -(out_gradient * &numerator) / &(&divisor * &divisor);
                vec![
                    (a.clone(), a_gradient),
                    (b.clone(), reduce_broadcast(&b_gradient_full, *broadcast)),
                ]
            }
            MatrixMultiplication { a, b } => {
                // dA = g·Bᵀ and dB = Aᵀ·g; matrix multiplication is not
                // commutative, hence the separate cases.
                let left = a.value();
                let right = b.value();
                vec![
                    (a.clone(), out_gradient.dot(&right.t())),
                    (b.clone(), left.t().dot(out_gradient)),
                ]
            }
            Scale { a, factor } => vec![(a.clone(), out_gradient * *factor)],
            Transpose { a } => vec![(a.clone(), out_gradient.t().to_owned())],
            Slice { a, rows, cols } => {
                let (full_rows, full_cols) = a.dims();
                let mut gradient = Array2::zeros((full_rows, full_cols));
                gradient
                    .slice_mut(s![rows.clone(), cols.clone()])
                    .assign(out_gradient);
                vec![(a.clone(), gradient)]
            }
            Concatenation { parts, axis } => {
                let mut contributions = Vec::with_capacity(parts.len());
                let mut offset = 0;
                for part in parts {
                    let extent = match axis {
                        0 => part.dims().0,
                        _ => part.dims().1,
                    };
                    let slice = match axis {
                        0 => out_gradient.slice(s![offset..offset + extent, ..]),
                        _ => out_gradient.slice(s![.., offset..offset + extent]),
                    };
                    contributions.push((part.clone(), slice.to_owned()));
                    offset += extent;
                }
                contributions
            }
            Reshape { a, .. } => {
                let (rows, cols) = a.dims();
                vec![(
                    a.clone(),
                    out_gradient
                        .clone()
                        .into_shape_with_order((rows, cols))
                        .expect("element count was validated"),
                )]
            }
            Exponentiation { a } => vec![(a.clone(), out_gradient * &a.value().mapv(f32::exp))],
            Logarithm { a } => vec![(a.clone(), out_gradient / &a.value())],
            Power { a, exponent } => {
                let scaled = a.value().mapv(|x| exponent * x.powf(exponent - 1.));
                vec![(a.clone(), out_gradient * &scaled)]
            }
            SquareRoot { a } => {
                let halved = a.value().mapv(|x| 0.5 / x.sqrt());
                vec![(a.clone(), out_gradient * &halved)]
            }
            HyperbolicTangent { a } => {
                let damping = a.value().mapv(|x| 1. - x.tanh().powi(2));
                vec![(a.clone(), out_gradient * &damping)]
            }
            RectifiedLinearUnit { a } => {
                let array = a.value();
                let mut gradient = Array2::zeros(array.raw_dim());
                Zip::from(&mut gradient)
                    .and(out_gradient)
                    .and(&array)
                    .for_each(|g, &o, &x| {
                        if x > 0. {
                            *g = o;
                        }
                    });
                vec![(a.clone(), gradient)]
            }
            Sigmoid { a } => {
                let squashed = a.value().mapv(sigmoid_scalar);
                let damping = squashed.mapv(|s| s * (1. - s));
                vec![(a.clone(), out_gradient * &damping)]
            }
            SumAlong { a, .. } => {
                let (rows, cols) = a.dims();
                vec![(
                    a.clone(),
                    out_gradient
                        .broadcast((rows, cols))
                        .expect("gradient should broadcast back across the reduced axis")
                        .to_owned(),
                )]
            }
            MeanAlong { a, axis } => {
                let (rows, cols) = a.dims();
                let n = match axis {
                    0 => rows,
                    _ => cols,
                } as f32;
                let expanded = out_gradient
                    .broadcast((rows, cols))
                    .expect("gradient should broadcast back across the reduced axis")
                    .to_owned();
                vec![(a.clone(), expanded / n)]
            }
            VarianceAlong { a, axis } => {
                // d var/dx_i = 2(x_i − μ)/n, with the mean treated as a
                // function of x as well (the cross terms cancel).
                let array = a.value();
                let n = array.len_of(Axis(*axis)) as f32;
                let mean = array
                    .mean_axis(Axis(*axis))
                    .expect("reduced axis should be non-empty")
                    .insert_axis(Axis(*axis));
                let deviations = &array - &mean;
                let expanded = out_gradient
                    .broadcast(array.raw_dim())
                    .expect("gradient should broadcast back across the reduced axis")
                    .to_owned();
                vec![(a.clone(), (expanded * &deviations) * (2. / n))]
            }
            MaxAlong { a, axis } => {
                // The gradient flows to the first maximal entry of each lane.
                let array = a.value();
                let (rows, cols) = array.dim();
                let mut gradient = Array2::zeros((rows, cols));
                match axis {
                    0 => {
                        for j in 0..cols {
                            let mut best = 0;
                            for i in 1..rows {
                                if array[[i, j]] > array[[best, j]] {
                                    best = i;
                                }
                            }
                            gradient[[best, j]] += out_gradient[[0, j]];
                        }
                    }
                    _ => {
                        for i in 0..rows {
                            let mut best = 0;
                            for j in 1..cols {
                                if array[[i, j]] > array[[i, best]] {
                                    best = j;
                                }
                            }
                            gradient[[i, best]] += out_gradient[[i, 0]];
                        }
                    }
                }
                vec![(a.clone(), gradient)]
            }
            Softmax { a, axis } => vec![(
                a.clone(),
                softmax_backward_lanes(&a.value(), out_gradient, *axis),
            )],
            Mask { a, mask } => {
                let mask_values = mask.value();
                let masked_gradient = Array2::from_shape_fn(mask_values.raw_dim(), |(i, j)| {
                    if mask_values[[i, j]] == 0. {
                        0.
                    } else {
                        out_gradient[[i, j]]
                    }
                });
                // The mask itself is a constant: it gets no gradient.
                vec![
                    (a.clone(), masked_gradient),
                    (mask.clone(), Array2::zeros(mask_values.raw_dim())),
                ]
            }
            MeanAbsoluteError { prediction, target } => {
                let difference = prediction.value() - &target.value();
                let n = difference.len() as f32;
                let factor = out_gradient[[0, 0]] / n;
                let signs = difference.mapv(|e| {
                    if e > 0. {
                        1.
                    } else if e < 0. {
                        -1.
                    } else {
                        0.
                    }
                });
                vec![
                    (prediction.clone(), factor * &signs),
                    (target.clone(), -factor * &signs),
                ]
            }
            Huber {
                prediction,
                target,
                delta,
            } => {
                // Inside the delta band the loss is quadratic (gradient e);
                // outside it is linear (gradient ±δ) — i.e. e clamped.
                let difference = prediction.value() - &target.value();
                let n = difference.len() as f32;
                let factor = out_gradient[[0, 0]] / n;
                let clamped = difference.mapv(|e| e.clamp(-delta, *delta));
                vec![
                    (prediction.clone(), factor * &clamped),
                    (target.clone(), -factor * &clamped),
                ]
            }
            SigmoidCrossEntropy { prediction, target } => {
                let logits = prediction.value();
                let labels = target.value();
                let n = logits.len() as f32;
                let factor = out_gradient[[0, 0]] / n;
                let squashed = logits.mapv(sigmoid_scalar);
                vec![
                    (prediction.clone(), factor * &(squashed - &labels)),
                    (target.clone(), -factor * &logits),
                ]
            }
            SoftmaxCrossEntropy {
                prediction,
                target,
                temperature,
            } => {
                // dL/dx = (softmax(x/T) − y)/T per row — the tidiness of this
                // is the motivation for fusing the softmax activation with
                // the cross-entropy loss as one operation.
                let scaled = prediction.value().mapv(|v| v / temperature);
                let softmaxed = softmax_lanes(&scaled, 1);
                let labels = target.value();
                let rows = labels.nrows() as f32;
                let factor = out_gradient[[0, 0]] / (temperature * rows);
                let target_dims = target.dims();
                vec![
                    (prediction.clone(), factor * &(softmaxed - &labels)),
                    (target.clone(), Array2::zeros(target_dims)),
                ]
            }
        }
    }
}

fn derived(operation: Operation, rows: usize, cols: usize) -> Arc<Tensor> {
    Tensor::from_operation(operation, rows, cols)
}

pub fn add(a: &Arc<Tensor>, b: &Arc<Tensor>) -> Result<Arc<Tensor>, GraphError> {
    let broadcast = elementwise_broadcast("add", a, b)?;
    let (rows, cols) = a.dims();
    Ok(derived(
        Operation::Addition {
            a: a.clone(),
            b: b.clone(),
            broadcast,
        },
        rows,
        cols,
    ))
}

pub fn subtract(a: &Arc<Tensor>, b: &Arc<Tensor>) -> Result<Arc<Tensor>, GraphError> {
    let broadcast = elementwise_broadcast("subtract", a, b)?;
    let (rows, cols) = a.dims();
    Ok(derived(
        Operation::Subtraction {
            a: a.clone(),
            b: b.clone(),
            broadcast,
        },
        rows,
        cols,
    ))
}

pub fn multiply(a: &Arc<Tensor>, b: &Arc<Tensor>) -> Result<Arc<Tensor>, GraphError> {
    validate_same_dims("multiply", a, b)?;
    let (rows, cols) = a.dims();
    Ok(derived(
        Operation::Multiplication {
            a: a.clone(),
            b: b.clone(),
        },
        rows,
        cols,
    ))
}

/// Element-wise division. The divisor is assumed strictly nonzero; no
/// epsilon guard is applied here.
pub fn divide(a: &Arc<Tensor>, b: &Arc<Tensor>) -> Result<Arc<Tensor>, GraphError> {
    let broadcast = elementwise_broadcast("divide", a, b)?;
    let (rows, cols) = a.dims();
    Ok(derived(
        Operation::Division {
            a: a.clone(),
            b: b.clone(),
            broadcast,
        },
        rows,
        cols,
    ))
}

pub fn matmul(a: &Arc<Tensor>, b: &Arc<Tensor>) -> Result<Arc<Tensor>, GraphError> {
    let (a_rows, a_cols) = a.dims();
    let (b_rows, b_cols) = b.dims();
    if a_cols != b_rows {
        return Err(GraphError::ShapeMismatch {
            operation: "matmul",
            left: (a_rows, a_cols),
            right: (b_rows, b_cols),
        });
    }
    Ok(derived(
        Operation::MatrixMultiplication {
            a: a.clone(),
            b: b.clone(),
        },
        a_rows,
        b_cols,
    ))
}

pub fn scale(a: &Arc<Tensor>, factor: f32) -> Arc<Tensor> {
    let (rows, cols) = a.dims();
    derived(Operation::Scale { a: a.clone(), factor }, rows, cols)
}

pub fn transpose(a: &Arc<Tensor>) -> Arc<Tensor> {
    let (rows, cols) = a.dims();
    derived(Operation::Transpose { a: a.clone() }, cols, rows)
}

pub fn slice(
    a: &Arc<Tensor>,
    rows: Range<usize>,
    cols: Range<usize>,
) -> Result<Arc<Tensor>, GraphError> {
    let (full_rows, full_cols) = a.dims();
    for (range, extent) in [(&rows, full_rows), (&cols, full_cols)] {
        if range.start >= range.end || range.end > extent {
            return Err(GraphError::RangeOutOfBounds {
                operation: "slice",
                start: range.start,
                end: range.end,
                extent,
            });
        }
    }
    let (out_rows, out_cols) = (rows.end - rows.start, cols.end - cols.start);
    Ok(derived(
        Operation::Slice {
            a: a.clone(),
            rows,
            cols,
        },
        out_rows,
        out_cols,
    ))
}

pub fn concatenate(parts: &[Arc<Tensor>], axis: usize) -> Result<Arc<Tensor>, GraphError> {
    validate_axis("concatenate", axis)?;
    let Some(first) = parts.first() else {
        return Err(GraphError::NoOperands {
            operation: "concatenate",
        });
    };
    let mut rows = first.dims().0;
    let mut cols = first.dims().1;
    for part in &parts[1..] {
        let (r, c) = part.dims();
        match axis {
            0 if c == cols => rows += r,
            1 if r == rows => cols += c,
            _ => {
                return Err(GraphError::ShapeMismatch {
                    operation: "concatenate",
                    left: (rows, cols),
                    right: (r, c),
                })
            }
        }
    }
    Ok(derived(
        Operation::Concatenation {
            parts: parts.to_vec(),
            axis,
        },
        rows,
        cols,
    ))
}

pub fn reshape(a: &Arc<Tensor>, rows: usize, cols: usize) -> Result<Arc<Tensor>, GraphError> {
    let dims = a.dims();
    if dims.0 * dims.1 != rows * cols {
        return Err(GraphError::IncompatibleReshape {
            operation: "reshape",
            dims,
            rows,
            cols,
        });
    }
    Ok(derived(
        Operation::Reshape {
            a: a.clone(),
            rows,
            cols,
        },
        rows,
        cols,
    ))
}

pub fn exp(a: &Arc<Tensor>) -> Arc<Tensor> {
    let (rows, cols) = a.dims();
    derived(Operation::Exponentiation { a: a.clone() }, rows, cols)
}

/// Natural logarithm. Entries are assumed strictly positive; callers add a
/// stabilizing epsilon for values that may reach zero.
pub fn log(a: &Arc<Tensor>) -> Arc<Tensor> {
    let (rows, cols) = a.dims();
    derived(Operation::Logarithm { a: a.clone() }, rows, cols)
}

pub fn pow(a: &Arc<Tensor>, exponent: f32) -> Arc<Tensor> {
    let (rows, cols) = a.dims();
    derived(
        Operation::Power {
            a: a.clone(),
            exponent,
        },
        rows,
        cols,
    )
}

pub fn sqrt(a: &Arc<Tensor>) -> Arc<Tensor> {
    let (rows, cols) = a.dims();
    derived(Operation::SquareRoot { a: a.clone() }, rows, cols)
}

pub fn tanh(a: &Arc<Tensor>) -> Arc<Tensor> {
    let (rows, cols) = a.dims();
    derived(Operation::HyperbolicTangent { a: a.clone() }, rows, cols)
}

pub fn relu(a: &Arc<Tensor>) -> Arc<Tensor> {
    let (rows, cols) = a.dims();
    derived(Operation::RectifiedLinearUnit { a: a.clone() }, rows, cols)
}

pub fn sigmoid(a: &Arc<Tensor>) -> Arc<Tensor> {
    let (rows, cols) = a.dims();
    derived(Operation::Sigmoid { a: a.clone() }, rows, cols)
}

fn reduced_dims(a: &Arc<Tensor>, axis: usize) -> (usize, usize) {
    let (rows, cols) = a.dims();
    match axis {
        0 => (1, cols),
        _ => (rows, 1),
    }
}

pub fn sum(a: &Arc<Tensor>, axis: usize) -> Result<Arc<Tensor>, GraphError> {
    validate_axis("sum", axis)?;
    let (rows, cols) = reduced_dims(a, axis);
    Ok(derived(
        Operation::SumAlong { a: a.clone(), axis },
        rows,
        cols,
    ))
}

pub fn mean(a: &Arc<Tensor>, axis: usize) -> Result<Arc<Tensor>, GraphError> {
    validate_axis("mean", axis)?;
    let (rows, cols) = reduced_dims(a, axis);
    Ok(derived(
        Operation::MeanAlong { a: a.clone(), axis },
        rows,
        cols,
    ))
}

/// Population variance along an axis (normalized by `n`, not `n − 1`).
pub fn variance(a: &Arc<Tensor>, axis: usize) -> Result<Arc<Tensor>, GraphError> {
    validate_axis("variance", axis)?;
    let (rows, cols) = reduced_dims(a, axis);
    Ok(derived(
        Operation::VarianceAlong { a: a.clone(), axis },
        rows,
        cols,
    ))
}

pub fn max(a: &Arc<Tensor>, axis: usize) -> Result<Arc<Tensor>, GraphError> {
    validate_axis("max", axis)?;
    let (rows, cols) = reduced_dims(a, axis);
    Ok(derived(
        Operation::MaxAlong { a: a.clone(), axis },
        rows,
        cols,
    ))
}

/// Softmax along `axis`: `axis = 1` normalizes each row to a distribution,
/// `axis = 0` each column.
pub fn softmax_along(a: &Arc<Tensor>, axis: usize) -> Result<Arc<Tensor>, GraphError> {
    validate_axis("softmax", axis)?;
    let (rows, cols) = a.dims();
    Ok(derived(
        Operation::Softmax { a: a.clone(), axis },
        rows,
        cols,
    ))
}

/// Replaces entries of `a` with −∞ wherever `mask` is zero (attention-style
/// masking ahead of a softmax). The mask receives no gradient.
pub fn mask(a: &Arc<Tensor>, mask: &Arc<Tensor>) -> Result<Arc<Tensor>, GraphError> {
    validate_same_dims("mask", a, mask)?;
    let (rows, cols) = a.dims();
    Ok(derived(
        Operation::Mask {
            a: a.clone(),
            mask: mask.clone(),
        },
        rows,
        cols,
    ))
}

pub fn mean_absolute_error(
    prediction: &Arc<Tensor>,
    target: &Arc<Tensor>,
) -> Result<Arc<Tensor>, GraphError> {
    validate_same_dims("mean_absolute_error", prediction, target)?;
    Ok(derived(
        Operation::MeanAbsoluteError {
            prediction: prediction.clone(),
            target: target.clone(),
        },
        1,
        1,
    ))
}

/// Huber loss with threshold `delta`, averaged over all entries. The target
/// receives the negated prediction gradient, though targets are normally
/// gradient-free constants and never see it.
pub fn huber(
    prediction: &Arc<Tensor>,
    target: &Arc<Tensor>,
    delta: f32,
) -> Result<Arc<Tensor>, GraphError> {
    validate_same_dims("huber", prediction, target)?;
    Ok(derived(
        Operation::Huber {
            prediction: prediction.clone(),
            target: target.clone(),
            delta,
        },
        1,
        1,
    ))
}

/// Element-wise binary cross-entropy over raw logits, averaged over all
/// entries. Like `huber`, this defines an analytic gradient for the target
/// operand, but targets are normally gradient-free constants (unlike
/// `softmax_cross_entropy`, which pins the target gradient to zero).
pub fn sigmoid_cross_entropy(
    prediction: &Arc<Tensor>,
    target: &Arc<Tensor>,
) -> Result<Arc<Tensor>, GraphError> {
    validate_same_dims("sigmoid_cross_entropy", prediction, target)?;
    Ok(derived(
        Operation::SigmoidCrossEntropy {
            prediction: prediction.clone(),
            target: target.clone(),
        },
        1,
        1,
    ))
}

/// Row-wise softmax cross-entropy against a target distribution, averaged
/// over rows, with the logits divided by `temperature` first.
pub fn softmax_cross_entropy(
    prediction: &Arc<Tensor>,
    target: &Arc<Tensor>,
    temperature: f32,
) -> Result<Arc<Tensor>, GraphError> {
    validate_same_dims("softmax_cross_entropy", prediction, target)?;
    Ok(derived(
        Operation::SoftmaxCrossEntropy {
            prediction: prediction.clone(),
            target: target.clone(),
            temperature,
        },
        1,
        1,
    ))
}
