#![allow(mixed_script_confusables)]

//! A small tensor-autograd engine: lazily evaluated computation graphs over
//! dense 2-D `f32` matrices, reverse-mode differentiation, and the
//! layer/loss/optimizer contracts for training little networks on the CPU.

pub mod core;

pub use crate::core::operations::GraphError;
pub use crate::core::{backprop, Layer, ParameterStore, Tensor, TensorBuilder};
