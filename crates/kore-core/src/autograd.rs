//! Core autograd types for automatic differentiation.
//!
//! Defines the `GradFn` trait and `GradNode` computation graph node.
//! These live in kore-core so that `Tensor` can carry gradient tracking
//! without circular dependencies.

use std::cell::Cell;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::tensor::Tensor;
use crate::Result;

// ============================================================================
// GradFn trait
// ============================================================================

/// Trait for gradient functions in the computation graph.
///
/// Each differentiable operation implements this trait to define
/// how gradients flow backward through it.
pub trait GradFn: Send + Sync {
    /// Compute gradients for each input given the output gradient.
    ///
    /// Returns a vector of optional gradients (one per input).
    /// `None` means the input doesn't need a gradient.
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>>;

    /// Name of this gradient function (for debugging).
    fn name(&self) -> &str;
}

// ============================================================================
// GradNode
// ============================================================================

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A node in the autograd computation graph.
///
/// Each node holds:
/// - An optional gradient function for backward
/// - Weak references to input nodes (prevents cycles)
/// - Thread-safe accumulated gradient
pub struct GradNode {
    pub id: usize,
    pub grad_fn: Option<Box<dyn GradFn>>,
    pub inputs: Vec<Weak<GradNode>>,
    pub grad: RwLock<Option<Tensor>>,
}

impl GradNode {
    /// Create a new leaf node (no grad_fn, e.g., a parameter).
    pub fn leaf() -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: None,
            inputs: Vec::new(),
            grad: RwLock::new(None),
        })
    }

    /// Create a new interior node with a gradient function and inputs.
    pub fn with_grad_fn(grad_fn: Box<dyn GradFn>, inputs: Vec<Arc<GradNode>>) -> Arc<Self> {
        let weak_inputs = inputs.iter().map(Arc::downgrade).collect();
        Arc::new(Self {
            id: next_id(),
            grad_fn: Some(grad_fn),
            inputs: weak_inputs,
            grad: RwLock::new(None),
        })
    }

    /// Whether this is a leaf node (no grad_fn).
    pub fn is_leaf(&self) -> bool {
        self.grad_fn.is_none()
    }

    /// Accumulate gradient into this node (thread-safe).
    ///
    /// Fails if `grad` cannot be added to the gradient already stored,
    /// leaving the stored gradient unchanged.
    pub fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let mut lock = self.grad.write();
        let next = match lock.as_ref() {
            Some(existing) => existing.add(grad)?,
            None => grad.clone(),
        };
        *lock = Some(next);
        Ok(())
    }

    /// Get the current accumulated gradient.
    pub fn get_grad(&self) -> Option<Tensor> {
        self.grad.read().clone()
    }

    /// Clear the accumulated gradient.
    pub fn zero_grad(&self) {
        *self.grad.write() = None;
    }
}

// ============================================================================
// Backward pass
// ============================================================================

/// Execute the backward pass from a root node.
///
/// Performs a BFS traversal of the computation graph and
/// propagates gradients from the root to all leaf nodes.
pub fn backward(root: &Arc<GradNode>, grad_output: Tensor) -> Result<()> {
    root.accumulate_grad(&grad_output)?;

    for node in &topological_sort(root) {
        if let Some(ref grad_fn) = node.grad_fn {
            let node_grad = match node.get_grad() {
                Some(g) => g,
                None => continue,
            };

            let input_grads = grad_fn.apply(&node_grad);

            for (weak_input, maybe_grad) in node.inputs.iter().zip(input_grads) {
                if let (Some(input_node), Some(grad)) = (weak_input.upgrade(), maybe_grad) {
                    input_node.accumulate_grad(&grad)?;
                }
            }
        }
    }
    Ok(())
}

/// BFS topological sort from root → leaves (backward traversal order).
fn topological_sort(root: &Arc<GradNode>) -> Vec<Arc<GradNode>> {
    let mut sorted = Vec::new();
    let mut visited = HashSet::new();
    let mut queue: VecDeque<Arc<GradNode>> = VecDeque::new();

    queue.push_back(Arc::clone(root));
    visited.insert(root.id);

    while let Some(node) = queue.pop_front() {
        sorted.push(Arc::clone(&node));
        for weak_input in &node.inputs {
            if let Some(input) = weak_input.upgrade() {
                if visited.insert(input.id) {
                    queue.push_back(input);
                }
            }
        }
    }

    sorted
}

// ============================================================================
// No-grad scope
// ============================================================================

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Check if gradient computation is currently enabled.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|g| g.replace(enabled))
}

/// RAII guard that disables gradient computation in its scope.
///
/// # Example
/// ```ignore
/// let _guard = NoGradGuard::new();
/// // All operations here skip gradient tracking
/// // Gradients re-enabled when guard is dropped
/// ```
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        let prev = set_grad_enabled(false);
        Self { prev }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}

// ============================================================================
// Built-in gradient functions
// ============================================================================

/// Backward for element-wise addition: grad flows through unchanged,
/// reduced back to each tracked operand's shape when broadcasting happened.
///
/// `input_shapes` has one entry per graph input, in the same order.
pub struct AddBackward {
    pub input_shapes: Vec<Vec<usize>>,
}

impl GradFn for AddBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        self.input_shapes
            .iter()
            .map(|shape| {
                Some(
                    grad_output
                        .sum_to_shape(shape)
                        .expect("AddBackward reduction failed"),
                )
            })
            .collect()
    }
    fn name(&self) -> &str { "AddBackward" }
}

/// Backward for full sum reduction.
pub struct SumBackward {
    pub input_shape: Vec<usize>,
}

impl GradFn for SumBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let numel: usize = self.input_shape.iter().product();
        let grad_val = grad_output.get_f32(0).unwrap_or(1.0);
        let data = vec![grad_val; numel];
        vec![Some(Tensor::from_f32(&data, &self.input_shape))]
    }
    fn name(&self) -> &str { "SumBackward" }
}

/// Backward for `sum_to`: the gradient is broadcast back to the input shape.
pub struct SumToBackward {
    pub input_shape: Vec<usize>,
}

impl GradFn for SumToBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let grad = grad_output
            .broadcast_to(&self.input_shape)
            .expect("SumToBackward broadcast failed");
        vec![Some(grad)]
    }
    fn name(&self) -> &str { "SumToBackward" }
}

/// Backward for `broadcast_to`: the gradient is summed back to the input shape.
pub struct BroadcastToBackward {
    pub input_shape: Vec<usize>,
}

impl GradFn for BroadcastToBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let grad = grad_output
            .sum_to_shape(&self.input_shape)
            .expect("BroadcastToBackward reduction failed");
        vec![Some(grad)]
    }
    fn name(&self) -> &str { "BroadcastToBackward" }
}
