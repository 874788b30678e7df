#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use adv_core::{Tensor, TensorMeta, TensorMetaError};
use adv_kernel_cpu::{
    KernelError, add_tensor_contiguous_f64, expand_f64, log_softmax_rows_f64, matmul_f64,
    max_per_row_f64, mul_tensor_contiguous_f64, reduce_expanded_f64, sub_tensor_contiguous_f64,
    sum_per_example_f64, transpose2d_f64, unary_contiguous_f64,
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorNodeId(pub usize);

impl fmt::Display for TensorNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tape length captured by [`TensorTape::mark`]; truncating back to it drops
/// every node recorded afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeMark(usize);

#[derive(Debug, Clone, PartialEq)]
enum TensorNodeOp {
    Leaf,
    Add {
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    },
    Sub {
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    },
    Mul {
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    },
    Affine {
        input: TensorNodeId,
        scale: f64,
    },
    Tanh {
        input: TensorNodeId,
    },
    ClampMin {
        input: TensorNodeId,
        min: f64,
    },
    Sum {
        input: TensorNodeId,
    },
    SumPerExample {
        input: TensorNodeId,
    },
    MaxPerRow {
        input: TensorNodeId,
        argmax: Vec<usize>,
    },
    LogSoftmax {
        input: TensorNodeId,
    },
    Matmul {
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    },
    Transpose {
        input: TensorNodeId,
    },
    Reshape {
        input: TensorNodeId,
    },
    Expand {
        input: TensorNodeId,
    },
}

impl TensorNodeOp {
    fn inputs(&self) -> [Option<TensorNodeId>; 2] {
        match self {
            Self::Leaf => [None, None],
            Self::Add { lhs, rhs }
            | Self::Sub { lhs, rhs }
            | Self::Mul { lhs, rhs }
            | Self::Matmul { lhs, rhs } => [Some(*lhs), Some(*rhs)],
            Self::Affine { input, .. }
            | Self::Tanh { input }
            | Self::ClampMin { input, .. }
            | Self::Sum { input }
            | Self::SumPerExample { input }
            | Self::MaxPerRow { input, .. }
            | Self::LogSoftmax { input }
            | Self::Transpose { input }
            | Self::Reshape { input }
            | Self::Expand { input } => [Some(*input), None],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TensorNode {
    tensor: Tensor,
    requires_grad: bool,
    op: TensorNodeOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerTelemetry {
    pub execution_order: Vec<TensorNodeId>,
    pub queue_pushes: usize,
    pub queue_pops: usize,
    pub max_queue_len: usize,
    pub dependency_snapshot: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyTask {
    node: TensorNodeId,
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node.0.cmp(&other.node.0)
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ReadyQueue {
    heap: BinaryHeap<ReadyTask>,
    pushes: usize,
    pops: usize,
    max_len: usize,
}

impl ReadyQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            pushes: 0,
            pops: 0,
            max_len: 0,
        }
    }

    fn push(&mut self, node: TensorNodeId) {
        self.heap.push(ReadyTask { node });
        self.pushes += 1;
        self.max_len = self.max_len.max(self.heap.len());
    }

    fn pop(&mut self) -> Option<TensorNodeId> {
        let next = self.heap.pop().map(|task| task.node);
        if next.is_some() {
            self.pops += 1;
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorBackwardStep {
    pub node: TensorNodeId,
    pub rule: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorBackwardReport {
    gradients: Vec<Option<Vec<f64>>>,
    pub steps: Vec<TensorBackwardStep>,
    pub telemetry: SchedulerTelemetry,
}

impl TensorBackwardReport {
    #[must_use]
    pub fn gradient(&self, node: TensorNodeId) -> Option<&[f64]> {
        self.gradients
            .get(node.0)
            .and_then(|grad| grad.as_deref())
    }

    #[must_use]
    pub fn gradients(&self) -> &[Option<Vec<f64>>] {
        &self.gradients
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutogradError {
    #[error("unknown node id {0}")]
    UnknownNode(TensorNodeId),
    #[error("kernel failure: {0}")]
    Kernel(#[from] KernelError),
    #[error("tensor metadata failure: {0}")]
    Meta(#[from] TensorMetaError),
    #[error("dependency scheduler underflow at node {node}")]
    DependencyUnderflow { node: TensorNodeId },
    #[error("backward root must be a single-element tensor, got shape {shape:?}")]
    NonScalarRoot { shape: Vec<usize> },
    #[error("node {0} is not a leaf and cannot be updated in place")]
    NotALeaf(TensorNodeId),
    #[error("cannot reshape {from:?} into {to:?}")]
    InvalidReshape { from: Vec<usize>, to: Vec<usize> },
    #[error("tape mark {mark} is past the current tape length {len}")]
    StaleMark { mark: usize, len: usize },
    #[error("gradient length mismatch at node {node}: expected={expected}, actual={actual}")]
    TensorGradientShapeMismatch {
        node: TensorNodeId,
        expected: usize,
        actual: usize,
    },
    #[error("invalid optimizer hyper-parameter: {reason}")]
    InvalidHyperparameter { reason: &'static str },
    #[error("optimizer state failure: {reason}")]
    OptimizerState { reason: &'static str },
}

struct BackwardState {
    grads: Vec<Option<Vec<f64>>>,
    pending: Vec<usize>,
    queue: ReadyQueue,
}

impl BackwardState {
    fn propagate<F>(
        &mut self,
        tape: &TensorTape,
        input: TensorNodeId,
        contribution: F,
    ) -> Result<(), AutogradError>
    where
        F: FnOnce() -> Result<Vec<f64>, AutogradError>,
    {
        if !tape.node(input)?.requires_grad {
            return Ok(());
        }

        let contribution = contribution()?;
        if let Some(existing) = self.grads[input.0].as_mut() {
            for (acc, value) in existing.iter_mut().zip(contribution.iter()) {
                *acc += value;
            }
        } else {
            self.grads[input.0] = Some(contribution);
        }

        if self.pending[input.0] == 0 {
            return Err(AutogradError::DependencyUnderflow { node: input });
        }
        self.pending[input.0] -= 1;
        if self.pending[input.0] == 0 {
            self.queue.push(input);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TensorTape {
    nodes: Vec<TensorNode>,
}

impl TensorTape {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf(&mut self, tensor: Tensor, requires_grad: bool) -> TensorNodeId {
        self.push(tensor, requires_grad, TensorNodeOp::Leaf)
    }

    pub fn tensor(&self, node: TensorNodeId) -> Result<&Tensor, AutogradError> {
        Ok(&self.node(node)?.tensor)
    }

    pub fn values(&self, node: TensorNodeId) -> Result<&[f64], AutogradError> {
        Ok(self.node(node)?.tensor.values())
    }

    pub fn shape(&self, node: TensorNodeId) -> Result<&[usize], AutogradError> {
        Ok(self.node(node)?.tensor.shape())
    }

    #[must_use]
    pub fn mark(&self) -> TapeMark {
        TapeMark(self.nodes.len())
    }

    /// Drop every node recorded after `mark`. Ids handed out after the mark
    /// become invalid.
    pub fn truncate(&mut self, mark: TapeMark) -> Result<(), AutogradError> {
        if mark.0 > self.nodes.len() {
            return Err(AutogradError::StaleMark {
                mark: mark.0,
                len: self.nodes.len(),
            });
        }
        self.nodes.truncate(mark.0);
        Ok(())
    }

    /// Overwrite a leaf's values, bumping its version.
    pub fn update_leaf(&mut self, node: TensorNodeId, values: Vec<f64>) -> Result<(), AutogradError> {
        let entry = self
            .nodes
            .get_mut(node.0)
            .ok_or(AutogradError::UnknownNode(node))?;
        if entry.op != TensorNodeOp::Leaf {
            return Err(AutogradError::NotALeaf(node));
        }
        entry.tensor.set_in_place(values)?;
        Ok(())
    }

    /// `leaf -= delta`, in place.
    pub fn sub_leaf_in_place(
        &mut self,
        node: TensorNodeId,
        delta: &[f64],
    ) -> Result<(), AutogradError> {
        let current = self.values(node)?;
        if current.len() != delta.len() {
            return Err(AutogradError::TensorGradientShapeMismatch {
                node,
                expected: current.len(),
                actual: delta.len(),
            });
        }
        let updated = current
            .iter()
            .zip(delta.iter())
            .map(|(value, step)| value - step)
            .collect();
        self.update_leaf(node, updated)
    }

    pub fn add(
        &mut self,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        let (l, r) = (self.tensor(lhs)?, self.tensor(rhs)?);
        let values = add_tensor_contiguous_f64(l.values(), r.values(), l.meta(), r.meta())?;
        self.binary_result(values, lhs, rhs, TensorNodeOp::Add { lhs, rhs })
    }

    pub fn sub(
        &mut self,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        let (l, r) = (self.tensor(lhs)?, self.tensor(rhs)?);
        let values = sub_tensor_contiguous_f64(l.values(), r.values(), l.meta(), r.meta())?;
        self.binary_result(values, lhs, rhs, TensorNodeOp::Sub { lhs, rhs })
    }

    pub fn mul(
        &mut self,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        let (l, r) = (self.tensor(lhs)?, self.tensor(rhs)?);
        let values = mul_tensor_contiguous_f64(l.values(), r.values(), l.meta(), r.meta())?;
        self.binary_result(values, lhs, rhs, TensorNodeOp::Mul { lhs, rhs })
    }

    /// `input * scale + shift`, element-wise.
    pub fn affine(
        &mut self,
        input: TensorNodeId,
        scale: f64,
        shift: f64,
    ) -> Result<TensorNodeId, AutogradError> {
        let src = self.tensor(input)?;
        let values = unary_contiguous_f64(src.values(), src.meta(), |v| v * scale + shift)?;
        self.unary_result(values, input, TensorNodeOp::Affine { input, scale })
    }

    pub fn tanh(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        let src = self.tensor(input)?;
        let values = unary_contiguous_f64(src.values(), src.meta(), f64::tanh)?;
        self.unary_result(values, input, TensorNodeOp::Tanh { input })
    }

    /// `max(input, min)`, element-wise.
    pub fn clamp_min(
        &mut self,
        input: TensorNodeId,
        min: f64,
    ) -> Result<TensorNodeId, AutogradError> {
        let src = self.tensor(input)?;
        let values = unary_contiguous_f64(src.values(), src.meta(), |v| v.max(min))?;
        self.unary_result(values, input, TensorNodeOp::ClampMin { input, min })
    }

    /// Sum of every element, as a scalar.
    pub fn sum(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        let total = self.values(input)?.iter().sum();
        let requires_grad = self.node(input)?.requires_grad;
        Ok(self.push(
            Tensor::scalar(total),
            requires_grad,
            TensorNodeOp::Sum { input },
        ))
    }

    /// `[B, ...] -> [B]`, summing every non-batch axis.
    pub fn sum_per_example(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        let src = self.tensor(input)?;
        let values = sum_per_example_f64(src.values(), src.meta())?;
        let shape = vec![src.batch_size()?];
        self.reshaped_result(values, shape, input, TensorNodeOp::SumPerExample { input })
    }

    /// `[B, K] -> [B]`, keeping the largest entry of each row.
    pub fn max_per_row(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        let src = self.tensor(input)?;
        let (values, argmax) = max_per_row_f64(src.values(), src.meta())?;
        let shape = vec![values.len()];
        self.reshaped_result(values, shape, input, TensorNodeOp::MaxPerRow { input, argmax })
    }

    pub fn log_softmax(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        let src = self.tensor(input)?;
        let values = log_softmax_rows_f64(src.values(), src.meta())?;
        self.unary_result(values, input, TensorNodeOp::LogSoftmax { input })
    }

    pub fn matmul(
        &mut self,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        let (l, r) = (self.tensor(lhs)?, self.tensor(rhs)?);
        let values = matmul_f64(l.values(), r.values(), l.meta(), r.meta())?;
        let shape = vec![l.shape()[0], r.shape()[1]];
        let requires_grad = self.node(lhs)?.requires_grad || self.node(rhs)?.requires_grad;
        let tensor = Tensor::from_vec(values, shape)?;
        Ok(self.push(tensor, requires_grad, TensorNodeOp::Matmul { lhs, rhs }))
    }

    pub fn transpose(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        let src = self.tensor(input)?;
        let values = transpose2d_f64(src.values(), src.meta())?;
        let shape = vec![src.shape()[1], src.shape()[0]];
        self.reshaped_result(values, shape, input, TensorNodeOp::Transpose { input })
    }

    pub fn reshape(
        &mut self,
        input: TensorNodeId,
        shape: Vec<usize>,
    ) -> Result<TensorNodeId, AutogradError> {
        let src = self.tensor(input)?;
        let target: usize = shape.iter().product();
        if target != src.numel() {
            return Err(AutogradError::InvalidReshape {
                from: src.shape().to_vec(),
                to: shape,
            });
        }
        let values = src.values().to_vec();
        self.reshaped_result(values, shape, input, TensorNodeOp::Reshape { input })
    }

    pub fn expand(
        &mut self,
        input: TensorNodeId,
        shape: Vec<usize>,
    ) -> Result<TensorNodeId, AutogradError> {
        let src = self.tensor(input)?;
        let values = expand_f64(src.values(), src.meta(), &shape)?;
        self.reshaped_result(values, shape, input, TensorNodeOp::Expand { input })
    }

    pub fn backward(&self, root: TensorNodeId) -> Result<TensorBackwardReport, AutogradError> {
        let root_node = self.node(root)?;
        if root_node.tensor.numel() != 1 {
            return Err(AutogradError::NonScalarRoot {
                shape: root_node.tensor.shape().to_vec(),
            });
        }

        let reachable = self.compute_reachable(root)?;
        let pending = self.compute_dependencies(&reachable)?;

        let mut state = BackwardState {
            grads: vec![None; self.nodes.len()],
            pending,
            queue: ReadyQueue::with_capacity(self.nodes.len().max(1)),
        };
        let mut steps = Vec::with_capacity(self.nodes.len());
        let mut execution_order = Vec::with_capacity(self.nodes.len());

        if root_node.requires_grad {
            state.grads[root.0] = Some(vec![1.0]);
            state.queue.push(root);
        }

        while let Some(node_id) = state.queue.pop() {
            execution_order.push(node_id);
            let node = &self.nodes[node_id.0];
            let incoming = state.grads[node_id.0]
                .take()
                .unwrap_or_else(|| vec![0.0; node.tensor.numel()]);

            let rule = self.propagate_node(node, &incoming, &mut state)?;
            steps.push(TensorBackwardStep {
                node: node_id,
                rule,
            });
            state.grads[node_id.0] = Some(incoming);
        }

        let telemetry = SchedulerTelemetry {
            execution_order,
            queue_pushes: state.queue.pushes,
            queue_pops: state.queue.pops,
            max_queue_len: state.queue.max_len,
            dependency_snapshot: state.pending,
        };

        Ok(TensorBackwardReport {
            gradients: state.grads,
            steps,
            telemetry,
        })
    }

    fn propagate_node(
        &self,
        node: &TensorNode,
        incoming: &[f64],
        state: &mut BackwardState,
    ) -> Result<&'static str, AutogradError> {
        let rule = match &node.op {
            TensorNodeOp::Leaf => "leaf",
            TensorNodeOp::Add { lhs, rhs } => {
                state.propagate(self, *lhs, || Ok(incoming.to_vec()))?;
                state.propagate(self, *rhs, || Ok(incoming.to_vec()))?;
                "d(a+b)/da=1; d(a+b)/db=1"
            }
            TensorNodeOp::Sub { lhs, rhs } => {
                state.propagate(self, *lhs, || Ok(incoming.to_vec()))?;
                state.propagate(self, *rhs, || Ok(incoming.iter().map(|g| -g).collect()))?;
                "d(a-b)/da=1; d(a-b)/db=-1"
            }
            TensorNodeOp::Mul { lhs, rhs } => {
                let lhs_values = self.values(*lhs)?;
                let rhs_values = self.values(*rhs)?;
                state.propagate(self, *lhs, || Ok(zip_mul(incoming, rhs_values)))?;
                state.propagate(self, *rhs, || Ok(zip_mul(incoming, lhs_values)))?;
                "d(a*b)/da=b; d(a*b)/db=a"
            }
            TensorNodeOp::Affine { input, scale } => {
                state.propagate(self, *input, || {
                    Ok(incoming.iter().map(|g| g * scale).collect())
                })?;
                "d(a*x+b)/dx=a"
            }
            TensorNodeOp::Tanh { input } => {
                let out = node.tensor.values();
                state.propagate(self, *input, || {
                    Ok(incoming
                        .iter()
                        .zip(out.iter())
                        .map(|(g, y)| g * (1.0 - y * y))
                        .collect())
                })?;
                "d(tanh x)/dx=1-tanh(x)^2"
            }
            TensorNodeOp::ClampMin { input, min } => {
                let src = self.values(*input)?;
                state.propagate(self, *input, || {
                    Ok(incoming
                        .iter()
                        .zip(src.iter())
                        .map(|(g, x)| if x >= min { *g } else { 0.0 })
                        .collect())
                })?;
                "d(max(x,m))/dx=[x>=m]"
            }
            TensorNodeOp::Sum { input } => {
                let numel = self.tensor(*input)?.numel();
                let g = incoming.first().copied().unwrap_or(0.0);
                state.propagate(self, *input, || Ok(vec![g; numel]))?;
                "d(sum x)/dx=1"
            }
            TensorNodeOp::SumPerExample { input } => {
                let width = self.tensor(*input)?.example_numel()?;
                state.propagate(self, *input, || {
                    Ok(incoming
                        .iter()
                        .flat_map(|g| std::iter::repeat_n(*g, width))
                        .collect())
                })?;
                "d(sum_i x)/dx_i=1"
            }
            TensorNodeOp::MaxPerRow { input, argmax } => {
                let src = self.tensor(*input)?;
                let cols = src.shape()[1];
                let numel = src.numel();
                state.propagate(self, *input, || {
                    let mut grad = vec![0.0; numel];
                    for (row, (g, col)) in incoming.iter().zip(argmax.iter()).enumerate() {
                        grad[row * cols + col] = *g;
                    }
                    Ok(grad)
                })?;
                "d(max x)/dx=[x=argmax]"
            }
            TensorNodeOp::LogSoftmax { input } => {
                let out = node.tensor.values();
                let cols = node.tensor.shape()[1];
                state.propagate(self, *input, || {
                    let mut grad = Vec::with_capacity(incoming.len());
                    for (g_row, y_row) in incoming.chunks_exact(cols).zip(out.chunks_exact(cols))
                    {
                        let g_sum: f64 = g_row.iter().sum();
                        grad.extend(
                            g_row
                                .iter()
                                .zip(y_row.iter())
                                .map(|(g, y)| g - y.exp() * g_sum),
                        );
                    }
                    Ok(grad)
                })?;
                "d(log_softmax)/dx=g-softmax*sum(g)"
            }
            TensorNodeOp::Matmul { lhs, rhs } => {
                let l = self.tensor(*lhs)?;
                let r = self.tensor(*rhs)?;
                let out_meta = node.tensor.meta();
                state.propagate(self, *lhs, || {
                    let r_t = transpose2d_f64(r.values(), r.meta())?;
                    let r_t_meta = TensorMeta::from_shape(vec![r.shape()[1], r.shape()[0]]);
                    Ok(matmul_f64(incoming, &r_t, out_meta, &r_t_meta)?)
                })?;
                state.propagate(self, *rhs, || {
                    let l_t = transpose2d_f64(l.values(), l.meta())?;
                    let l_t_meta = TensorMeta::from_shape(vec![l.shape()[1], l.shape()[0]]);
                    Ok(matmul_f64(&l_t, incoming, &l_t_meta, out_meta)?)
                })?;
                "d(AB)/dA=G*B^T; d(AB)/dB=A^T*G"
            }
            TensorNodeOp::Transpose { input } => {
                let out_meta = node.tensor.meta();
                state.propagate(self, *input, || Ok(transpose2d_f64(incoming, out_meta)?))?;
                "d(x^T)/dx=G^T"
            }
            TensorNodeOp::Reshape { input } => {
                state.propagate(self, *input, || Ok(incoming.to_vec()))?;
                "d(reshape x)/dx=1"
            }
            TensorNodeOp::Expand { input } => {
                let from = self.shape(*input)?;
                let to = node.tensor.shape();
                state.propagate(self, *input, || Ok(reduce_expanded_f64(incoming, from, to)?))?;
                "d(expand x)/dx=sum over broadcast axes"
            }
        };
        Ok(rule)
    }

    fn compute_reachable(&self, root: TensorNodeId) -> Result<Vec<bool>, AutogradError> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![root];

        while let Some(node) = stack.pop() {
            let entry = self.node(node)?;
            if reachable[node.0] || !entry.requires_grad {
                continue;
            }
            reachable[node.0] = true;
            stack.extend(entry.op.inputs().into_iter().flatten());
        }

        Ok(reachable)
    }

    fn compute_dependencies(&self, reachable: &[bool]) -> Result<Vec<usize>, AutogradError> {
        let mut pending = vec![0usize; self.nodes.len()];

        for (idx, node) in self.nodes.iter().enumerate() {
            if !reachable[idx] {
                continue;
            }
            for input in node.op.inputs().into_iter().flatten() {
                if self.node(input)?.requires_grad {
                    pending[input.0] = pending[input.0].saturating_add(1);
                }
            }
        }

        Ok(pending)
    }

    fn binary_result(
        &mut self,
        values: Vec<f64>,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
        op: TensorNodeOp,
    ) -> Result<TensorNodeId, AutogradError> {
        let shape = self.shape(lhs)?.to_vec();
        let requires_grad = self.node(lhs)?.requires_grad || self.node(rhs)?.requires_grad;
        let tensor = Tensor::from_vec(values, shape)?;
        Ok(self.push(tensor, requires_grad, op))
    }

    fn unary_result(
        &mut self,
        values: Vec<f64>,
        input: TensorNodeId,
        op: TensorNodeOp,
    ) -> Result<TensorNodeId, AutogradError> {
        let shape = self.shape(input)?.to_vec();
        self.reshaped_result(values, shape, input, op)
    }

    fn reshaped_result(
        &mut self,
        values: Vec<f64>,
        shape: Vec<usize>,
        input: TensorNodeId,
        op: TensorNodeOp,
    ) -> Result<TensorNodeId, AutogradError> {
        let requires_grad = self.node(input)?.requires_grad;
        let tensor = Tensor::from_vec(values, shape)?;
        Ok(self.push(tensor, requires_grad, op))
    }

    fn push(&mut self, tensor: Tensor, requires_grad: bool, op: TensorNodeOp) -> TensorNodeId {
        let id = TensorNodeId(self.nodes.len());
        self.nodes.push(TensorNode {
            tensor,
            requires_grad,
            op,
        });
        id
    }

    fn node(&self, id: TensorNodeId) -> Result<&TensorNode, AutogradError> {
        self.nodes.get(id.0).ok_or(AutogradError::UnknownNode(id))
    }
}

fn zip_mul(lhs: &[f64], rhs: &[f64]) -> Vec<f64> {
    lhs.iter().zip(rhs.iter()).map(|(a, b)| a * b).collect()
}

#[cfg(test)]
mod tests {
    use adv_core::Tensor;
    use proptest::prelude::*;

    use super::{AutogradError, TensorNodeId, TensorTape};

    fn leaf(tape: &mut TensorTape, values: &[f64], shape: &[usize], grad: bool) -> TensorNodeId {
        let tensor = Tensor::from_vec(values.to_vec(), shape.to_vec()).expect("tensor");
        tape.leaf(tensor, grad)
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "length mismatch");
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() <= 1e-9, "expected {expected:?}, got {actual:?}");
        }
    }

    #[test]
    fn add_backward_matches_expected_gradient() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[2.0], &[1], true);
        let y = leaf(&mut tape, &[3.0], &[1], true);
        let z = tape.add(x, y).expect("add should succeed");

        let report = tape.backward(z).expect("backward should succeed");
        assert_eq!(report.gradient(x), Some(&[1.0][..]));
        assert_eq!(report.gradient(y), Some(&[1.0][..]));
        assert_eq!(report.telemetry.execution_order, vec![z, y, x]);
    }

    #[test]
    fn mul_of_shared_input_accumulates() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[4.0, -1.0], &[2], true);
        let sq = tape.mul(x, x).expect("mul");
        let loss = tape.sum(sq).expect("sum");

        let report = tape.backward(loss).expect("backward");
        assert_close(report.gradient(x).expect("x grad"), &[8.0, -2.0]);
        assert!(report.telemetry.dependency_snapshot.iter().all(|d| *d == 0));
    }

    #[test]
    fn constants_receive_no_gradient() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[1.0, 2.0], &[2], true);
        let c = leaf(&mut tape, &[3.0, 4.0], &[2], false);
        let prod = tape.mul(x, c).expect("mul");
        let loss = tape.sum(prod).expect("sum");

        let report = tape.backward(loss).expect("backward");
        assert_close(report.gradient(x).expect("x grad"), &[3.0, 4.0]);
        assert!(report.gradient(c).is_none());
        assert!(!report.telemetry.execution_order.contains(&c));
    }

    #[test]
    fn tanh_affine_chain_matches_closed_form() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[0.3, -0.7], &[1, 2], true);
        let t = tape.tanh(x).expect("tanh");
        let a = tape.affine(t, 1.5, -0.25).expect("affine");
        let loss = tape.sum(a).expect("sum");

        let report = tape.backward(loss).expect("backward");
        let expected: Vec<f64> = [0.3f64, -0.7]
            .iter()
            .map(|v| 1.5 * (1.0 - v.tanh().powi(2)))
            .collect();
        assert_close(report.gradient(x).expect("x grad"), &expected);
    }

    #[test]
    fn clamp_min_blocks_gradient_below_floor() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[-1.0, 0.5, 2.0], &[3], true);
        let clamped = tape.clamp_min(x, 0.0).expect("clamp");
        assert_eq!(tape.values(clamped).expect("values"), &[0.0, 0.5, 2.0]);
        let loss = tape.sum(clamped).expect("sum");

        let report = tape.backward(loss).expect("backward");
        assert_close(report.gradient(x).expect("x grad"), &[0.0, 1.0, 1.0]);
    }

    #[test]
    fn max_per_row_routes_gradient_to_argmax() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[1.0, 3.0, 2.0, 5.0, 4.0, 0.0], &[2, 3], true);
        let max = tape.max_per_row(x).expect("max");
        assert_eq!(tape.values(max).expect("values"), &[3.0, 5.0]);
        let loss = tape.sum(max).expect("sum");

        let report = tape.backward(loss).expect("backward");
        assert_close(
            report.gradient(x).expect("x grad"),
            &[0.0, 1.0, 0.0, 1.0, 0.0, 0.0],
        );
    }

    #[test]
    fn sum_per_example_broadcasts_row_gradient() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[1.0, 2.0, 3.0, 4.0], &[2, 1, 2], true);
        let w = leaf(&mut tape, &[2.0, -1.0], &[2], false);
        let rows = tape.sum_per_example(x).expect("sum per example");
        assert_eq!(tape.shape(rows).expect("shape"), &[2]);
        let weighted = tape.mul(rows, w).expect("mul");
        let loss = tape.sum(weighted).expect("sum");

        let report = tape.backward(loss).expect("backward");
        assert_close(report.gradient(x).expect("x grad"), &[2.0, 2.0, -1.0, -1.0]);
    }

    #[test]
    fn linear_layer_gradient_matches_weights() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[1.0, 2.0], &[1, 2], true);
        let w = leaf(&mut tape, &[1.0, 2.0, 3.0, 4.0], &[2, 2], false);
        let b = leaf(&mut tape, &[0.5, -0.5], &[1, 2], false);
        let w_t = tape.transpose(w).expect("transpose");
        let xw = tape.matmul(x, w_t).expect("matmul");
        let bias = tape.expand(b, vec![1, 2]).expect("expand");
        let out = tape.add(xw, bias).expect("add");
        assert_eq!(tape.values(out).expect("values"), &[5.5, 10.5]);
        let loss = tape.sum(out).expect("sum");

        let report = tape.backward(loss).expect("backward");
        // d/dx sum(x W^T) = column sums of W
        assert_close(report.gradient(x).expect("x grad"), &[4.0, 6.0]);
    }

    #[test]
    fn log_softmax_gradient_of_nll() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[1.0, 2.0, 3.0], &[1, 3], true);
        let onehot = leaf(&mut tape, &[0.0, 0.0, -1.0], &[1, 3], false);
        let logp = tape.log_softmax(x).expect("log_softmax");
        let picked = tape.mul(logp, onehot).expect("mul");
        let loss = tape.sum(picked).expect("sum");

        let report = tape.backward(loss).expect("backward");
        let denom: f64 = [1.0f64, 2.0, 3.0].iter().map(|v| v.exp()).sum();
        let softmax: Vec<f64> = [1.0f64, 2.0, 3.0].iter().map(|v| v.exp() / denom).collect();
        assert_close(
            report.gradient(x).expect("x grad"),
            &[softmax[0], softmax[1], softmax[2] - 1.0],
        );
    }

    #[test]
    fn reshape_rejects_mismatched_numel() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[1.0; 6], &[2, 3], true);
        let flat = tape.reshape(x, vec![2, 3, 1]).expect("reshape");
        assert_eq!(tape.shape(flat).expect("shape"), &[2, 3, 1]);
        let err = tape.reshape(x, vec![4]).expect_err("4 != 6");
        assert!(matches!(err, AutogradError::InvalidReshape { .. }));
    }

    #[test]
    fn backward_requires_scalar_root() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[1.0, 2.0], &[2], true);
        let err = tape.backward(x).expect_err("non-scalar root must fail");
        assert_eq!(err, AutogradError::NonScalarRoot { shape: vec![2] });
    }

    #[test]
    fn truncate_drops_nodes_after_mark_and_keeps_leaves() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[1.0], &[1], true);
        let mark = tape.mark();
        let y = tape.affine(x, 2.0, 0.0).expect("affine");
        let _ = tape.sum(y).expect("sum");
        assert_eq!(tape.node_count(), 3);

        tape.truncate(mark).expect("truncate");
        assert_eq!(tape.node_count(), 1);
        assert!(matches!(tape.values(y), Err(AutogradError::UnknownNode(_))));
        assert_eq!(tape.values(x).expect("x survives"), &[1.0]);
    }

    #[test]
    fn leaf_updates_reject_interior_nodes() {
        let mut tape = TensorTape::new();
        let x = leaf(&mut tape, &[1.0, 1.0], &[2], true);
        tape.sub_leaf_in_place(x, &[0.5, -0.5]).expect("leaf update");
        assert_eq!(tape.values(x).expect("values"), &[0.5, 1.5]);
        assert_eq!(tape.tensor(x).expect("tensor").version(), 1);

        let y = tape.tanh(x).expect("tanh");
        let err = tape
            .update_leaf(y, vec![0.0, 0.0])
            .expect_err("interior node update must fail");
        assert_eq!(err, AutogradError::NotALeaf(y));
    }

    proptest! {
        #[test]
        fn prop_squared_distance_gradient_is_twice_difference(
            values in prop::collection::vec(-5.0f64..5.0, 8),
        ) {
            let mut tape = TensorTape::new();
            let x = leaf(&mut tape, &values[..4], &[2, 2], true);
            let y = leaf(&mut tape, &values[4..], &[2, 2], false);
            let diff = tape.sub(x, y).expect("sub");
            let sq = tape.mul(diff, diff).expect("mul");
            let rows = tape.sum_per_example(sq).expect("rows");
            let loss = tape.sum(rows).expect("sum");

            let report = tape.backward(loss).expect("backward");
            let grad = report.gradient(x).expect("x grad");
            for idx in 0..4 {
                let expected = 2.0 * (values[idx] - values[idx + 4]);
                prop_assert!((grad[idx] - expected).abs() <= 1e-9);
            }
            prop_assert_eq!(report.telemetry.queue_pushes, report.telemetry.queue_pops);
        }
    }
}
