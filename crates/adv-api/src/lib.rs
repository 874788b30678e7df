#![forbid(unsafe_code)]

use adv_autograd::{AutogradError, TapeMark, TensorBackwardReport, TensorNodeId, TensorTape};
use adv_core::Tensor;
use adv_runtime::{EvidenceEntry, EvidenceKind, EvidenceLedger};

/// Owns one tensor tape plus the ledger that records what happened on it.
#[derive(Debug, Clone, Default)]
pub struct AdvSession {
    tape: TensorTape,
    ledger: EvidenceLedger,
}

impl AdvSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensor_variable(
        &mut self,
        values: Vec<f64>,
        shape: Vec<usize>,
        requires_grad: bool,
    ) -> Result<TensorNodeId, AutogradError> {
        let tensor = Tensor::from_vec(values, shape)?;
        Ok(self.tape.leaf(tensor, requires_grad))
    }

    pub fn tensor_leaf(&mut self, tensor: Tensor, requires_grad: bool) -> TensorNodeId {
        self.tape.leaf(tensor, requires_grad)
    }

    pub fn tensor(&self, node: TensorNodeId) -> Result<&Tensor, AutogradError> {
        self.tape.tensor(node)
    }

    pub fn tensor_values(&self, node: TensorNodeId) -> Result<Vec<f64>, AutogradError> {
        Ok(self.tape.values(node)?.to_vec())
    }

    pub fn tensor_shape(&self, node: TensorNodeId) -> Result<Vec<usize>, AutogradError> {
        Ok(self.tape.shape(node)?.to_vec())
    }

    pub fn tensor_add(
        &mut self,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.add(lhs, rhs)
    }

    pub fn tensor_sub(
        &mut self,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.sub(lhs, rhs)
    }

    pub fn tensor_mul(
        &mut self,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.mul(lhs, rhs)
    }

    pub fn tensor_affine(
        &mut self,
        input: TensorNodeId,
        scale: f64,
        shift: f64,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.affine(input, scale, shift)
    }

    pub fn tensor_tanh(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        self.tape.tanh(input)
    }

    pub fn tensor_relu(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        self.tape.clamp_min(input, 0.0)
    }

    pub fn tensor_clamp_min(
        &mut self,
        input: TensorNodeId,
        min: f64,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.clamp_min(input, min)
    }

    pub fn tensor_sum(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        self.tape.sum(input)
    }

    pub fn tensor_sum_per_example(
        &mut self,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.sum_per_example(input)
    }

    pub fn tensor_max_per_row(
        &mut self,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.max_per_row(input)
    }

    pub fn tensor_log_softmax(
        &mut self,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.log_softmax(input)
    }

    pub fn tensor_matmul(
        &mut self,
        lhs: TensorNodeId,
        rhs: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.matmul(lhs, rhs)
    }

    pub fn tensor_transpose(&mut self, input: TensorNodeId) -> Result<TensorNodeId, AutogradError> {
        self.tape.transpose(input)
    }

    pub fn tensor_reshape(
        &mut self,
        input: TensorNodeId,
        shape: Vec<usize>,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.reshape(input, shape)
    }

    pub fn tensor_expand(
        &mut self,
        input: TensorNodeId,
        shape: Vec<usize>,
    ) -> Result<TensorNodeId, AutogradError> {
        self.tape.expand(input, shape)
    }

    /// In-place `param -= delta` on a leaf.
    pub fn tensor_sub_(
        &mut self,
        param: TensorNodeId,
        delta: &[f64],
    ) -> Result<(), AutogradError> {
        self.tape.sub_leaf_in_place(param, delta)
    }

    pub fn tensor_backward(
        &mut self,
        root: TensorNodeId,
    ) -> Result<TensorBackwardReport, AutogradError> {
        let report = self.tape.backward(root)?;
        self.ledger.record(
            EvidenceKind::Backward,
            format!(
                "root={} backward_steps={} queue_pushes={} queue_pops={} max_queue_len={}",
                root,
                report.steps.len(),
                report.telemetry.queue_pushes,
                report.telemetry.queue_pops,
                report.telemetry.max_queue_len,
            ),
        );
        Ok(report)
    }

    #[must_use]
    pub fn tensor_gradient<'a>(
        &self,
        report: &'a TensorBackwardReport,
        node: TensorNodeId,
    ) -> Option<&'a [f64]> {
        report.gradient(node)
    }

    /// Everything recorded after this point can be discarded with
    /// [`AdvSession::rewind`].
    #[must_use]
    pub fn mark(&self) -> TapeMark {
        self.tape.mark()
    }

    pub fn rewind(&mut self, mark: TapeMark) -> Result<(), AutogradError> {
        self.tape.truncate(mark)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.tape.node_count()
    }

    pub fn record_evidence(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.ledger.record(kind, summary);
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.ledger.entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.ledger.len()
    }
}
