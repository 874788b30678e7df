#![forbid(unsafe_code)]
//! First-order optimizers that update session leaves in place from a
//! backward report.

use adv_api::AdvSession;
use adv_autograd::{AutogradError, TensorBackwardReport, TensorNodeId};
use adv_runtime::EvidenceKind;

/// Updates a fixed set of leaves from the gradients of one backward pass.
pub trait Optimizer {
    fn step(
        &mut self,
        session: &mut AdvSession,
        report: &TensorBackwardReport,
    ) -> Result<(), AutogradError>;

    /// Gradients live in the backward report, so there is nothing to clear
    /// unless an optimizer keeps its own accumulators.
    fn zero_grad(&mut self, _session: &mut AdvSession) -> Result<(), AutogradError> {
        Ok(())
    }

    fn get_lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);
}

fn hyperparameter(reason: &'static str) -> AutogradError {
    AutogradError::InvalidHyperparameter { reason }
}

fn require(ok: bool, reason: &'static str) -> Result<(), AutogradError> {
    if ok { Ok(()) } else { Err(hyperparameter(reason)) }
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

/// Gradient of `param` with L2 weight decay folded in, or `None` when the
/// backward pass never reached it.
fn decayed_gradient(
    session: &AdvSession,
    report: &TensorBackwardReport,
    param: TensorNodeId,
    weight_decay: f64,
) -> Result<Option<Vec<f64>>, AutogradError> {
    let Some(grad) = session.tensor_gradient(report, param) else {
        return Ok(None);
    };
    let values = session.tensor(param)?.values();
    if values.len() != grad.len() {
        return Err(AutogradError::TensorGradientShapeMismatch {
            node: param,
            expected: values.len(),
            actual: grad.len(),
        });
    }
    if weight_decay == 0.0 {
        return Ok(Some(grad.to_vec()));
    }
    Ok(Some(
        grad.iter()
            .zip(values)
            .map(|(g, p)| g + weight_decay * p)
            .collect(),
    ))
}

/// Per-parameter running buffer, created zeroed on first use.
fn slot<'a>(
    buffers: &'a mut [Option<Vec<f64>>],
    index: usize,
    len: usize,
    reason: &'static str,
) -> Result<&'a mut Vec<f64>, AutogradError> {
    let buffer = buffers[index].get_or_insert_with(|| vec![0.0; len]);
    if buffer.len() != len {
        return Err(AutogradError::OptimizerState { reason });
    }
    Ok(buffer)
}

/// Stochastic gradient descent with optional (Nesterov) momentum and weight
/// decay.
#[derive(Debug, Clone)]
pub struct SGD {
    params: Vec<TensorNodeId>,
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    nesterov: bool,
    velocity: Vec<Option<Vec<f64>>>,
}

impl SGD {
    #[must_use]
    pub fn new(params: Vec<TensorNodeId>, lr: f64) -> Self {
        let velocity = vec![None; params.len()];
        Self {
            params,
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
            nesterov: false,
            velocity,
        }
    }

    #[must_use]
    pub fn momentum(self, momentum: f64) -> Self {
        Self { momentum, ..self }
    }

    #[must_use]
    pub fn weight_decay(self, weight_decay: f64) -> Self {
        Self {
            weight_decay,
            ..self
        }
    }

    #[must_use]
    pub fn nesterov(self, nesterov: bool) -> Self {
        Self { nesterov, ..self }
    }

    fn check(&self) -> Result<(), AutogradError> {
        require(non_negative(self.lr), "sgd lr must be finite and >= 0")?;
        require(non_negative(self.momentum), "sgd momentum must be finite and >= 0")?;
        require(
            non_negative(self.weight_decay),
            "sgd weight_decay must be finite and >= 0",
        )?;
        require(
            !self.nesterov || self.momentum > 0.0,
            "sgd nesterov needs momentum > 0",
        )
    }
}

impl Optimizer for SGD {
    fn step(
        &mut self,
        session: &mut AdvSession,
        report: &TensorBackwardReport,
    ) -> Result<(), AutogradError> {
        self.check()?;
        for (index, &param) in self.params.iter().enumerate() {
            let Some(grad) = decayed_gradient(session, report, param, self.weight_decay)? else {
                continue;
            };

            let direction = if self.momentum == 0.0 {
                grad
            } else {
                let velocity = slot(
                    &mut self.velocity,
                    index,
                    grad.len(),
                    "sgd velocity length differs from gradient",
                )?;
                for (v, g) in velocity.iter_mut().zip(&grad) {
                    *v = self.momentum * *v + g;
                }
                if self.nesterov {
                    grad.iter()
                        .zip(velocity.iter())
                        .map(|(g, v)| g + self.momentum * v)
                        .collect()
                } else {
                    velocity.clone()
                }
            };

            let delta: Vec<f64> = direction.iter().map(|d| self.lr * d).collect();
            session.tensor_sub_(param, &delta)?;
        }
        Ok(())
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Adam with bias-corrected first and second moments.
///
/// Defaults: `betas = (0.9, 0.999)`, `eps = 1e-8`, no weight decay.
#[derive(Debug, Clone)]
pub struct Adam {
    params: Vec<TensorNodeId>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    steps: u64,
    first_moment: Vec<Option<Vec<f64>>>,
    second_moment: Vec<Option<Vec<f64>>>,
}

impl Adam {
    #[must_use]
    pub fn new(params: Vec<TensorNodeId>, lr: f64) -> Self {
        let count = params.len();
        Self {
            params,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            steps: 0,
            first_moment: vec![None; count],
            second_moment: vec![None; count],
        }
    }

    #[must_use]
    pub fn betas(self, beta1: f64, beta2: f64) -> Self {
        Self {
            beta1,
            beta2,
            ..self
        }
    }

    #[must_use]
    pub fn eps(self, eps: f64) -> Self {
        Self { eps, ..self }
    }

    #[must_use]
    pub fn weight_decay(self, weight_decay: f64) -> Self {
        Self {
            weight_decay,
            ..self
        }
    }

    /// Completed update steps.
    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.steps
    }

    fn check(&self) -> Result<(), AutogradError> {
        require(non_negative(self.lr), "adam lr must be finite and >= 0")?;
        let beta_ok = |beta: f64| (0.0..1.0).contains(&beta);
        require(
            beta_ok(self.beta1) && beta_ok(self.beta2),
            "adam betas must lie in [0, 1)",
        )?;
        require(
            self.eps.is_finite() && self.eps > 0.0,
            "adam eps must be finite and > 0",
        )?;
        require(
            non_negative(self.weight_decay),
            "adam weight_decay must be finite and >= 0",
        )
    }
}

impl Optimizer for Adam {
    fn step(
        &mut self,
        session: &mut AdvSession,
        report: &TensorBackwardReport,
    ) -> Result<(), AutogradError> {
        self.check()?;
        let t = self
            .steps
            .checked_add(1)
            .ok_or(AutogradError::OptimizerState {
                reason: "adam step counter overflow",
            })?;
        let correction1 = 1.0 - self.beta1.powf(t as f64);
        let correction2 = 1.0 - self.beta2.powf(t as f64);

        for (index, &param) in self.params.iter().enumerate() {
            let Some(grad) = decayed_gradient(session, report, param, self.weight_decay)? else {
                continue;
            };
            let m = slot(
                &mut self.first_moment,
                index,
                grad.len(),
                "adam first moment length differs from gradient",
            )?;
            let v = slot(
                &mut self.second_moment,
                index,
                grad.len(),
                "adam second moment length differs from gradient",
            )?;

            let mut delta = Vec::with_capacity(grad.len());
            for ((m, v), g) in m.iter_mut().zip(v.iter_mut()).zip(&grad) {
                *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                delta.push(self.lr * m_hat / (v_hat.sqrt() + self.eps));
            }
            session.tensor_sub_(param, &delta)?;
        }

        self.steps = t;
        if t == 1 {
            session.record_evidence(
                EvidenceKind::Optimizer,
                format!("adam started lr={:.3e} params={}", self.lr, self.params.len()),
            );
        }
        Ok(())
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}
