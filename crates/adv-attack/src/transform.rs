//! Change of variables between the clip box and unconstrained tanh space.
//!
//! The attack optimizes `w` in tanh space, where every real number maps back
//! to a point strictly inside `[clip_min, clip_max]`, so the adversarial
//! input never needs explicit clipping.

use adv_api::AdvSession;
use adv_autograd::{AutogradError, TensorNodeId};
use adv_core::Tensor;

/// Inputs are pulled this far inside (-1, 1) before `atanh`.
pub const TANH_SHRINK: f64 = 1e-6;

/// Map inputs from `[clip_min, clip_max]` into tanh space.
#[must_use]
pub fn to_tanh_space(inputs: &Tensor, clip_min: f64, clip_max: f64) -> Tensor {
    let mut out = inputs.clone();
    let range = clip_max - clip_min;
    out.map_in_place(|x| {
        let unit = (x - clip_min) / range;
        ((unit * 2.0 - 1.0) * (1.0 - TANH_SHRINK)).atanh()
    });
    out
}

/// Map tanh-space values back into `[clip_min, clip_max]`.
#[must_use]
pub fn from_tanh_space(values: &Tensor, clip_min: f64, clip_max: f64) -> Tensor {
    let half_range = (clip_max - clip_min) * 0.5;
    let mut out = values.clone();
    out.map_in_place(|w| w.tanh() * half_range + (half_range + clip_min));
    out
}

/// Differentiable [`from_tanh_space`] on the session tape.
pub(crate) fn from_tanh_space_node(
    session: &mut AdvSession,
    node: TensorNodeId,
    clip_min: f64,
    clip_max: f64,
) -> Result<TensorNodeId, AutogradError> {
    let squashed = session.tensor_tanh(node)?;
    let half_range = (clip_max - clip_min) * 0.5;
    session.tensor_affine(squashed, half_range, half_range + clip_min)
}
