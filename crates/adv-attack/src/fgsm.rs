use adv_api::AdvSession;
use adv_core::Tensor;
use adv_nn::Module;
use serde::{Deserialize, Serialize};

use crate::error::AttackError;

/// Single-step fast gradient sign method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Fgsm {
    pub epsilon: f64,
    pub clip_min: f64,
    pub clip_max: f64,
}

impl Default for Fgsm {
    fn default() -> Self {
        Self {
            epsilon: 0.25,
            clip_min: -1.0,
            clip_max: 1.0,
        }
    }
}

impl Fgsm {
    #[must_use]
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            ..Self::default()
        }
    }

    /// `clamp(x + epsilon * sign(grad NLL), clip_min, clip_max)`, where the
    /// negative log-likelihood is taken at the true labels.
    pub fn attack<M: Module + ?Sized>(
        &self,
        inputs: &Tensor,
        labels: &[usize],
        model: &M,
    ) -> Result<Tensor, AttackError> {
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(AttackError::InvalidConfig {
                reason: "fgsm epsilon must be finite and non-negative",
            });
        }
        if !self.clip_min.is_finite() || !self.clip_max.is_finite() || self.clip_min >= self.clip_max
        {
            return Err(AttackError::InvalidConfig {
                reason: "clip_min must be finite and strictly below a finite clip_max",
            });
        }
        let batch = inputs.batch_size()?;
        if labels.len() != batch {
            return Err(AttackError::BatchMismatch {
                inputs: batch,
                labels: labels.len(),
            });
        }

        let mut session = AdvSession::new();
        let x = session.tensor_leaf(inputs.clone(), true);
        let scores = model.forward(&mut session, x)?;
        let score_shape = session.tensor_shape(scores)?;
        if score_shape.len() != 2 || score_shape[0] != batch {
            return Err(AttackError::ScoreShape {
                expected: vec![batch, score_shape.last().copied().unwrap_or(0)],
                actual: score_shape,
            });
        }
        let classes = score_shape[1];

        let mut onehot = vec![0.0; batch * classes];
        for (example, &label) in labels.iter().enumerate() {
            if label >= classes {
                return Err(AttackError::LabelOutOfRange {
                    example,
                    label,
                    num_labels: classes,
                });
            }
            onehot[example * classes + label] = 1.0;
        }
        let onehot = session.tensor_variable(onehot, score_shape, false)?;

        let log_probs = session.tensor_log_softmax(scores)?;
        let picked = session.tensor_mul(onehot, log_probs)?;
        let total = session.tensor_sum(picked)?;
        let nll = session.tensor_affine(total, -1.0, 0.0)?;
        let report = session.tensor_backward(nll)?;

        let mut adversarial = inputs.clone();
        if let Some(grad) = session.tensor_gradient(&report, x) {
            let stepped: Vec<f64> = inputs
                .values()
                .iter()
                .zip(grad)
                .map(|(value, g)| {
                    (value + self.epsilon * sign(*g)).clamp(self.clip_min, self.clip_max)
                })
                .collect();
            adversarial.set_in_place(stepped)?;
        }
        Ok(adversarial)
    }
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use adv_nn::Linear;

    use super::*;

    fn monotone_model() -> Linear {
        let weight = Tensor::from_vec(vec![-10.0, 0.0, 0.0, 10.0, 0.0, 0.0], vec![2, 3])
            .expect("weight");
        Linear::new(weight, None).expect("linear")
    }

    #[test]
    fn steps_against_the_true_class() {
        let inputs = Tensor::from_vec(vec![-0.5, 0.2, -0.1], vec![1, 3]).expect("inputs");
        let adversarial = Fgsm::default()
            .attack(&inputs, &[0], &monotone_model())
            .expect("fgsm");
        assert_eq!(adversarial.values(), &[-0.25, 0.2, -0.1]);
    }

    #[test]
    fn result_is_clamped_to_the_box() {
        let inputs = Tensor::from_vec(vec![0.9, 0.0, 0.0], vec![1, 3]).expect("inputs");
        let adversarial = Fgsm::default()
            .attack(&inputs, &[0], &monotone_model())
            .expect("fgsm");
        assert_eq!(adversarial.values()[0], 1.0);
    }

    #[test]
    fn label_beyond_model_classes_is_rejected() {
        let inputs = Tensor::zeros(vec![1, 3]);
        let err = Fgsm::default()
            .attack(&inputs, &[2], &monotone_model())
            .expect_err("label 2 of a 2-class model");
        assert_eq!(
            err,
            AttackError::LabelOutOfRange {
                example: 0,
                label: 2,
                num_labels: 2
            }
        );
    }

    #[test]
    fn negative_epsilon_is_rejected() {
        let inputs = Tensor::zeros(vec![1, 3]);
        let err = Fgsm::new(-0.1)
            .attack(&inputs, &[0], &monotone_model())
            .expect_err("negative epsilon");
        assert!(matches!(err, AttackError::InvalidConfig { .. }));
    }
}
