//! Untargeted Carlini-Wagner L2 attack.
//!
//! Each outer round runs Adam over a per-example modifier `w` in tanh space,
//! minimizing `c * max(0, real - other + confidence) + ||x' - x||^2`. Between
//! rounds a per-example binary search adjusts `c`: successes shrink it,
//! failures grow it.

use adv_api::AdvSession;
use adv_autograd::{TapeMark, TensorNodeId};
use adv_core::Tensor;
use adv_kernel_cpu::argmax;
use adv_nn::Module;
use adv_optim::{Adam, Optimizer};
use serde::Serialize;

use crate::config::CarliniWagnerConfig;
use crate::error::AttackError;
use crate::observer::{AttackObserver, NoopObserver, RoundSummary, StepEvent};
use crate::state::{ExampleState, SearchBounds};
use crate::transform::{from_tanh_space, from_tanh_space_node, to_tanh_space};

/// Keeps the true class out of the "best other class" maximum.
const TRUE_CLASS_PENALTY: f64 = 10_000.0;

/// A round stops once the loss fails to drop below this fraction of the
/// previous checkpoint.
const STAGNATION_FACTOR: f64 = 0.9999;

/// Model output to judge: full per-class scores or an already chosen label.
#[derive(Debug, Clone, Copy)]
pub enum Prediction<'a> {
    Scores(&'a [f64]),
    Label(usize),
}

/// Result of one inner optimization step. Values are taken before the
/// modifier update.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StepOutcome {
    pub(crate) loss: f64,
    pub(crate) distortions: Vec<f64>,
    /// `[batch, num_labels]`, row-major.
    pub(crate) scores: Vec<f64>,
    pub(crate) adversarial: Tensor,
}

/// Per-example result of a full run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExampleOutcome {
    pub label: usize,
    pub best_distance: Option<f64>,
    pub best_label: Option<usize>,
    pub bounds: SearchBounds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttackReport {
    #[serde(skip)]
    pub adversarial: Tensor,
    pub examples: Vec<ExampleOutcome>,
}

impl AttackReport {
    /// Number of examples for which an adversarial input was found.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.examples
            .iter()
            .filter(|example| example.best_distance.is_some())
            .count()
    }
}

/// Optimization state for one outer round. Dropped and rebuilt at every
/// round boundary, which resets the modifier and the optimizer.
struct RoundState {
    session: AdvSession,
    optimizer: Adam,
    modifier: TensorNodeId,
    working: TensorNodeId,
    reference: TensorNodeId,
    onehot: TensorNodeId,
    others_mask: TensorNodeId,
    penalty: TensorNodeId,
    scale_consts: TensorNodeId,
    mark: TapeMark,
}

impl RoundState {
    fn new(
        working: &Tensor,
        reference: &Tensor,
        onehot: &Tensor,
        scale_consts: Vec<f64>,
        learning_rate: f64,
    ) -> Result<Self, AttackError> {
        let mut session = AdvSession::new();
        let modifier = session.tensor_leaf(Tensor::zeros(working.shape().to_vec()), true);
        let working = session.tensor_leaf(working.clone(), false);
        let reference = session.tensor_leaf(reference.clone(), false);

        let mut others = onehot.clone();
        others.map_in_place(|hot| 1.0 - hot);
        let mut penalty = onehot.clone();
        penalty.map_in_place(|hot| hot * TRUE_CLASS_PENALTY);
        let onehot = session.tensor_leaf(onehot.clone(), false);
        let others_mask = session.tensor_leaf(others, false);
        let penalty = session.tensor_leaf(penalty, false);

        let batch = scale_consts.len();
        let scale_consts = session.tensor_variable(scale_consts, vec![batch], false)?;
        let mark = session.mark();

        Ok(Self {
            session,
            optimizer: Adam::new(vec![modifier], learning_rate),
            modifier,
            working,
            reference,
            onehot,
            others_mask,
            penalty,
            scale_consts,
            mark,
        })
    }

    fn modifier_mean(&self) -> Result<f64, AttackError> {
        let modifier = self.session.tensor(self.modifier)?;
        Ok(modifier.values().iter().sum::<f64>() / modifier.numel().max(1) as f64)
    }

    fn optimize_step<M: Module + ?Sized>(
        &mut self,
        model: &M,
        config: &CarliniWagnerConfig,
    ) -> Result<StepOutcome, AttackError> {
        let session = &mut self.session;

        let shifted = session.tensor_add(self.working, self.modifier)?;
        let adversarial =
            from_tanh_space_node(session, shifted, config.clip_min, config.clip_max)?;
        let scores = model.forward(session, adversarial)?;

        let score_shape = session.tensor_shape(scores)?;
        let expected = session.tensor_shape(self.onehot)?;
        if score_shape != expected {
            session.rewind(self.mark)?;
            return Err(AttackError::ScoreShape {
                expected,
                actual: score_shape,
            });
        }

        let real_terms = session.tensor_mul(self.onehot, scores)?;
        let real = session.tensor_sum_per_example(real_terms)?;
        let others = session.tensor_mul(self.others_mask, scores)?;
        let others = session.tensor_sub(others, self.penalty)?;
        let other = session.tensor_max_per_row(others)?;

        let margin = session.tensor_sub(real, other)?;
        let margin = session.tensor_affine(margin, 1.0, config.confidence)?;
        let hinge = session.tensor_clamp_min(margin, 0.0)?;
        let weighted = session.tensor_mul(self.scale_consts, hinge)?;
        let loss1 = session.tensor_sum(weighted)?;

        let diff = session.tensor_sub(adversarial, self.reference)?;
        let squared = session.tensor_mul(diff, diff)?;
        let distortion = session.tensor_sum_per_example(squared)?;
        let loss2 = session.tensor_sum(distortion)?;
        let loss = session.tensor_add(loss1, loss2)?;

        let outcome = StepOutcome {
            loss: session.tensor_values(loss)?[0],
            distortions: session.tensor_values(distortion)?,
            scores: session.tensor_values(scores)?,
            adversarial: session.tensor(adversarial)?.clone(),
        };

        let report = session.tensor_backward(loss)?;
        self.optimizer.zero_grad(session)?;
        self.optimizer.step(session, &report)?;
        session.rewind(self.mark)?;
        Ok(outcome)
    }
}

/// Untargeted Carlini-Wagner L2 attack.
#[derive(Debug, Clone, PartialEq)]
pub struct CarliniWagner {
    config: CarliniWagnerConfig,
}

impl CarliniWagner {
    pub fn new(config: CarliniWagnerConfig) -> Result<Self, AttackError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &CarliniWagnerConfig {
        &self.config
    }

    /// True when `label` is not the predicted class. With full scores the
    /// true class gets a `confidence` head start before the arg-max.
    #[must_use]
    pub fn compare(&self, prediction: Prediction<'_>, label: usize) -> bool {
        match prediction {
            Prediction::Label(predicted) => predicted != label,
            Prediction::Scores(scores) => {
                let mut boosted = scores.to_vec();
                if let Some(score) = boosted.get_mut(label) {
                    *score += self.config.confidence;
                }
                argmax(&boosted).0 != label
            }
        }
    }

    /// Adversarial inputs for `inputs`, shaped like `inputs`. Examples with
    /// no adversarial candidate come back unchanged.
    pub fn attack<M: Module + ?Sized>(
        &self,
        inputs: &Tensor,
        labels: &[usize],
        model: &M,
    ) -> Result<Tensor, AttackError> {
        Ok(self.attack_with_report(inputs, labels, model)?.adversarial)
    }

    pub fn attack_with_report<M: Module + ?Sized>(
        &self,
        inputs: &Tensor,
        labels: &[usize],
        model: &M,
    ) -> Result<AttackReport, AttackError> {
        self.attack_with_observer(inputs, labels, model, &mut NoopObserver)
    }

    pub fn attack_with_observer<M, O>(
        &self,
        inputs: &Tensor,
        labels: &[usize],
        model: &M,
        observer: &mut O,
    ) -> Result<AttackReport, AttackError>
    where
        M: Module + ?Sized,
        O: AttackObserver + ?Sized,
    {
        let config = &self.config;
        self.check_inputs(inputs, labels)?;
        let batch = labels.len();

        let working = to_tanh_space(inputs, config.clip_min, config.clip_max);
        let reference = from_tanh_space(&working, config.clip_min, config.clip_max);
        let onehot = one_hot(labels, config.num_labels)?;

        let mut examples: Vec<ExampleState> = labels
            .iter()
            .map(|&label| ExampleState::new(label, config.initial_const))
            .collect();
        let rounds = config.binary_search_steps;
        let check_every = config.abort_check_interval();

        for round in 0..rounds {
            if config.repeats_last_round() && round + 1 == rounds {
                for example in &mut examples {
                    example.bounds.repeat_at_upper();
                }
            }
            for example in &mut examples {
                example.start_round();
            }

            let scale_consts: Vec<f64> = examples.iter().map(|e| e.bounds.scale_const).collect();
            observer.round_started(round, rounds, &scale_consts);
            let mut state = RoundState::new(
                &working,
                &reference,
                &onehot,
                scale_consts,
                config.learning_rate,
            )?;

            let mut checkpoint: Option<f64> = None;
            let mut steps = 0;
            let mut aborted_early = false;
            for step in 0..config.max_iterations {
                let modifier_mean = state.modifier_mean()?;
                let outcome = state.optimize_step(model, config)?;
                steps = step + 1;

                for (index, example) in examples.iter_mut().enumerate() {
                    let scores = &outcome.scores
                        [index * config.num_labels..(index + 1) * config.num_labels];
                    let success = self.compare(Prediction::Scores(scores), example.label);
                    example.observe(
                        outcome.distortions[index],
                        argmax(scores).0,
                        success,
                        outcome.adversarial.example(index)?,
                    );
                }

                observer.step_completed(&StepEvent {
                    round,
                    step,
                    max_iterations: config.max_iterations,
                    loss: outcome.loss,
                    mean_distortion: outcome.distortions.iter().sum::<f64>() / batch as f64,
                    modifier_mean,
                });

                if config.abort_early && step % check_every == 0 {
                    if let Some(previous) = checkpoint {
                        if outcome.loss > previous * STAGNATION_FACTOR {
                            observer.aborted_early(round, step, outcome.loss, previous);
                            aborted_early = true;
                            break;
                        }
                    }
                    checkpoint = Some(outcome.loss);
                }
            }

            for example in &mut examples {
                let success = example
                    .round_best
                    .is_some_and(|best| self.compare(Prediction::Label(best.label), example.label));
                example.bounds.adjust(success);
            }

            observer.round_finished(&summarize(round, &examples, steps, aborted_early));
        }

        let mut adversarial = inputs.clone();
        for (index, example) in examples.iter().enumerate() {
            if let Some(best) = &example.overall_best {
                adversarial.example_mut(index)?.copy_from_slice(&best.adversarial);
            }
        }

        Ok(AttackReport {
            adversarial,
            examples: examples
                .into_iter()
                .map(|example| ExampleOutcome {
                    label: example.label,
                    best_distance: example.overall_best.as_ref().map(|best| best.distance),
                    best_label: example.overall_best.as_ref().map(|best| best.label),
                    bounds: example.bounds,
                })
                .collect(),
        })
    }

    fn check_inputs(&self, inputs: &Tensor, labels: &[usize]) -> Result<(), AttackError> {
        let config = &self.config;
        if inputs.shape().len() < 2 {
            return Err(AttackError::InputRank {
                shape: inputs.shape().to_vec(),
            });
        }
        let batch = inputs.batch_size()?;
        if batch == 0 {
            return Err(AttackError::EmptyBatch);
        }
        if labels.len() != batch {
            return Err(AttackError::BatchMismatch {
                inputs: batch,
                labels: labels.len(),
            });
        }
        for (example, &label) in labels.iter().enumerate() {
            if label >= config.num_labels {
                return Err(AttackError::LabelOutOfRange {
                    example,
                    label,
                    num_labels: config.num_labels,
                });
            }
        }
        for example in 0..batch {
            let outside = inputs
                .example(example)?
                .iter()
                .copied()
                .find(|value| !(config.clip_min..=config.clip_max).contains(value));
            if let Some(value) = outside {
                return Err(AttackError::InputOutOfRange {
                    example,
                    value,
                    clip_min: config.clip_min,
                    clip_max: config.clip_max,
                });
            }
        }
        Ok(())
    }
}

fn one_hot(labels: &[usize], num_labels: usize) -> Result<Tensor, AttackError> {
    let mut values = vec![0.0; labels.len() * num_labels];
    for (row, &label) in labels.iter().enumerate() {
        values[row * num_labels + label] = 1.0;
    }
    Ok(Tensor::from_vec(values, vec![labels.len(), num_labels])?)
}

fn summarize(
    round: usize,
    examples: &[ExampleState],
    steps: usize,
    aborted_early: bool,
) -> RoundSummary {
    let best: Vec<f64> = examples
        .iter()
        .filter_map(|example| example.overall_best.as_ref().map(|best| best.distance))
        .collect();
    let mean_best_distance =
        (!best.is_empty()).then(|| best.iter().sum::<f64>() / best.len() as f64);
    RoundSummary {
        round,
        successes: best.len(),
        failures: examples.len() - best.len(),
        mean_best_distance,
        steps,
        aborted_early,
    }
}
