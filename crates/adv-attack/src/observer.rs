//! Progress reporting for attack runs.
//!
//! The driver never logs on its own; it hands events to an
//! [`AttackObserver`]. Every hook has an empty default body.

use adv_runtime::{EvidenceKind, EvidenceLedger};
use serde::Serialize;
use tracing::{debug, info};

/// One inner optimization step, as seen after bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepEvent {
    pub round: usize,
    pub step: usize,
    pub max_iterations: usize,
    pub loss: f64,
    pub mean_distortion: f64,
    /// Mean modifier value before this step's update.
    pub modifier_mean: f64,
}

impl StepEvent {
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.step + 1 == self.max_iterations
    }
}

/// Outcome counts after a round's bound adjustment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundSummary {
    pub round: usize,
    /// Examples holding an adversarial candidate so far.
    pub successes: usize,
    pub failures: usize,
    /// Mean of the best squared distortions over successful examples.
    pub mean_best_distance: Option<f64>,
    /// Steps the round actually ran.
    pub steps: usize,
    pub aborted_early: bool,
}

pub trait AttackObserver {
    fn round_started(&mut self, _round: usize, _rounds: usize, _scale_consts: &[f64]) {}

    fn step_completed(&mut self, _event: &StepEvent) {}

    fn aborted_early(&mut self, _round: usize, _step: usize, _loss: f64, _checkpoint: f64) {}

    fn round_finished(&mut self, _summary: &RoundSummary) {}
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl AttackObserver for NoopObserver {}

/// Emits events as `tracing` records.
#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    progress_every: usize,
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self { progress_every: 100 }
    }
}

impl TracingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log step progress every `every` steps (and always on the last one).
    #[must_use]
    pub fn progress_every(mut self, every: usize) -> Self {
        self.progress_every = every.max(1);
        self
    }

    fn wants_step(&self, event: &StepEvent) -> bool {
        event.step % self.progress_every == 0 || event.is_last()
    }
}

impl AttackObserver for TracingObserver {
    fn round_started(&mut self, round: usize, rounds: usize, scale_consts: &[f64]) {
        let mean_const = scale_consts.iter().sum::<f64>() / scale_consts.len().max(1) as f64;
        info!(round, rounds, mean_const, "search step started");
    }

    fn step_completed(&mut self, event: &StepEvent) {
        if self.wants_step(event) {
            debug!(
                round = event.round,
                step = event.step,
                loss = event.loss,
                dist = event.mean_distortion,
                modifier_mean = event.modifier_mean,
                "optimization step"
            );
        }
    }

    fn aborted_early(&mut self, round: usize, step: usize, loss: f64, checkpoint: f64) {
        debug!(round, step, loss, checkpoint, "aborting early, loss stagnated");
    }

    fn round_finished(&mut self, summary: &RoundSummary) {
        info!(
            round = summary.round,
            failures = summary.failures,
            successes = summary.successes,
            mean_best_distance = ?summary.mean_best_distance,
            steps = summary.steps,
            "search step finished"
        );
    }
}

/// Appends round-level events to an evidence ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerObserver {
    ledger: EvidenceLedger,
}

impl LedgerObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    #[must_use]
    pub fn into_ledger(self) -> EvidenceLedger {
        self.ledger
    }
}

impl AttackObserver for LedgerObserver {
    fn round_started(&mut self, round: usize, rounds: usize, scale_consts: &[f64]) {
        self.ledger.record(
            EvidenceKind::Attack,
            format!("round={round}/{rounds} scale_consts={scale_consts:?}"),
        );
    }

    fn aborted_early(&mut self, round: usize, step: usize, loss: f64, checkpoint: f64) {
        self.ledger.record(
            EvidenceKind::Attack,
            format!("round={round} early_abort step={step} loss={loss:.6e} checkpoint={checkpoint:.6e}"),
        );
    }

    fn round_finished(&mut self, summary: &RoundSummary) {
        self.ledger.record(
            EvidenceKind::Attack,
            format!(
                "round={} failures={} successes={} steps={}",
                summary.round, summary.failures, summary.successes, summary.steps
            ),
        );
    }
}
