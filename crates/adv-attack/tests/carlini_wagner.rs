use adv_attack::{
    AttackError, AttackObserver, CarliniWagner, CarliniWagnerConfig, LedgerObserver,
    RoundSummary, StepEvent, UNBOUNDED_SENTINEL, UpperBound, l2_distance,
};
use adv_core::Tensor;
use adv_nn::{Flatten, Linear, Sequential};
use adv_runtime::EvidenceKind;

#[derive(Default)]
struct RecordingObserver {
    round_consts: Vec<Vec<f64>>,
    summaries: Vec<RoundSummary>,
    steps: usize,
    aborts: usize,
}

impl AttackObserver for RecordingObserver {
    fn round_started(&mut self, _round: usize, _rounds: usize, scale_consts: &[f64]) {
        self.round_consts.push(scale_consts.to_vec());
    }

    fn step_completed(&mut self, _event: &StepEvent) {
        self.steps += 1;
    }

    fn aborted_early(&mut self, _round: usize, _step: usize, _loss: f64, _checkpoint: f64) {
        self.aborts += 1;
    }

    fn round_finished(&mut self, summary: &RoundSummary) {
        self.summaries.push(summary.clone());
    }
}

/// Ignores its input and always scores class 0 far ahead of class 1.
fn constant_model() -> Linear {
    Linear::new(Tensor::zeros(vec![2, 3]), Some(vec![10.0, 0.0])).expect("linear")
}

/// score0 = -10 * x0, score1 = 10 * x0.
fn monotone_model() -> Linear {
    let weight =
        Tensor::from_vec(vec![-10.0, 0.0, 0.0, 10.0, 0.0, 0.0], vec![2, 3]).expect("weight");
    Linear::new(weight, None).expect("linear")
}

fn two_class(config: CarliniWagnerConfig) -> CarliniWagner {
    CarliniWagner::new(config.num_labels(2)).expect("valid config")
}

#[test]
fn unfoolable_model_returns_the_input_unchanged() {
    let cw = two_class(CarliniWagnerConfig::default().max_iterations(50));
    let inputs = Tensor::zeros(vec![1, 3]);
    let mut observer = RecordingObserver::default();

    let report = cw
        .attack_with_observer(&inputs, &[0], &constant_model(), &mut observer)
        .expect("attack runs");

    assert_eq!(report.adversarial.values(), inputs.values());
    assert_eq!(report.success_count(), 0);
    let outcome = &report.examples[0];
    assert_eq!(outcome.best_distance, None);
    assert_eq!(outcome.best_label, None);
    assert_eq!(outcome.bounds.upper, UpperBound::Unbounded);
    // Five failed rounds: 0.01 grows tenfold each time.
    assert!((outcome.bounds.scale_const - 1000.0).abs() < 1e-9);
    assert!((outcome.bounds.lower - 100.0).abs() < 1e-9);

    assert_eq!(observer.summaries.len(), 5);
    assert!(observer.summaries.iter().all(|s| s.failures == 1 && s.successes == 0));
    // Constant loss trips the stagnation check at the second checkpoint.
    assert_eq!(observer.aborts, 5);
    assert!(observer.summaries.iter().all(|s| s.aborted_early && s.steps == 6));
}

#[test]
fn monotone_model_flips_with_a_small_perturbation() {
    let cw = two_class(
        CarliniWagnerConfig::default()
            .learning_rate(0.01)
            .binary_search_steps(3)
            .max_iterations(300)
            .abort_early(false),
    );
    let inputs = Tensor::from_vec(vec![-0.5, 0.2, -0.1], vec![1, 3]).expect("inputs");
    let mut observer = RecordingObserver::default();

    let report = cw
        .attack_with_observer(&inputs, &[0], &monotone_model(), &mut observer)
        .expect("attack runs");

    let outcome = &report.examples[0];
    let distance = outcome.best_distance.expect("adversarial found");
    assert_eq!(outcome.best_label, Some(1));
    assert!(distance > 0.2 && distance < 0.4, "distance {distance}");

    let adversarial = report.adversarial.values();
    assert!(adversarial[0] > 0.0, "x0 = {}", adversarial[0]);
    assert!((adversarial[1] - 0.2).abs() < 1e-5);
    assert!((adversarial[2] + 0.1).abs() < 1e-5);
    let measured = l2_distance(&report.adversarial, &inputs).expect("distance");
    assert!((measured[0] - distance).abs() < 1e-4);

    // The first round's constant is too weak; the search grows it and then
    // starts bisecting once a round succeeds.
    assert_eq!(observer.summaries[0].successes, 0);
    assert!((observer.round_consts[1][0] - 0.1).abs() < 1e-12);
    assert!(matches!(outcome.bounds.upper, UpperBound::Finite(upper) if upper <= 0.1));
    assert!(outcome.bounds.lower >= 0.01);
    assert_eq!(observer.steps, 900);
}

#[test]
fn overall_best_distance_never_increases_across_rounds() {
    let cw = two_class(
        CarliniWagnerConfig::default()
            .learning_rate(0.01)
            .binary_search_steps(4)
            .max_iterations(200),
    );
    let inputs = Tensor::from_vec(vec![-0.3, 0.0, 0.0, 0.4, 0.1, 0.1], vec![2, 3])
        .expect("inputs");
    let mut observer = RecordingObserver::default();

    cw.attack_with_observer(&inputs, &[0, 1], &monotone_model(), &mut observer)
        .expect("attack runs");

    let means: Vec<f64> = observer
        .summaries
        .iter()
        .filter(|summary| summary.successes == 2)
        .filter_map(|summary| summary.mean_best_distance)
        .collect();
    assert!(means.windows(2).all(|pair| pair[1] <= pair[0]), "{means:?}");
    let successes: Vec<usize> = observer.summaries.iter().map(|s| s.successes).collect();
    assert!(successes.windows(2).all(|pair| pair[1] >= pair[0]), "{successes:?}");
}

#[test]
fn single_round_with_huge_constant_never_repeats() {
    let cw = two_class(
        CarliniWagnerConfig::default()
            .binary_search_steps(1)
            .initial_const(1e10)
            .learning_rate(0.05)
            .max_iterations(100),
    );
    let inputs = Tensor::from_vec(vec![-0.1, 0.0, 0.0], vec![1, 3]).expect("inputs");
    let mut observer = RecordingObserver::default();

    let report = cw
        .attack_with_observer(&inputs, &[0], &monotone_model(), &mut observer)
        .expect("attack runs");

    assert_eq!(observer.round_consts, vec![vec![1e10]]);
    assert_eq!(observer.summaries.len(), 1);
    let bounds = report.examples[0].bounds;
    if report.examples[0].best_distance.is_some() {
        assert_eq!(bounds.upper, UpperBound::Unbounded);
        assert_eq!(bounds.scale_const, 1e10);
    } else {
        assert_eq!(bounds.lower, 1e10);
    }
}

#[test]
fn long_search_repeats_last_round_at_the_upper_bound() {
    let cw = two_class(
        CarliniWagnerConfig::default()
            .binary_search_steps(10)
            .max_iterations(2),
    );
    let inputs = Tensor::zeros(vec![1, 3]);
    let mut observer = RecordingObserver::default();

    cw.attack_with_observer(&inputs, &[0], &constant_model(), &mut observer)
        .expect("attack runs");

    assert_eq!(observer.round_consts.len(), 10);
    assert!((observer.round_consts[8][0] - 1e6).abs() < 1e-3);
    assert_eq!(observer.round_consts[9], vec![UNBOUNDED_SENTINEL]);
}

#[test]
fn label_outside_num_labels_fails_before_running() {
    let cw = two_class(CarliniWagnerConfig::default());
    let mut observer = RecordingObserver::default();

    let err = cw
        .attack_with_observer(
            &Tensor::zeros(vec![2, 3]),
            &[1, 2],
            &monotone_model(),
            &mut observer,
        )
        .expect_err("label 2 with two classes");

    assert_eq!(
        err,
        AttackError::LabelOutOfRange {
            example: 1,
            label: 2,
            num_labels: 2
        }
    );
    assert!(observer.round_consts.is_empty());
}

#[test]
fn image_shaped_inputs_go_through_flatten() {
    let model = Sequential::new().with(Flatten).with(monotone_model());
    let cw = two_class(
        CarliniWagnerConfig::default()
            .learning_rate(0.01)
            .binary_search_steps(2)
            .initial_const(1.0)
            .max_iterations(150),
    );
    let inputs = Tensor::from_vec(vec![-0.2, 0.5, 0.5], vec![1, 1, 3]).expect("inputs");

    let adversarial = cw.attack(&inputs, &[0], &model).expect("attack runs");
    assert_eq!(adversarial.shape(), &[1, 1, 3]);
    assert!(adversarial.values()[0] > 0.0);
}

#[test]
fn ledger_observer_keeps_one_entry_per_round_event() {
    let cw = two_class(
        CarliniWagnerConfig::default()
            .binary_search_steps(2)
            .max_iterations(4)
            .abort_early(false),
    );
    let mut observer = LedgerObserver::new();

    cw.attack_with_observer(&Tensor::zeros(vec![1, 3]), &[0], &constant_model(), &mut observer)
        .expect("attack runs");

    let ledger = observer.into_ledger();
    assert_eq!(ledger.entries_of(EvidenceKind::Attack).count(), 4);
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let err = CarliniWagner::new(CarliniWagnerConfig::default().learning_rate(-1.0))
        .expect_err("negative learning rate");
    assert!(matches!(err, AttackError::InvalidConfig { .. }));
}
