#![forbid(unsafe_code)]
//! Adversarial example generation against differentiable classifiers.
//!
//! [`CarliniWagner`] runs the untargeted L2 attack; [`Fgsm`] is the
//! single-step gradient-sign baseline. Models plug in through
//! [`adv_nn::Module`].

mod carlini_wagner;
mod config;
mod distance;
mod error;
mod fgsm;
mod observer;
mod state;
mod transform;

pub use carlini_wagner::{AttackReport, CarliniWagner, ExampleOutcome, Prediction};
pub use config::CarliniWagnerConfig;
pub use distance::l2_distance;
pub use error::AttackError;
pub use fgsm::Fgsm;
pub use observer::{
    AttackObserver, LedgerObserver, NoopObserver, RoundSummary, StepEvent, TracingObserver,
};
pub use state::{
    ExampleState, FINITE_LIMIT, OverallBest, RoundBest, SearchBounds, UNBOUNDED_SENTINEL,
    UpperBound,
};
pub use transform::{TANH_SHRINK, from_tanh_space, to_tanh_space};
