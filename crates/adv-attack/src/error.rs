use adv_autograd::AutogradError;
use adv_core::TensorMetaError;
use adv_kernel_cpu::KernelError;
use thiserror::Error;

/// Errors raised before or during an attack run.
///
/// Not finding an adversarial example is never an error; it shows up as an
/// empty record in the report and the untouched input in the output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttackError {
    #[error("invalid attack configuration: {reason}")]
    InvalidConfig { reason: &'static str },
    #[error("invalid json: {diagnostic}")]
    InvalidJson { diagnostic: String },
    #[error("unknown configuration field '{field}'")]
    UnknownField { field: String },
    #[error("inputs need a batch axis and at least one feature axis, got shape {shape:?}")]
    InputRank { shape: Vec<usize> },
    #[error("attack requires a non-empty batch")]
    EmptyBatch,
    #[error("batch holds {inputs} inputs but {labels} labels")]
    BatchMismatch { inputs: usize, labels: usize },
    #[error("label {label} of example {example} is outside 0..{num_labels}")]
    LabelOutOfRange {
        example: usize,
        label: usize,
        num_labels: usize,
    },
    #[error("example {example} holds {value}, outside [{clip_min}, {clip_max}]")]
    InputOutOfRange {
        example: usize,
        value: f64,
        clip_min: f64,
        clip_max: f64,
    },
    #[error("model produced scores of shape {actual:?}, expected {expected:?}")]
    ScoreShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error(transparent)]
    Autograd(#[from] AutogradError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Meta(#[from] TensorMetaError),
}
