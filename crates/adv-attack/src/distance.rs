use adv_core::Tensor;
use adv_kernel_cpu::squared_l2_distance_per_example_f64;

use crate::error::AttackError;

/// Squared Euclidean distance between two equally shaped batches, one value
/// per example, summed over every non-batch axis.
pub fn l2_distance(lhs: &Tensor, rhs: &Tensor) -> Result<Vec<f64>, AttackError> {
    Ok(squared_l2_distance_per_example_f64(
        lhs.values(),
        rhs.values(),
        lhs.meta(),
        rhs.meta(),
    )?)
}
