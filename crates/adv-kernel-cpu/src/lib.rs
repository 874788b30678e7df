#![forbid(unsafe_code)]

use adv_core::{TensorMeta, TensorMetaError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("shape mismatch: lhs={lhs:?}, rhs={rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("insufficient storage on {side}: needed={needed}, available={available}")]
    InsufficientStorage {
        side: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{op} expects rank {expected}, got shape {shape:?}")]
    RankMismatch {
        op: &'static str,
        expected: &'static str,
        shape: Vec<usize>,
    },
    #[error("{op} requires a non-empty reduction axis, got shape {shape:?}")]
    EmptyReduction { op: &'static str, shape: Vec<usize> },
    #[error("matmul inner dimensions differ: lhs={lhs:?}, rhs={rhs:?}")]
    MatmulShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("cannot expand shape {from:?} to {to:?}")]
    InvalidExpand { from: Vec<usize>, to: Vec<usize> },
    #[error(transparent)]
    Meta(#[from] TensorMetaError),
}

fn ensure_storage_len(
    buffer: &[f64],
    meta: &TensorMeta,
    side: &'static str,
) -> Result<(), KernelError> {
    let needed = meta.numel();
    if buffer.len() < needed {
        return Err(KernelError::InsufficientStorage {
            side,
            needed,
            available: buffer.len(),
        });
    }
    Ok(())
}

fn ensure_meta_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), KernelError> {
    if lhs.shape() != rhs.shape() {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }
    Ok(())
}

fn ensure_rank(meta: &TensorMeta, op: &'static str, rank: usize) -> Result<(), KernelError> {
    if meta.rank() != rank {
        return Err(KernelError::RankMismatch {
            op,
            expected: match rank {
                1 => "1",
                2 => "2",
                _ => "n",
            },
            shape: meta.shape().to_vec(),
        });
    }
    Ok(())
}

fn elementwise_contiguous_f64<F>(
    lhs: &[f64],
    rhs: &[f64],
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
    op: F,
) -> Result<Vec<f64>, KernelError>
where
    F: Fn(f64, f64) -> f64,
{
    ensure_meta_compatible(lhs_meta, rhs_meta)?;
    ensure_storage_len(lhs, lhs_meta, "lhs")?;
    ensure_storage_len(rhs, rhs_meta, "rhs")?;

    let numel = lhs_meta.numel();
    Ok(lhs[..numel]
        .iter()
        .zip(rhs[..numel].iter())
        .map(|(left, right)| op(*left, *right))
        .collect())
}

pub fn add_tensor_contiguous_f64(
    lhs: &[f64],
    rhs: &[f64],
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<Vec<f64>, KernelError> {
    elementwise_contiguous_f64(lhs, rhs, lhs_meta, rhs_meta, |left, right| left + right)
}

pub fn sub_tensor_contiguous_f64(
    lhs: &[f64],
    rhs: &[f64],
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<Vec<f64>, KernelError> {
    elementwise_contiguous_f64(lhs, rhs, lhs_meta, rhs_meta, |left, right| left - right)
}

pub fn mul_tensor_contiguous_f64(
    lhs: &[f64],
    rhs: &[f64],
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<Vec<f64>, KernelError> {
    elementwise_contiguous_f64(lhs, rhs, lhs_meta, rhs_meta, |left, right| left * right)
}

pub fn unary_contiguous_f64<F>(
    input: &[f64],
    meta: &TensorMeta,
    op: F,
) -> Result<Vec<f64>, KernelError>
where
    F: Fn(f64) -> f64,
{
    ensure_storage_len(input, meta, "input")?;
    Ok(input[..meta.numel()].iter().map(|value| op(*value)).collect())
}

/// Sum over every non-batch axis, yielding one value per example.
pub fn sum_per_example_f64(input: &[f64], meta: &TensorMeta) -> Result<Vec<f64>, KernelError> {
    ensure_storage_len(input, meta, "input")?;
    let batch = meta.batch_size()?;
    let width = meta.example_numel()?;
    if width == 0 {
        return Ok(vec![0.0; batch]);
    }
    Ok(input[..batch * width]
        .chunks_exact(width)
        .map(|row| row.iter().sum())
        .collect())
}

/// Per-example squared Euclidean distance between two equally shaped
/// batches: `out[i] = sum((lhs[i] - rhs[i])^2)` over all non-batch axes.
pub fn squared_l2_distance_per_example_f64(
    lhs: &[f64],
    rhs: &[f64],
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<Vec<f64>, KernelError> {
    if lhs_meta.rank() < 2 {
        return Err(KernelError::RankMismatch {
            op: "squared_l2_distance",
            expected: ">=2",
            shape: lhs_meta.shape().to_vec(),
        });
    }
    let squared = elementwise_contiguous_f64(lhs, rhs, lhs_meta, rhs_meta, |left, right| {
        let diff = left - right;
        diff * diff
    })?;
    sum_per_example_f64(&squared, lhs_meta)
}

/// Row-wise maximum of a `[rows, cols]` matrix. Ties resolve to the lowest
/// column index.
pub fn max_per_row_f64(
    input: &[f64],
    meta: &TensorMeta,
) -> Result<(Vec<f64>, Vec<usize>), KernelError> {
    ensure_rank(meta, "max_per_row", 2)?;
    ensure_storage_len(input, meta, "input")?;
    let (rows, cols) = (meta.shape()[0], meta.shape()[1]);
    if cols == 0 {
        return Err(KernelError::EmptyReduction {
            op: "max_per_row",
            shape: meta.shape().to_vec(),
        });
    }

    let mut values = Vec::with_capacity(rows);
    let mut indices = Vec::with_capacity(rows);
    for row in input[..rows * cols].chunks_exact(cols) {
        let (best_idx, best) = argmax(row);
        values.push(best);
        indices.push(best_idx);
    }
    Ok((values, indices))
}

/// Index and value of the largest entry; the first one wins on ties.
#[must_use]
pub fn argmax(values: &[f64]) -> (usize, f64) {
    let mut best_idx = 0;
    let mut best = f64::NEG_INFINITY;
    for (idx, value) in values.iter().copied().enumerate() {
        if value > best || idx == 0 {
            best = value;
            best_idx = idx;
        }
    }
    (best_idx, best)
}

/// Numerically stable row-wise log-softmax of a `[rows, cols]` matrix.
pub fn log_softmax_rows_f64(input: &[f64], meta: &TensorMeta) -> Result<Vec<f64>, KernelError> {
    ensure_rank(meta, "log_softmax", 2)?;
    ensure_storage_len(input, meta, "input")?;
    let (rows, cols) = (meta.shape()[0], meta.shape()[1]);
    if cols == 0 {
        return Err(KernelError::EmptyReduction {
            op: "log_softmax",
            shape: meta.shape().to_vec(),
        });
    }

    let mut out = Vec::with_capacity(rows * cols);
    for row in input[..rows * cols].chunks_exact(cols) {
        let (_, max) = argmax(row);
        let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f64>().ln() + max;
        out.extend(row.iter().map(|v| v - log_sum));
    }
    Ok(out)
}

/// `[m, k] @ [k, n] -> [m, n]`.
pub fn matmul_f64(
    lhs: &[f64],
    rhs: &[f64],
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<Vec<f64>, KernelError> {
    ensure_rank(lhs_meta, "matmul", 2)?;
    ensure_rank(rhs_meta, "matmul", 2)?;
    ensure_storage_len(lhs, lhs_meta, "lhs")?;
    ensure_storage_len(rhs, rhs_meta, "rhs")?;

    let (m, k) = (lhs_meta.shape()[0], lhs_meta.shape()[1]);
    let (k_rhs, n) = (rhs_meta.shape()[0], rhs_meta.shape()[1]);
    if k != k_rhs {
        return Err(KernelError::MatmulShapeMismatch {
            lhs: lhs_meta.shape().to_vec(),
            rhs: rhs_meta.shape().to_vec(),
        });
    }

    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let left = lhs[i * k + p];
            if left == 0.0 {
                continue;
            }
            for j in 0..n {
                out[i * n + j] += left * rhs[p * n + j];
            }
        }
    }
    Ok(out)
}

/// `[rows, cols] -> [cols, rows]`.
pub fn transpose2d_f64(input: &[f64], meta: &TensorMeta) -> Result<Vec<f64>, KernelError> {
    ensure_rank(meta, "transpose", 2)?;
    ensure_storage_len(input, meta, "input")?;
    let (rows, cols) = (meta.shape()[0], meta.shape()[1]);
    let mut out = vec![0.0; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = input[r * cols + c];
        }
    }
    Ok(out)
}

fn ensure_expandable(from: &[usize], to: &[usize]) -> Result<(), KernelError> {
    let ok = from.len() == to.len()
        && from
            .iter()
            .zip(to.iter())
            .all(|(src, dst)| src == dst || *src == 1);
    if !ok {
        return Err(KernelError::InvalidExpand {
            from: from.to_vec(),
            to: to.to_vec(),
        });
    }
    Ok(())
}

fn expanded_source_index(out_linear: usize, from: &[usize], to: &[usize]) -> usize {
    let mut remaining = out_linear;
    let mut src = 0usize;
    let mut src_stride = 1usize;
    for dim in (0..to.len()).rev() {
        let coord = remaining % to[dim];
        remaining /= to[dim];
        if from[dim] != 1 {
            src += coord * src_stride;
        }
        src_stride *= from[dim];
    }
    src
}

/// Broadcast singleton axes of `meta` up to `target`.
pub fn expand_f64(
    input: &[f64],
    meta: &TensorMeta,
    target: &[usize],
) -> Result<Vec<f64>, KernelError> {
    ensure_storage_len(input, meta, "input")?;
    ensure_expandable(meta.shape(), target)?;
    let numel: usize = target.iter().product();
    Ok((0..numel)
        .map(|idx| input[expanded_source_index(idx, meta.shape(), target)])
        .collect())
}

/// Adjoint of [`expand_f64`]: sums a gradient of shape `target` back onto the
/// broadcast source shape.
pub fn reduce_expanded_f64(
    grad: &[f64],
    from: &[usize],
    target: &[usize],
) -> Result<Vec<f64>, KernelError> {
    ensure_expandable(from, target)?;
    let src_numel: usize = from.iter().product();
    let mut out = vec![0.0; src_numel];
    for (idx, value) in grad.iter().enumerate() {
        out[expanded_source_index(idx, from, target)] += value;
    }
    Ok(out)
}
