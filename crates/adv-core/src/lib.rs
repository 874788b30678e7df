#![forbid(unsafe_code)]

use thiserror::Error;

/// Shape of a dense row-major tensor. The leading axis, when present, is the
/// batch axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    shape: Vec<usize>,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar() -> Self {
        Self { shape: Vec::new() }
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>) -> Self {
        Self { shape }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Row-major strides for this shape.
    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        contiguous_strides(&self.shape)
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Element count; a rank-0 tensor holds one value.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn batch_size(&self) -> Result<usize, TensorMetaError> {
        self.shape
            .first()
            .copied()
            .ok_or(TensorMetaError::MissingBatchDim)
    }

    /// Elements per example: the product of every non-batch axis.
    pub fn example_numel(&self) -> Result<usize, TensorMetaError> {
        match self.shape.split_first() {
            Some((_, rest)) => Ok(rest.iter().product()),
            None => Err(TensorMetaError::MissingBatchDim),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorMetaError {
    #[error("value count mismatch for shape {shape:?}: expected={expected}, actual={actual}")]
    ValueCountMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("tensor has no batch dimension")]
    MissingBatchDim,
    #[error("example index {index} out of range for batch of {batch}")]
    ExampleOutOfRange { index: usize, batch: usize },
}

/// Dense, contiguous `f64` tensor.
///
/// The version counter bumps on every in-place write so callers can tell a
/// mutated tensor from the value they captured earlier.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    meta: TensorMeta,
    values: Vec<f64>,
    version: u64,
}

impl Tensor {
    pub fn from_vec(values: Vec<f64>, shape: Vec<usize>) -> Result<Self, TensorMetaError> {
        let meta = TensorMeta::from_shape(shape);
        if values.len() != meta.numel() {
            return Err(TensorMetaError::ValueCountMismatch {
                shape: meta.shape().to_vec(),
                expected: meta.numel(),
                actual: values.len(),
            });
        }
        Ok(Self {
            meta,
            values,
            version: 0,
        })
    }

    #[must_use]
    pub fn full(shape: Vec<usize>, value: f64) -> Self {
        let meta = TensorMeta::from_shape(shape);
        let values = vec![value; meta.numel()];
        Self {
            meta,
            values,
            version: 0,
        }
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            meta: TensorMeta::scalar(),
            values: vec![value],
            version: 0,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn batch_size(&self) -> Result<usize, TensorMetaError> {
        self.meta.batch_size()
    }

    pub fn example_numel(&self) -> Result<usize, TensorMetaError> {
        self.meta.example_numel()
    }

    pub fn example(&self, index: usize) -> Result<&[f64], TensorMetaError> {
        let range = self.example_range(index)?;
        Ok(&self.values[range])
    }

    pub fn example_mut(&mut self, index: usize) -> Result<&mut [f64], TensorMetaError> {
        let range = self.example_range(index)?;
        self.version = self.version.saturating_add(1);
        Ok(&mut self.values[range])
    }

    pub fn set_in_place(&mut self, values: Vec<f64>) -> Result<(), TensorMetaError> {
        if values.len() != self.values.len() {
            return Err(TensorMetaError::ValueCountMismatch {
                shape: self.meta.shape().to_vec(),
                expected: self.values.len(),
                actual: values.len(),
            });
        }
        self.values = values;
        self.version = self.version.saturating_add(1);
        Ok(())
    }

    pub fn map_in_place<F>(&mut self, op: F)
    where
        F: Fn(f64) -> f64,
    {
        for value in &mut self.values {
            *value = op(*value);
        }
        self.version = self.version.saturating_add(1);
    }

    fn example_range(&self, index: usize) -> Result<std::ops::Range<usize>, TensorMetaError> {
        let batch = self.batch_size()?;
        if index >= batch {
            return Err(TensorMetaError::ExampleOutOfRange { index, batch });
        }
        let width = self.example_numel()?;
        let start = index * width;
        Ok(start..start + width)
    }
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}
