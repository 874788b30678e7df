#![forbid(unsafe_code)]

use adv_api::AdvSession;
use adv_autograd::{AutogradError, TensorNodeId};
use adv_core::Tensor;
use adv_kernel_cpu::KernelError;

/// Trait for differentiable modules.
///
/// A module owns its weights as plain tensors and inserts them into the
/// session on every forward pass, so the same module can be evaluated on
/// any number of short-lived sessions.
pub trait Module {
    /// Execute the forward pass, returning the output node.
    fn forward(
        &self,
        session: &mut AdvSession,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError>;
}

impl<M: Module + ?Sized> Module for &M {
    fn forward(
        &self,
        session: &mut AdvSession,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        (**self).forward(session, input)
    }
}

impl<M: Module + ?Sized> Module for Box<M> {
    fn forward(
        &self,
        session: &mut AdvSession,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        (**self).forward(session, input)
    }
}

/// Fully connected linear layer: output = input @ weight^T + bias.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Build a layer from explicit weights.
    ///
    /// `weight` has shape `[out_features, in_features]`. `bias`, when given,
    /// holds `out_features` values and is stored as `[1, out_features]` for
    /// broadcast add.
    pub fn new(weight: Tensor, bias: Option<Vec<f64>>) -> Result<Self, AutogradError> {
        if weight.shape().len() != 2 {
            return Err(KernelError::RankMismatch {
                op: "linear",
                expected: "2",
                shape: weight.shape().to_vec(),
            }
            .into());
        }
        let out_features = weight.shape()[0];
        let bias = match bias {
            Some(values) => Some(Tensor::from_vec(values, vec![1, out_features])?),
            None => None,
        };
        Ok(Self { weight, bias })
    }

    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Input feature dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Output feature dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Module for Linear {
    fn forward(
        &self,
        session: &mut AdvSession,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        let weight = session.tensor_leaf(self.weight.clone(), false);
        // Transpose weight: [out, in] -> [in, out]
        let weight_t = session.tensor_transpose(weight)?;
        // [batch, in] @ [in, out] => [batch, out]
        let output = session.tensor_matmul(input, weight_t)?;

        match &self.bias {
            Some(bias) => {
                let out_shape = session.tensor_shape(output)?;
                let bias = session.tensor_leaf(bias.clone(), false);
                let expanded_bias = session.tensor_expand(bias, out_shape)?;
                session.tensor_add(output, expanded_bias)
            }
            None => Ok(output),
        }
    }
}

/// Collapse every non-batch axis: `[B, d1, d2, ...] -> [B, d1 * d2 * ...]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl Module for Flatten {
    fn forward(
        &self,
        session: &mut AdvSession,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        let tensor = session.tensor(input)?;
        let batch = tensor.batch_size()?;
        let features = tensor.example_numel()?;
        session.tensor_reshape(input, vec![batch, features])
    }
}

/// ReLU activation module.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl Module for ReLU {
    fn forward(
        &self,
        session: &mut AdvSession,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        session.tensor_relu(input)
    }
}

/// Tanh activation module.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

impl Module for Tanh {
    fn forward(
        &self,
        session: &mut AdvSession,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        session.tensor_tanh(input)
    }
}

/// Sequential container that chains modules in order.
#[derive(Default)]
pub struct Sequential {
    modules: Vec<Box<dyn Module>>,
}

impl Sequential {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module to the end of the chain.
    pub fn push(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    /// Builder form of [`Sequential::push`].
    #[must_use]
    pub fn with(mut self, module: impl Module + 'static) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Module for Sequential {
    fn forward(
        &self,
        session: &mut AdvSession,
        input: TensorNodeId,
    ) -> Result<TensorNodeId, AutogradError> {
        let mut output = input;
        for module in &self.modules {
            output = module.forward(session, output)?;
        }
        Ok(output)
    }
}
