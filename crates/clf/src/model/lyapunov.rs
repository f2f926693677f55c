use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::tanh;

/// Configuration for the Lyapunov network.
///
/// ```text
/// (batch, n_input)
///   → Linear(n_input→n_hidden) → tanh = h₁
///   → Linear(n_hidden→n_hidden) → tanh = h₂
///   → V = ½‖h₂‖²: (batch,)
/// ```
#[derive(Config, Debug)]
pub struct LyapunovNetConfig {
    /// State dimension.
    pub n_input: usize,
    /// Width of both hidden layers.
    #[config(default = 48)]
    pub n_hidden: usize,
}

/// Two-layer tanh network whose squared output norm is a Lyapunov candidate.
#[derive(Module, Debug)]
pub struct LyapunovNet<B: Backend> {
    pub layer1: Linear<B>,
    pub layer2: Linear<B>,
}

impl LyapunovNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LyapunovNet<B> {
        LyapunovNet {
            layer1: LinearConfig::new(self.n_input, self.n_hidden).init(device),
            layer2: LinearConfig::new(self.n_hidden, self.n_hidden).init(device),
        }
    }
}

impl<B: Backend> LyapunovNet<B> {
    /// Value `V(x)` and gradient `∇V(x)`.
    ///
    /// Input `(batch, n)`, returns `(batch,)` and `(batch, n)`. The gradient
    /// is the closed-form chain rule through both layers,
    /// `∇V = h₂ᵀ · diag(1-h₂²)·W₂ · diag(1-h₁²)·W₁`, with `W` in
    /// `(out, in)` layout.
    pub fn evaluate(&self, x: Tensor<B, 2>) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let [batch, n] = x.dims();
        let h1 = tanh(self.layer1.forward(x));
        let h2 = tanh(self.layer2.forward(h1.clone()));
        let hidden = h2.dims()[1];

        // burn stores Linear weights as (in, out)
        let w1 = self
            .layer1
            .weight
            .val()
            .transpose()
            .unsqueeze::<3>()
            .repeat_dim(0, batch);
        let w2 = self
            .layer2
            .weight
            .val()
            .transpose()
            .unsqueeze::<3>()
            .repeat_dim(0, batch);

        let d1 = h1.powf_scalar(2.0).neg().add_scalar(1.0);
        let d2 = h2.clone().powf_scalar(2.0).neg().add_scalar(1.0);

        // (batch, hidden, n)
        let jac1 = d1.unsqueeze_dim::<3>(2).repeat_dim(2, n) * w1;
        // (batch, hidden, hidden) · (batch, hidden, n)
        let jac2 = (d2.unsqueeze_dim::<3>(2).repeat_dim(2, hidden) * w2).matmul(jac1);
        let grad = h2
            .clone()
            .unsqueeze_dim::<3>(1)
            .matmul(jac2)
            .reshape([batch, n]);

        let value = h2.powf_scalar(2.0).sum_dim(1).reshape([batch]) * 0.5;
        (value, grad)
    }

    /// Value `V(x)` only, shape `(batch,)`.
    pub fn value(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch, _] = x.dims();
        let h1 = tanh(self.layer1.forward(x));
        let h2 = tanh(self.layer2.forward(h1));
        h2.powf_scalar(2.0).sum_dim(1).reshape([batch]) * 0.5
    }

    pub fn n_input(&self) -> usize {
        self.layer1.weight.dims()[0]
    }

    pub fn n_hidden(&self) -> usize {
        self.layer1.weight.dims()[1]
    }
}
