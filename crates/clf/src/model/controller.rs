use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::tanh;

/// Configuration for the learned gain controller.
///
/// One independent `Linear → tanh → Linear` network per control channel,
/// each producing one row of a state-dependent gain `K(x) ∈ ℝ^{m×n}`.
#[derive(Config, Debug)]
pub struct GainControllerConfig {
    /// State dimension.
    pub n_input: usize,
    /// Hidden width of every row network.
    #[config(default = 48)]
    pub n_hidden: usize,
    /// Number of controls (gain rows).
    pub n_controls: usize,
}

/// Network emitting one gain row `K_j(x)`, shape `(batch, n)`.
#[derive(Module, Debug)]
pub struct GainRow<B: Backend> {
    pub hidden: Linear<B>,
    pub output: Linear<B>,
}

impl<B: Backend> GainRow<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.output.forward(tanh(self.hidden.forward(x)))
    }
}

/// Feedback controller `u = -K(x)·(x - x_goal) + u_eq`.
#[derive(Module, Debug)]
pub struct GainController<B: Backend> {
    pub rows: Vec<GainRow<B>>,
}

impl GainControllerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GainController<B> {
        let rows = (0..self.n_controls)
            .map(|_| GainRow {
                hidden: LinearConfig::new(self.n_input, self.n_hidden).init(device),
                output: LinearConfig::new(self.n_hidden, self.n_input).init(device),
            })
            .collect();
        GainController { rows }
    }
}

impl<B: Backend> GainController<B> {
    /// Gain matrix `K(x)`, shape `(batch, m, n)`.
    pub fn gain(&self, x: Tensor<B, 2>) -> Tensor<B, 3> {
        let rows = self
            .rows
            .iter()
            .map(|row| row.forward(x.clone()).unsqueeze_dim::<3>(1))
            .collect();
        Tensor::cat(rows, 1)
    }

    /// Learned control for a `(batch, n)` state, shape `(batch, m)`.
    ///
    /// `x_goal` and `u_eq` are `(1, n)` and `(1, m)` rows.
    pub fn forward(&self, x: Tensor<B, 2>, x_goal: Tensor<B, 2>, u_eq: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, n] = x.dims();
        let m = self.rows.len();
        let error = (x.clone() - x_goal.repeat_dim(0, batch)).reshape([batch, n, 1]);
        let feedback = self.gain(x).matmul(error).reshape([batch, m]);
        u_eq.repeat_dim(0, batch) - feedback
    }

    pub fn n_controls(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::{Distribution, ElementConversion, TensorData};

    type TestBackend = NdArray<f64>;

    #[test]
    fn test_output_shapes() {
        let device = Default::default();
        let controller = GainControllerConfig::new(6, 3)
            .with_n_hidden(16)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::random([7, 6], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(controller.gain(x.clone()).dims(), [7, 3, 6]);

        let goal = Tensor::<TestBackend, 2>::zeros([1, 6], &device);
        let u_eq = Tensor::<TestBackend, 2>::zeros([1, 3], &device);
        assert_eq!(controller.forward(x, goal, u_eq).dims(), [7, 3]);
        assert_eq!(controller.n_controls(), 3);
    }

    #[test]
    fn test_goal_state_returns_equilibrium_control() {
        let device = Default::default();
        let controller = GainControllerConfig::new(4, 2)
            .with_n_hidden(8)
            .init::<TestBackend>(&device);
        let goal_row = vec![0.5, -1.0, 0.25, 2.0];
        let x = Tensor::<TestBackend, 2>::from_data(
            TensorData::new([goal_row.clone(), goal_row.clone()].concat(), [2, 4]),
            &device,
        );
        let goal = Tensor::<TestBackend, 2>::from_data(TensorData::new(goal_row, [1, 4]), &device);
        let u_eq = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![4.9, 4.9], [1, 2]), &device);

        let u: Vec<f64> = controller.forward(x, goal, u_eq).into_data().to_vec().unwrap();
        for value in u {
            assert!((value - 4.9).abs() < 1e-12);
        }
    }

    #[test]
    fn test_control_is_linear_in_offset_for_fixed_gain() {
        // With zero hidden weights the gain is the constant output bias
        let device = Default::default();
        let mut controller = GainControllerConfig::new(2, 1)
            .with_n_hidden(4)
            .init::<TestBackend>(&device);
        let row = &mut controller.rows[0];
        row.output.weight = row.output.weight.clone().map(|w| w.zeros_like());
        row.output.bias = row.output.bias.clone().map(|b| {
            b.map(|_| Tensor::from_data(TensorData::new(vec![1.0, 2.0], [2]), &device))
        });

        let x = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![1.0, 1.0], [1, 2]), &device);
        let goal = Tensor::<TestBackend, 2>::zeros([1, 2], &device);
        let u_eq = Tensor::<TestBackend, 2>::zeros([1, 1], &device);
        let u: f64 = controller.forward(x, goal, u_eq).into_scalar().elem();
        assert!((u + 3.0).abs() < 1e-12, "u = {u}");
    }
}
