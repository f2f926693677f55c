//! Sampled state datasets and safe/unsafe region classification.
//!
//! Training and test states are drawn uniformly from a box over the state
//! space, optionally topped up with a denser sample from a smaller box around
//! the goal. All sampling goes through a seeded `StdRng` so a run can be
//! reproduced from its configuration alone.

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ClfError;
use crate::model::bridge::row_to_tensor;

/// Axis-aligned box given as one `(min, max)` pair per state dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBox {
    pub bounds: Vec<(f64, f64)>,
}

impl StateBox {
    pub fn new(bounds: Vec<(f64, f64)>) -> Result<Self, ClfError> {
        let state_box = Self { bounds };
        state_box.validate()?;
        Ok(state_box)
    }

    /// A box with the same `[-half_width, half_width]` range on every axis.
    pub fn symmetric(n_dims: usize, half_width: f64) -> Result<Self, ClfError> {
        Self::new(vec![(-half_width, half_width); n_dims])
    }

    pub fn validate(&self) -> Result<(), ClfError> {
        if self.bounds.is_empty() {
            return Err(ClfError::InvalidData("state box has no dimensions".into()));
        }
        for (i, &(lo, hi)) in self.bounds.iter().enumerate() {
            if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
                return Err(ClfError::InvalidData(format!(
                    "state box dimension {i} has invalid bounds ({lo}, {hi})"
                )));
            }
        }
        Ok(())
    }

    pub fn n_dims(&self) -> usize {
        self.bounds.len()
    }

    /// `count` uniform samples, flattened row-major to `count * n_dims` values.
    pub fn sample<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<f64> {
        let mut out = Vec::with_capacity(count * self.n_dims());
        for _ in 0..count {
            out.extend(self.bounds.iter().map(|&(lo, hi)| {
                if lo == hi {
                    lo
                } else {
                    rng.gen_range(lo..=hi)
                }
            }));
        }
        out
    }

    #[cfg(test)]
    fn contains(&self, x: &[f64]) -> bool {
        x.len() == self.n_dims()
            && x
                .iter()
                .zip(&self.bounds)
                .all(|(v, &(lo, hi))| lo <= *v && *v <= hi)
    }
}

fn default_near_origin_factor() -> usize {
    10
}

/// How to build a [`ClfDataset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClfDatasetConfig {
    /// Box covering the whole training domain.
    pub domain: StateBox,
    /// Optional smaller box around the goal, sampled more densely.
    #[serde(default)]
    pub near_origin: Option<StateBox>,
    /// Domain samples in the training set.
    pub n_train: usize,
    /// Domain samples in the test set.
    pub n_test: usize,
    /// Near-origin samples per domain sample.
    #[serde(default = "default_near_origin_factor")]
    pub near_origin_factor: usize,
    #[serde(default)]
    pub seed: u64,
}

/// Training and test states plus the goal state.
#[derive(Debug, Clone)]
pub struct ClfDataset {
    n_dims: usize,
    train: Vec<f64>,
    test: Vec<f64>,
    goal: Vec<f64>,
}

impl ClfDataset {
    /// Sample the training and test sets.
    ///
    /// Each set holds `n` domain samples followed by
    /// `near_origin_factor * n` near-origin samples when a near-origin box is
    /// configured.
    pub fn generate(config: &ClfDatasetConfig, goal: Vec<f64>) -> Result<Self, ClfError> {
        config.domain.validate()?;
        let n_dims = config.domain.n_dims();
        if goal.len() != n_dims {
            return Err(ClfError::Dimension {
                what: "goal state length",
                expected: n_dims,
                got: goal.len(),
            });
        }
        if let Some(near) = &config.near_origin {
            near.validate()?;
            if near.n_dims() != n_dims {
                return Err(ClfError::Dimension {
                    what: "near-origin box dimension",
                    expected: n_dims,
                    got: near.n_dims(),
                });
            }
        }
        if config.n_train == 0 || config.n_test == 0 {
            return Err(ClfError::InvalidData(
                "training and test sets must both be non-empty".into(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut draw = |count: usize| {
            let mut states = config.domain.sample(count, &mut rng);
            if let Some(near) = &config.near_origin {
                states.extend(near.sample(config.near_origin_factor * count, &mut rng));
            }
            states
        };
        let train = draw(config.n_train);
        let test = draw(config.n_test);

        let dataset = Self {
            n_dims,
            train,
            test,
            goal,
        };
        tracing::info!(
            n_dims,
            n_train = dataset.n_train(),
            n_test = dataset.n_test(),
            seed = config.seed,
            "Sampled CLF dataset"
        );
        Ok(dataset)
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    pub fn n_train(&self) -> usize {
        self.train.len() / self.n_dims
    }

    pub fn n_test(&self) -> usize {
        self.test.len() / self.n_dims
    }

    pub fn goal(&self) -> &[f64] {
        &self.goal
    }

    /// Training state `index` as a slice.
    pub fn train_state(&self, index: usize) -> &[f64] {
        &self.train[index * self.n_dims..(index + 1) * self.n_dims]
    }

    /// Random presentation order for one epoch.
    pub fn shuffled_indices<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.n_train()).collect();
        indices.shuffle(rng);
        indices
    }

    /// Gather training rows into a `(indices.len(), n)` tensor.
    pub fn train_batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Tensor<B, 2> {
        let mut flat = Vec::with_capacity(indices.len() * self.n_dims);
        for &i in indices {
            flat.extend_from_slice(self.train_state(i));
        }
        Tensor::from_data(TensorData::new(flat, [indices.len(), self.n_dims]), device)
    }

    /// Test set in consecutive chunks of at most `chunk_size` rows.
    pub fn test_chunks<'a, B: Backend>(
        &'a self,
        chunk_size: usize,
        device: &'a B::Device,
    ) -> impl Iterator<Item = Tensor<B, 2>> + 'a {
        let n = self.n_dims;
        self.test.chunks(chunk_size.max(1) * n).map(move |chunk| {
            Tensor::from_data(TensorData::new(chunk.to_vec(), [chunk.len() / n, n]), device)
        })
    }

    /// Goal state as a `(1, n)` tensor.
    pub fn goal_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        row_to_tensor(&self.goal, device)
    }
}

fn default_altitude_points_down() -> bool {
    true
}

/// Safe and unsafe sets defined by altitude and distance from the origin.
///
/// With the altitude axis pointing down (the quadrotor convention), a state
/// is safe when `alt ≤ safe_altitude` and `‖x‖ ≤ safe_radius`, and unsafe
/// when `alt ≥ unsafe_altitude` or `‖x‖ ≥ unsafe_radius`. Pointing up, the
/// altitude comparisons flip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRegion {
    pub altitude_index: usize,
    #[serde(default = "default_altitude_points_down")]
    pub altitude_points_down: bool,
    pub safe_altitude: f64,
    pub unsafe_altitude: f64,
    pub safe_radius: f64,
    pub unsafe_radius: f64,
}

impl SafetyRegion {
    pub fn validate(&self, n_dims: usize) -> Result<(), ClfError> {
        if self.altitude_index >= n_dims {
            return Err(ClfError::InvalidData(format!(
                "altitude index {} out of range for {n_dims}-dimensional states",
                self.altitude_index
            )));
        }
        if !(self.safe_radius > 0.0 && self.safe_radius <= self.unsafe_radius) {
            return Err(ClfError::InvalidData(format!(
                "need 0 < safe_radius ({}) <= unsafe_radius ({})",
                self.safe_radius, self.unsafe_radius
            )));
        }
        Ok(())
    }

    /// Host-side `(safe, unsafe)` classification of a single state.
    #[cfg(test)]
    fn classify(&self, x: &[f64]) -> (bool, bool) {
        let altitude = x[self.altitude_index];
        let norm = x.iter().map(|v| v * v).sum::<f64>().sqrt();
        let (safe_alt, unsafe_alt) = if self.altitude_points_down {
            (altitude <= self.safe_altitude, altitude >= self.unsafe_altitude)
        } else {
            (altitude >= self.safe_altitude, altitude <= self.unsafe_altitude)
        };
        (
            safe_alt && norm <= self.safe_radius,
            unsafe_alt || norm >= self.unsafe_radius,
        )
    }

    /// `(safe_mask, unsafe_mask)` for a `(batch, n)` state tensor.
    pub fn masks<B: Backend>(&self, x: &Tensor<B, 2>) -> (Tensor<B, 1, Bool>, Tensor<B, 1, Bool>) {
        let [batch, _] = x.dims();
        let i = self.altitude_index;
        let altitude = x.clone().slice([0..batch, i..i + 1]).reshape([batch]);
        let norm = x
            .clone()
            .powf_scalar(2.0)
            .sum_dim(1)
            .reshape([batch])
            .sqrt();

        let (safe_alt, unsafe_alt) = if self.altitude_points_down {
            (
                altitude.clone().lower_equal_elem(self.safe_altitude),
                altitude.greater_equal_elem(self.unsafe_altitude),
            )
        } else {
            (
                altitude.clone().greater_equal_elem(self.safe_altitude),
                altitude.lower_equal_elem(self.unsafe_altitude),
            )
        };
        let safe_norm = norm.clone().lower_equal_elem(self.safe_radius);
        let unsafe_norm = norm.greater_equal_elem(self.unsafe_radius);

        // Boolean and/or through {0, 1} floats
        let safe = (safe_alt.float() * safe_norm.float()).greater_elem(0.5);
        let unsafe_ = (unsafe_alt.float() + unsafe_norm.float()).greater_elem(0.5);
        (safe, unsafe_)
    }
}
