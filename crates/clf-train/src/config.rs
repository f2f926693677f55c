//! TOML run configuration for the CLF trainer.
//!
//! Deserializes `configs/<model>.toml`, which has `[model]`, `[network]`,
//! `[clf]`, `[schedule]`, `[data]`, `[region]` and `[training]` sections, then
//! merges it with CLI overrides.

use std::path::{Path, PathBuf};

use clf::training::data::{ClfDatasetConfig, SafetyRegion};
use clf::training::loss::ControllerLossMode;
use clf::training::schedule::TrainingSchedule;
use clf::training::trainer::ClfTrainingConfig;
use clf_qp::QpSettings;
use dynamics::{PvtolParams, QuadParams};
use serde::Deserialize;

/// Top-level structure of a run file.
#[derive(Debug, Deserialize)]
pub struct RunToml {
    pub model: ModelSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub clf: ClfSection,
    #[serde(default)]
    pub schedule: TrainingSchedule,
    pub data: ClfDatasetConfig,
    pub region: SafetyRegion,
    #[serde(default)]
    pub training: TrainingSection,
}

fn default_pvtol_scenarios() -> Vec<PvtolParams> {
    vec![PvtolParams::default()]
}

fn default_quad_scenarios() -> Vec<QuadParams> {
    vec![QuadParams::default()]
}

/// Dynamics model, its robustness scenarios and the scenario used for the
/// nominal controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ModelSection {
    Pvtol {
        #[serde(default = "default_pvtol_scenarios")]
        scenarios: Vec<PvtolParams>,
        #[serde(default)]
        nominal: PvtolParams,
    },
    Quad9d {
        #[serde(default = "default_quad_scenarios")]
        scenarios: Vec<QuadParams>,
        #[serde(default)]
        nominal: QuadParams,
    },
}

impl ModelSection {
    pub fn name(&self) -> &'static str {
        match self {
            ModelSection::Pvtol { .. } => "pvtol",
            ModelSection::Quad9d { .. } => "quad9d",
        }
    }
}

/// Network sizes.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub n_hidden: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self { n_hidden: 48 }
    }
}

/// CLF condition and QP options.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClfSection {
    /// Exponential convergence rate `λ`.
    pub lambda: f64,
    /// Initial relaxation penalty. Overrides `schedule.relaxation_penalty`.
    pub relaxation_penalty: Option<f64>,
    pub safe_level: f64,
    pub timestep: f64,
    pub use_qp: bool,
    /// Add the model's control bounds to the QP.
    pub control_bounds: bool,
    pub qp: QpSettings,
}

impl Default for ClfSection {
    fn default() -> Self {
        Self {
            lambda: 0.1,
            relaxation_penalty: None,
            safe_level: 10.0,
            timestep: 0.001,
            use_qp: true,
            control_bounds: true,
            qp: QpSettings::default(),
        }
    }
}

/// Optimizer and loop settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    pub epochs: usize,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub weight_decay: f64,
    pub controller_loss: ControllerLossMode,
    pub checkpoint_dir: PathBuf,
    pub seed: u64,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            epochs: 1000,
            batch_size: 64,
            eval_batch_size: 4096,
            weight_decay: 1e-6,
            controller_loss: ControllerLossMode::Nominal,
            checkpoint_dir: PathBuf::from("checkpoints/clf"),
            seed: 0,
        }
    }
}

impl RunToml {
    /// Schedule with the `[clf]` penalty override applied.
    pub fn schedule(&self) -> TrainingSchedule {
        let mut schedule = self.schedule.clone();
        if let Some(penalty) = self.clf.relaxation_penalty {
            schedule.relaxation_penalty = penalty;
        }
        schedule
    }

    /// Trainer configuration from the TOML sections.
    pub fn training_config(&self) -> ClfTrainingConfig {
        ClfTrainingConfig::new()
            .with_epochs(self.training.epochs)
            .with_batch_size(self.training.batch_size)
            .with_eval_batch_size(self.training.eval_batch_size)
            .with_weight_decay(self.training.weight_decay)
            .with_safe_level(self.clf.safe_level)
            .with_timestep(self.clf.timestep)
            .with_controller_loss(self.training.controller_loss)
            .with_use_qp(self.clf.use_qp)
            .with_checkpoint_dir(self.training.checkpoint_dir.to_string_lossy().into_owned())
            .with_seed(self.training.seed)
            .with_schedule(self.schedule())
    }
}

/// Load and deserialize a `RunToml` from a TOML file.
pub fn load_run_toml(path: &Path) -> anyhow::Result<RunToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    let config: RunToml = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))?;
    config.schedule().validate()?;
    tracing::info!(path = %path.display(), model = config.model.name(), "Loaded run config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[model]
name = "pvtol"

[data]
domain = { bounds = [[-1.0, 1.0], [-1.0, 1.0], [-1.0, 1.0], [-1.0, 1.0], [-1.0, 1.0], [-1.0, 1.0]] }
n_train = 100
n_test = 10

[region]
altitude_index = 1
altitude_points_down = false
safe_altitude = 0.0
unsafe_altitude = -0.3
safe_radius = 3.0
unsafe_radius = 3.5
"#;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: RunToml = toml::from_str(MINIMAL).unwrap();
        match &config.model {
            ModelSection::Pvtol { scenarios, nominal } => {
                assert_eq!(scenarios, &vec![PvtolParams::default()]);
                assert_eq!(nominal, &PvtolParams::default());
            }
            other => panic!("unexpected model {other:?}"),
        }
        assert_eq!(config.network.n_hidden, 48);
        assert!((config.clf.lambda - 0.1).abs() < 1e-12);
        assert!(config.clf.control_bounds);
        assert_eq!(config.data.near_origin_factor, 10);
        assert!(config.data.near_origin.is_none());
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.training.controller_loss, ControllerLossMode::Nominal);
        assert_eq!(config.schedule, TrainingSchedule::default());
    }

    #[test]
    fn test_full_quad9d_toml() {
        let toml_str = r#"
[model]
name = "quad9d"
scenarios = [{ mass = 1.0 }, { mass = 1.5 }]
nominal = { mass = 1.0 }

[network]
n_hidden = 32

[clf]
lambda = 0.5
relaxation_penalty = 20.0
safe_level = 5.0
use_qp = false
qp = { max_iterations = 100 }

[schedule]
relaxation_penalty_period = 3
max_relaxation_penalty = 1e4

[data]
domain = { bounds = [[-4.0, 4.0], [-4.0, 4.0], [-4.0, 4.0], [-8.0, 8.0], [-8.0, 8.0], [-8.0, 8.0], [-1.5, 1.5], [-1.5, 1.5], [-1.5, 1.5]] }
n_train = 1000
n_test = 100
near_origin_factor = 2
seed = 5

[region]
altitude_index = 2
safe_altitude = 0.0
unsafe_altitude = 0.3
safe_radius = 3.0
unsafe_radius = 3.5

[training]
epochs = 5
batch_size = 32
controller_loss = "equilibrium"
checkpoint_dir = "out/quad"
"#;
        let config: RunToml = toml::from_str(toml_str).unwrap();
        match &config.model {
            ModelSection::Quad9d { scenarios, .. } => assert_eq!(scenarios.len(), 2),
            other => panic!("unexpected model {other:?}"),
        }
        assert!(config.region.altitude_points_down);
        assert_eq!(config.clf.qp.max_iterations, 100);
        assert!((config.clf.qp.feasibility_tolerance - 1e-6).abs() < 1e-18);

        let schedule = config.schedule();
        assert_eq!(schedule.relaxation_penalty, 20.0);
        assert_eq!(schedule.relaxation_penalty_period, 3);

        let training = config.training_config();
        assert_eq!(training.epochs, 5);
        assert_eq!(training.batch_size, 32);
        assert_eq!(training.controller_loss, ControllerLossMode::Equilibrium);
        assert!(!training.use_qp);
        assert_eq!(training.safe_level, 5.0);
        assert_eq!(training.checkpoint_dir, "out/quad");
        assert_eq!(training.schedule.max_relaxation_penalty, Some(1e4));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let toml_str = MINIMAL.replace("\"pvtol\"", "\"segway\"");
        assert!(toml::from_str::<RunToml>(&toml_str).is_err());
    }

    #[test]
    fn test_bundled_configs_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs");
        for name in ["pvtol.toml", "quad9d.toml"] {
            let config = load_run_toml(&root.join(name)).unwrap();
            assert_eq!(format!("{}.toml", config.model.name()), name);
        }
    }
}
