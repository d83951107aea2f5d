use crate::error::{ReconError, Result};
use crate::float::Precision;
use crate::prox::Prior;
use crate::solver::admm::{DEFAULT_MU1, DEFAULT_MU2, DEFAULT_MU3, DEFAULT_TAU};
use crate::solver::gradient_descent::DEFAULT_MOMENTUM;
use crate::solver::{DivergencePolicy, DEFAULT_N_ITER};
use preferences::{AppInfo, Preferences};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

pub const APP_INFO: AppInfo = AppInfo {
    name: "Lensless Reconstruction",
    author: "Linus Leo Stöckli",
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    GradientDescent,
    NesterovGradientDescent,
    #[default]
    Fista,
    Admm,
    UnrolledFista,
    UnrolledAdmm,
}

impl Algorithm {
    pub const ALL: [Algorithm; 6] = [
        Algorithm::GradientDescent,
        Algorithm::NesterovGradientDescent,
        Algorithm::Fista,
        Algorithm::Admm,
        Algorithm::UnrolledFista,
        Algorithm::UnrolledAdmm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::GradientDescent => "gradient_descent",
            Algorithm::NesterovGradientDescent => "nesterov_gradient_descent",
            Algorithm::Fista => "fista",
            Algorithm::Admm => "admm",
            Algorithm::UnrolledFista => "unrolled_fista",
            Algorithm::UnrolledAdmm => "unrolled_admm",
        }
    }

    pub fn is_unrolled(&self) -> bool {
        matches!(self, Algorithm::UnrolledFista | Algorithm::UnrolledAdmm)
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Algorithm {
    type Err = ReconError;

    /// Accepts the snake_case names, case-insensitive.
    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Algorithm::ALL
            .into_iter()
            .find(|a| a.name() == wanted)
            .ok_or_else(|| ReconError::UnsupportedAlgorithm(s.to_string()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct GradientDescentConfig {
    /// step size, `1.8 / L` when unset
    pub alpha: Option<f64>,
    pub line_search: bool,
    pub prior: Prior,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NesterovConfig {
    pub alpha: Option<f64>,
    pub momentum: f64,
    pub prior: Prior,
}

impl Default for NesterovConfig {
    fn default() -> Self {
        NesterovConfig {
            alpha: None,
            momentum: DEFAULT_MOMENTUM,
            prior: Prior::default(),
        }
    }
}

/// Shared by classic and unrolled FISTA.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FistaConfig {
    /// step size, `1 / L` when unset
    pub alpha: Option<f64>,
    pub tk: f64,
    /// unrolled only
    pub learn_tk: bool,
    pub prior: Prior,
}

impl Default for FistaConfig {
    fn default() -> Self {
        FistaConfig {
            alpha: None,
            tk: 1.0,
            learn_tk: true,
            prior: Prior::default(),
        }
    }
}

/// Shared by classic and unrolled ADMM.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct AdmmConfig {
    pub mu1: f64,
    pub mu2: f64,
    pub mu3: f64,
    pub tau: f64,
}

impl Default for AdmmConfig {
    fn default() -> Self {
        AdmmConfig {
            mu1: DEFAULT_MU1,
            mu2: DEFAULT_MU2,
            mu3: DEFAULT_MU3,
            tau: DEFAULT_TAU,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct UnrolledConfig {
    /// learned parameters to load at construction
    pub checkpoint: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReconConfig {
    pub algorithm: Algorithm,
    pub precision: Precision,
    pub n_iter: usize,
    pub normalize_psf: bool,
    pub divergence: DivergencePolicy,
    pub gradient_descent: GradientDescentConfig,
    pub nesterov: NesterovConfig,
    pub fista: FistaConfig,
    pub admm: AdmmConfig,
    pub unrolled: UnrolledConfig,
}

impl Default for ReconConfig {
    fn default() -> Self {
        ReconConfig {
            algorithm: Algorithm::default(),
            precision: Precision::default(),
            n_iter: DEFAULT_N_ITER,
            normalize_psf: true,
            divergence: DivergencePolicy::default(),
            gradient_descent: GradientDescentConfig::default(),
            nesterov: NesterovConfig::default(),
            fista: FistaConfig::default(),
            admm: AdmmConfig::default(),
            unrolled: UnrolledConfig::default(),
        }
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ReconError::InvalidConfig(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

fn valid_prior(prior: &Prior) -> Result<()> {
    if prior.is_valid() {
        Ok(())
    } else {
        Err(ReconError::InvalidConfig(format!("invalid prior {prior:?}")))
    }
}

impl ReconConfig {
    pub fn for_algorithm(algorithm: Algorithm) -> Self {
        ReconConfig {
            algorithm,
            ..Default::default()
        }
    }

    /// Checks the section of the selected algorithm and the shared fields.
    pub fn validate(&self) -> Result<()> {
        if self.n_iter == 0 {
            return Err(ReconError::InvalidConfig(
                "n_iter must be at least 1".to_string(),
            ));
        }
        match self.algorithm {
            Algorithm::GradientDescent => {
                let section = &self.gradient_descent;
                if let Some(alpha) = section.alpha {
                    positive("alpha", alpha)?;
                }
                valid_prior(&section.prior)?;
            }
            Algorithm::NesterovGradientDescent => {
                let section = &self.nesterov;
                if let Some(alpha) = section.alpha {
                    positive("alpha", alpha)?;
                }
                if !(0.0..1.0).contains(&section.momentum) {
                    return Err(ReconError::InvalidConfig(format!(
                        "momentum must be in [0, 1), got {}",
                        section.momentum
                    )));
                }
                valid_prior(&section.prior)?;
            }
            Algorithm::Fista | Algorithm::UnrolledFista => {
                let section = &self.fista;
                if let Some(alpha) = section.alpha {
                    positive("alpha", alpha)?;
                }
                if !(section.tk.is_finite() && section.tk >= 1.0) {
                    return Err(ReconError::InvalidConfig(format!(
                        "tk must be at least 1, got {}",
                        section.tk
                    )));
                }
                valid_prior(&section.prior)?;
                if self.algorithm.is_unrolled() && section.prior != Prior::NonNegative {
                    return Err(ReconError::InvalidConfig(format!(
                        "{} only supports the non-negativity prior",
                        self.algorithm
                    )));
                }
            }
            Algorithm::Admm | Algorithm::UnrolledAdmm => {
                let section = &self.admm;
                positive("mu1", section.mu1)?;
                positive("mu2", section.mu2)?;
                positive("mu3", section.mu3)?;
                if !(section.tau.is_finite() && section.tau >= 0.0) {
                    return Err(ReconError::InvalidConfig(format!(
                        "tau must be non-negative, got {}",
                        section.tau
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stores this configuration as the named preset in the user's preferences.
    pub fn save_preset(&self, name: &str) -> Result<()> {
        let key = format!("presets/{name}");
        self.save(&APP_INFO, &key)?;
        log::info!("saved preset {name}");
        Ok(())
    }

    pub fn load_preset(name: &str) -> Result<Self> {
        let key = format!("presets/{name}");
        let config = ReconConfig::load(&APP_INFO, &key)?;
        log::info!("loaded preset {name} ({})", config.algorithm);
        Ok(config)
    }

    /// Reads a JSON configuration, e.g. an exported preset.
    pub fn from_reader<R: std::io::Read>(reader: &mut R) -> Result<Self> {
        let config = ReconConfig::load_from(reader)?;
        config.validate()?;
        Ok(config)
    }
}
