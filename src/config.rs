//! Experiment configuration.
//!
//! A configuration file is a JSON object; every field is optional:
//!
//! ```json
//! {
//!     "model": "fm",
//!     "hyperparameters": {"latent_dim": 8, "test_fraction": 0.1},
//!     "fit": {"num_iterations": 50000, "learning_rate": 0.05}
//! }
//! ```
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use crate::models::{FitParameters, Hyperparameters};

/// Which model to train.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Matrix factorization.
    #[serde(rename = "mf")]
    Factorization,
    /// Factorization machine over users and offer categories.
    #[serde(rename = "fm")]
    FactorizationMachine,
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::FactorizationMachine
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "mf" | "factorization" => Ok(ModelKind::Factorization),
            "fm" | "factorization_machine" => Ok(ModelKind::FactorizationMachine),
            other => Err(format!("Unknown model kind: {}", other)),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelKind::Factorization => write!(f, "mf"),
            ModelKind::FactorizationMachine => write!(f, "fm"),
        }
    }
}

/// Model choice together with its construction and training parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Model to train.
    pub model: ModelKind,
    /// Construction parameters.
    pub hyperparameters: Hyperparameters,
    /// Training parameters.
    pub fit: FitParameters,
}

impl ExperimentConfig {
    /// Read a configuration from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, failure::Error> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, failure::Error> {
        Ok(serde_json::from_str(json)?)
    }
}
