use nalgebra::DVector;
use serde::Deserialize;

use crate::boundary_cond::EvaporationThresholds;
use crate::enkf::EnsembleConfig;
use crate::error::{RichardsError, Result};
use crate::richards::SECONDS_PER_DAY;
use crate::root_uptake::RootConfig;
use crate::soil_column::SoilColumn;
use crate::soil_hydra::{HydraulicParams, SoilLibrary};

// One value for every layer, or one value per layer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LayerValues {
    Uniform(f64),
    PerLayer(Vec<f64>),
}

impl LayerValues {
    fn resolve(&self, what: &'static str, layers: usize) -> Result<Vec<f64>> {
        match self {
            LayerValues::Uniform(v) => Ok(vec![*v; layers]),
            LayerValues::PerLayer(values) if values.len() == layers => Ok(values.clone()),
            LayerValues::PerLayer(values) => Err(RichardsError::LayerMismatch {
                what,
                expected: layers,
                actual: values.len(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColumnConfig {
    pub layers: usize,
    pub thickness: LayerValues,     // [m]
    pub initial_theta: LayerValues, // [v/v]
}

impl ColumnConfig {
    pub fn build(&self) -> Result<SoilColumn> {
        SoilColumn::from_thickness(self.thickness.resolve("layer thickness", self.layers)?)
    }

    pub fn initial_theta(&self, column: &SoilColumn) -> Result<DVector<f64>> {
        let theta = self.initial_theta.resolve("initial theta", column.no_layer())?;
        if let Some(bad) = theta.iter().find(|t| !(0.0..=1.0).contains(*t)) {
            return Err(RichardsError::config(format!(
                "initial theta must lie in [0, 1], got {bad}"
            )));
        }
        Ok(DVector::from_vec(theta))
    }
}

// Hydraulic parameters given directly or by texture name
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SoilConfig {
    Texture { texture: String },
    Params(HydraulicParams),
}

/// Complete description of a run, usually read from TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_day_length")]
    pub day_length: f64, // Length of one forcing interval [s]
    pub column: ColumnConfig,
    #[serde(default)]
    pub soil: Option<SoilConfig>,
    #[serde(default)]
    pub evaporation: EvaporationThresholds,
    #[serde(default)]
    pub roots: Option<RootConfig>,
    #[serde(default)]
    pub ensemble: Option<EnsembleConfig>,
}

fn default_day_length() -> f64 {
    SECONDS_PER_DAY
}

impl SimulationConfig {
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    // Catch configuration errors before any day is simulated
    pub fn validate(&self) -> Result<()> {
        if !(self.day_length > 0.0) {
            return Err(RichardsError::config("day_length must be positive"));
        }
        let column = self.column.build()?;
        self.column.initial_theta(&column)?;
        match &self.ensemble {
            Some(ensemble) => ensemble.validate(column.no_layer())?,
            None => {
                self.soil_params()?;
            }
        }
        Ok(())
    }

    pub fn soil_params(&self) -> Result<HydraulicParams> {
        let params = match &self.soil {
            Some(SoilConfig::Params(params)) => *params,
            Some(SoilConfig::Texture { texture }) => SoilLibrary::builtin()?.get(texture)?,
            None => {
                return Err(RichardsError::config(
                    "a [soil] section is required for deterministic runs",
                ));
            }
        };
        params.validate()?;
        Ok(params)
    }
}
