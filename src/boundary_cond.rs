use serde::{Deserialize, Serialize};

use crate::error::{RichardsError, Result};
use crate::soil_hydra::HydraulicParams;

// How the surface-moisture window controlling evaporation is specified
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaporationThresholds {
    // Absolute moisture values [v/v]
    Fixed { low: f64, high: f64 },
    // Fractions of the (theta_s - theta_r) range above theta_r
    Fraction { low: f64, high: f64 },
    // Pressure heads [m], e.g. wilting point and field capacity
    PressureHead { low: f64, high: f64 },
}

impl Default for EvaporationThresholds {
    fn default() -> Self {
        EvaporationThresholds::Fraction {
            low: 0.25,
            high: 0.75,
        }
    }
}

// Net flux entering the top of the column during one sub-step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopFlux {
    pub net: f64, // Rainfall minus actual evaporation [m/s]
    pub aet: f64, // Actual evaporation [m/s]
    pub smi: f64, // Soil moisture stress index [-]
}

// Atmosphere-limited top boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopBoundary {
    pub(crate) evap_low: f64,  // Surface moisture at which evaporation stops [v/v]
    pub(crate) evap_high: f64, // Surface moisture above which evaporation is potential [v/v]
}

impl TopBoundary {
    pub fn new(thresholds: &EvaporationThresholds, params: &HydraulicParams) -> Result<Self> {
        let range = params.theta_s - params.theta_r;
        let (evap_low, evap_high) = match *thresholds {
            EvaporationThresholds::Fixed { low, high } => (low, high),
            EvaporationThresholds::Fraction { low, high } => {
                (params.theta_r + low * range, params.theta_r + high * range)
            }
            EvaporationThresholds::PressureHead { low, high } => {
                (params.theta(low), params.theta(high))
            }
        };
        // Evaporation never draws the surface below the residual floor
        let evap_low = evap_low.max(params.residual_floor());
        if !(evap_high > evap_low) {
            return Err(RichardsError::config(format!(
                "evaporation thresholds must satisfy low < high, got {evap_low} and {evap_high}"
            )));
        }
        Ok(TopBoundary {
            evap_low,
            evap_high,
        })
    }

    pub fn stress_index(&self, theta_top: f64) -> f64 {
        ((theta_top - self.evap_low) / (self.evap_high - self.evap_low)).clamp(0.0, 1.0)
    }

    // Top boundary flux (positive = into the soil)
    pub fn top_flux(&self, theta_top: f64, rain_rate: f64, pet_rate: f64) -> TopFlux {
        let smi = self.stress_index(theta_top);
        let aet = smi * pet_rate;
        TopFlux {
            net: rain_rate - aet,
            aet,
            smi,
        }
    }
}

// Free drainage: unit hydraulic gradient at the bottom, so the outflow is the
// conductivity of the lowest layer.
pub(crate) fn gravity_drainage_flux(k_bottom: f64) -> f64 {
    k_bottom
}
