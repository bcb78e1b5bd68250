use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RichardsError, Result};

// Effective saturation is kept inside [SE_EPSILON, 1 - SE_EPSILON] by every
// closure relation below.
pub const SE_EPSILON: f64 = 1.0e-4;

// Pressure head representing the residual-moisture asymptote [m]
pub const PSI_FLOOR: f64 = -1.0e6;

// Moisture is never allowed below this multiple of theta_r
pub const RESIDUAL_FACTOR: f64 = 1.01;

/// A value after clamping, together with whether the clamp changed it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clamped {
    pub value: f64,
    pub clamped: bool,
}

impl Clamped {
    pub fn clamp(value: f64, lo: f64, hi: f64) -> Self {
        if value < lo {
            Clamped { value: lo, clamped: true }
        } else if value > hi {
            Clamped { value: hi, clamped: true }
        } else {
            Clamped { value, clamped: false }
        }
    }
}

pub fn effective_saturation(theta: f64, theta_r: f64, theta_s: f64) -> Clamped {
    let se = (theta - theta_r) / (theta_s - theta_r);
    Clamped::clamp(se, SE_EPSILON, 1.0 - SE_EPSILON)
}

// Mualem relative permeability scaled by Ks
pub fn relative_permeability(se: f64, ks: f64, l: f64, m: f64) -> f64 {
    ks * se.powf(l) * (1.0 - (1.0 - se.powf(1.0 / m)).powf(m)).powi(2)
}

// Specific moisture capacity d(theta)/d(psi) [1/m]
pub fn moisture_capacity(se: f64, theta_s: f64, theta_r: f64, alpha: f64, m: f64, n: f64) -> f64 {
    alpha
        * (theta_s - theta_r)
        * m
        * n
        * se.powf(1.0 / m + 1.0)
        * (se.powf(-1.0 / m) - 1.0).powf(m)
}

pub fn saturation_to_psi(se: f64, alpha: f64, m: f64, n: f64) -> f64 {
    let psi = -(1.0 / alpha) * (se.powf(-1.0 / m) - 1.0).powf(1.0 / n);
    psi.max(PSI_FLOOR)
}

// Soil hydraulic parameters (van Genuchten-Mualem model)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HydraulicParams {
    pub theta_r: f64, // Residual water content [m³/m³]
    pub theta_s: f64, // Saturated water content [m³/m³]
    pub alpha: f64,   // van Genuchten parameter [1/m]
    pub n: f64,       // van Genuchten shape parameter [-]
    pub ks: f64,      // Saturated hydraulic conductivity [m/s]
    #[serde(default = "default_pore_connectivity")]
    pub l: f64, // Pore-connectivity exponent [-]
}

fn default_pore_connectivity() -> f64 {
    0.5
}

fn invalid(name: &'static str, value: f64, reason: &'static str) -> Result<()> {
    Err(RichardsError::InvalidParameter {
        name,
        value,
        reason,
    })
}

impl HydraulicParams {
    pub const NAMES: [&'static str; 6] = ["theta_r", "theta_s", "alpha", "n", "ks", "l"];

    pub fn new(theta_r: f64, theta_s: f64, alpha: f64, n: f64, ks: f64, l: f64) -> Result<Self> {
        let params = HydraulicParams {
            theta_r,
            theta_s,
            alpha,
            n,
            ks,
            l,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.to_array().iter().all(|v| v.is_finite()) {
            return invalid("params", f64::NAN, "all parameters must be finite");
        }
        if self.theta_r < 0.0 {
            return invalid("theta_r", self.theta_r, "must be non-negative");
        }
        if self.theta_s <= self.theta_r || self.theta_s > 1.0 {
            return invalid("theta_s", self.theta_s, "must lie in (theta_r, 1]");
        }
        if self.alpha <= 0.0 {
            return invalid("alpha", self.alpha, "must be positive");
        }
        if self.n <= 1.0 {
            return invalid("n", self.n, "must be greater than 1");
        }
        if self.ks < 0.0 {
            return invalid("ks", self.ks, "must be non-negative");
        }
        Ok(())
    }

    pub fn m(&self) -> f64 {
        1.0 - 1.0 / self.n
    }

    // Order matches NAMES; this is the parameter block of the ensemble vector
    pub fn to_array(&self) -> [f64; 6] {
        [self.theta_r, self.theta_s, self.alpha, self.n, self.ks, self.l]
    }

    pub fn from_array(values: [f64; 6]) -> Self {
        HydraulicParams {
            theta_r: values[0],
            theta_s: values[1],
            alpha: values[2],
            n: values[3],
            ks: values[4],
            l: values[5],
        }
    }

    pub fn effective_saturation(&self, theta: f64) -> Clamped {
        effective_saturation(theta, self.theta_r, self.theta_s)
    }

    // Hydraulic conductivity as a function of water content [m/s]
    pub fn k(&self, theta: f64) -> f64 {
        let se = self.effective_saturation(theta).value;
        relative_permeability(se, self.ks, self.l, self.m())
    }

    // Specific moisture capacity, C = d(theta)/d(psi) [1/m]
    pub fn c(&self, theta: f64) -> f64 {
        let se = self.effective_saturation(theta).value;
        moisture_capacity(se, self.theta_s, self.theta_r, self.alpha, self.m(), self.n)
    }

    // Pressure head as a function of water content [m]
    pub fn psi(&self, theta: f64) -> f64 {
        let se = self.effective_saturation(theta).value;
        saturation_to_psi(se, self.alpha, self.m(), self.n)
    }

    // Water content as a function of pressure head [m]
    pub fn theta(&self, psi: f64) -> f64 {
        if psi >= 0.0 {
            self.theta_s
        } else if psi < PSI_FLOOR {
            self.residual_floor()
        } else {
            let denom = (1.0 + (self.alpha * psi).abs().powf(self.n)).powf(self.m());
            self.theta_r + (self.theta_s - self.theta_r) / denom
        }
    }

    pub fn residual_floor(&self) -> f64 {
        (RESIDUAL_FACTOR * self.theta_r).min(self.theta_s)
    }

    /// Clip moisture into the physical range: above theta_s is truncated to
    /// theta_s, below theta_r is lifted to 1.01 theta_r.
    pub fn clamp_theta(&self, theta: f64) -> Clamped {
        if theta > self.theta_s {
            Clamped {
                value: self.theta_s,
                clamped: true,
            }
        } else if theta < self.theta_r {
            Clamped {
                value: self.residual_floor(),
                clamped: true,
            }
        } else {
            Clamped {
                value: theta,
                clamped: false,
            }
        }
    }
}

/// Named texture classes loaded from TOML.
#[derive(Debug, Clone)]
pub struct SoilLibrary {
    soils: BTreeMap<String, HydraulicParams>,
}

impl SoilLibrary {
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let raw: BTreeMap<String, HydraulicParams> = toml::from_str(toml_str)?;
        let mut soils = BTreeMap::new();
        for (name, params) in raw {
            params.validate()?;
            soils.insert(name.to_lowercase(), params);
        }
        Ok(SoilLibrary { soils })
    }

    // The table shipped with the crate
    pub fn builtin() -> Result<Self> {
        Self::from_toml(include_str!("../soil_parameters.toml"))
    }

    // Look up a texture by name, falling back to loam when it is unknown
    pub fn get(&self, soil_name: &str) -> Result<HydraulicParams> {
        let mut soil_name = soil_name.trim().to_lowercase().replace([' ', '-'], "_");
        if soil_name.is_empty() {
            soil_name = "loam".to_string();
        }
        self.soils
            .get(&soil_name)
            .or_else(|| {
                log::warn!("unknown soil texture '{soil_name}', using loam");
                self.soils.get("loam")
            })
            .copied()
            .ok_or_else(|| RichardsError::config(format!("soil '{soil_name}' not in library")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.soils.keys().map(String::as_str)
    }
}
