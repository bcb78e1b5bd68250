use serde::{Deserialize, Serialize};

use crate::error::{RichardsError, Result};
use crate::soil_column::SoilColumn;

// Root water uptake parameters (Feddes model), pressure heads in metres
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeddesParams {
    pub h1: f64, // Pressure head above which uptake stops (anaerobiosis) [m]
    pub h2: f64, // Optimal uptake range start [m]
    pub h3: f64, // Optimal uptake range end [m]
    pub h4: f64, // Pressure head below which uptake stops (wilting) [m]
}

impl Default for FeddesParams {
    fn default() -> Self {
        FeddesParams {
            h1: -0.10, // Feddes parameters for generic crop
            h2: -0.25,
            h3: -2.0,
            h4: -80.0,
        }
    }
}

impl FeddesParams {
    fn validate(&self) -> Result<()> {
        if !(self.h1 > self.h2 && self.h2 >= self.h3 && self.h3 > self.h4) {
            return Err(RichardsError::config(
                "Feddes heads must satisfy h1 > h2 >= h3 > h4",
            ));
        }
        Ok(())
    }

    // Water stress reduction factor alpha(h) in [0, 1]
    pub fn stress(&self, h: f64) -> f64 {
        if h > self.h1 || h < self.h4 {
            0.0
        } else if h <= self.h2 && h >= self.h3 {
            1.0
        } else if h > self.h2 {
            (h - self.h1) / (self.h2 - self.h1)
        } else {
            (h - self.h4) / (self.h3 - self.h4)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub feddes: FeddesParams,
    // (depth [m], relative root density [-]) pairs, interpolated linearly
    pub distribution: Vec<(f64, f64)>,
}

// Root uptake resolved onto the layers of a column
#[derive(Debug, Clone, PartialEq)]
pub struct RootUptake {
    feddes: FeddesParams,
    fractions: Vec<f64>, // Share of potential transpiration drawn from each layer, sums to 1
}

impl RootUptake {
    pub fn new(config: &RootConfig, column: &SoilColumn) -> Result<Self> {
        config.feddes.validate()?;
        if config.distribution.is_empty() {
            return Err(RichardsError::config("root distribution is empty"));
        }
        let weights: Vec<f64> = column
            .mid_depth()
            .iter()
            .zip(column.dz())
            .map(|(&z, &dz)| root_density(&config.distribution, z).max(0.0) * dz)
            .collect();
        let total: f64 = weights.iter().sum();
        if !(total > 0.0) {
            return Err(RichardsError::config(
                "root distribution has no density inside the column",
            ));
        }
        Ok(RootUptake {
            feddes: config.feddes,
            fractions: weights.iter().map(|w| w / total).collect(),
        })
    }

    pub fn fractions(&self) -> &[f64] {
        &self.fractions
    }

    // Root water uptake sink S in layer i [1/s]
    pub fn sink(&self, i: usize, psi: f64, tp_rate: f64, dz: f64) -> f64 {
        self.feddes.stress(psi) * tp_rate * self.fractions[i] / dz
    }
}

// Linear interpolation of root density at depth z, held constant beyond the ends
fn root_density(profile: &[(f64, f64)], z: f64) -> f64 {
    for pair in profile.windows(2) {
        let (z1, d1) = pair[0];
        let (z2, d2) = pair[1];
        if z >= z1 && z <= z2 && z2 > z1 {
            return d1 + (d2 - d1) * (z - z1) / (z2 - z1);
        }
    }
    match profile.first() {
        Some(&(z0, d0)) if z < z0 => d0,
        _ => profile.last().map(|&(_, d)| d).unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn feddes_stress_shape() {
        let f = FeddesParams::default();
        assert_eq!(f.stress(0.0), 0.0);
        assert_eq!(f.stress(-1.0), 1.0);
        assert_eq!(f.stress(-100.0), 0.0);
        assert_relative_eq!(f.stress(-0.175), 0.5);
        assert_relative_eq!(f.stress(-41.0), 0.5);
    }

    #[test]
    fn fractions_sum_to_one() {
        let column = SoilColumn::uniform(10, 0.1).unwrap();
        let config = RootConfig {
            feddes: FeddesParams::default(),
            distribution: vec![(0.0, 1.0), (0.5, 0.0)],
        };
        let roots = RootUptake::new(&config, &column).unwrap();
        let total: f64 = roots.fractions().iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        assert!(roots.fractions()[0] > roots.fractions()[3]);
        assert_eq!(roots.fractions()[7], 0.0);
    }

    #[test]
    fn roots_below_column_are_rejected() {
        let column = SoilColumn::uniform(2, 0.1).unwrap();
        let config = RootConfig {
            feddes: FeddesParams::default(),
            distribution: vec![(0.0, 0.0), (0.5, 0.0), (1.0, 1.0)],
        };
        assert!(RootUptake::new(&config, &column).is_err());
    }
}
