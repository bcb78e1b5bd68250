use nalgebra::DVector;

use crate::error::{RichardsError, Result};

// Soil column discretised into layers, top (index 0) to bottom
#[derive(Debug, Clone)]
pub struct SoilColumn {
    dz: Vec<f64>,        // Layer thickness [m]
    mid_depth: Vec<f64>, // Depth of the layer centre below the surface [m]
}

impl SoilColumn {
    pub fn uniform(no_layer: usize, dz: f64) -> Result<Self> {
        Self::from_thickness(vec![dz; no_layer])
    }

    pub fn from_thickness(dz: Vec<f64>) -> Result<Self> {
        if dz.is_empty() {
            return Err(RichardsError::config("soil column needs at least one layer"));
        }
        if let Some(bad) = dz.iter().find(|t| !(t.is_finite() && **t > 0.0)) {
            return Err(RichardsError::config(format!(
                "layer thickness must be positive, got {bad}"
            )));
        }
        let mut mid_depth = Vec::with_capacity(dz.len());
        let mut top = 0.0;
        for t in &dz {
            mid_depth.push(top + 0.5 * t);
            top += t;
        }
        Ok(SoilColumn { dz, mid_depth })
    }

    pub fn no_layer(&self) -> usize {
        self.dz.len()
    }

    pub fn dz(&self) -> &[f64] {
        &self.dz
    }

    pub fn mid_depth(&self) -> &[f64] {
        &self.mid_depth
    }

    pub fn depth(&self) -> f64 {
        self.dz.iter().sum()
    }

    // Distance between the centres of layer i-1 and i [m]
    pub(crate) fn node_spacing(&self, i: usize) -> f64 {
        0.5 * (self.dz[i - 1] + self.dz[i])
    }

    // Water stored in the column, sum of theta * dz [m]
    pub fn storage(&self, theta: &DVector<f64>) -> f64 {
        theta.iter().zip(&self.dz).map(|(t, dz)| t * dz).sum()
    }

    pub(crate) fn check_profile(&self, what: &'static str, len: usize) -> Result<()> {
        if len != self.no_layer() {
            return Err(RichardsError::LayerMismatch {
                what,
                expected: self.no_layer(),
                actual: len,
            });
        }
        Ok(())
    }
}
