//! Ensemble Kalman filter around the Richards solver.
//!
//! Every member carries its own moisture profile and hydraulic parameters.
//! A day is: perturb the parameters, forecast all members in parallel, and,
//! when a surface moisture observation exists, update the stacked
//! state + parameter vector of every member.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::boundary_cond::{EvaporationThresholds, TopBoundary};
use crate::config::SimulationConfig;
use crate::daily_inputs::{DailyInputs, ForcingRecord};
use crate::error::{RichardsError, Result};
use crate::output::{DailyOutput, MemberOutput, Progress};
use crate::richards::{step_day, DayOutcome, SimulationContext, SubStepPlan, SECONDS_PER_DAY};
use crate::root_uptake::RootUptake;
use crate::soil_column::SoilColumn;
use crate::soil_hydra::HydraulicParams;

const N_PARAMS: usize = 6;

// Calibrated range of one hydraulic parameter
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
    pub best: f64,        // Best estimate, centre of the initial ensemble
    pub uncertainty: f64, // Standard deviation of the initial ensemble
}

impl ParameterRange {
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ParameterRanges {
    pub theta_r: ParameterRange,
    pub theta_s: ParameterRange,
    pub alpha: ParameterRange,
    pub n: ParameterRange,
    pub ks: ParameterRange,
    pub l: ParameterRange,
}

impl ParameterRanges {
    // Same order as HydraulicParams::to_array
    pub fn as_array(&self) -> [ParameterRange; N_PARAMS] {
        [self.theta_r, self.theta_s, self.alpha, self.n, self.ks, self.l]
    }

    pub fn clamp(&self, values: [f64; N_PARAMS]) -> HydraulicParams {
        let ranges = self.as_array();
        HydraulicParams::from_array(std::array::from_fn(|j| ranges[j].clamp(values[j])))
    }

    fn validate(&self) -> Result<()> {
        for (name, range) in HydraulicParams::NAMES.iter().zip(self.as_array()) {
            let finite = [range.min, range.max, range.best, range.uncertainty]
                .iter()
                .all(|v| v.is_finite());
            if !finite || range.min > range.max {
                return Err(RichardsError::InvalidBounds {
                    name: name.to_string(),
                    min: range.min,
                    max: range.max,
                });
            }
            if range.uncertainty < 0.0 {
                return Err(RichardsError::config(format!(
                    "uncertainty of {name} must be non-negative"
                )));
            }
        }
        // Any clamped parameter vector has to be a valid soil
        let lowest = HydraulicParams::from_array(self.as_array().map(|r| r.min));
        let highest = HydraulicParams::from_array(self.as_array().map(|r| r.max));
        if !(self.theta_r.max < self.theta_s.min) {
            return Err(RichardsError::config(
                "theta_r range must lie entirely below the theta_s range",
            ));
        }
        if self.theta_r.min < 0.0 || self.theta_s.max > 1.0 {
            return Err(RichardsError::config("moisture bounds must lie in [0, 1]"));
        }
        for params in [lowest, highest] {
            if params.alpha <= 0.0 || params.n <= 1.0 || params.ks < 0.0 {
                return Err(RichardsError::config(
                    "parameter bounds allow alpha <= 0, n <= 1 or ks < 0",
                ));
            }
        }
        Ok(())
    }
}

/// Maps a surface moisture measurement onto the state vector.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationOperator {
    // The measurement is the moisture of the top layer
    #[default]
    Surface,
    // Layer i of the top `intercept.len()` layers is intercept[i] + slope[i] * measurement
    Profile { intercept: Vec<f64>, slope: Vec<f64> },
}

impl ObservationOperator {
    // (state index, observed value) pairs
    pub fn observe(&self, measured: f64) -> Vec<(usize, f64)> {
        match self {
            ObservationOperator::Surface => vec![(0, measured)],
            ObservationOperator::Profile { intercept, slope } => intercept
                .iter()
                .zip(slope)
                .map(|(a, b)| a + b * measured)
                .enumerate()
                .collect(),
        }
    }

    fn validate(&self, no_layer: usize) -> Result<()> {
        if let ObservationOperator::Profile { intercept, slope } = self {
            if intercept.len() != slope.len() {
                return Err(RichardsError::LayerMismatch {
                    what: "profile regression slope",
                    expected: intercept.len(),
                    actual: slope.len(),
                });
            }
            if intercept.is_empty() || intercept.len() > no_layer {
                return Err(RichardsError::LayerMismatch {
                    what: "profile regression",
                    expected: no_layer,
                    actual: intercept.len(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default = "default_assimilate")]
    pub assimilate: bool,
    pub parameters: ParameterRanges,
    #[serde(default)]
    pub observation: ObservationOperator,
    #[serde(default = "default_initial_spread")]
    pub initial_spread: f64, // Std. dev. of the initial moisture ensemble [v/v]
    #[serde(default = "default_perturbation_fraction")]
    pub perturbation_fraction: f64, // Daily parameter noise as a fraction of each range
    #[serde(default = "default_observation_noise")]
    pub observation_noise: f64, // Used when a record carries no uncertainty [v/v]
    #[serde(default = "default_inflation_jitter")]
    pub inflation_jitter: f64, // Std. dev. of the jitter re-added after an update [v/v]
    #[serde(default = "default_regularization")]
    pub regularization: f64, // Added to the covariance diagonals
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_size() -> usize {
    10
}
fn default_assimilate() -> bool {
    true
}
fn default_initial_spread() -> f64 {
    0.05
}
fn default_perturbation_fraction() -> f64 {
    1.0e-3
}
fn default_observation_noise() -> f64 {
    0.025
}
fn default_inflation_jitter() -> f64 {
    0.01
}
fn default_regularization() -> f64 {
    1.0e-6
}

impl EnsembleConfig {
    pub fn new(parameters: ParameterRanges) -> Self {
        EnsembleConfig {
            size: default_size(),
            assimilate: default_assimilate(),
            parameters,
            observation: ObservationOperator::default(),
            initial_spread: default_initial_spread(),
            perturbation_fraction: default_perturbation_fraction(),
            observation_noise: default_observation_noise(),
            inflation_jitter: default_inflation_jitter(),
            regularization: default_regularization(),
            seed: None,
        }
    }

    pub fn validate(&self, no_layer: usize) -> Result<()> {
        if self.size == 0 || (self.assimilate && self.size < 2) {
            return Err(RichardsError::config(format!(
                "ensemble size {} is too small",
                self.size
            )));
        }
        self.parameters.validate()?;
        self.observation.validate(no_layer)?;
        let scales = [
            ("initial_spread", self.initial_spread),
            ("perturbation_fraction", self.perturbation_fraction),
            ("observation_noise", self.observation_noise),
            ("inflation_jitter", self.inflation_jitter),
            ("regularization", self.regularization),
        ];
        for (name, value) in scales {
            if !(value.is_finite() && value >= 0.0) {
                return Err(RichardsError::config(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Clamps applied by one analysis step, summed over all members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateClamps {
    pub state: usize,  // Updated moisture components pulled back into [0, 1]
    pub params: usize, // Updated parameters pulled back into their ranges
    pub theta: usize,  // Layers clipped into the member's [theta_r, theta_s]
}

#[derive(Debug, Clone)]
pub struct Member {
    pub theta: DVector<f64>,
    pub params: HydraulicParams,
    plan: SubStepPlan,
}

// Standard normal draws with the mean of every column removed
fn demeaned_normal<R: Rng>(rng: &mut R, rows: usize, cols: usize, scale: f64) -> DMatrix<f64> {
    let mut v = DMatrix::from_fn(rows, cols, |_, _| rng.sample::<f64, _>(StandardNormal));
    for mut col in v.column_iter_mut() {
        let mean = col.mean();
        col.add_scalar_mut(-mean);
    }
    v * scale
}

fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Kalman analysis of an ensemble matrix `x` (members × components).
///
/// `observed` lists the observed components and their measured values. The
/// innovation of every member is the measurement minus the ensemble mean,
/// plus de-meaned noise with standard deviation `noise_sd`. The gain is
/// `Cxx Hᵀ (H Cxx Hᵀ + Cee)⁺` with a pseudo-inverse so rank-deficient
/// ensembles (fewer members than components) are handled.
pub fn kalman_update<R: Rng>(
    x: &DMatrix<f64>,
    observed: &[(usize, f64)],
    noise_sd: f64,
    regularization: f64,
    rng: &mut R,
) -> Result<DMatrix<f64>> {
    let (members, dim) = x.shape();
    let p = observed.len();
    if let Some(&(idx, _)) = observed.iter().find(|(idx, _)| *idx >= dim) {
        return Err(RichardsError::LayerMismatch {
            what: "observed component",
            expected: dim,
            actual: idx + 1,
        });
    }

    let mean = DVector::from_fn(dim, |j, _| x.column(j).mean());
    let anomalies = DMatrix::from_fn(members, dim, |i, j| x[(i, j)] - mean[j]);
    let cxx = symmetrize(
        &(anomalies.transpose() * &anomalies
            + DMatrix::identity(dim, dim) * regularization),
    );

    let v = demeaned_normal(rng, members, p, noise_sd);
    let innovation = DMatrix::from_fn(members, p, |i, k| {
        let (idx, value) = observed[k];
        value - mean[idx] + v[(i, k)]
    });
    let cee = symmetrize(&(v.transpose() * &v + DMatrix::identity(p, p) * regularization));

    // Cxx Hᵀ and H Cxx Hᵀ
    let cxh = DMatrix::from_fn(dim, p, |j, k| cxx[(j, observed[k].0)]);
    let hch = DMatrix::from_fn(p, p, |a, b| cxx[(observed[a].0, observed[b].0)]);
    let innovation_cov = symmetrize(&(hch + cee));
    let inverse = innovation_cov
        .pseudo_inverse(f64::EPSILON)
        .map_err(RichardsError::config)?;
    let gain = cxh * inverse;

    Ok(x + innovation * gain.transpose())
}

fn perturb(
    members: &mut [Member],
    ranges: &ParameterRanges,
    scale: &[f64; N_PARAMS],
    rng: &mut StdRng,
) {
    let v = demeaned_normal(rng, members.len(), N_PARAMS, 1.0);
    for (i, member) in members.iter_mut().enumerate() {
        let current = member.params.to_array();
        let values = std::array::from_fn(|j| current[j] + scale[j] * v[(i, j)]);
        member.params = ranges.clamp(values);
    }
}

/// Ensemble of Richards columns with joint state/parameter assimilation.
pub struct EnsembleKalmanFilter {
    column: SoilColumn,
    config: EnsembleConfig,
    thresholds: EvaporationThresholds,
    roots: Option<RootUptake>,
    day_length: f64,
    members: Vec<Member>,
    perturbation: [f64; N_PARAMS], // Daily std. dev. of every parameter
    rng: StdRng,
}

impl EnsembleKalmanFilter {
    pub fn new(
        column: SoilColumn,
        config: EnsembleConfig,
        thresholds: EvaporationThresholds,
        theta0: &DVector<f64>,
    ) -> Result<Self> {
        config.validate(column.no_layer())?;
        column.check_profile("initial theta", theta0.len())?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let ranges = config.parameters.as_array();
        let size = config.size;
        let v = demeaned_normal(&mut rng, size, N_PARAMS, 1.0);
        let mut members = Vec::with_capacity(size);
        for i in 0..size {
            let values = std::array::from_fn(|j| ranges[j].best + v[(i, j)] * ranges[j].uncertainty);
            let params = config.parameters.clamp(values);
            TopBoundary::new(&thresholds, &params)?;
            let theta = DVector::from_fn(theta0.len(), |layer, _| {
                let noise: f64 = rng.sample(StandardNormal);
                params
                    .clamp_theta(theta0[layer] + config.initial_spread * noise)
                    .value
            });
            members.push(Member {
                theta,
                params,
                plan: SubStepPlan::default(),
            });
        }
        let perturbation = ranges.map(|r| r.width() * config.perturbation_fraction);

        Ok(EnsembleKalmanFilter {
            column,
            config,
            thresholds,
            roots: None,
            day_length: SECONDS_PER_DAY,
            members,
            perturbation,
            rng,
        })
    }

    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        config.validate()?;
        let ensemble = config
            .ensemble
            .clone()
            .ok_or_else(|| RichardsError::config("missing [ensemble] section"))?;
        let column = config.column.build()?;
        let theta0 = config.column.initial_theta(&column)?;
        let roots = config
            .roots
            .as_ref()
            .map(|roots| RootUptake::new(roots, &column))
            .transpose()?;
        let mut filter = EnsembleKalmanFilter::new(column, ensemble, config.evaporation, &theta0)?;
        filter.roots = roots;
        filter.day_length = config.day_length;
        Ok(filter)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn column(&self) -> &SoilColumn {
        &self.column
    }

    // Random walk on the parameters, de-meaned across members and kept in bounds
    pub fn perturb_parameters(&mut self) {
        perturb(
            &mut self.members,
            &self.config.parameters,
            &self.perturbation,
            &mut self.rng,
        );
    }

    // Independent forecasts of every member; returns only when all have finished
    fn forecast(
        &self,
        members: &[Member],
        day: usize,
        forcing: &ForcingRecord,
    ) -> Result<Vec<DayOutcome>> {
        members
            .par_iter()
            .enumerate()
            .map(|(i, member)| {
                self.forecast_member(member, forcing)
                    .map_err(|e| e.at(day, i))
            })
            .collect()
    }

    fn forecast_member(&self, member: &Member, forcing: &ForcingRecord) -> Result<DayOutcome> {
        let ctx = SimulationContext {
            column: &self.column,
            params: member.params,
            top: TopBoundary::new(&self.thresholds, &member.params)?,
            roots: self.roots.as_ref(),
            day_length: self.day_length,
        };
        step_day(&ctx, &member.theta, member.plan, forcing)
    }

    /// Update all members with the day's observation, if there is one.
    ///
    /// Returns whether an update happened. The ensemble is left untouched
    /// when the update fails.
    pub fn assimilate(&mut self, forcing: &ForcingRecord) -> Result<bool> {
        let mut members = self.members.clone();
        let mut rng = self.rng.clone();
        let clamps = self.analyse(&mut members, forcing, &mut rng)?;
        self.members = members;
        self.rng = rng;
        Ok(clamps.is_some())
    }

    // Kalman analysis of `members` in place; None when there is nothing to assimilate
    fn analyse(
        &self,
        members: &mut [Member],
        forcing: &ForcingRecord,
        rng: &mut StdRng,
    ) -> Result<Option<UpdateClamps>> {
        let Some(measured) = forcing.observation() else {
            if forcing.measured_sm.is_some() {
                log::warn!(
                    "observation on {}/{} is not a number, skipping the update",
                    forcing.year,
                    forcing.doy
                );
            }
            return Ok(None);
        };
        let noise_sd = forcing
            .uncertainty
            .filter(|u| u.is_finite() && *u >= 0.0)
            .unwrap_or(self.config.observation_noise);

        let no_layer = self.column.no_layer();
        let size = members.len();
        let x = DMatrix::from_fn(size, no_layer + N_PARAMS, |i, j| {
            let member = &members[i];
            if j < no_layer {
                member.theta[j]
            } else {
                member.params.to_array()[j - no_layer]
            }
        });
        let observed = self.config.observation.observe(measured);
        let updated = kalman_update(&x, &observed, noise_sd, self.config.regularization, rng)?;

        let ranges = self.config.parameters.as_array();
        let jitter = demeaned_normal(rng, size, no_layer, self.config.inflation_jitter);
        let mut clamps = UpdateClamps::default();
        for (i, member) in members.iter_mut().enumerate() {
            let values: [f64; N_PARAMS] = std::array::from_fn(|j| updated[(i, no_layer + j)]);
            clamps.params += values
                .iter()
                .zip(&ranges)
                .filter(|(v, r)| **v < r.min || **v > r.max)
                .count();
            member.params = self.config.parameters.clamp(values);
            let params = member.params;
            member.theta = DVector::from_fn(no_layer, |layer, _| {
                let raw = updated[(i, layer)];
                if !(0.0..=1.0).contains(&raw) {
                    clamps.state += 1;
                }
                let clipped = params.clamp_theta(raw.clamp(0.0, 1.0) + jitter[(i, layer)]);
                if clipped.clamped {
                    clamps.theta += 1;
                }
                clipped.value
            });
        }
        log::debug!(
            "assimilated {measured:.3} (sd {noise_sd:.3}) into {} components, \
             clamped {} states, {} parameters and {} layers",
            observed.len(),
            clamps.state,
            clamps.params,
            clamps.theta
        );
        Ok(Some(clamps))
    }

    /// Perturb, forecast and (optionally) assimilate one day.
    ///
    /// The day runs on a copy of the ensemble and random stream, which replace
    /// the filter's own only when every member and the update succeeded.
    pub fn advance(&mut self, day: usize, forcing: &ForcingRecord) -> Result<DailyOutput> {
        let mut rng = self.rng.clone();
        let mut members = self.members.clone();
        perturb(
            &mut members,
            &self.config.parameters,
            &self.perturbation,
            &mut rng,
        );
        let outcomes = self.forecast(&members, day, forcing)?;
        let mut diagnostics = Vec::with_capacity(outcomes.len());
        for (member, outcome) in members.iter_mut().zip(outcomes) {
            member.theta = outcome.theta;
            member.plan = outcome.plan;
            diagnostics.push(outcome.diagnostics);
        }

        let clamps = if self.config.assimilate {
            self.analyse(&mut members, forcing, &mut rng)
                .map_err(|e| e.at(day, 0))?
        } else {
            None
        };
        self.members = members;
        self.rng = rng;

        let members = self
            .members
            .iter()
            .zip(diagnostics)
            .map(|(member, diagnostics)| MemberOutput {
                theta: member.theta.iter().copied().collect(),
                diagnostics,
                params: Some(member.params),
            })
            .collect();
        Ok(DailyOutput {
            year: forcing.year,
            doy: forcing.doy,
            members,
            assimilated: clamps.is_some(),
            update_clamps: clamps.unwrap_or_default(),
        })
    }

    // Run over the full forcing series; nothing is returned if any day fails
    pub fn run(&mut self, inputs: &DailyInputs) -> Result<Vec<DailyOutput>> {
        inputs.validate()?;
        log::info!(
            "running {} days with {} members on a {}-layer column (assimilation {})",
            inputs.len(),
            self.members.len(),
            self.column.no_layer(),
            if self.config.assimilate { "on" } else { "off" }
        );
        let mut progress = Progress::new(inputs.len());
        let mut outputs = Vec::with_capacity(inputs.len());
        for (day, record) in inputs.iter().enumerate() {
            outputs.push(self.advance(day, record)?);
            progress.update(day);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn range(min: f64, max: f64, best: f64, uncertainty: f64) -> ParameterRange {
        ParameterRange {
            min,
            max,
            best,
            uncertainty,
        }
    }

    fn ranges() -> ParameterRanges {
        ParameterRanges {
            theta_r: range(0.02, 0.08, 0.05, 0.01),
            theta_s: range(0.35, 0.45, 0.40, 0.02),
            alpha: range(1.0, 4.0, 2.0, 0.3),
            n: range(1.2, 2.0, 1.5, 0.1),
            ks: range(1.0e-7, 1.0e-5, 1.0e-6, 2.0e-7),
            l: range(0.1, 1.0, 0.5, 0.1),
        }
    }

    fn filter(config: EnsembleConfig, no_layer: usize) -> EnsembleKalmanFilter {
        let column = SoilColumn::uniform(no_layer, 0.1).unwrap();
        EnsembleKalmanFilter::new(
            column,
            config,
            EvaporationThresholds::default(),
            &DVector::from_element(no_layer, 0.25),
        )
        .unwrap()
    }

    fn seeded(seed: u64) -> EnsembleConfig {
        let mut config = EnsembleConfig::new(ranges());
        config.seed = Some(seed);
        config
    }

    fn surface_stats(f: &EnsembleKalmanFilter) -> (f64, f64) {
        let values: Vec<f64> = f.members().iter().map(|m| m.theta[0]).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        (mean, var)
    }

    #[test]
    fn initial_ensemble_respects_bounds() {
        let f = filter(seeded(1), 6);
        assert_eq!(f.members().len(), 10);
        let r = ranges();
        for m in f.members() {
            for (value, range) in m.params.to_array().iter().zip(r.as_array()) {
                assert!(*value >= range.min && *value <= range.max);
            }
            assert!(m.theta.iter().all(|t| *t >= m.params.theta_r && *t <= m.params.theta_s));
        }
    }

    #[test]
    fn perturbation_keeps_parameters_in_bounds_and_centred() {
        let mut f = filter(seeded(2), 3);
        let mean_before: f64 = f.members().iter().map(|m| m.params.alpha).sum::<f64>() / 10.0;
        f.perturb_parameters();
        let mean_after: f64 = f.members().iter().map(|m| m.params.alpha).sum::<f64>() / 10.0;
        assert_abs_diff_eq!(mean_before, mean_after, epsilon = 1e-9);
        for m in f.members() {
            assert!(m.params.n >= 1.2 && m.params.n <= 2.0);
        }
    }

    #[test]
    fn exact_observation_is_matched_without_inflating_spread() {
        let mut config = seeded(3);
        config.inflation_jitter = 0.0;
        config.initial_spread = 0.02;
        let mut f = filter(config, 5);
        let (mean_before, var_before) = surface_stats(&f);
        let obs = mean_before + 0.02;
        let rec = ForcingRecord::new(2012, 10, 0.0, 0.0).with_observation(obs, Some(0.0));
        assert!(f.assimilate(&rec).unwrap());
        let (mean_after, var_after) = surface_stats(&f);
        assert_abs_diff_eq!(mean_after, obs, epsilon = 1e-4);
        assert!(var_after <= var_before + 1e-12);
    }

    #[test]
    fn kalman_update_moves_correlated_components() {
        let mut rng = StdRng::seed_from_u64(11);
        // Second component is perfectly correlated with the first
        let x = DMatrix::from_fn(8, 2, |i, j| {
            let base = 0.2 + 0.01 * i as f64;
            if j == 0 { base } else { 2.0 * base }
        });
        let updated = kalman_update(&x, &[(0, 0.3)], 0.0, 1e-9, &mut rng).unwrap();
        let mean0 = updated.column(0).mean();
        let mean1 = updated.column(1).mean();
        assert_abs_diff_eq!(mean0, 0.3, epsilon = 1e-5);
        assert_abs_diff_eq!(mean1, 0.6, epsilon = 1e-4);
    }

    #[test]
    fn missing_observation_skips_update() {
        let mut f = filter(seeded(4), 4);
        let before: Vec<f64> = f.members().iter().map(|m| m.theta[0]).collect();
        let rec = ForcingRecord::new(2012, 1, 0.0, 0.0).with_observation(f64::NAN, None);
        assert!(!f.assimilate(&rec).unwrap());
        let rec = ForcingRecord::new(2012, 1, 0.0, 0.0);
        assert!(!f.assimilate(&rec).unwrap());
        let after: Vec<f64> = f.members().iter().map(|m| m.theta[0]).collect();
        assert_eq!(before, after);
    }

    // Fast-draining sandy members on a thin column
    fn sandy_filter(seed: u64) -> EnsembleKalmanFilter {
        let mut config = EnsembleConfig::new(ParameterRanges {
            theta_r: range(0.040, 0.050, 0.045, 0.002),
            theta_s: range(0.42, 0.44, 0.43, 0.005),
            alpha: range(12.0, 16.0, 14.5, 0.5),
            n: range(2.5, 2.8, 2.68, 0.05),
            ks: range(7.0e-5, 9.0e-5, 8.25e-5, 5.0e-6),
            l: range(0.4, 0.6, 0.5, 0.05),
        });
        config.seed = Some(seed);
        config.initial_spread = 0.0;
        EnsembleKalmanFilter::new(
            SoilColumn::uniform(20, 0.01).unwrap(),
            config,
            EvaporationThresholds::default(),
            &DVector::from_element(20, 0.40),
        )
        .unwrap()
    }

    fn snapshot(f: &EnsembleKalmanFilter) -> Vec<(DVector<f64>, HydraulicParams, SubStepPlan)> {
        f.members()
            .iter()
            .map(|m| (m.theta.clone(), m.params, m.plan))
            .collect()
    }

    #[test]
    fn failed_day_leaves_the_ensemble_untouched() {
        let mut failing = sandy_filter(7);
        let mut twin = sandy_filter(7);
        let before = snapshot(&failing);

        failing.day_length = 1.0e9;
        let rec = ForcingRecord::new(2012, 3, 0.0, 0.0).with_observation(0.3, None);
        match failing.advance(2, &rec) {
            Err(RichardsError::Aborted { day, member, source }) => {
                assert_eq!(day, 2);
                assert!(member < 10);
                assert!(matches!(*source, RichardsError::NumericalInstability { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(snapshot(&failing), before);

        // Parameters and random stream were not advanced either
        failing.day_length = SECONDS_PER_DAY;
        let rec = ForcingRecord::new(2012, 3, 0.0, 0.0);
        let a = failing.advance(2, &rec).unwrap();
        let b = twin.advance(2, &rec).unwrap();
        assert_eq!(a, b);
        assert_eq!(snapshot(&failing), snapshot(&twin));
    }

    #[test]
    fn run_aborts_on_the_failing_day_and_member() {
        let mut f = filter(seeded(8), 5);
        let roots = RootUptake::new(
            &crate::root_uptake::RootConfig {
                feddes: crate::root_uptake::FeddesParams::default(),
                distribution: vec![(0.0, 1.0), (0.5, 1.0)],
            },
            f.column(),
        )
        .unwrap();
        f.roots = Some(roots);
        let before = snapshot(&f);
        // Day 2 asks the roots for far more water than the column holds
        let records = (1..=4)
            .map(|doy| {
                let pt = if doy == 3 { 1.0e4 } else { 0.001 };
                ForcingRecord::new(2012, doy, 0.0, 0.0).with_transpiration(pt)
            })
            .collect();
        match f.run(&DailyInputs::new(records).unwrap()) {
            Err(RichardsError::Aborted { day, member, source }) => {
                assert_eq!(day, 2);
                assert!(member < 10);
                assert!(matches!(*source, RichardsError::NumericalInstability { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_ne!(snapshot(&f), before);
    }

    #[test]
    fn update_clamps_are_counted() {
        let mut config = seeded(9);
        config.inflation_jitter = 0.0;
        let mut f = filter(config, 4);
        let rec = ForcingRecord::new(2012, 1, 0.0, 0.0).with_observation(0.9, Some(0.0));
        let day = f.advance(0, &rec).unwrap();
        assert!(day.assimilated);
        // The surface layer is pulled far above every member's theta_s
        assert!(day.update_clamps.theta >= 10);
        assert!(f.members().iter().all(|m| m.theta[0] == m.params.theta_s));

        let quiet = f.advance(1, &ForcingRecord::new(2012, 2, 0.0, 0.0)).unwrap();
        assert!(!quiet.assimilated);
        assert_eq!(quiet.update_clamps, UpdateClamps::default());
    }

    #[test]
    fn profile_operator_observes_top_layers() {
        let op = ObservationOperator::Profile {
            intercept: vec![0.0, 0.02],
            slope: vec![1.0, 0.9],
        };
        let obs = op.observe(0.2);
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[1].0, 1);
        assert_abs_diff_eq!(obs[1].1, 0.2, epsilon = 1e-12);
        assert!(op.validate(1).is_err());
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let mut r = ranges();
        r.ks = range(1.0e-5, 1.0e-7, 1.0e-6, 0.0);
        let column = SoilColumn::uniform(2, 0.1).unwrap();
        let result = EnsembleKalmanFilter::new(
            column,
            EnsembleConfig::new(r),
            EvaporationThresholds::default(),
            &DVector::from_element(2, 0.2),
        );
        assert!(matches!(result, Err(RichardsError::InvalidBounds { .. })));
    }

    #[test]
    fn ensemble_run_reports_parameters() {
        let mut f = filter(seeded(5), 4);
        let records = (1..=5)
            .map(|doy| {
                let rec = ForcingRecord::new(2012, doy, 0.002, 0.003);
                if doy % 2 == 0 { rec.with_observation(0.28, None) } else { rec }
            })
            .collect();
        let outputs = f.run(&DailyInputs::new(records).unwrap()).unwrap();
        assert_eq!(outputs.len(), 5);
        assert!(outputs[1].assimilated && !outputs[0].assimilated);
        for day in &outputs {
            assert_eq!(day.members.len(), 10);
            assert!(day.members.iter().all(|m| m.params.is_some()));
        }
    }
}
