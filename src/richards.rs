use nalgebra::DVector;
use serde::Serialize;

use crate::boundary_cond::{gravity_drainage_flux, EvaporationThresholds, TopBoundary};
use crate::config::SimulationConfig;
use crate::daily_inputs::{DailyInputs, ForcingRecord};
use crate::enkf::UpdateClamps;
use crate::error::{RichardsError, Result};
use crate::output::{DailyOutput, MemberOutput, Progress};
use crate::root_uptake::RootUptake;
use crate::soil_column::SoilColumn;
use crate::soil_hydra::{moisture_capacity, relative_permeability, saturation_to_psi, HydraulicParams};
use crate::tridiag::Tridiagonal;

pub const MIN_SUBSTEPS: usize = 24;
// Rainfall depth handled by a single sub-step [mm]
const RAIN_PER_SUBSTEP_MM: f64 = 0.15;
// A day never uses fewer than this fraction of the previous day's sub-steps
const SUBSTEP_DAMPING: f64 = 0.75;

// Doublings of a day's sub-steps tried before an overshoot is fatal
const MAX_REFINEMENTS: usize = 8;

pub const SECONDS_PER_DAY: f64 = 86400.0;

/// Number of implicit sub-steps used for one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubStepPlan {
    pub substeps: usize,
}

impl Default for SubStepPlan {
    fn default() -> Self {
        SubStepPlan { substeps: 1 }
    }
}

impl SubStepPlan {
    // Refine for intense rain, but never drop below 75 % of the previous plan
    pub fn next(self, rain_rate: f64, day_length: f64) -> SubStepPlan {
        let rain_mm = rain_rate * day_length * 1000.0;
        let wanted = ((rain_mm / RAIN_PER_SUBSTEP_MM).ceil() as usize).max(MIN_SUBSTEPS);
        let damped = (SUBSTEP_DAMPING * self.substeps as f64).ceil() as usize;
        SubStepPlan {
            substeps: wanted.max(damped),
        }
    }

    // Twice as many sub-steps, used when a day overshoots
    pub fn refined(self) -> SubStepPlan {
        SubStepPlan {
            substeps: self.substeps * 2,
        }
    }
}

// Per-day diagnostics of one column
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub recharge: f64,      // Drainage through the bottom of the column [m]
    pub evaporation: f64,   // Actual evaporation [m]
    pub transpiration: f64, // Actual root water uptake [m]
    pub runoff: f64,        // Hortonian excess removed from the top layer [m]
    pub substeps: usize,
    pub clipped_high: usize, // Layer updates truncated to theta_s
    pub clipped_low: usize,  // Layer updates between theta_r and 1.01 theta_r lifted to the floor
    pub se_clamped: usize,   // Effective saturation evaluations clamped into (eps, 1 - eps)
    pub refinements: usize,  // Times the day was restarted with twice the sub-steps
}

impl Diagnostics {
    pub fn aet(&self) -> f64 {
        self.evaporation + self.transpiration
    }
}

/// Everything a day step reads but never changes.
#[derive(Debug, Clone, Copy)]
pub struct SimulationContext<'a> {
    pub column: &'a SoilColumn,
    pub params: HydraulicParams,
    pub top: TopBoundary,
    pub roots: Option<&'a RootUptake>,
    pub day_length: f64, // Length of a forcing interval [s]
}

#[derive(Debug, Clone)]
pub struct DayOutcome {
    pub theta: DVector<f64>,
    pub plan: SubStepPlan,
    pub diagnostics: Diagnostics,
}

// Forcing rates for one day [m/s]
#[derive(Debug, Clone, Copy)]
struct Rates {
    rain: f64,
    pet: f64,
    pt: f64,
}

/// Advance the moisture profile by one day.
///
/// The day is atomic: either every sub-step completes and the new profile is
/// returned, or the first fatal error is returned and the input is untouched.
/// A sub-step that drains a layer below theta_r has overshot; the day is then
/// restarted from `theta` with twice the sub-steps, and the overshoot becomes
/// `NumericalInstability` once `MAX_REFINEMENTS` restarts did not resolve it.
pub fn step_day(
    ctx: &SimulationContext,
    theta: &DVector<f64>,
    plan: SubStepPlan,
    forcing: &ForcingRecord,
) -> Result<DayOutcome> {
    ctx.column.check_profile("moisture state", theta.len())?;
    let rates = Rates {
        rain: forcing.rain / ctx.day_length,
        pet: forcing.pet / ctx.day_length,
        pt: forcing.pt / ctx.day_length,
    };
    let mut plan = plan.next(rates.rain, ctx.day_length);
    let mut refinements = 0;
    loop {
        match run_day(ctx, theta, rates, plan) {
            Ok((theta, mut diagnostics)) => {
                diagnostics.refinements = refinements;
                return Ok(DayOutcome {
                    theta,
                    plan,
                    diagnostics,
                });
            }
            Err(RichardsError::NumericalInstability {
                layer,
                substep,
                substeps,
            }) if refinements < MAX_REFINEMENTS => {
                log::debug!(
                    "layer {layer} overshot at sub-step {substep} of {substeps}, restarting the day"
                );
                plan = plan.refined();
                refinements += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn run_day(
    ctx: &SimulationContext,
    theta: &DVector<f64>,
    rates: Rates,
    plan: SubStepPlan,
) -> Result<(DVector<f64>, Diagnostics)> {
    let dt = ctx.day_length / plan.substeps as f64;
    let mut theta = theta.clone();
    let mut diagnostics = Diagnostics {
        substeps: plan.substeps,
        ..Diagnostics::default()
    };
    for s in 0..plan.substeps {
        if let Some(layer) = substep(ctx, &mut theta, rates, dt, &mut diagnostics)? {
            return Err(RichardsError::NumericalInstability {
                layer,
                substep: s,
                substeps: plan.substeps,
            });
        }
    }
    Ok((theta, diagnostics))
}

// One backward-Euler step in pressure head followed by a conservative
// moisture update from the resulting inter-layer fluxes. Returns the first
// layer whose moisture overshot below theta_r or stopped being finite.
fn substep(
    ctx: &SimulationContext,
    theta: &mut DVector<f64>,
    rates: Rates,
    dt: f64,
    diag: &mut Diagnostics,
) -> Result<Option<usize>> {
    let column = ctx.column;
    let p = &ctx.params;
    let (m, n) = (p.m(), p.n);
    let nz = column.no_layer();
    let dz = column.dz();

    let top = ctx.top.top_flux(theta[0], rates.rain, rates.pet);

    let mut k = DVector::zeros(nz);
    let mut c = DVector::zeros(nz);
    let mut psi = DVector::zeros(nz);
    for i in 0..nz {
        let se = p.effective_saturation(theta[i]);
        if se.clamped {
            diag.se_clamped += 1;
        }
        k[i] = relative_permeability(se.value, p.ks, p.l, m);
        c[i] = moisture_capacity(se.value, p.theta_s, p.theta_r, p.alpha, m, n);
        psi[i] = saturation_to_psi(se.value, p.alpha, m, n);
    }

    // Conductivity at the interfaces; index i is the top of layer i and nz the bottom
    let mut k_mid = DVector::zeros(nz + 1);
    for i in 1..nz {
        k_mid[i] = 0.5 * (k[i] + k[i - 1]);
    }
    k_mid[nz] = gravity_drainage_flux(k[nz - 1]);

    let sink: DVector<f64> = match ctx.roots {
        Some(roots) => DVector::from_fn(nz, |i, _| roots.sink(i, psi[i], rates.pt, dz[i])),
        None => DVector::zeros(nz),
    };

    let mut sys = Tridiagonal::zeros(nz);
    for i in 0..nz {
        let storage = c[i] / dt;
        let upper = if i > 0 {
            k_mid[i] / (column.node_spacing(i) * dz[i])
        } else {
            0.0 // Neumann flux at the surface
        };
        let lower = if i + 1 < nz {
            k_mid[i + 1] / (column.node_spacing(i + 1) * dz[i])
        } else {
            0.0 // Gravity drainage, no capillary term
        };
        let q_in = if i == 0 { top.net } else { k_mid[i] };
        let q_out = k_mid[i + 1];

        sys.a[i] = -upper;
        sys.b[i] = storage + upper + lower;
        sys.c[i] = -lower;
        sys.d[i] = storage * psi[i] - (q_out - q_in) / dz[i] - sink[i];
    }
    let u = sys.solve()?;

    // Downward Darcy flux at each interface [m/s]
    let mut flux = DVector::zeros(nz + 1);
    flux[0] = top.net;
    for i in 1..nz {
        flux[i] = k_mid[i] * (1.0 - (u[i] - u[i - 1]) / column.node_spacing(i));
    }
    flux[nz] = k_mid[nz];

    for i in 0..nz {
        theta[i] -= (flux[i + 1] - flux[i]) * dt / dz[i] + sink[i] * dt;
        if !theta[i].is_finite() || theta[i] < p.theta_r {
            return Ok(Some(i));
        }
        let clipped = p.clamp_theta(theta[i]);
        if clipped.clamped {
            if theta[i] > p.theta_s {
                if i == 0 {
                    diag.runoff += (theta[i] - p.theta_s) * dz[i];
                }
                diag.clipped_high += 1;
            } else {
                diag.clipped_low += 1;
            }
            theta[i] = clipped.value;
        }
    }

    diag.recharge += flux[nz] * dt;
    diag.evaporation += top.aet * dt;
    diag.transpiration += sink.iter().zip(dz).map(|(s, dz)| s * dz).sum::<f64>() * dt;
    Ok(None)
}

// Deterministic single-column run of the Richards equation
#[derive(Debug, Clone)]
pub struct Richards1D {
    column: SoilColumn,
    params: HydraulicParams,
    top: TopBoundary,
    roots: Option<RootUptake>,
    day_length: f64,
    theta: DVector<f64>,
    plan: SubStepPlan,
}

impl Richards1D {
    pub fn new(
        column: SoilColumn,
        params: HydraulicParams,
        thresholds: &EvaporationThresholds,
        theta: DVector<f64>,
    ) -> Result<Self> {
        params.validate()?;
        column.check_profile("initial theta", theta.len())?;
        let top = TopBoundary::new(thresholds, &params)?;
        let theta = theta.map(|t| params.clamp_theta(t).value);
        Ok(Richards1D {
            column,
            params,
            top,
            roots: None,
            day_length: SECONDS_PER_DAY,
            theta,
            plan: SubStepPlan::default(),
        })
    }

    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        config.validate()?;
        let column = config.column.build()?;
        let theta = config.column.initial_theta(&column)?;
        let params = config.soil_params()?;
        let model = Richards1D::new(column, params, &config.evaporation, theta)?
            .with_day_length(config.day_length)?;
        match &config.roots {
            Some(roots) => {
                let roots = RootUptake::new(roots, &model.column)?;
                Ok(model.with_roots(roots))
            }
            None => Ok(model),
        }
    }

    pub fn with_roots(mut self, roots: RootUptake) -> Self {
        self.roots = Some(roots);
        self
    }

    pub fn with_day_length(mut self, day_length: f64) -> Result<Self> {
        if !(day_length > 0.0) {
            return Err(RichardsError::config("day length must be positive"));
        }
        self.day_length = day_length;
        Ok(self)
    }

    pub fn theta(&self) -> &DVector<f64> {
        &self.theta
    }

    pub fn column(&self) -> &SoilColumn {
        &self.column
    }

    pub fn params(&self) -> &HydraulicParams {
        &self.params
    }

    pub fn plan(&self) -> SubStepPlan {
        self.plan
    }

    fn context(&self) -> SimulationContext<'_> {
        SimulationContext {
            column: &self.column,
            params: self.params,
            top: self.top,
            roots: self.roots.as_ref(),
            day_length: self.day_length,
        }
    }

    /// Simulate one day. The state only changes when the whole day succeeds.
    pub fn advance(&mut self, day: usize, forcing: &ForcingRecord) -> Result<Diagnostics> {
        let outcome = step_day(&self.context(), &self.theta, self.plan, forcing)
            .map_err(|e| e.at(day, 0))?;
        self.theta = outcome.theta;
        self.plan = outcome.plan;
        log::debug!(
            "day {day}: {} sub-steps ({} refinements), recharge {:.3e} m, aet {:.3e} m, {} clips",
            outcome.diagnostics.substeps,
            outcome.diagnostics.refinements,
            outcome.diagnostics.recharge,
            outcome.diagnostics.aet(),
            outcome.diagnostics.clipped_high + outcome.diagnostics.clipped_low
        );
        Ok(outcome.diagnostics)
    }

    // Run over the full forcing series; nothing is returned if any day fails
    pub fn run(&mut self, inputs: &DailyInputs) -> Result<Vec<DailyOutput>> {
        inputs.validate()?;
        log::info!(
            "running {} days on a {}-layer column",
            inputs.len(),
            self.column.no_layer()
        );
        let mut progress = Progress::new(inputs.len());
        let mut outputs = Vec::with_capacity(inputs.len());
        for (day, record) in inputs.iter().enumerate() {
            let diagnostics = self.advance(day, record)?;
            outputs.push(DailyOutput {
                year: record.year,
                doy: record.doy,
                members: vec![MemberOutput {
                    theta: self.theta.iter().copied().collect(),
                    diagnostics,
                    params: None,
                }],
                assimilated: false,
                update_clamps: UpdateClamps::default(),
            });
            progress.update(day);
        }
        Ok(outputs)
    }
}
