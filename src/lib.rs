mod boundary_cond;
mod config;
mod daily_inputs;
mod enkf;
mod error;
mod output;
mod richards;
mod root_uptake;
mod soil_column;
mod soil_hydra;
mod tridiag;

pub use boundary_cond::{EvaporationThresholds, TopBoundary, TopFlux};
pub use config::{ColumnConfig, LayerValues, SimulationConfig, SoilConfig};
pub use daily_inputs::{DailyInputs, ForcingRecord};
pub use enkf::{
    kalman_update, EnsembleConfig, EnsembleKalmanFilter, Member, ObservationOperator,
    ParameterRange, ParameterRanges, UpdateClamps,
};
pub use error::{Result, RichardsError};
pub use output::{DailyOutput, MemberOutput};
pub use richards::{
    step_day, DayOutcome, Diagnostics, Richards1D, SimulationContext, SubStepPlan, MIN_SUBSTEPS,
    SECONDS_PER_DAY,
};
pub use root_uptake::{FeddesParams, RootConfig, RootUptake};
pub use soil_column::SoilColumn;
pub use soil_hydra::{
    effective_saturation, moisture_capacity, relative_permeability, saturation_to_psi, Clamped,
    HydraulicParams, SoilLibrary, PSI_FLOOR, SE_EPSILON,
};
pub use tridiag::Tridiagonal;

/// Run a configured simulation: an ensemble when the configuration has an
/// `[ensemble]` section, a single deterministic column otherwise.
pub fn run_simulation(config: &SimulationConfig, inputs: &DailyInputs) -> Result<Vec<DailyOutput>> {
    match config.ensemble {
        Some(_) => EnsembleKalmanFilter::from_config(config)?.run(inputs),
        None => Richards1D::from_config(config)?.run(inputs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn sandy_params() -> HydraulicParams {
        HydraulicParams::new(0.05, 0.40, 2.0, 1.5, 1.0e-6, 0.5).unwrap()
    }

    fn single_layer(theta0: f64) -> Richards1D {
        Richards1D::new(
            SoilColumn::uniform(1, 0.1).unwrap(),
            sandy_params(),
            &EvaporationThresholds::default(),
            DVector::from_element(1, theta0),
        )
        .unwrap()
    }

    fn dry_days(n: u32) -> DailyInputs {
        DailyInputs::new((1..=n).map(|doy| ForcingRecord::new(2012, doy, 0.0, 0.0)).collect())
            .unwrap()
    }

    #[test]
    fn it_works() {
        init_logging();
        let mut model = single_layer(0.30);
        let outputs = model.run(&dry_days(10)).unwrap();
        assert_eq!(outputs.len(), 10);
    }

    #[test]
    fn single_layer_drains_under_gravity() {
        init_logging();
        let mut model = single_layer(0.30);
        let outputs = model.run(&dry_days(10)).unwrap();
        let mut last = 0.30;
        for day in &outputs {
            let member = &day.members[0];
            assert!(member.diagnostics.recharge > 0.0);
            assert!(member.diagnostics.substeps >= MIN_SUBSTEPS);
            assert!(member.theta[0] <= last);
            last = member.theta[0];
        }
        assert!(model.theta()[0] <= 0.30);
    }

    #[test]
    fn storage_loss_equals_drainage() {
        let column = SoilColumn::uniform(6, 0.05).unwrap();
        let theta0 = DVector::from_vec(vec![0.32, 0.30, 0.28, 0.27, 0.26, 0.25]);
        let mut model = Richards1D::new(
            column,
            sandy_params(),
            &EvaporationThresholds::default(),
            theta0,
        )
        .unwrap();
        let before = model.column().storage(model.theta());
        let outputs = model.run(&dry_days(20)).unwrap();
        let drained: f64 = outputs.iter().map(|d| d.members[0].diagnostics.recharge).sum();
        let after = model.column().storage(model.theta());
        assert!(drained > 0.0);
        assert_relative_eq!(before - after, drained, epsilon = 1e-12);
    }

    #[test]
    fn rain_refines_the_substep_plan() {
        let mut wet = single_layer(0.30);
        let mut dry = single_layer(0.30);
        let rain_day = ForcingRecord::new(2012, 1, 0.05, 0.0);
        let dry_day = ForcingRecord::new(2012, 1, 0.0, 0.0);
        let wet_diag = wet.advance(0, &rain_day).unwrap();
        let dry_diag = dry.advance(0, &dry_day).unwrap();
        assert!(wet_diag.substeps > dry_diag.substeps);

        // The next dry day keeps most of the refinement
        let next = wet.advance(1, &dry_day).unwrap();
        assert!(next.substeps as f64 >= 0.75 * wet_diag.substeps as f64);
    }

    #[test]
    fn more_rain_never_wets_the_top_less() {
        let column = SoilColumn::uniform(10, 0.05).unwrap();
        let theta0 = DVector::from_element(10, 0.25);
        let mut last_increment = f64::NEG_INFINITY;
        for rain in [0.0, 0.002, 0.005, 0.01, 0.02, 0.04] {
            let mut model = Richards1D::new(
                column.clone(),
                sandy_params(),
                &EvaporationThresholds::default(),
                theta0.clone(),
            )
            .unwrap();
            model.advance(0, &ForcingRecord::new(2012, 1, rain, 0.002)).unwrap();
            let increment = model.theta()[0] - theta0[0];
            assert!(increment >= last_increment, "rain {rain}: {increment} < {last_increment}");
            last_increment = increment;
        }
    }

    #[test]
    fn invalid_day_aborts_the_whole_run() {
        let mut model = single_layer(0.30);
        let mut inputs = dry_days(3);
        inputs.records[2].rain = -1.0;
        assert!(matches!(
            model.run(&inputs),
            Err(RichardsError::InvalidForcing { day: 2, .. })
        ));
        assert_eq!(model.theta()[0], 0.30);
    }

    #[test]
    fn unstable_configuration_aborts_naming_the_day() {
        let config = SimulationConfig::from_toml(
            r#"
            day_length = 1.0e9

            [column]
            layers = 20
            thickness = 0.01
            initial_theta = 0.40

            [soil]
            texture = "sand"
            "#,
        )
        .unwrap();
        let err = run_simulation(&config, &dry_days(3)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "simulation aborted on day 0, ensemble member 0"
        );
        match err {
            RichardsError::Aborted { source, .. } => {
                assert!(matches!(*source, RichardsError::NumericalInstability { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn runs_from_toml_configuration() {
        init_logging();
        let config = SimulationConfig::from_toml(
            r#"
            [column]
            layers = 5
            thickness = 0.1
            initial_theta = 0.25

            [ensemble]
            size = 6
            seed = 42

            [ensemble.parameters]
            theta_r = { min = 0.02, max = 0.08, best = 0.05, uncertainty = 0.01 }
            theta_s = { min = 0.35, max = 0.45, best = 0.40, uncertainty = 0.02 }
            alpha = { min = 1.0, max = 4.0, best = 2.0, uncertainty = 0.3 }
            n = { min = 1.2, max = 2.0, best = 1.5, uncertainty = 0.1 }
            ks = { min = 1.0e-7, max = 1.0e-5, best = 1.0e-6, uncertainty = 2.0e-7 }
            l = { min = 0.1, max = 1.0, best = 0.5, uncertainty = 0.1 }

            [roots]
            distribution = [[0.0, 1.0], [0.3, 0.0]]
            "#,
        )
        .unwrap();
        let records = (1..=4)
            .map(|doy| {
                ForcingRecord::new(2012, doy, 0.004, 0.003)
                    .with_transpiration(0.001)
                    .with_observation(0.27, Some(0.02))
            })
            .collect();
        let outputs = run_simulation(&config, &DailyInputs::new(records).unwrap()).unwrap();
        assert_eq!(outputs.len(), 4);
        assert!(outputs.iter().all(|d| d.assimilated && d.members.len() == 6));
        assert!(outputs[3].mean_theta().iter().all(|t| (0.0..=1.0).contains(t)));
    }

    #[test]
    fn deterministic_configuration_uses_a_single_column() {
        let config = SimulationConfig::from_toml(
            r#"
            [column]
            layers = 3
            thickness = [0.05, 0.1, 0.2]
            initial_theta = 0.3

            [soil]
            texture = "sandy loam"
            "#,
        )
        .unwrap();
        let outputs = run_simulation(&config, &dry_days(3)).unwrap();
        assert_eq!(outputs[2].members.len(), 1);
        assert!(outputs[2].members[0].params.is_none());
    }
}
