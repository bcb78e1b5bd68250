use serde::{Deserialize, Serialize};

use crate::error::{RichardsError, Result};

// Forcing for one calendar day. Depths are already converted to metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForcingRecord {
    pub year: i32,
    pub doy: u32,
    pub rain: f64, // Rainfall depth [m/day]
    pub pet: f64,  // Potential evaporation depth [m/day]
    #[serde(default)]
    pub pt: f64, // Potential transpiration depth [m/day]
    #[serde(default)]
    pub measured_sm: Option<f64>, // Measured surface moisture [v/v]
    #[serde(default)]
    pub uncertainty: Option<f64>, // Standard deviation of measured_sm [v/v]
}

impl ForcingRecord {
    pub fn new(year: i32, doy: u32, rain: f64, pet: f64) -> Self {
        ForcingRecord {
            year,
            doy,
            rain,
            pet,
            pt: 0.0,
            measured_sm: None,
            uncertainty: None,
        }
    }

    pub fn with_observation(mut self, measured_sm: f64, uncertainty: Option<f64>) -> Self {
        self.measured_sm = Some(measured_sm);
        self.uncertainty = uncertainty;
        self
    }

    pub fn with_transpiration(mut self, pt: f64) -> Self {
        self.pt = pt;
        self
    }

    // A usable observation for the day; NaN counts as missing
    pub fn observation(&self) -> Option<f64> {
        self.measured_sm.filter(|v| v.is_finite())
    }

    fn validate(&self, day: usize) -> Result<()> {
        for (field, value) in [("rain", self.rain), ("pet", self.pet), ("pt", self.pt)] {
            if !value.is_finite() || value < 0.0 {
                return Err(RichardsError::InvalidForcing { day, field, value });
            }
        }
        Ok(())
    }
}

// Daily forcing series driving the column
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyInputs {
    pub records: Vec<ForcingRecord>,
}

impl DailyInputs {
    pub fn new(records: Vec<ForcingRecord>) -> Result<Self> {
        let inputs = DailyInputs { records };
        inputs.validate()?;
        Ok(inputs)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let inputs: DailyInputs = toml::from_str(toml_str)?;
        inputs.validate()?;
        Ok(inputs)
    }

    pub fn validate(&self) -> Result<()> {
        self.records
            .iter()
            .enumerate()
            .try_for_each(|(day, rec)| rec.validate(day))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForcingRecord> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_observation_is_missing() {
        let rec = ForcingRecord::new(2012, 1, 0.0, 0.0).with_observation(f64::NAN, Some(0.02));
        assert_eq!(rec.observation(), None);
        let rec = ForcingRecord::new(2012, 1, 0.0, 0.0).with_observation(0.21, None);
        assert_eq!(rec.observation(), Some(0.21));
    }

    #[test]
    fn missing_rain_is_fatal() {
        let records = vec![
            ForcingRecord::new(2012, 1, 0.001, 0.003),
            ForcingRecord::new(2012, 2, f64::NAN, 0.003),
        ];
        match DailyInputs::new(records) {
            Err(RichardsError::InvalidForcing { day, field, .. }) => {
                assert_eq!(day, 1);
                assert_eq!(field, "rain");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_toml_records() {
        let inputs = DailyInputs::from_toml(
            r#"
            [[records]]
            year = 2012
            doy = 1
            rain = 0.002
            pet = 0.004

            [[records]]
            year = 2012
            doy = 2
            rain = 0.0
            pet = 0.004
            measured_sm = 0.18
            uncertainty = 0.02
            "#,
        )
        .unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.records[1].observation(), Some(0.18));
        assert_eq!(inputs.records[0].pt, 0.0);
    }
}
