use thiserror::Error;

pub type Result<T> = std::result::Result<T, RichardsError>;

// Fatal errors. Domain clamps (Se, theta, missing observations) are not errors,
// they are reported through the daily diagnostics instead.
#[derive(Error, Debug)]
pub enum RichardsError {
    #[error("invalid hydraulic parameter {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("invalid bounds for {name}: min {min} > max {max}")]
    InvalidBounds { name: String, min: f64, max: f64 },

    #[error("layer mismatch for {what}: expected {expected} values, got {actual}")]
    LayerMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid forcing on day {day}: {field} = {value}")]
    InvalidForcing {
        day: usize,
        field: &'static str,
        value: f64,
    },

    #[error("tridiagonal system is near-singular at row {row} (pivot {pivot:e})")]
    SingularSystem { row: usize, pivot: f64 },

    #[error(
        "moisture in layer {layer} left the physical range at sub-step {substep} of {substeps}, \
         even after refining the day"
    )]
    NumericalInstability {
        layer: usize,
        substep: usize,
        substeps: usize,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("simulation aborted on day {day}, ensemble member {member}")]
    Aborted {
        day: usize,
        member: usize,
        #[source]
        source: Box<RichardsError>,
    },
}

impl RichardsError {
    pub fn config(message: impl Into<String>) -> Self {
        RichardsError::Config(message.into())
    }

    /// Attach the day and ensemble member a fatal error happened on.
    pub(crate) fn at(self, day: usize, member: usize) -> Self {
        RichardsError::Aborted {
            day,
            member,
            source: Box::new(self),
        }
    }
}

impl From<toml::de::Error> for RichardsError {
    fn from(err: toml::de::Error) -> Self {
        RichardsError::Config(err.to_string())
    }
}
