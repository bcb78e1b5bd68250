use serde::Serialize;

use crate::enkf::UpdateClamps;
use crate::richards::Diagnostics;
use crate::soil_hydra::HydraulicParams;

// State and fluxes of one ensemble member at the end of a day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberOutput {
    pub theta: Vec<f64>, // Moisture profile, top to bottom [v/v]
    pub diagnostics: Diagnostics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<HydraulicParams>, // Only reported by ensemble runs
}

/// One day of model output, handed to whatever persists the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyOutput {
    pub year: i32,
    pub doy: u32,
    pub members: Vec<MemberOutput>,
    pub assimilated: bool,
    pub update_clamps: UpdateClamps, // Zero unless an update happened
}

impl DailyOutput {
    pub fn mean_theta(&self) -> Vec<f64> {
        let Some(first) = self.members.first() else {
            return Vec::new();
        };
        let count = self.members.len() as f64;
        (0..first.theta.len())
            .map(|i| self.members.iter().map(|m| m.theta[i]).sum::<f64>() / count)
            .collect()
    }

    pub fn mean_recharge(&self) -> f64 {
        self.mean_of(|d| d.recharge)
    }

    pub fn mean_aet(&self) -> f64 {
        self.mean_of(Diagnostics::aet)
    }

    fn mean_of(&self, f: impl Fn(&Diagnostics) -> f64) -> f64 {
        if self.members.is_empty() {
            return 0.0;
        }
        self.members.iter().map(|m| f(&m.diagnostics)).sum::<f64>() / self.members.len() as f64
    }
}

// Logs 25/50/75/100 % milestones of a run
pub(crate) struct Progress {
    total: usize,
    next_quarter: usize,
}

impl Progress {
    pub(crate) fn new(total: usize) -> Self {
        Progress {
            total,
            next_quarter: 1,
        }
    }

    pub(crate) fn update(&mut self, day: usize) {
        while self.next_quarter <= 4 && (day + 1) * 4 >= self.next_quarter * self.total {
            log::info!("{} % completed", self.next_quarter * 25);
            self.next_quarter += 1;
        }
    }
}
