use rand::Rng;

use super::{DetectionError, Detector};
use crate::config::{DetectionConfig, Sensitivity};

/// Placeholder detector: random matches, more often at higher sensitivity
pub struct SimulatedDetector;

impl SimulatedDetector {
    pub fn match_probability(sensitivity: Sensitivity) -> f64 {
        match sensitivity {
            Sensitivity::Low => 0.15,
            Sensitivity::Medium => 0.30,
            Sensitivity::High => 0.45,
        }
    }
}

impl Detector for SimulatedDetector {
    fn poll(&self, config: &DetectionConfig) -> Result<bool, DetectionError> {
        Ok(rand::thread_rng().gen_bool(Self::match_probability(config.sensitivity)))
    }
}
