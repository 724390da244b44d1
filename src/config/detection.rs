//! Detection configuration record
//!
//! The single piece of durable state. Field names and enum tags match the
//! record format the overlay renderer and the state file both use.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::constants::{blur, detection};

/// Detection threshold tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

/// Effect variant rendered over matched regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlurType {
    Gaussian,
    Pixelate,
    BlackBar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Whether detection + overlay should be running
    #[serde(rename = "isActive")]
    pub active: bool,
    pub sensitivity: Sensitivity,
    /// Effect strength, always within [MIN_INTENSITY, MAX_INTENSITY]
    #[serde(rename = "blurIntensity")]
    pub blur_intensity: u8,
    #[serde(rename = "blurType")]
    pub blur_type: BlurType,
    /// Selects the slower polling tier
    #[serde(rename = "batteryOptimization")]
    pub battery_optimization: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            active: false,
            sensitivity: Sensitivity::Medium,
            blur_intensity: blur::DEFAULT_INTENSITY,
            blur_type: BlurType::Gaussian,
            battery_optimization: false,
        }
    }
}

/// Rejected setting edit. Raised before anything is mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown setting '{0}'")]
    UnknownField(String),

    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },
}

/// Clamp a raw intensity into the allowed domain
pub fn clamp_intensity(raw: i64) -> u8 {
    raw.clamp(blur::MIN_INTENSITY as i64, blur::MAX_INTENSITY as i64) as u8
}

/// Polling interval for the given power mode
pub fn interval_for(battery_optimization: bool) -> Duration {
    if battery_optimization {
        Duration::from_millis(detection::BATTERY_SAVER_INTERVAL_MS)
    } else {
        Duration::from_millis(detection::INTERVAL_MS)
    }
}

impl DetectionConfig {
    pub fn interval(&self) -> Duration {
        interval_for(self.battery_optimization)
    }

    /// Force stored values back into their domains
    /// Called on every record read from storage
    pub fn normalized(mut self) -> Self {
        let clamped = clamp_intensity(self.blur_intensity as i64);
        if clamped != self.blur_intensity {
            warn!(blur_intensity = self.blur_intensity, using = clamped, "Stored blur intensity out of range, clamping");
            self.blur_intensity = clamped;
        }
        self
    }

    /// Apply an edit, returning the delta that actually went into the record
    pub fn apply(&mut self, change: SettingChange) -> OverlayPatch {
        let mut patch = OverlayPatch::default();
        match change {
            SettingChange::Sensitivity(s) => {
                self.sensitivity = s;
                patch.sensitivity = Some(s);
            }
            SettingChange::BlurIntensity(raw) => {
                self.blur_intensity = clamp_intensity(raw);
                patch.blur_intensity = Some(self.blur_intensity);
            }
            SettingChange::BlurType(t) => {
                self.blur_type = t;
                patch.blur_type = Some(t);
            }
            SettingChange::BatteryOptimization(on) => {
                self.battery_optimization = on;
                patch.battery_optimization = Some(on);
            }
        }
        patch
    }
}

impl FromStr for Sensitivity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(ValidationError::InvalidValue { field: "sensitivity", value: s.to_string() }),
        }
    }
}

impl FromStr for BlurType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gaussian" => Ok(Self::Gaussian),
            "pixelate" => Ok(Self::Pixelate),
            "blackbar" | "black_bar" | "black-bar" => Ok(Self::BlackBar),
            _ => Err(ValidationError::InvalidValue { field: "blurType", value: s.to_string() }),
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

impl fmt::Display for BlurType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gaussian => "gaussian",
            Self::Pixelate => "pixelate",
            Self::BlackBar => "blackbar",
        })
    }
}

/// A single user edit. `active` is not editable here; it only moves
/// through activation/deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingChange {
    Sensitivity(Sensitivity),
    /// Raw value, clamped when applied
    BlurIntensity(i64),
    BlurType(BlurType),
    BatteryOptimization(bool),
}

impl SettingChange {
    /// Build an edit from the primitive (field, value) pair a UI sends
    pub fn parse(field: &str, value: &str) -> Result<Self, ValidationError> {
        let value = value.trim();
        match field {
            "sensitivity" => Ok(Self::Sensitivity(value.parse()?)),
            "blurIntensity" | "blur_intensity" | "intensity" => value
                .parse::<i64>()
                .map(Self::BlurIntensity)
                .map_err(|_| ValidationError::InvalidValue { field: "blurIntensity", value: value.to_string() }),
            "blurType" | "blur_type" | "type" => Ok(Self::BlurType(value.parse()?)),
            "batteryOptimization" | "battery_optimization" | "battery" => match value {
                "true" | "on" | "1" => Ok(Self::BatteryOptimization(true)),
                "false" | "off" | "0" => Ok(Self::BatteryOptimization(false)),
                _ => Err(ValidationError::InvalidValue { field: "batteryOptimization", value: value.to_string() }),
            },
            other => Err(ValidationError::UnknownField(other.to_string())),
        }
    }

    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Sensitivity(_) => "sensitivity",
            Self::BlurIntensity(_) => "blurIntensity",
            Self::BlurType(_) => "blurType",
            Self::BatteryOptimization(_) => "batteryOptimization",
        }
    }
}

/// Changed fields only, sent to a running overlay surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<Sensitivity>,
    #[serde(rename = "blurIntensity", default, skip_serializing_if = "Option::is_none")]
    pub blur_intensity: Option<u8>,
    #[serde(rename = "blurType", default, skip_serializing_if = "Option::is_none")]
    pub blur_type: Option<BlurType>,
    #[serde(rename = "batteryOptimization", default, skip_serializing_if = "Option::is_none")]
    pub battery_optimization: Option<bool>,
}
