#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Weighted flood risk model.
//!
//! Combines five normalized signals into a score in `[0, 1]`:
//!
//! ```text
//! score = w_rain * min(rainfall / ceiling, 1)
//!       + w_recur * recurrence_rate
//!       + w_hot * hotspot_persistence
//!       + w_drain * drainage_stress
//!       + w_pop * population_exposure
//! ```
//!
//! and maps the score onto a [`RiskLevel`]. Everything here is pure;
//! callers fetch the inputs and persist the outputs.

use flood_map_config::{RiskConfig, RiskWeights};
use flood_map_flood_models::{RiskLevel, Zone};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scores at or above this are [`RiskLevel::High`].
pub const HIGH_THRESHOLD: f64 = 0.6;

/// Scores at or above this (and below [`HIGH_THRESHOLD`]) are
/// [`RiskLevel::Medium`].
pub const MEDIUM_THRESHOLD: f64 = 0.3;

/// Smallest accepted rainfall multiplier for simulation.
pub const MIN_RAINFALL_MULTIPLIER: f64 = 0.1;

/// Largest accepted rainfall multiplier for simulation.
pub const MAX_RAINFALL_MULTIPLIER: f64 = 10.0;

/// Errors from risk computations.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RiskError {
    /// Simulation multiplier outside `[0.1, 10]` or not finite.
    #[error("Rainfall multiplier must be between 0.1 and 10, got {value}")]
    InvalidMultiplier {
        /// The rejected multiplier.
        value: f64,
    },
}

/// The five signals that feed a score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskInputs {
    /// Hourly-equivalent rainfall in mm (not normalized).
    pub rainfall_mm: f64,
    /// Normalized report recurrence in `[0, 1]`.
    pub recurrence_rate: f64,
    /// Normalized hotspot persistence in `[0, 1]`.
    pub hotspot_persistence: f64,
    /// Normalized drainage stress in `[0, 1]`.
    pub drainage_stress: f64,
    /// Normalized population exposure in `[0, 1]`.
    pub population_exposure: f64,
}

/// A score with its level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Score in `[0, 1]`.
    pub score: f64,
    /// Level derived from the score.
    pub level: RiskLevel,
}

/// Maps a score to a level. Both boundaries are inclusive-lower.
#[must_use]
pub fn risk_level(score: f64) -> RiskLevel {
    if score >= HIGH_THRESHOLD {
        RiskLevel::High
    } else if score >= MEDIUM_THRESHOLD {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Checks a simulation multiplier.
///
/// # Errors
///
/// Returns [`RiskError::InvalidMultiplier`] if the value is not finite or
/// lies outside `[0.1, 10]`. Values are never clamped.
pub fn validate_multiplier(multiplier: f64) -> Result<f64, RiskError> {
    if multiplier.is_finite()
        && (MIN_RAINFALL_MULTIPLIER..=MAX_RAINFALL_MULTIPLIER).contains(&multiplier)
    {
        Ok(multiplier)
    } else {
        Err(RiskError::InvalidMultiplier { value: multiplier })
    }
}

/// The configured risk model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskModel {
    weights: RiskWeights,
    rainfall_ceiling_mm: f64,
    recurrence_saturation: f64,
    hotspot_saturation: f64,
}

impl Default for RiskModel {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            rainfall_ceiling_mm: 50.0,
            recurrence_saturation: 10.0,
            hotspot_saturation: 5.0,
        }
    }
}

impl RiskModel {
    /// Builds a model from validated configuration.
    #[must_use]
    pub const fn from_config(config: &RiskConfig) -> Self {
        Self {
            weights: config.weights,
            rainfall_ceiling_mm: config.rainfall_ceiling_mm,
            recurrence_saturation: config.recurrence_saturation,
            hotspot_saturation: config.hotspot_saturation,
        }
    }

    /// The weights in use.
    #[must_use]
    pub const fn weights(&self) -> &RiskWeights {
        &self.weights
    }

    /// Rainfall divided by the ceiling, clamped to `[0, 1]`.
    #[must_use]
    pub fn normalize_rainfall(&self, rainfall_mm: f64) -> f64 {
        (rainfall_mm / self.rainfall_ceiling_mm).clamp(0.0, 1.0)
    }

    /// `min(reports_in_window / saturation, 1)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn recurrence_rate(&self, reports_in_window: u64) -> f64 {
        (reports_in_window as f64 / self.recurrence_saturation).min(1.0)
    }

    /// `min(hotspot_count / saturation, 1)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hotspot_persistence(&self, hotspot_count: u64) -> f64 {
        (hotspot_count as f64 / self.hotspot_saturation).min(1.0)
    }

    /// Computes the weighted score, clamped to `[0, 1]`, and its level.
    #[must_use]
    pub fn score(&self, inputs: &RiskInputs) -> RiskAssessment {
        let w = &self.weights;
        let raw = w.rainfall * self.normalize_rainfall(inputs.rainfall_mm)
            + w.recurrence * inputs.recurrence_rate
            + w.hotspot * inputs.hotspot_persistence
            + w.drainage * inputs.drainage_stress
            + w.population * inputs.population_exposure;

        let score = raw.clamp(0.0, 1.0);

        RiskAssessment {
            score,
            level: risk_level(score),
        }
    }

    /// Scores a zone as if its last rainfall were multiplied by
    /// `rainfall_multiplier`, holding drainage and population fixed.
    ///
    /// Reads the zone only; nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`RiskError::InvalidMultiplier`] for multipliers outside
    /// `[0.1, 10]`.
    pub fn simulate(
        &self,
        zone: &Zone,
        rainfall_multiplier: f64,
        recurrence_rate: f64,
        hotspot_persistence: f64,
    ) -> Result<RiskAssessment, RiskError> {
        let multiplier = validate_multiplier(rainfall_multiplier)?;

        Ok(self.score(&RiskInputs {
            rainfall_mm: zone.last_rainfall_mm * multiplier,
            recurrence_rate,
            hotspot_persistence,
            drainage_stress: zone.drainage_stress,
            population_exposure: zone.population_exposure,
        }))
    }
}
