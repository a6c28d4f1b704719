//! Weather-based volume adjustment. A pure model: circuit base volume +
//! recent conditions + correction factors in, clamped target volume out.

use tracing::warn;

use crate::conditions::ConditionsSnapshot;
use crate::config::{CorrectionFactors, IrrigationLimits, StandardConditions};
use crate::types::round3;

// ---------------------------------------------------------------------------
// Model output
// ---------------------------------------------------------------------------

/// Full context of one volume computation.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeEstimate {
    pub base_volume: f64,
    /// Summed weather adjustment; the applied factor is `1 + total_adjustment`.
    pub total_adjustment: f64,
    pub adjusted_volume: f64,
    pub min_volume: f64,
    pub max_volume: f64,
    /// Volume after clamping; 0 when skipped.
    pub final_volume: f64,
    pub skip: bool,
}

// ---------------------------------------------------------------------------
// Model trait
// ---------------------------------------------------------------------------

/// Volume computation seam. Implementations must be deterministic and
/// side-effect-free.
pub trait VolumeModel: Send + Sync {
    fn compute(
        &self,
        base_volume: f64,
        conditions: &ConditionsSnapshot,
        standard: &StandardConditions,
        global_factors: &CorrectionFactors,
        local_factors: &CorrectionFactors,
        limits: &IrrigationLimits,
    ) -> VolumeEstimate;
}

// ---------------------------------------------------------------------------
// Weather-adjusted model
// ---------------------------------------------------------------------------

/// Adjusts the basal volume by deviations of recent weather from the
/// reference standard conditions:
///
/// ```text
/// factor = 1 + Σ over {solar, rain, temperature} of
///              (global_factor + local_factor) × (observed − standard)
/// ```
///
/// The adjusted volume is clamped to `[base × min%, base × max%]`. When the
/// floor is disabled (`min_percent = 0`) and the adjusted volume falls under
/// it, irrigation is skipped entirely.
#[derive(Debug, Default)]
pub struct WeatherAdjustedModel;

impl VolumeModel for WeatherAdjustedModel {
    fn compute(
        &self,
        base_volume: f64,
        conditions: &ConditionsSnapshot,
        standard: &StandardConditions,
        global_factors: &CorrectionFactors,
        local_factors: &CorrectionFactors,
        limits: &IrrigationLimits,
    ) -> VolumeEstimate {
        let base_volume = if base_volume < 0.0 {
            warn!(base_volume, "negative base volume, treating as 0");
            0.0
        } else {
            base_volume
        };

        let delta_solar = conditions.solar_total - standard.solar_total;
        let delta_rain = conditions.rainfall_mm - standard.rainfall_mm;
        let delta_temp = conditions.temperature_celsius - standard.temperature_celsius;

        let total_adjustment = delta_solar * (global_factors.solar + local_factors.solar)
            + delta_rain * (global_factors.rain + local_factors.rain)
            + delta_temp * (global_factors.temperature + local_factors.temperature);

        let adjusted_volume = round3(base_volume * (1.0 + total_adjustment));
        let min_volume = round3(base_volume * limits.min_percent / 100.0);
        let max_volume = round3(base_volume * limits.max_percent / 100.0);

        // With the floor disabled, dropping below it means no irrigation at
        // all; with a floor configured, the volume clamps up to it instead.
        let skip = adjusted_volume < min_volume && limits.min_percent == 0.0;

        let final_volume = if skip {
            0.0
        } else {
            adjusted_volume.clamp(min_volume, max_volume)
        };

        VolumeEstimate {
            base_volume,
            total_adjustment,
            adjusted_volume,
            min_volume,
            max_volume,
            final_volume,
            skip,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
