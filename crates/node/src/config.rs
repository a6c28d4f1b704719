//! TOML config loading and validation: global sections (reference weather,
//! correction factors, limits, automation, weather API) plus one
//! `[[circuits]]` table per irrigation zone.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::round3;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub standard_conditions: StandardConditions,
    pub correction_factors: CorrectionFactors,
    pub limits: IrrigationLimits,
    pub automation: AutomationConfig,
    #[serde(default)]
    pub weather_api: WeatherApiConfig,
    #[serde(default)]
    pub circuits: Vec<CircuitConfig>,
}

/// Reference conditions the weather adjustment is computed against.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StandardConditions {
    /// kWh/m² per day.
    pub solar_total: f64,
    pub temperature_celsius: f64,
    pub rainfall_mm: f64,
}

/// Per-quantity correction factors; applied to deltas from standard
/// conditions. Global and per-circuit factors are summed.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CorrectionFactors {
    #[serde(default)]
    pub solar: f64,
    #[serde(default)]
    pub rain: f64,
    #[serde(default)]
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IrrigationLimits {
    /// Lower clamp as percent of the base volume. 0 disables the floor.
    pub min_percent: f64,
    /// Upper clamp as percent of the base volume.
    pub max_percent: f64,
    /// L/h through the main valve. Parsed for compatibility; flow-capped
    /// batching is an extension point, not implemented.
    #[serde(default)]
    pub main_valve_max_flow: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    pub auto_enabled: bool,
    pub scheduled_hour: u8,
    pub scheduled_minute: u8,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub use_weather_simulator: bool,
    #[serde(default)]
    pub max_flow_monitoring: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeatherApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub application_key: String,
    #[serde(default)]
    pub api_key: String,
    /// Station MAC address, as required by the Ecowitt history API.
    #[serde(default)]
    pub mac: String,
    /// Cache TTL; also the interval of the background cache-refresh task.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_cache_ttl() -> u64 {
    1800
}

// ---------------------------------------------------------------------------
// Circuit configuration
// ---------------------------------------------------------------------------

/// A dripper line item: `count` emitters at `flow_lph` liters per hour.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Dripper {
    pub flow_lph: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitConfig {
    pub id: u32,
    pub name: String,
    pub relay_pin: u8,
    pub enabled: bool,
    /// Even-area mode: target is `target_mm` of water column over `area_m2`.
    /// Otherwise the target is `liters_per_minimum_dripper`.
    pub even_area_mode: bool,
    #[serde(default)]
    pub target_mm: Option<f64>,
    #[serde(default)]
    pub area_m2: Option<f64>,
    #[serde(default)]
    pub liters_per_minimum_dripper: Option<f64>,
    /// Whole days between irrigations.
    pub interval_days: u32,
    #[serde(default)]
    pub drippers: Vec<Dripper>,
    #[serde(default)]
    pub correction: CorrectionFactors,
}

impl CircuitConfig {
    /// Total emitter consumption in L/h.
    pub fn flow_lph(&self) -> f64 {
        self.drippers
            .iter()
            .map(|d| (d.flow_lph * d.count) as f64)
            .sum()
    }

    /// Flow rate of the smallest dripper in L/h.
    pub fn min_dripper_flow(&self) -> Option<u32> {
        self.drippers.iter().map(|d| d.flow_lph).min()
    }

    /// Basal volume in liters, before any weather adjustment.
    ///
    /// Even-area mode: `target_mm × area_m2` (mm × m² = L). Dripper mode:
    /// the minimum dripper delivers `liters_per_minimum_dripper`, every
    /// other emitter runs for the same duration, so the total scales by
    /// `flow / min_flow`.
    pub fn base_volume(&self) -> f64 {
        let volume = if self.even_area_mode {
            self.target_mm.unwrap_or(0.0) * self.area_m2.unwrap_or(0.0)
        } else {
            let min_flow = self.min_dripper_flow().unwrap_or(0) as f64;
            if min_flow <= 0.0 {
                return 0.0;
            }
            self.liters_per_minimum_dripper.unwrap_or(0.0) * self.flow_lph() / min_flow
        };
        round3(volume)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        let fail = |reason: &str| {
            Err(ConfigError::InvalidCircuit {
                id: self.id,
                reason: reason.to_string(),
            })
        };

        if self.drippers.is_empty() {
            return fail("dripper inventory is empty");
        }
        if self.drippers.iter().any(|d| d.flow_lph == 0) {
            return fail("dripper flow rates must be positive");
        }
        if self.drippers.iter().any(|d| d.count == 0) {
            return fail("dripper counts must be positive");
        }
        if self.interval_days == 0 {
            return fail("interval_days must be at least 1");
        }

        if self.even_area_mode {
            match (self.target_mm, self.area_m2) {
                (Some(mm), Some(area)) if mm > 0.0 && area > 0.0 => {}
                _ => return fail("even-area mode requires positive target_mm and area_m2"),
            }
            if self.liters_per_minimum_dripper.is_some() {
                return fail("liters_per_minimum_dripper is not valid in even-area mode");
            }
        } else {
            match self.liters_per_minimum_dripper {
                Some(l) if l > 0.0 => {}
                _ => return fail("dripper mode requires positive liters_per_minimum_dripper"),
            }
            if self.target_mm.is_some() || self.area_m2.is_some() {
                return fail("target_mm/area_m2 are not valid in dripper mode");
            }
        }

        // Zero effective flow would make duration math meaningless.
        if self.flow_lph() <= 0.0 {
            return fail("effective flow is zero");
        }
        Ok(())
    }
}

impl NodeConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.min_percent < 0.0
            || limits.min_percent > 100.0
            || limits.max_percent < 100.0
        {
            return Err(ConfigError::InvalidLimits {
                min: limits.min_percent,
                max: limits.max_percent,
            });
        }

        let auto = &self.automation;
        if auto.scheduled_hour > 23 || auto.scheduled_minute > 59 {
            return Err(ConfigError::InvalidSchedule {
                hour: auto.scheduled_hour,
                minute: auto.scheduled_minute,
            });
        }

        let mut seen = std::collections::HashSet::new();
        for circuit in &self.circuits {
            if !seen.insert(circuit.id) {
                return Err(ConfigError::DuplicateCircuitId(circuit.id));
            }
            circuit.validate()?;
        }
        Ok(())
    }

    /// Largest configured irrigation interval; drives the weather lookback.
    pub fn max_interval_days(&self) -> u32 {
        self.circuits
            .iter()
            .map(|c| c.interval_days)
            .max()
            .unwrap_or(1)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<NodeConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: NodeConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> &'static str {
        r#"
[standard_conditions]
solar_total = 5.0
temperature_celsius = 20.0
rainfall_mm = 0.0

[correction_factors]
solar = 0.03
rain = -0.15
temperature = 0.02

[limits]
min_percent = 20.0
max_percent = 300.0

[automation]
auto_enabled = true
scheduled_hour = 6
scheduled_minute = 30
use_weather_simulator = true

[[circuits]]
id = 1
name = "Front beds"
relay_pin = 17
enabled = true
even_area_mode = true
target_mm = 5.0
area_m2 = 2.0
interval_days = 2

[[circuits.drippers]]
flow_lph = 10
count = 1
"#
    }

    fn parse(toml_str: &str) -> NodeConfig {
        toml::from_str(toml_str).unwrap()
    }

    // -- parsing ------------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let cfg = parse(base_toml());
        assert_eq!(cfg.circuits.len(), 1);
        assert_eq!(cfg.circuits[0].name, "Front beds");
        assert_eq!(cfg.automation.scheduled_hour, 6);
        assert!(cfg.automation.use_weather_simulator);
        assert_eq!(cfg.automation.environment, Environment::Development);
        assert!(!cfg.weather_api.enabled);
        assert_eq!(cfg.weather_api.cache_ttl_secs, 1800);
        cfg.validate().unwrap();
    }

    #[test]
    fn correction_factors_default_to_zero() {
        let cfg = parse(base_toml());
        let corr = cfg.circuits[0].correction;
        assert_eq!(corr.solar, 0.0);
        assert_eq!(corr.rain, 0.0);
        assert_eq!(corr.temperature, 0.0);
    }

    // -- derived values -----------------------------------------------------

    #[test]
    fn flow_sums_across_dripper_lines() {
        let mut cfg = parse(base_toml());
        cfg.circuits[0].drippers = vec![
            Dripper { flow_lph: 2, count: 4 },
            Dripper { flow_lph: 8, count: 1 },
        ];
        assert_eq!(cfg.circuits[0].flow_lph(), 16.0);
        assert_eq!(cfg.circuits[0].min_dripper_flow(), Some(2));
    }

    #[test]
    fn even_area_base_volume() {
        let cfg = parse(base_toml());
        // 5 mm over 2 m² = 10 L
        assert_eq!(cfg.circuits[0].base_volume(), 10.0);
    }

    #[test]
    fn dripper_mode_base_volume_scales_by_min_flow() {
        let mut cfg = parse(base_toml());
        let c = &mut cfg.circuits[0];
        c.even_area_mode = false;
        c.target_mm = None;
        c.area_m2 = None;
        c.liters_per_minimum_dripper = Some(3.0);
        c.drippers = vec![
            Dripper { flow_lph: 2, count: 1 },
            Dripper { flow_lph: 4, count: 1 },
        ];
        // min dripper gets 3 L over 1.5 h; total flow 6 L/h × 1.5 h = 9 L
        assert_eq!(cfg.circuits[0].base_volume(), 9.0);
        cfg.validate().unwrap();
    }

    // -- validation ---------------------------------------------------------

    #[test]
    fn empty_dripper_inventory_rejected() {
        let mut cfg = parse(base_toml());
        cfg.circuits[0].drippers.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidCircuit { id: 1, .. })
        ));
    }

    #[test]
    fn zero_flow_dripper_rejected() {
        let mut cfg = parse(base_toml());
        cfg.circuits[0].drippers = vec![Dripper { flow_lph: 0, count: 1 }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mixed_mode_fields_rejected() {
        let mut cfg = parse(base_toml());
        cfg.circuits[0].liters_per_minimum_dripper = Some(2.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dripper_mode_missing_target_rejected() {
        let mut cfg = parse(base_toml());
        let c = &mut cfg.circuits[0];
        c.even_area_mode = false;
        c.target_mm = None;
        c.area_m2 = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn limit_ordering_enforced() {
        let mut cfg = parse(base_toml());
        cfg.limits.min_percent = 120.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidLimits { .. })
        ));

        let mut cfg = parse(base_toml());
        cfg.limits.max_percent = 80.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn min_percent_zero_is_valid() {
        let mut cfg = parse(base_toml());
        cfg.limits.min_percent = 0.0;
        cfg.validate().unwrap();
    }

    #[test]
    fn schedule_bounds_enforced() {
        let mut cfg = parse(base_toml());
        cfg.automation.scheduled_hour = 24;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn duplicate_circuit_ids_rejected() {
        let mut cfg = parse(base_toml());
        let dup = cfg.circuits[0].clone();
        cfg.circuits.push(dup);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateCircuitId(1))
        ));
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = parse(base_toml());
        cfg.circuits[0].interval_days = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_interval_days_across_circuits() {
        let mut cfg = parse(base_toml());
        let mut second = cfg.circuits[0].clone();
        second.id = 2;
        second.interval_days = 5;
        cfg.circuits.push(second);
        assert_eq!(cfg.max_interval_days(), 5);
    }
}
