//! Recent-weather providers. The Ecowitt fetcher caches station history and
//! degrades to standard conditions on any failure; the simulator produces
//! bounded synthetic values from a seeded RNG for development runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{StandardConditions, WeatherApiConfig};

/// API limitation: history queries cover at most one week.
pub const WINDOW_DAYS_LIMIT: u32 = 7;

/// Simulated conditions refresh daily.
const SIMULATOR_REFRESH_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Aggregated weather since the last irrigation window.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionsSnapshot {
    /// kWh/m² per day over the window.
    pub solar_total: f64,
    /// Average over the window.
    pub temperature_celsius: f64,
    /// Total over the window.
    pub rainfall_mm: f64,
    pub retrieved_at: DateTime<Utc>,
}

impl ConditionsSnapshot {
    /// The reference conditions, stamped now. Every degraded path lands here.
    pub fn standard(standard: &StandardConditions) -> Self {
        Self {
            solar_total: standard.solar_total,
            temperature_celsius: standard.temperature_celsius,
            rainfall_mm: standard.rainfall_mm,
            retrieved_at: Utc::now(),
        }
    }
}

fn clamp_window(window_days: u32) -> u32 {
    if window_days > WINDOW_DAYS_LIMIT {
        warn!(
            window_days,
            limit = WINDOW_DAYS_LIMIT,
            "weather window exceeds API limit, clamping"
        );
        WINDOW_DAYS_LIMIT
    } else {
        window_days.max(1)
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Supplies "recent weather since last irrigation" on demand.
///
/// Implementations never fail: any fetch problem degrades to standard
/// conditions and is logged, so callers can treat the result as total.
#[async_trait]
pub trait ConditionsProvider: Send + Sync {
    async fn recent(&self, window_days: u32) -> ConditionsSnapshot;

    /// Refresh any internal cache; periodic background task hook.
    async fn refresh(&self);
}

// ---------------------------------------------------------------------------
// Fixed provider (API disabled, tests)
// ---------------------------------------------------------------------------

/// Always reports the same conditions. Used when the weather API is
/// disabled, and as a deterministic stand-in for tests.
pub struct FixedConditions {
    solar_total: f64,
    temperature_celsius: f64,
    rainfall_mm: f64,
}

impl FixedConditions {
    pub fn new(solar_total: f64, temperature_celsius: f64, rainfall_mm: f64) -> Self {
        Self {
            solar_total,
            temperature_celsius,
            rainfall_mm,
        }
    }

    pub fn standard(standard: &StandardConditions) -> Self {
        Self::new(
            standard.solar_total,
            standard.temperature_celsius,
            standard.rainfall_mm,
        )
    }
}

#[async_trait]
impl ConditionsProvider for FixedConditions {
    async fn recent(&self, _window_days: u32) -> ConditionsSnapshot {
        ConditionsSnapshot {
            solar_total: self.solar_total,
            temperature_celsius: self.temperature_celsius,
            rainfall_mm: self.rainfall_mm,
            retrieved_at: Utc::now(),
        }
    }

    async fn refresh(&self) {}
}

// ---------------------------------------------------------------------------
// Simulator (development)
// ---------------------------------------------------------------------------

/// Deterministically seeded synthetic weather, regenerated daily. Bounds
/// match a temperate growing season: 13–28 °C, 0–7 mm rain, 4–8 kWh/m².
pub struct SimulatedConditions {
    inner: std::sync::Mutex<SimulatorInner>,
}

struct SimulatorInner {
    rng: StdRng,
    current: Option<ConditionsSnapshot>,
}

impl SimulatedConditions {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: std::sync::Mutex::new(SimulatorInner {
                rng: StdRng::seed_from_u64(seed),
                current: None,
            }),
        }
    }

    fn generate(rng: &mut StdRng) -> ConditionsSnapshot {
        ConditionsSnapshot {
            temperature_celsius: rng.gen_range(13.0..28.0),
            rainfall_mm: rng.gen_range(0.0..7.0),
            solar_total: rng.gen_range(4.0..8.0),
            retrieved_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ConditionsProvider for SimulatedConditions {
    async fn recent(&self, _window_days: u32) -> ConditionsSnapshot {
        let mut inner = self.inner.lock().expect("simulator lock");
        let expired = match &inner.current {
            Some(snap) => {
                Utc::now() - snap.retrieved_at > ChronoDuration::hours(SIMULATOR_REFRESH_HOURS)
            }
            None => true,
        };
        if expired {
            let snap = Self::generate(&mut inner.rng);
            debug!(
                temperature = snap.temperature_celsius,
                rain = snap.rainfall_mm,
                solar = snap.solar_total,
                "generated simulated conditions"
            );
            inner.current = Some(snap);
        }
        inner.current.clone().expect("simulated snapshot present")
    }

    async fn refresh(&self) {
        let mut inner = self.inner.lock().expect("simulator lock");
        let snap = Self::generate(&mut inner.rng);
        inner.current = Some(snap);
    }
}

// ---------------------------------------------------------------------------
// Ecowitt history fetcher (production)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<HistoryData>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryData {
    #[serde(default)]
    temperature: Series,
    #[serde(default)]
    rainfall: Series,
    #[serde(default)]
    solar: Series,
}

/// The API reports numeric samples as strings keyed by unix timestamp.
#[derive(Debug, Default, Deserialize)]
struct Series {
    #[serde(default)]
    list: BTreeMap<String, String>,
}

impl Series {
    /// Parse into (unix ts → value), dropping malformed entries.
    fn samples(&self) -> BTreeMap<i64, f64> {
        self.list
            .iter()
            .filter_map(|(ts, v)| Some((ts.parse::<i64>().ok()?, v.parse::<f64>().ok()?)))
            .collect()
    }
}

struct CachedHistory {
    temperatures: BTreeMap<i64, f64>,
    rainfall: BTreeMap<i64, f64>,
    solar: BTreeMap<i64, f64>,
    fetched_at: DateTime<Utc>,
}

/// Fetches station history over HTTP, caches it for the configured TTL,
/// and falls back to standard conditions on any failure.
pub struct EcowittConditions {
    api: WeatherApiConfig,
    standard: StandardConditions,
    client: reqwest::Client,
    cache: tokio::sync::Mutex<Option<CachedHistory>>,
}

impl EcowittConditions {
    pub fn new(api: WeatherApiConfig, standard: StandardConditions) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            api,
            standard,
            client,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    async fn fetch_history(&self, window_days: u32) -> anyhow::Result<CachedHistory> {
        let end = Utc::now();
        let start = end - ChronoDuration::days(window_days as i64);

        let url = format!("{}/api/v3/device/history", self.api.endpoint);
        let start_date = start.format("%Y-%m-%d %H:%M:%S").to_string();
        let end_date = end.format("%Y-%m-%d %H:%M:%S").to_string();
        let response: HistoryResponse = self
            .client
            .get(&url)
            .query(&[
                ("application_key", self.api.application_key.as_str()),
                ("api_key", self.api.api_key.as_str()),
                ("mac", self.api.mac.as_str()),
                ("start_date", start_date.as_str()),
                ("end_date", end_date.as_str()),
                ("call_back", "outdoor.temperature,rainfall.daily,solar_and_uvi.solar"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.code != 0 {
            anyhow::bail!("weather API error {}: {}", response.code, response.msg);
        }
        let data = response.data.unwrap_or_default();

        Ok(CachedHistory {
            temperatures: data.temperature.samples(),
            rainfall: data.rainfall.samples(),
            solar: data.solar.samples(),
            fetched_at: Utc::now(),
        })
    }

    fn aggregate(&self, history: &CachedHistory, window_days: u32) -> ConditionsSnapshot {
        let window_start = (Utc::now() - ChronoDuration::days(window_days as i64)).timestamp();

        let temperature = average_since(&history.temperatures, window_start)
            .unwrap_or(self.standard.temperature_celsius);
        let rainfall =
            cumulative_delta(&history.rainfall, window_start).unwrap_or(self.standard.rainfall_mm);
        let solar = daily_solar_total(&history.solar, window_start, window_days)
            .unwrap_or(self.standard.solar_total);

        ConditionsSnapshot {
            solar_total: solar,
            temperature_celsius: temperature,
            rainfall_mm: rainfall,
            retrieved_at: history.fetched_at,
        }
    }
}

#[async_trait]
impl ConditionsProvider for EcowittConditions {
    async fn recent(&self, window_days: u32) -> ConditionsSnapshot {
        let window_days = clamp_window(window_days);
        let ttl = ChronoDuration::seconds(self.api.cache_ttl_secs as i64);

        let mut cache = self.cache.lock().await;
        let fresh = matches!(&*cache, Some(h) if Utc::now() - h.fetched_at < ttl);
        if !fresh {
            match self.fetch_history(WINDOW_DAYS_LIMIT).await {
                Ok(history) => {
                    debug!(
                        temperatures = history.temperatures.len(),
                        rainfall = history.rainfall.len(),
                        solar = history.solar.len(),
                        "weather history cache updated"
                    );
                    *cache = Some(history);
                }
                Err(e) => {
                    warn!("weather fetch failed, using standard conditions: {e:#}");
                    // A stale cache beats the standard fallback.
                    if cache.is_none() {
                        return ConditionsSnapshot::standard(&self.standard);
                    }
                }
            }
        }

        match &*cache {
            Some(history) => self.aggregate(history, window_days),
            None => ConditionsSnapshot::standard(&self.standard),
        }
    }

    async fn refresh(&self) {
        match self.fetch_history(WINDOW_DAYS_LIMIT).await {
            Ok(history) => {
                let mut cache = self.cache.lock().await;
                *cache = Some(history);
            }
            Err(e) => warn!("weather cache refresh failed: {e:#}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation helpers
// ---------------------------------------------------------------------------

/// Mean of samples at or after `window_start`. None when empty.
fn average_since(samples: &BTreeMap<i64, f64>, window_start: i64) -> Option<f64> {
    let relevant: Vec<f64> = samples
        .range(window_start..)
        .map(|(_, &v)| v)
        .collect();
    if relevant.is_empty() {
        return None;
    }
    Some(relevant.iter().sum::<f64>() / relevant.len() as f64)
}

/// Total accumulated over the window for a cumulative counter series:
/// latest value minus the value at the window start.
fn cumulative_delta(samples: &BTreeMap<i64, f64>, window_start: i64) -> Option<f64> {
    let (_, &last) = samples.iter().next_back()?;
    let (_, &first) = samples.range(window_start..).next()?;
    Some((last - first).max(0.0))
}

/// Daily solar total in kWh/m²: sum of W/m² samples in the window, averaged
/// per day and converted from watts.
fn daily_solar_total(
    samples: &BTreeMap<i64, f64>,
    window_start: i64,
    window_days: u32,
) -> Option<f64> {
    let relevant: Vec<f64> = samples
        .range(window_start..)
        .map(|(_, &v)| v)
        .collect();
    if relevant.is_empty() {
        return None;
    }
    Some(relevant.iter().sum::<f64>() / window_days.max(1) as f64 / 1000.0)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> StandardConditions {
        StandardConditions {
            solar_total: 5.0,
            temperature_celsius: 20.0,
            rainfall_mm: 0.0,
        }
    }

    // -- FixedConditions ----------------------------------------------------

    #[tokio::test]
    async fn fixed_provider_reports_configured_values() {
        let provider = FixedConditions::new(6.0, 22.5, 1.2);
        let snap = provider.recent(3).await;
        assert_eq!(snap.solar_total, 6.0);
        assert_eq!(snap.temperature_celsius, 22.5);
        assert_eq!(snap.rainfall_mm, 1.2);
    }

    #[tokio::test]
    async fn fixed_standard_matches_reference() {
        let provider = FixedConditions::standard(&standard());
        let snap = provider.recent(7).await;
        assert_eq!(snap.temperature_celsius, 20.0);
        assert_eq!(snap.rainfall_mm, 0.0);
    }

    // -- SimulatedConditions ------------------------------------------------

    #[tokio::test]
    async fn simulator_is_deterministic_for_a_seed() {
        let a = SimulatedConditions::new(42).recent(3).await;
        let b = SimulatedConditions::new(42).recent(3).await;
        assert_eq!(a.temperature_celsius, b.temperature_celsius);
        assert_eq!(a.rainfall_mm, b.rainfall_mm);
        assert_eq!(a.solar_total, b.solar_total);
    }

    #[tokio::test]
    async fn simulator_values_are_bounded() {
        for seed in 0..20 {
            let snap = SimulatedConditions::new(seed).recent(3).await;
            assert!((13.0..28.0).contains(&snap.temperature_celsius));
            assert!((0.0..7.0).contains(&snap.rainfall_mm));
            assert!((4.0..8.0).contains(&snap.solar_total));
        }
    }

    #[tokio::test]
    async fn simulator_caches_until_refresh() {
        let provider = SimulatedConditions::new(7);
        let first = provider.recent(3).await;
        let second = provider.recent(3).await;
        assert_eq!(first, second);

        provider.refresh().await;
        let third = provider.recent(3).await;
        // Regeneration advances the RNG; values change.
        assert_ne!(first.temperature_celsius, third.temperature_celsius);
    }

    // -- window clamp -------------------------------------------------------

    #[test]
    fn window_clamped_to_api_limit() {
        assert_eq!(clamp_window(3), 3);
        assert_eq!(clamp_window(7), 7);
        assert_eq!(clamp_window(30), WINDOW_DAYS_LIMIT);
        assert_eq!(clamp_window(0), 1);
    }

    // -- aggregation --------------------------------------------------------

    fn series(entries: &[(i64, f64)]) -> BTreeMap<i64, f64> {
        entries.iter().copied().collect()
    }

    #[test]
    fn average_ignores_samples_before_window() {
        let samples = series(&[(100, 10.0), (200, 20.0), (300, 30.0)]);
        assert_eq!(average_since(&samples, 150), Some(25.0));
        assert_eq!(average_since(&samples, 0), Some(20.0));
        assert_eq!(average_since(&samples, 400), None);
    }

    #[test]
    fn cumulative_delta_from_window_start() {
        // Cumulative rain counter: 2 mm before the window, 9 mm at the end.
        let samples = series(&[(100, 2.0), (200, 4.0), (300, 9.0)]);
        assert_eq!(cumulative_delta(&samples, 150), Some(5.0));
        assert_eq!(cumulative_delta(&samples, 0), Some(7.0));
    }

    #[test]
    fn cumulative_delta_never_negative() {
        // Counter reset mid-window must not yield negative rainfall.
        let samples = series(&[(100, 8.0), (200, 1.0)]);
        assert_eq!(cumulative_delta(&samples, 150), Some(0.0));
    }

    #[test]
    fn solar_total_converts_watts_per_day() {
        // 3 samples of 1000 W/m² over 2 days → 1.5 kWh/m² per day.
        let samples = series(&[(100, 1000.0), (200, 1000.0), (300, 1000.0)]);
        assert_eq!(daily_solar_total(&samples, 0, 2), Some(1.5));
        assert_eq!(daily_solar_total(&samples, 400, 2), None);
    }

    #[test]
    fn series_parsing_drops_malformed_entries() {
        let s = Series {
            list: [
                ("100".to_string(), "21.5".to_string()),
                ("bad".to_string(), "22.0".to_string()),
                ("200".to_string(), "-".to_string()),
            ]
            .into_iter()
            .collect(),
        };
        let samples = s.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[&100], 21.5);
    }

    // -- fetch fallback -----------------------------------------------------

    #[tokio::test]
    async fn fetch_failure_degrades_to_standard_conditions() {
        let api = WeatherApiConfig {
            enabled: true,
            endpoint: "http://127.0.0.1:9".to_string(), // nothing listens here
            application_key: "k".to_string(),
            api_key: "k".to_string(),
            mac: "00:00:00:00:00:00".to_string(),
            cache_ttl_secs: 60,
        };
        let provider = EcowittConditions::new(api, standard());
        let snap = provider.recent(3).await;
        assert_eq!(snap.temperature_celsius, 20.0);
        assert_eq!(snap.solar_total, 5.0);
        assert_eq!(snap.rainfall_mm, 0.0);
    }
}
