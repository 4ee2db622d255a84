//! Dynamic price feed: a pure strategy evaluator over `{now, horizon,
//! prices}`, plus an HTTP adapter that fetches and caches a day-ahead price
//! curve from a configurable endpoint.
//!
//! The evaluator (`decide_should_charge`) never touches the network itself —
//! it is handed whatever the adapter last fetched — so it can be unit tested
//! without a client and reused if the adapter is swapped for a different
//! vendor's feed.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Qualitative price bucket, as reported by feeds that classify prices
/// rather than (or in addition to) giving a raw number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceLevel {
    VeryCheap,
    Cheap,
    Normal,
    Expensive,
    VeryExpensive,
}

impl PriceLevel {
    pub fn from_str(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "VERY_CHEAP" => PriceLevel::VeryCheap,
            "CHEAP" => PriceLevel::Cheap,
            "EXPENSIVE" => PriceLevel::Expensive,
            "VERY_EXPENSIVE" => PriceLevel::VeryExpensive,
            _ => PriceLevel::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriceLevel::VeryCheap => "VERY_CHEAP",
            PriceLevel::Cheap => "CHEAP",
            PriceLevel::Normal => "NORMAL",
            PriceLevel::Expensive => "EXPENSIVE",
            PriceLevel::VeryExpensive => "VERY_EXPENSIVE",
        }
    }
}

/// A single price point on the curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub starts_at: String,
    pub total: f64,
    pub level: PriceLevel,
}

/// The data the evaluator needs: the current price and the rest of the
/// fetched horizon (which may or may not include `current`, implementations
/// should not assume either way).
#[derive(Debug, Clone, Default)]
pub struct PriceHorizon {
    pub current: Option<PricePoint>,
    pub upcoming: Vec<PricePoint>,
}

impl PriceHorizon {
    /// Cheapest total across `upcoming`, the basis for the "threshold" and
    /// "percentile" strategies.
    fn sorted_totals(&self) -> Vec<f64> {
        let mut totals: Vec<f64> = self.upcoming.iter().map(|p| p.total).collect();
        totals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        totals
    }

    /// The price at the given percentile (0.0 = cheapest, 1.0 = most
    /// expensive) of the horizon.
    pub fn percentile_threshold(&self, percentile: f64) -> Option<f64> {
        let totals = self.sorted_totals();
        if totals.is_empty() {
            return None;
        }
        let p = percentile.clamp(0.0, 1.0);
        let idx = ((totals.len() - 1) as f64 * p).round() as usize;
        totals.get(idx).copied()
    }

    fn cheapest(&self) -> Option<f64> {
        self.sorted_totals().first().copied()
    }
}

/// Evaluate whether charging should be enabled right now, per the
/// configured strategy. Pure function: no I/O, no clock reads beyond what is
/// already embedded in `horizon`.
pub fn decide_should_charge(cfg: &crate::config::PriceFeedConfig, horizon: &PriceHorizon) -> bool {
    match cfg.strategy.as_str() {
        "threshold" => {
            let Some(current) = horizon.current.as_ref() else {
                return false;
            };
            if cfg.max_price_total > 0.0 {
                current.total <= cfg.max_price_total
            } else if let Some(cheapest) = horizon.cheapest() {
                current.total <= cheapest * (1.0 + cfg.threshold_tolerance)
            } else {
                false
            }
        }
        "percentile" => {
            let Some(current) = horizon.current.as_ref() else {
                return false;
            };
            match horizon.percentile_threshold(cfg.cheap_percentile) {
                Some(threshold) => current.total <= threshold,
                None => false,
            }
        }
        // "level" and any unrecognized value fall back to the level strategy
        _ => {
            let Some(current) = horizon.current.as_ref() else {
                return false;
            };
            (current.level == PriceLevel::VeryCheap && cfg.charge_on_very_cheap)
                || (current.level == PriceLevel::Cheap && cfg.charge_on_cheap)
        }
    }
}

/// Build a short human-readable explanation of the decision, for logs and
/// the web status endpoint.
pub fn explain_decision(
    cfg: &crate::config::PriceFeedConfig,
    horizon: &PriceHorizon,
    should_charge: bool,
) -> String {
    let mut parts = Vec::new();
    if let Some(current) = &horizon.current {
        parts.push(format!("total={:.4}", current.total));
        if cfg.strategy == "level" {
            parts.push(format!("level={}", current.level.as_str()));
        }
    }
    match cfg.strategy.as_str() {
        "threshold" => parts.push(format!(
            "strategy=threshold max={:.4} tol={:.2}",
            cfg.max_price_total, cfg.threshold_tolerance
        )),
        "percentile" => {
            if let Some(thr) = horizon.percentile_threshold(cfg.cheap_percentile) {
                parts.push(format!(
                    "strategy=percentile p={:.2} thr={:.4}",
                    cfg.cheap_percentile, thr
                ));
            }
        }
        _ => {}
    }
    let suffix = if should_charge {
        "charging enabled"
    } else {
        "waiting for cheaper price"
    };
    if parts.is_empty() {
        format!("pricefeed decision — {}", suffix)
    } else {
        format!("{} — {}", parts.join(", "), suffix)
    }
}

#[cfg(feature = "pricefeed")]
mod http_client {
    use super::*;
    use crate::config::PriceFeedConfig;
    use crate::error::BridgeError;
    use crate::logging::get_logger;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Fetches and caches a price horizon from a generic JSON endpoint. The
    /// endpoint is expected to return `{"current": PricePoint, "upcoming":
    /// [PricePoint, ...]}`; this keeps the adapter vendor-neutral while still
    /// giving the evaluator real data shaped the way day-ahead markets
    /// (Nordpool/ENTSO-E/Tibber-style) publish it.
    pub struct PriceFeedClient {
        cached: Option<PriceHorizon>,
        cached_at: Option<std::time::Instant>,
        logger: crate::logging::StructuredLogger,
    }

    impl PriceFeedClient {
        pub fn new() -> Self {
            Self {
                cached: None,
                cached_at: None,
                logger: get_logger("pricefeed"),
            }
        }

        fn cache_is_fresh(&self, cache_minutes: u32) -> bool {
            match self.cached_at {
                Some(at) => at.elapsed() < Duration::from_secs(u64::from(cache_minutes) * 60),
                None => false,
            }
        }

        /// Return the cached horizon, refetching first if the cache is stale
        /// or empty. A failed fetch keeps serving the last good cache rather
        /// than erroring out, since a stale price is still actionable while
        /// an error would stall charging entirely.
        pub async fn horizon(&mut self, cfg: &PriceFeedConfig) -> Result<PriceHorizon> {
            if self.cache_is_fresh(cfg.cache_minutes) {
                if let Some(h) = &self.cached {
                    return Ok(h.clone());
                }
            }

            match self.fetch_with_retry(cfg).await {
                Ok(fresh) => {
                    self.cached = Some(fresh.clone());
                    self.cached_at = Some(std::time::Instant::now());
                    Ok(fresh)
                }
                Err(e) => {
                    if let Some(stale) = &self.cached {
                        self.logger.warn(&format!(
                            "price feed fetch failed ({}); serving stale cache",
                            e
                        ));
                        Ok(stale.clone())
                    } else {
                        Err(e)
                    }
                }
            }
        }

        async fn fetch_with_retry(&self, cfg: &PriceFeedConfig) -> Result<PriceHorizon> {
            let mut attempt = 0;
            let mut backoff_ms = 250u64;
            loop {
                match self.fetch_once(cfg).await {
                    Ok(h) => return Ok(h),
                    Err(e) => {
                        attempt += 1;
                        if attempt > cfg.max_retries {
                            return Err(BridgeError::retry_exhausted(
                                "pricefeed_fetch",
                                attempt,
                                &e.to_string(),
                            ));
                        }
                        let jitter = (attempt as u64 * 37) % 100;
                        sleep(Duration::from_millis(backoff_ms + jitter)).await;
                        backoff_ms = (backoff_ms * 2).min(5_000);
                    }
                }
            }
        }

        async fn fetch_once(&self, cfg: &PriceFeedConfig) -> Result<PriceHorizon> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.request_timeout_seconds))
                .build()?;

            let mut req = client.get(&cfg.url);
            if !cfg.api_token.trim().is_empty() {
                req = req.bearer_auth(cfg.api_token.trim());
            }

            let resp = req.send().await?;
            if !resp.status().is_success() {
                return Err(BridgeError::network(format!(
                    "price feed returned {}",
                    resp.status()
                )));
            }

            let horizon: PriceHorizon = resp
                .json::<RawHorizon>()
                .await
                .map_err(|e| BridgeError::network(format!("invalid price feed response: {}", e)))?
                .into();
            Ok(horizon)
        }
    }

    impl Default for PriceFeedClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[derive(Deserialize)]
    struct RawHorizon {
        current: Option<PricePoint>,
        #[serde(default)]
        upcoming: Vec<PricePoint>,
    }

    impl From<RawHorizon> for PriceHorizon {
        fn from(raw: RawHorizon) -> Self {
            PriceHorizon {
                current: raw.current,
                upcoming: raw.upcoming,
            }
        }
    }
}

#[cfg(feature = "pricefeed")]
pub use http_client::PriceFeedClient;

/// Evaluate the price feed's recommendation for SCHEDULED mode, returning
/// `(should_charge, explanation)`. Stubbed out to "never charge" when the
/// `pricefeed` feature is disabled at compile time.
#[cfg(feature = "pricefeed")]
pub async fn check_pricefeed_schedule(
    cfg: &crate::config::PriceFeedConfig,
    client: &mut PriceFeedClient,
) -> Result<(bool, String)> {
    if !cfg.enabled || cfg.url.trim().is_empty() {
        return Ok((false, "price feed not configured".to_string()));
    }
    let horizon = client.horizon(cfg).await?;
    let should = decide_should_charge(cfg, &horizon);
    Ok((should, explain_decision(cfg, &horizon, should)))
}

#[cfg(not(feature = "pricefeed"))]
pub async fn check_pricefeed_schedule(
    _cfg: &crate::config::PriceFeedConfig,
) -> Result<(bool, String)> {
    Ok((false, "price feed integration disabled".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceFeedConfig;

    fn make_cfg() -> PriceFeedConfig {
        let mut cfg = PriceFeedConfig::default();
        cfg.enabled = true;
        cfg.url = "http://example.invalid/prices".to_string();
        cfg
    }

    #[test]
    fn price_level_mapping_roundtrip() {
        use PriceLevel::*;
        assert_eq!(PriceLevel::from_str("VERY_CHEAP"), VeryCheap);
        assert_eq!(PriceLevel::from_str("cheap"), Cheap);
        assert_eq!(PriceLevel::from_str("normal"), Normal);
        assert_eq!(PriceLevel::from_str("EXPENSIVE"), Expensive);
        assert_eq!(PriceLevel::from_str("very_expensive"), VeryExpensive);

        assert_eq!(VeryCheap.as_str(), "VERY_CHEAP");
        assert_eq!(VeryExpensive.as_str(), "VERY_EXPENSIVE");
    }

    fn point(total: f64, level: PriceLevel) -> PricePoint {
        PricePoint {
            starts_at: "t".into(),
            total,
            level,
        }
    }

    #[test]
    fn percentile_threshold_edges_and_mid() {
        let horizon = PriceHorizon {
            current: None,
            upcoming: vec![
                point(1.0, PriceLevel::Normal),
                point(2.0, PriceLevel::Normal),
                point(3.0, PriceLevel::Normal),
                point(4.0, PriceLevel::Normal),
            ],
        };
        assert_eq!(horizon.percentile_threshold(0.0), Some(1.0));
        assert_eq!(horizon.percentile_threshold(1.0), Some(4.0));
        assert_eq!(horizon.percentile_threshold(0.5), Some(2.0));
        assert_eq!(horizon.percentile_threshold(0.75), Some(3.0));
    }

    #[test]
    fn decide_should_charge_threshold_and_level() {
        let mut cfg = make_cfg();
        cfg.strategy = "threshold".to_string();
        cfg.max_price_total = 0.20;

        let horizon = PriceHorizon {
            current: Some(point(0.15, PriceLevel::Cheap)),
            upcoming: vec![],
        };
        assert!(decide_should_charge(&cfg, &horizon));

        cfg.max_price_total = 0.10;
        assert!(!decide_should_charge(&cfg, &horizon));

        cfg.strategy = "level".to_string();
        let horizon_cheap = PriceHorizon {
            current: Some(point(0.0, PriceLevel::Cheap)),
            upcoming: vec![],
        };
        assert!(decide_should_charge(&cfg, &horizon_cheap));
        let horizon_expensive = PriceHorizon {
            current: Some(point(0.0, PriceLevel::Expensive)),
            upcoming: vec![],
        };
        assert!(!decide_should_charge(&cfg, &horizon_expensive));
    }

    #[test]
    fn decide_should_charge_percentile() {
        let mut cfg = make_cfg();
        cfg.strategy = "percentile".to_string();
        let horizon = PriceHorizon {
            current: Some(point(3.0, PriceLevel::Normal)),
            upcoming: vec![
                point(2.0, PriceLevel::Cheap),
                point(3.0, PriceLevel::Normal),
                point(4.0, PriceLevel::Expensive),
            ],
        };

        cfg.cheap_percentile = 0.5; // threshold -> 3.0 (index 1 of 3)
        assert!(decide_should_charge(&cfg, &horizon));

        cfg.cheap_percentile = 0.0; // threshold -> 2.0
        assert!(!decide_should_charge(&cfg, &horizon));
    }

    #[test]
    fn threshold_without_explicit_max_uses_tolerance_over_cheapest() {
        let mut cfg = make_cfg();
        cfg.strategy = "threshold".to_string();
        cfg.max_price_total = 0.0;
        cfg.threshold_tolerance = 0.1;
        let horizon = PriceHorizon {
            current: Some(point(1.05, PriceLevel::Normal)),
            upcoming: vec![point(1.0, PriceLevel::Cheap), point(2.0, PriceLevel::Expensive)],
        };
        assert!(decide_should_charge(&cfg, &horizon));

        let horizon_expensive = PriceHorizon {
            current: Some(point(1.5, PriceLevel::Normal)),
            upcoming: vec![point(1.0, PriceLevel::Cheap), point(2.0, PriceLevel::Expensive)],
        };
        assert!(!decide_should_charge(&cfg, &horizon_expensive));
    }
}
