//! On-chain fee selection for JIT channel opens.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fee api error: {0}")]
    Api(String),
    #[error("invalid mempool url: {0}")]
    BadUrl(String),
}

/// Which recommended-fee tier a channel open should pay.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeeStrategy {
    Minimum,
    Economy,
    Hour,
    HalfHour,
    Fastest,
}

impl Default for FeeStrategy {
    fn default() -> Self {
        FeeStrategy::Economy
    }
}

impl FromStr for FeeStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minimum" => Ok(FeeStrategy::Minimum),
            "economy" => Ok(FeeStrategy::Economy),
            "hour" => Ok(FeeStrategy::Hour),
            "halfhour" => Ok(FeeStrategy::HalfHour),
            "fastest" => Ok(FeeStrategy::Fastest),
            _ => Err(()),
        }
    }
}

/// The mempool.space recommended-fees snapshot, in sat/vbyte.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RecommendedFees {
    #[serde(rename = "fastestFee")]
    pub fastest_fee: f64,
    #[serde(rename = "halfHourFee")]
    pub half_hour_fee: f64,
    #[serde(rename = "hourFee")]
    pub hour_fee: f64,
    #[serde(rename = "economyFee")]
    pub economy_fee: f64,
    #[serde(rename = "minimumFee")]
    pub minimum_fee: f64,
}

/// What the channel open should tell the node about fees.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FeeDirective {
    SatPerVbyte(f64),
    TargetConf(u32),
    /// Let the backend pick.
    Default,
}

// strategy -> snapshot field
static FEE_STRATEGY_TABLE: &[(FeeStrategy, fn(&RecommendedFees) -> f64)] = &[
    (FeeStrategy::Minimum, |f| f.minimum_fee),
    (FeeStrategy::Economy, |f| f.economy_fee),
    (FeeStrategy::Hour, |f| f.hour_fee),
    (FeeStrategy::HalfHour, |f| f.half_hour_fee),
    (FeeStrategy::Fastest, |f| f.fastest_fee),
];

/// Pure fee policy: a current network estimate wins, else fall back to a
/// confirmation-target directive, else the backend default.
pub fn fee_directive(
    strategy: FeeStrategy,
    estimate: Option<&RecommendedFees>,
    target_conf: Option<u32>,
) -> FeeDirective {
    if let Some(fees) = estimate {
        let select = FEE_STRATEGY_TABLE
            .iter()
            .find(|(s, _)| *s == strategy)
            .map(|(_, f)| f)
            .expect("strategy table is total");
        return FeeDirective::SatPerVbyte(select(fees));
    }
    match target_conf {
        Some(t) => FeeDirective::TargetConf(t),
        None => FeeDirective::Default,
    }
}

#[async_trait]
pub trait FeeEstimator: Send + Sync {
    async fn recommended_fees(&self) -> Result<RecommendedFees, Error>;
}

/// Async client for the mempool.space fee API.
#[derive(Clone, Debug)]
pub struct MempoolClient {
    rpc: Arc<Mutex<Client>>,
    base: Url,
}

impl MempoolClient {
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let base = Url::parse(base_url).map_err(|e| Error::BadUrl(e.to_string()))?;
        let rpc = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Api(e.to_string()))?;
        Ok(MempoolClient { rpc: Arc::new(Mutex::new(rpc)), base })
    }

    async fn get<T: for<'a> serde::de::Deserialize<'a>>(&self, path: &str) -> Result<T, Error> {
        let rpc = self.rpc.lock().await;
        let url = self.base.join(path).map_err(|e| Error::BadUrl(e.to_string()))?;
        let res = rpc.get(url).send().await.map_err(|e| Error::Api(e.to_string()))?;
        if res.status().is_server_error() || res.status().is_client_error() {
            return Err(Error::Api(format!("server error: {}", res.status())));
        }
        res.json::<T>().await.map_err(|e| Error::Api(e.to_string()))
    }
}

#[async_trait]
impl FeeEstimator for MempoolClient {
    async fn recommended_fees(&self) -> Result<RecommendedFees, Error> {
        self.get("v1/fees/recommended").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fees() -> RecommendedFees {
        RecommendedFees {
            fastest_fee: 50.0,
            half_hour_fee: 30.0,
            hour_fee: 20.0,
            economy_fee: 10.0,
            minimum_fee: 1.0,
        }
    }

    #[test]
    fn test_strategy_selects_field() {
        let f = fees();
        assert_eq!(fee_directive(FeeStrategy::Minimum, Some(&f), None), FeeDirective::SatPerVbyte(1.0));
        assert_eq!(fee_directive(FeeStrategy::Economy, Some(&f), None), FeeDirective::SatPerVbyte(10.0));
        assert_eq!(fee_directive(FeeStrategy::Hour, Some(&f), None), FeeDirective::SatPerVbyte(20.0));
        assert_eq!(fee_directive(FeeStrategy::HalfHour, Some(&f), None), FeeDirective::SatPerVbyte(30.0));
        assert_eq!(fee_directive(FeeStrategy::Fastest, Some(&f), None), FeeDirective::SatPerVbyte(50.0));
    }

    #[test]
    fn test_fallbacks() {
        assert_eq!(fee_directive(FeeStrategy::Economy, None, Some(6)), FeeDirective::TargetConf(6));
        assert_eq!(fee_directive(FeeStrategy::Economy, None, None), FeeDirective::Default);
        // estimate wins over target_conf
        assert_eq!(
            fee_directive(FeeStrategy::Fastest, Some(&fees()), Some(6)),
            FeeDirective::SatPerVbyte(50.0)
        );
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("HalfHour".parse::<FeeStrategy>().unwrap(), FeeStrategy::HalfHour);
        assert!("warp".parse::<FeeStrategy>().is_err());
    }
}
