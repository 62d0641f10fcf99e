use crate::{classify_source_error, provider_network_id, request_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config_manager::ProviderConfig;
use ledger_core::{AssetRef, PricePoint, PriceSource, SourceError};
use retry_utils::{execute_with_retry, AdaptiveRateLimiter, RetryConfig};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoricalPricesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    start_time: String,
    end_time: String,
    interval: String,
}

#[derive(Debug, Deserialize)]
struct HistoricalPricesResponse {
    #[serde(default)]
    data: Vec<ApiPricePoint>,
}

#[derive(Debug, Deserialize)]
struct ApiPricePoint {
    value: String,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct SpotPricesResponse {
    #[serde(default)]
    data: Vec<SpotPriceEntry>,
}

#[derive(Debug, Deserialize)]
struct SpotPriceEntry {
    symbol: String,
    #[serde(default)]
    prices: Vec<SpotQuote>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotQuote {
    currency: String,
    value: String,
}

/// REST client for the pricing provider, sharing the process-wide rate
/// limiter with the chain client.
#[derive(Debug, Clone)]
pub struct AlchemyPriceClient {
    http: Client,
    price_base_url: String,
    api_key: String,
    retry: RetryConfig,
    limiter: Arc<AdaptiveRateLimiter>,
}

impl AlchemyPriceClient {
    pub fn new(
        config: &ProviderConfig,
        limiter: Arc<AdaptiveRateLimiter>,
    ) -> Result<Self, SourceError> {
        if config.api_key.is_empty() {
            return Err(SourceError::Config(
                "provider API key is required".to_string(),
            ));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| SourceError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            price_base_url: config.price_base_url.clone(),
            api_key: config.api_key.clone(),
            retry: RetryConfig {
                max_retries: config.max_retries,
                retry_backoff_ms: config.retry_backoff_ms,
            },
            limiter,
        })
    }

    async fn fetch_series(
        &self,
        asset: &AssetRef,
        network: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: &str,
    ) -> Result<Vec<PricePoint>, SourceError> {
        let request = match asset {
            AssetRef::Symbol(symbol) => HistoricalPricesRequest {
                symbol: Some(symbol.clone()),
                network: None,
                address: None,
                start_time: start.to_rfc3339(),
                end_time: end.to_rfc3339(),
                interval: resolution.to_string(),
            },
            AssetRef::Contract(address) => HistoricalPricesRequest {
                symbol: None,
                network: Some(provider_network_id(network)?.to_string()),
                address: Some(address.clone()),
                start_time: start.to_rfc3339(),
                end_time: end.to_rfc3339(),
                interval: resolution.to_string(),
            },
        };

        let url = format!("{}/{}/tokens/historical", self.price_base_url, self.api_key);

        let response: HistoricalPricesResponse = execute_with_retry(
            &self.limiter,
            &self.retry,
            || async {
                let response = self
                    .http
                    .post(&url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(request_error)?;

                let status = response.status();
                if status.as_u16() == 429 {
                    return Err(SourceError::RateLimited);
                }
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(SourceError::Api {
                        status: status.as_u16(),
                        message: text.chars().take(300).collect(),
                    });
                }

                response.json().await.map_err(request_error)
            },
            classify_source_error,
        )
        .await?;

        Ok(parse_series(response))
    }
}

fn parse_series(response: HistoricalPricesResponse) -> Vec<PricePoint> {
    let mut points = Vec::with_capacity(response.data.len());

    for point in response.data {
        let price = match Decimal::from_str(&point.value) {
            Ok(price) => price,
            Err(e) => {
                warn!("Skipping unparsable price value '{}': {}", point.value, e);
                continue;
            }
        };
        let timestamp = match DateTime::parse_from_rfc3339(&point.timestamp) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => {
                warn!(
                    "Skipping price point with bad timestamp '{}': {}",
                    point.timestamp, e
                );
                continue;
            }
        };
        points.push(PricePoint { price, timestamp });
    }

    points
}

fn parse_spot_prices(
    response: SpotPricesResponse,
    currency: &str,
) -> HashMap<String, Decimal> {
    let mut prices = HashMap::new();

    for entry in response.data {
        if let Some(error) = entry.error {
            warn!("No spot price for {}: {}", entry.symbol, error);
            continue;
        }

        let quote = entry
            .prices
            .iter()
            .find(|quote| quote.currency.eq_ignore_ascii_case(currency));

        match quote {
            Some(quote) => match Decimal::from_str(&quote.value) {
                Ok(price) => {
                    prices.insert(entry.symbol, price);
                }
                Err(e) => {
                    warn!(
                        "Unparsable spot price '{}' for {}: {}",
                        quote.value, entry.symbol, e
                    );
                }
            },
            None => {
                warn!("No {} quote for {}", currency, entry.symbol);
            }
        }
    }

    prices
}

#[async_trait]
impl PriceSource for AlchemyPriceClient {
    async fn fetch_historical_series(
        &self,
        asset: &AssetRef,
        network: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: &str,
    ) -> Vec<PricePoint> {
        // Price gaps are non-fatal by contract: the series degrades to empty
        // instead of surfacing an error.
        match self.fetch_series(asset, network, start, end, resolution).await {
            Ok(points) => {
                debug!(
                    "📈 {} price points for {} over [{}, {}]",
                    points.len(),
                    asset,
                    start,
                    end
                );
                points
            }
            Err(e) => {
                warn!("Historical price fetch failed for {}: {}", asset, e);
                Vec::new()
            }
        }
    }

    async fn fetch_spot_prices(
        &self,
        symbols: &[String],
        currency: &str,
    ) -> Result<HashMap<String, Decimal>, SourceError> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/{}/tokens/by-symbol", self.price_base_url, self.api_key);
        let query: Vec<(&str, &str)> = symbols
            .iter()
            .map(|symbol| ("symbols", symbol.as_str()))
            .collect();

        let response: SpotPricesResponse = execute_with_retry(
            &self.limiter,
            &self.retry,
            || async {
                let response = self
                    .http
                    .get(&url)
                    .query(&query)
                    .send()
                    .await
                    .map_err(request_error)?;

                let status = response.status();
                if status.as_u16() == 429 {
                    return Err(SourceError::RateLimited);
                }
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(SourceError::Api {
                        status: status.as_u16(),
                        message: text.chars().take(300).collect(),
                    });
                }

                response.json().await.map_err(request_error)
            },
            classify_source_error,
        )
        .await?;

        Ok(parse_spot_prices(response, currency))
    }
}
