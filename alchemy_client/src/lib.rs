pub mod prices;

pub use prices::AlchemyPriceClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config_manager::ProviderConfig;
use ledger_core::numeric::{parse_hex_quantity, units_to_decimal};
use ledger_core::{
    ChainDataSource, SourceError, SourceReceipt, SourceTokenBalance, SourceTransfer, TransferPage,
};
use retry_utils::{execute_with_retry, AdaptiveRateLimiter, FailureClass, RetryConfig};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Map a source error onto the retry strategy: only throttles and timeouts
/// are retried, everything else surfaces immediately.
pub fn classify_source_error(error: &SourceError) -> FailureClass {
    match error {
        SourceError::RateLimited => FailureClass::RateLimited,
        SourceError::Timeout => FailureClass::Timeout,
        _ => FailureClass::Permanent,
    }
}

pub(crate) fn request_error(error: reqwest::Error) -> SourceError {
    if error.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Transport(error.to_string())
    }
}

/// Provider-side network identifier ("eth-mainnet" style host prefix).
pub(crate) fn provider_network_id(network: &str) -> Result<&'static str, SourceError> {
    match network {
        "ethereum" => Ok("eth-mainnet"),
        "base" => Ok("base-mainnet"),
        "arbitrum" => Ok("arb-mainnet"),
        "optimism" => Ok("opt-mainnet"),
        "polygon" => Ok("polygon-mainnet"),
        other => Err(SourceError::Config(format!(
            "unsupported network: '{}'",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P: Serialize> {
    jsonrpc: &'a str,
    id: u32,
    method: &'a str,
    params: &'a P,
}

#[derive(Debug, Deserialize)]
struct JsonRpcEnvelope<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

// ---------------------------------------------------------------------------
// Wire schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssetTransfersRequest {
    from_block: String,
    to_block: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    from_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_address: Option<String>,
    category: Vec<String>,
    with_metadata: bool,
    exclude_zero_value: bool,
    order: String,
    max_count: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTransfersResult {
    #[serde(default)]
    pub transfers: Vec<ApiTransfer>,
    pub page_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTransfer {
    pub unique_id: String,
    pub hash: String,
    pub block_num: String,
    pub from: String,
    pub to: Option<String>,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub raw_contract: RawContract,
    #[serde(default)]
    pub metadata: TransferMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawContract {
    pub value: Option<String>,
    pub address: Option<String>,
    pub decimal: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub block_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptResult {
    gas_used: String,
    effective_gas_price: String,
    block_number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBalancesResult {
    #[serde(default)]
    token_balances: Vec<ApiTokenBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiTokenBalance {
    contract_address: String,
    token_balance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenMetadataResult {
    symbol: Option<String>,
    name: Option<String>,
    decimals: Option<u32>,
}

// ---------------------------------------------------------------------------
// Pagination cursor
// ---------------------------------------------------------------------------

/// The provider filters transfers on one side of the movement per request,
/// so a full sweep runs incoming first, then outgoing. The opaque cursor
/// handed to callers threads both the sweep direction and the provider's
/// own page key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PageCursor {
    direction: SweepDirection,
    page_key: Option<String>,
}

impl PageCursor {
    fn start() -> Self {
        Self {
            direction: SweepDirection::Incoming,
            page_key: None,
        }
    }

    fn encode(&self) -> String {
        let prefix = match self.direction {
            SweepDirection::Incoming => "in",
            SweepDirection::Outgoing => "out",
        };
        format!("{}:{}", prefix, self.page_key.as_deref().unwrap_or_default())
    }

    fn decode(raw: Option<&str>) -> Result<Self, SourceError> {
        let Some(raw) = raw else {
            return Ok(Self::start());
        };

        let (prefix, key) = raw
            .split_once(':')
            .ok_or_else(|| SourceError::Decode(format!("malformed page cursor: '{}'", raw)))?;

        let direction = match prefix {
            "in" => SweepDirection::Incoming,
            "out" => SweepDirection::Outgoing,
            other => {
                return Err(SourceError::Decode(format!(
                    "unknown sweep direction in cursor: '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            direction,
            page_key: (!key.is_empty()).then(|| key.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// JSON-RPC client for the blockchain-data provider. All calls flow through
/// the injected shared rate limiter.
#[derive(Debug, Clone)]
pub struct AlchemyChainClient {
    http: Client,
    rpc_base_url: String,
    api_key: String,
    page_size: u32,
    retry: RetryConfig,
    limiter: Arc<AdaptiveRateLimiter>,
}

impl AlchemyChainClient {
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
            rpc_base_url: config.rpc_base_url.clone(),
            api_key: config.api_key.clone(),
            page_size: config.page_size,
            retry: RetryConfig {
                max_retries: config.max_retries,
                retry_backoff_ms: config.retry_backoff_ms,
            },
            limiter,
        })
    }

    fn rpc_url(&self, network: &str) -> Result<String, SourceError> {
        let host = provider_network_id(network)?;
        Ok(format!(
            "{}/{}",
            self.rpc_base_url.replace("{network}", host),
            self.api_key
        ))
    }

    async fn rpc_call<P, T>(
        &self,
        network: &str,
        method: &str,
        params: &P,
        label: &str,
    ) -> Result<T, SourceError>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.rpc_url(network)?;
        execute_with_retry(
            &self.limiter,
            &self.retry,
            || self.dispatch(&url, method, params, label),
            classify_source_error,
        )
        .await
    }

    async fn dispatch<P, T>(
        &self,
        url: &str,
        method: &str,
        params: &P,
        label: &str,
    ) -> Result<T, SourceError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        debug!("🌐 {} ({})", method, label);

        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .http
            .post(url)
            .json(&body)
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

        let envelope: JsonRpcEnvelope<T> = response.json().await.map_err(request_error)?;

        if let Some(error) = envelope.error {
            // Some gateways signal throttling in-band instead of via HTTP 429
            if error.code == 429 {
                return Err(SourceError::RateLimited);
            }
            return Err(SourceError::Api {
                status: status.as_u16(),
                message: format!("RPC error {}: {}", error.code, error.message),
            });
        }

        envelope
            .result
            .ok_or_else(|| SourceError::Decode(format!("{} returned no result", method)))
    }
}

fn to_source_transfer(api: ApiTransfer) -> Result<SourceTransfer, SourceError> {
    let block_number = parse_hex_quantity(&api.block_num)
        .map_err(|e| SourceError::Decode(e.to_string()))? as u64;

    let decimals = match api.raw_contract.decimal.as_deref() {
        Some(raw) => Some(
            parse_hex_quantity(raw).map_err(|e| SourceError::Decode(e.to_string()))? as u32,
        ),
        None => None,
    };

    let value = match api.raw_contract.value.as_deref() {
        Some(raw) => {
            let units =
                parse_hex_quantity(raw).map_err(|e| SourceError::Decode(e.to_string()))?;
            units_to_decimal(units, decimals.unwrap_or(18))
                .map_err(|e| SourceError::Decode(e.to_string()))?
        }
        None => Decimal::ZERO,
    };

    let timestamp = match api.metadata.block_timestamp.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| SourceError::Decode(format!("bad block timestamp '{}': {}", raw, e)))?
            .with_timezone(&Utc),
        None => {
            warn!("Transfer {} has no block timestamp", api.unique_id);
            DateTime::<Utc>::UNIX_EPOCH
        }
    };

    Ok(SourceTransfer {
        unique_id: api.unique_id,
        block_number,
        hash: api.hash,
        from_address: api.from,
        to_address: api.to.unwrap_or_default(),
        value,
        asset: api.asset.unwrap_or_else(|| "UNKNOWN".to_string()),
        category: api.category,
        contract_address: api.raw_contract.address,
        decimals,
        timestamp,
    })
}

#[async_trait]
impl ChainDataSource for AlchemyChainClient {
    async fn fetch_transfers(
        &self,
        address: &str,
        network: &str,
        from_block: Option<u64>,
        page_cursor: Option<String>,
    ) -> Result<TransferPage, SourceError> {
        let cursor = PageCursor::decode(page_cursor.as_deref())?;

        let from_block_hex = from_block
            .map(|block| format!("{:#x}", block))
            .unwrap_or_else(|| "0x0".to_string());

        let request = AssetTransfersRequest {
            from_block: from_block_hex,
            to_block: "latest".to_string(),
            from_address: matches!(cursor.direction, SweepDirection::Outgoing)
                .then(|| address.to_string()),
            to_address: matches!(cursor.direction, SweepDirection::Incoming)
                .then(|| address.to_string()),
            category: vec!["external".to_string(), "erc20".to_string()],
            with_metadata: true,
            exclude_zero_value: false,
            order: "asc".to_string(),
            max_count: format!("{:#x}", self.page_size),
            page_key: cursor.page_key.clone(),
        };

        let result: AssetTransfersResult = self
            .rpc_call(
                network,
                "alchemy_getAssetTransfers",
                &[&request],
                &format!("transfers {}", address),
            )
            .await?;

        let mut items = Vec::with_capacity(result.transfers.len());
        for api in result.transfers {
            match to_source_transfer(api) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping malformed transfer in page: {}", e),
            }
        }

        debug!(
            "📄 {} transfers in {:?} sweep page, has_next: {}",
            items.len(),
            cursor.direction,
            result.page_key.is_some()
        );

        let next_cursor = match (result.page_key, cursor.direction) {
            (Some(key), direction) => Some(
                PageCursor {
                    direction,
                    page_key: Some(key),
                }
                .encode(),
            ),
            // Incoming sweep exhausted: continue with the outgoing sweep
            (None, SweepDirection::Incoming) => Some(
                PageCursor {
                    direction: SweepDirection::Outgoing,
                    page_key: None,
                }
                .encode(),
            ),
            (None, SweepDirection::Outgoing) => None,
        };

        Ok(TransferPage { items, next_cursor })
    }

    async fn fetch_receipt(&self, hash: &str, network: &str) -> Result<SourceReceipt, SourceError> {
        let result: ReceiptResult = self
            .rpc_call(
                network,
                "eth_getTransactionReceipt",
                &[hash],
                &format!("receipt {}", hash),
            )
            .await?;

        let block_number = parse_hex_quantity(&result.block_number)
            .map_err(|e| SourceError::Decode(e.to_string()))? as u64;

        Ok(SourceReceipt {
            gas_used: result.gas_used,
            effective_gas_price: result.effective_gas_price,
            block_number,
        })
    }

    async fn fetch_native_balance(
        &self,
        address: &str,
        network: &str,
    ) -> Result<Decimal, SourceError> {
        let result: String = self
            .rpc_call(
                network,
                "eth_getBalance",
                &[address, "latest"],
                &format!("balance {}", address),
            )
            .await?;

        let wei = parse_hex_quantity(&result).map_err(|e| SourceError::Decode(e.to_string()))?;
        units_to_decimal(wei, 18).map_err(|e| SourceError::Decode(e.to_string()))
    }

    async fn fetch_token_balances(
        &self,
        address: &str,
        network: &str,
    ) -> Result<Vec<SourceTokenBalance>, SourceError> {
        let result: TokenBalancesResult = self
            .rpc_call(
                network,
                "alchemy_getTokenBalances",
                &[address, "erc20"],
                &format!("token balances {}", address),
            )
            .await?;

        let mut balances = Vec::new();

        // Metadata lookups run sequentially through the shared limiter.
        for entry in result.token_balances {
            let raw = entry.token_balance.as_deref().unwrap_or("0x0");
            let units = match parse_hex_quantity(raw) {
                Ok(units) => units,
                Err(e) => {
                    warn!("Skipping unparsable balance for {}: {}", entry.contract_address, e);
                    continue;
                }
            };
            if units == 0 {
                continue;
            }

            let metadata: TokenMetadataResult = match self
                .rpc_call(
                    network,
                    "alchemy_getTokenMetadata",
                    &[entry.contract_address.as_str()],
                    &format!("metadata {}", entry.contract_address),
                )
                .await
            {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(
                        "Skipping token {} without metadata: {}",
                        entry.contract_address, e
                    );
                    continue;
                }
            };

            let decimals = metadata.decimals.unwrap_or(18);
            let balance = match units_to_decimal(units, decimals) {
                Ok(balance) => balance,
                Err(e) => {
                    warn!("Skipping token {}: {}", entry.contract_address, e);
                    continue;
                }
            };

            balances.push(SourceTokenBalance {
                symbol: metadata
                    .symbol
                    .unwrap_or_else(|| entry.contract_address.clone()),
                name: metadata.name,
                contract_address: entry.contract_address,
                balance,
                decimals: Some(decimals),
            });
        }

        info!(
            "💰 {} non-zero token balances for {} on {}",
            balances.len(),
            address,
            network
        );

        Ok(balances)
    }
}
