pub mod memory;

pub use memory::MemoryLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::{
    AddressClassification, GasRecord, HistoricalPrice, RawTransfer, Repository, StoreError,
    TokenBalance, Wallet,
};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Map any backend failure into the store error surface.
fn backend<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn parse_all<T: DeserializeOwned>(raw: Vec<String>) -> Result<Vec<T>, StoreError> {
    raw.iter()
        .map(|json| serde_json::from_str(json).map_err(StoreError::from))
        .collect()
}

/// Store health status information
#[derive(Debug, Clone)]
pub struct StoreHealthStatus {
    pub connected: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Redis-backed Repository.
///
/// Each record kind lives in its own hash keyed by the record identity and
/// serialized as JSON. Cross-wallet invariants use dedicated global keys: a
/// `transfer-ids` set enforces global transfer dedup, the `gas-records`
/// hash holds one record per transaction hash regardless of how many
/// tracked wallets share the transaction.
#[derive(Debug, Clone)]
pub struct RedisLedgerStore {
    client: Client,
}

const WALLETS_KEY: &str = "wallets";
const TRANSFER_IDS_KEY: &str = "transfer-ids";
const GAS_RECORDS_KEY: &str = "gas-records";
const CLASSIFICATIONS_KEY: &str = "classifications";
const CLASSIFICATION_ORDER_KEY: &str = "classification-order";

fn transfers_key(address: &str) -> String {
    format!("transfers:{}", address)
}

fn prices_key(network: &str, asset_key: &str) -> String {
    format!("prices:{}:{}", network, asset_key)
}

fn balances_key(address: &str) -> String {
    format!("balances:{}", address)
}

fn balance_field(balance: &TokenBalance) -> String {
    format!("{}:{}", balance.symbol, balance.network)
}

impl RedisLedgerStore {
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(backend)?;

        // Test the connection
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        info!("Connected to Redis at {}", redis_url);
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)
    }

    /// Test store connectivity and round-trip latency.
    pub async fn health_check(&self) -> StoreHealthStatus {
        let start_time = std::time::Instant::now();

        match self.conn().await {
            Ok(mut conn) => {
                let ping: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                match ping {
                    Ok(_) => StoreHealthStatus {
                        connected: true,
                        latency_ms: start_time.elapsed().as_millis() as u64,
                        error: None,
                    },
                    Err(e) => StoreHealthStatus {
                        connected: false,
                        latency_ms: start_time.elapsed().as_millis() as u64,
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => StoreHealthStatus {
                connected: false,
                latency_ms: start_time.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl Repository for RedisLedgerStore {
    async fn list_wallets(&self) -> Result<Vec<Wallet>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.hvals(WALLETS_KEY).await.map_err(backend)?;
        let mut wallets: Vec<Wallet> = parse_all(raw)?;
        wallets.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(wallets)
    }

    async fn get_wallet(&self, address: &str) -> Result<Option<Wallet>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .hget(WALLETS_KEY, address)
            .await
            .map_err(backend)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn upsert_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(WALLETS_KEY, &wallet.address, to_json(wallet)?)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn mark_wallet_synced(
        &self,
        address: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.get_wallet(address).await? {
            Some(mut wallet) => {
                wallet.last_sync_at = Some(at);
                self.upsert_wallet(&wallet).await
            }
            None => {
                warn!("Cannot mark unknown wallet {} as synced", address);
                Ok(())
            }
        }
    }

    async fn transfers_for_wallet(&self, address: &str) -> Result<Vec<RawTransfer>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn
            .hvals(transfers_key(address))
            .await
            .map_err(backend)?;
        let mut transfers: Vec<RawTransfer> = parse_all(raw)?;
        transfers.sort_by(|a, b| (a.block_number, &a.id).cmp(&(b.block_number, &b.id)));
        Ok(transfers)
    }

    async fn has_transfer(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let present: bool = conn
            .sismember(TRANSFER_IDS_KEY, id)
            .await
            .map_err(backend)?;
        Ok(present)
    }

    async fn append_transfers(&self, records: &[RawTransfer]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn().await?;
        let mut written = 0usize;

        for record in records {
            // The global id set is the dedup gate; only a first-seen id gets
            // its record persisted.
            let added: i64 = conn
                .sadd(TRANSFER_IDS_KEY, &record.id)
                .await
                .map_err(backend)?;
            if added == 0 {
                debug!("Skipping already-imported transfer {}", record.id);
                continue;
            }

            let _: () = conn
                .hset(
                    transfers_key(&record.wallet_address),
                    &record.id,
                    to_json(record)?,
                )
                .await
                .map_err(backend)?;
            written += 1;
        }

        Ok(written)
    }

    async fn gas_records_for_wallet(&self, address: &str) -> Result<Vec<GasRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.hvals(GAS_RECORDS_KEY).await.map_err(backend)?;
        let mut records: Vec<GasRecord> = parse_all(raw)?
            .into_iter()
            .filter(|record: &GasRecord| record.wallet_address == address)
            .collect();
        records.sort_by_key(|record| record.block_number);
        Ok(records)
    }

    async fn has_gas_record(&self, hash: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let present: bool = conn
            .hexists(GAS_RECORDS_KEY, hash)
            .await
            .map_err(backend)?;
        Ok(present)
    }

    async fn append_gas_record(&self, record: &GasRecord) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let written: bool = conn
            .hset_nx(GAS_RECORDS_KEY, &record.hash, to_json(record)?)
            .await
            .map_err(backend)?;
        Ok(written)
    }

    async fn merge_prices(&self, points: &[HistoricalPrice]) -> Result<usize, StoreError> {
        if points.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn().await?;
        let mut appended = 0usize;

        for point in points {
            let key = prices_key(&point.network, point.asset_key());
            let field = point.timestamp.timestamp().to_string();
            // HSET replaces on a matching (asset, network, timestamp) tuple
            // and reports whether the field was new.
            let is_new: i64 = conn
                .hset(key, field, to_json(point)?)
                .await
                .map_err(backend)?;
            appended += is_new as usize;
        }

        Ok(appended)
    }

    async fn find_price_near(
        &self,
        asset_key: &str,
        network: &str,
        at: DateTime<Utc>,
        tolerance_secs: i64,
    ) -> Result<Option<HistoricalPrice>, StoreError> {
        let prices = self.prices_for_asset(asset_key, network).await?;
        Ok(closest_within(prices, at, tolerance_secs))
    }

    async fn prices_for_asset(
        &self,
        asset_key: &str,
        network: &str,
    ) -> Result<Vec<HistoricalPrice>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn
            .hvals(prices_key(network, asset_key))
            .await
            .map_err(backend)?;
        let mut prices: Vec<HistoricalPrice> = parse_all(raw)?;
        prices.sort_by_key(|price| price.timestamp);
        Ok(prices)
    }

    async fn balances_for_wallet(&self, address: &str) -> Result<Vec<TokenBalance>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn
            .hvals(balances_key(address))
            .await
            .map_err(backend)?;
        let mut balances: Vec<TokenBalance> = parse_all(raw)?;
        balances.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(balances)
    }

    async fn upsert_balance(&self, balance: &TokenBalance) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(
                balances_key(&balance.wallet_address),
                balance_field(balance),
                to_json(balance)?,
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn clear_balances(&self, address: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(balances_key(address)).await.map_err(backend)?;
        Ok(())
    }

    async fn list_classifications(&self) -> Result<Vec<AddressClassification>, StoreError> {
        let mut conn = self.conn().await?;
        // Rule order matters (first match wins), so a side list preserves
        // insertion order across the unordered hash.
        let order: Vec<String> = conn
            .lrange(CLASSIFICATION_ORDER_KEY, 0, -1)
            .await
            .map_err(backend)?;

        let mut rules = Vec::with_capacity(order.len());
        for id in order {
            let raw: Option<String> = conn
                .hget(CLASSIFICATIONS_KEY, &id)
                .await
                .map_err(backend)?;
            if let Some(json) = raw {
                rules.push(serde_json::from_str(&json)?);
            }
        }
        Ok(rules)
    }

    async fn upsert_classification(
        &self,
        rule: &AddressClassification,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let id = rule.id.to_string();
        let existed: bool = conn
            .hexists(CLASSIFICATIONS_KEY, &id)
            .await
            .map_err(backend)?;
        let _: () = conn
            .hset(CLASSIFICATIONS_KEY, &id, to_json(rule)?)
            .await
            .map_err(backend)?;
        if !existed {
            let _: () = conn
                .rpush(CLASSIFICATION_ORDER_KEY, &id)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn delete_classification(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let id = id.to_string();
        let removed: i64 = conn
            .hdel(CLASSIFICATIONS_KEY, &id)
            .await
            .map_err(backend)?;
        let _: () = conn
            .lrem(CLASSIFICATION_ORDER_KEY, 0, &id)
            .await
            .map_err(backend)?;
        Ok(removed > 0)
    }
}

/// Closest point to `at` within the tolerance window, shared by both store
/// implementations.
pub(crate) fn closest_within(
    prices: Vec<HistoricalPrice>,
    at: DateTime<Utc>,
    tolerance_secs: i64,
) -> Option<HistoricalPrice> {
    prices
        .into_iter()
        .filter(|price| (price.timestamp.timestamp() - at.timestamp()).abs() <= tolerance_secs)
        .min_by_key(|price| (price.timestamp.timestamp() - at.timestamp()).abs())
}
