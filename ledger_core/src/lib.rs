pub mod classify;
pub mod numeric;
pub mod progress;

pub use classify::classify;
pub use progress::{ImportProgress, ImportStage, ProgressSink};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid classification rule: {0}")]
    InvalidClassification(String),
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error surface of the persisted store, independent of the backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("record serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Error surface of the external data providers.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("response decoding failed: {0}")]
    Decode(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("provider configuration error: {0}")]
    Config(String),
}

/// Lowercase an address for storage and comparison.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Check the fixed 40-hex-digits-after-0x form of an EVM address.
pub fn is_evm_address(address: &str) -> bool {
    if !address.starts_with("0x") && !address.starts_with("0X") {
        return false;
    }

    if address.len() != 42 {
        return false;
    }

    address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Accounting category assigned to a transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransactionClass {
    Emission,
    Uploads,
    Purchase,
    Burn,
    AirDrop,
    Swap,
    OtherIncome,
    Withdraw,
}

impl std::fmt::Display for TransactionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransactionClass::Emission => "Emission",
            TransactionClass::Uploads => "Uploads",
            TransactionClass::Purchase => "Purchase",
            TransactionClass::Burn => "Burn",
            TransactionClass::AirDrop => "AirDrop",
            TransactionClass::Swap => "Swap",
            TransactionClass::OtherIncome => "OtherIncome",
            TransactionClass::Withdraw => "Withdraw",
        };
        write!(f, "{}", label)
    }
}

impl std::str::FromStr for TransactionClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "emission" => Ok(TransactionClass::Emission),
            "uploads" => Ok(TransactionClass::Uploads),
            "purchase" => Ok(TransactionClass::Purchase),
            "burn" => Ok(TransactionClass::Burn),
            "airdrop" => Ok(TransactionClass::AirDrop),
            "swap" => Ok(TransactionClass::Swap),
            "otherincome" | "other-income" => Ok(TransactionClass::OtherIncome),
            "withdraw" => Ok(TransactionClass::Withdraw),
            other => Err(CoreError::InvalidClassification(format!(
                "unknown transaction class: {}",
                other
            ))),
        }
    }
}

/// A tracked wallet. Created on explicit add; `last_sync_at` is only
/// advanced after a full successful import pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Wallet {
    /// Normalized (lowercase) address, unique
    pub address: String,
    pub name: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(address: &str, name: Option<String>) -> Self {
        Self {
            address: normalize_address(address),
            name,
            last_sync_at: None,
            created_at: Utc::now(),
        }
    }
}

fn default_decimals() -> u32 {
    18
}

/// One on-chain asset movement involving a tracked wallet.
///
/// Immutable once written except for `transaction_class`; `id` is globally
/// unique across all wallets and is the dedup key for repeated imports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawTransfer {
    /// Composite of block number and the source's unique transfer id
    pub id: String,
    pub wallet_address: String,
    pub block_number: u64,
    /// Hash of the containing transaction
    pub hash: String,
    pub from_address: String,
    pub to_address: String,
    pub value: Decimal,
    /// Asset symbol ("ETH", "USDC", ...)
    pub asset: String,
    /// Source-side transfer category ("external", "erc20", ...)
    pub category: String,
    pub contract_address: Option<String>,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    pub timestamp: DateTime<Utc>,
    /// Accounting category, computed once at ingest
    pub transaction_class: Option<TransactionClass>,
    pub created_at: DateTime<Utc>,
}

impl RawTransfer {
    /// The globally unique dedup key for a transfer.
    pub fn composite_id(block_number: u64, unique_id: &str) -> String {
        format!("{}-{}", block_number, unique_id)
    }

    /// Normalize a source transfer into a persistable record. The
    /// classification is left unset; the caller assigns it.
    pub fn from_source(source: SourceTransfer, wallet_address: &str) -> Self {
        Self {
            id: Self::composite_id(source.block_number, &source.unique_id),
            wallet_address: normalize_address(wallet_address),
            block_number: source.block_number,
            hash: source.hash,
            from_address: normalize_address(&source.from_address),
            to_address: normalize_address(&source.to_address),
            value: source.value,
            asset: source.asset,
            category: source.category,
            contract_address: source.contract_address.map(|a| normalize_address(&a)),
            decimals: source.decimals.unwrap_or(18),
            timestamp: source.timestamp,
            transaction_class: None,
            created_at: Utc::now(),
        }
    }

    /// Cache/merge key of the transfer's asset: contract address when the
    /// asset is a token, symbol otherwise.
    pub fn asset_ref(&self) -> AssetRef {
        match &self.contract_address {
            Some(contract) => AssetRef::Contract(contract.clone()),
            None => AssetRef::Symbol(self.asset.clone()),
        }
    }
}

/// Fee cost of one on-chain transaction. A transaction can emit several
/// transfer events; exactly one GasRecord exists per unique hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GasRecord {
    /// Hash plus a fixed suffix, unique per transaction
    pub id: String,
    pub wallet_address: String,
    pub hash: String,
    pub block_number: u64,
    /// Gas consumed, hex quantity as returned by the receipt
    pub gas_used: String,
    /// Effective gas price in wei, hex quantity
    pub gas_price: String,
    pub gas_cost_eth: Decimal,
    pub gas_cost_usd: Decimal,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl GasRecord {
    pub fn id_for(hash: &str) -> String {
        format!("{}-gas", hash)
    }
}

/// Where a stored price point came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PriceOrigin {
    Balance,
    Historical,
    Manual,
}

/// A timestamped price point for an asset on one network, used as a
/// time-indexed cache when valuing transfers and gas retroactively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoricalPrice {
    pub symbol: Option<String>,
    pub contract_address: Option<String>,
    pub network: String,
    pub price: Decimal,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    pub source: PriceOrigin,
    pub created_at: DateTime<Utc>,
}

impl HistoricalPrice {
    /// Contract address when present, symbol otherwise. One of the two is
    /// always set.
    pub fn asset_key(&self) -> &str {
        self.contract_address
            .as_deref()
            .or(self.symbol.as_deref())
            .unwrap_or_default()
    }

    /// Dedup/merge identity: an incoming point with a matching key replaces
    /// the stored one.
    pub fn merge_key(&self) -> (String, String, i64) {
        (
            self.asset_key().to_string(),
            self.network.clone(),
            self.timestamp.timestamp(),
        )
    }
}

/// A configured mapping from a counterpart address to an accounting
/// category. At least one of the two addresses must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddressClassification {
    pub id: Uuid,
    pub name: String,
    pub wallet_address: Option<String>,
    pub contract_address: Option<String>,
    pub transaction_class: TransactionClass,
}

impl AddressClassification {
    pub fn new(
        name: &str,
        transaction_class: TransactionClass,
        wallet_address: Option<String>,
        contract_address: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            wallet_address: wallet_address.map(|a| normalize_address(&a)),
            contract_address: contract_address.map(|a| normalize_address(&a)),
            transaction_class,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.wallet_address.is_none() && self.contract_address.is_none() {
            return Err(CoreError::InvalidClassification(format!(
                "rule '{}' must set a wallet address or a contract address",
                self.name
            )));
        }

        for address in [&self.wallet_address, &self.contract_address]
            .into_iter()
            .flatten()
        {
            if !is_evm_address(address) {
                return Err(CoreError::InvalidAddress(address.clone()));
            }
        }

        Ok(())
    }
}

/// Present-moment holding of one asset, refreshed wholesale per wallet.
/// Unique per (wallet, symbol, network); upsert replaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenBalance {
    pub wallet_address: String,
    pub symbol: String,
    pub name: Option<String>,
    pub balance: Decimal,
    pub price: Decimal,
    pub value: Decimal,
    pub network: String,
    pub decimals: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl TokenBalance {
    pub fn key(&self) -> (String, String, String) {
        (
            self.wallet_address.clone(),
            self.symbol.clone(),
            self.network.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// One page of transfers from the chain-data provider.
#[derive(Debug, Clone, Default)]
pub struct TransferPage {
    pub items: Vec<SourceTransfer>,
    /// Opaque continuation token; `None` means the stream is exhausted.
    pub next_cursor: Option<String>,
}

/// A transfer as reported by the provider, before normalization.
#[derive(Debug, Clone)]
pub struct SourceTransfer {
    pub unique_id: String,
    pub block_number: u64,
    pub hash: String,
    pub from_address: String,
    pub to_address: String,
    pub value: Decimal,
    pub asset: String,
    pub category: String,
    pub contract_address: Option<String>,
    pub decimals: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Gas fields of a transaction receipt.
#[derive(Debug, Clone)]
pub struct SourceReceipt {
    pub gas_used: String,
    pub effective_gas_price: String,
    pub block_number: u64,
}

/// A current token holding as reported by the provider, already
/// normalized to whole units.
#[derive(Debug, Clone)]
pub struct SourceTokenBalance {
    pub contract_address: String,
    pub symbol: String,
    pub name: Option<String>,
    pub balance: Decimal,
    pub decimals: Option<u32>,
}

/// How an asset is identified against the price source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetRef {
    Symbol(String),
    Contract(String),
}

impl AssetRef {
    pub fn key(&self) -> &str {
        match self {
            AssetRef::Symbol(s) => s,
            AssetRef::Contract(c) => c,
        }
    }
}

impl std::fmt::Display for AssetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// One point of a historical price series.
#[derive(Debug, Clone)]
pub struct PricePoint {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// The persisted store. All record ownership lives behind this trait; the
/// pipeline holds only transient in-memory state per import call.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_wallets(&self) -> std::result::Result<Vec<Wallet>, StoreError>;
    async fn get_wallet(&self, address: &str) -> std::result::Result<Option<Wallet>, StoreError>;
    async fn upsert_wallet(&self, wallet: &Wallet) -> std::result::Result<(), StoreError>;
    async fn mark_wallet_synced(
        &self,
        address: &str,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError>;

    async fn transfers_for_wallet(
        &self,
        address: &str,
    ) -> std::result::Result<Vec<RawTransfer>, StoreError>;
    /// Global check: transfer ids are unique across all wallets.
    async fn has_transfer(&self, id: &str) -> std::result::Result<bool, StoreError>;
    /// Append records, skipping any whose id already exists anywhere.
    /// Returns the number actually written.
    async fn append_transfers(
        &self,
        records: &[RawTransfer],
    ) -> std::result::Result<usize, StoreError>;

    async fn gas_records_for_wallet(
        &self,
        address: &str,
    ) -> std::result::Result<Vec<GasRecord>, StoreError>;
    /// Global check: one GasRecord exists per unique transaction hash, even
    /// when several tracked wallets share the transaction.
    async fn has_gas_record(&self, hash: &str) -> std::result::Result<bool, StoreError>;
    /// Write-once per hash; returns false when the hash is already covered.
    async fn append_gas_record(&self, record: &GasRecord)
        -> std::result::Result<bool, StoreError>;

    /// Merge points by (asset, network, timestamp): matching tuples are
    /// replaced, new tuples appended. Returns the number of new tuples.
    async fn merge_prices(
        &self,
        points: &[HistoricalPrice],
    ) -> std::result::Result<usize, StoreError>;
    /// Closest stored point within `tolerance_secs` of `at`, if any.
    async fn find_price_near(
        &self,
        asset_key: &str,
        network: &str,
        at: DateTime<Utc>,
        tolerance_secs: i64,
    ) -> std::result::Result<Option<HistoricalPrice>, StoreError>;
    async fn prices_for_asset(
        &self,
        asset_key: &str,
        network: &str,
    ) -> std::result::Result<Vec<HistoricalPrice>, StoreError>;

    async fn balances_for_wallet(
        &self,
        address: &str,
    ) -> std::result::Result<Vec<TokenBalance>, StoreError>;
    async fn upsert_balance(&self, balance: &TokenBalance)
        -> std::result::Result<(), StoreError>;
    async fn clear_balances(&self, address: &str) -> std::result::Result<(), StoreError>;

    async fn list_classifications(
        &self,
    ) -> std::result::Result<Vec<AddressClassification>, StoreError>;
    async fn upsert_classification(
        &self,
        rule: &AddressClassification,
    ) -> std::result::Result<(), StoreError>;
    async fn delete_classification(&self, id: Uuid) -> std::result::Result<bool, StoreError>;
}

/// The blockchain-data provider.
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    /// One page of transfers involving `address`, optionally resuming from a
    /// block height and an opaque page cursor.
    async fn fetch_transfers(
        &self,
        address: &str,
        network: &str,
        from_block: Option<u64>,
        page_cursor: Option<String>,
    ) -> std::result::Result<TransferPage, SourceError>;

    async fn fetch_receipt(
        &self,
        hash: &str,
        network: &str,
    ) -> std::result::Result<SourceReceipt, SourceError>;

    /// Native-asset balance in whole units.
    async fn fetch_native_balance(
        &self,
        address: &str,
        network: &str,
    ) -> std::result::Result<Decimal, SourceError>;

    async fn fetch_token_balances(
        &self,
        address: &str,
        network: &str,
    ) -> std::result::Result<Vec<SourceTokenBalance>, SourceError>;
}

/// The pricing provider.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Price series for one asset over [start, end]. Returns an empty
    /// series on provider failure; price gaps are non-fatal by contract.
    async fn fetch_historical_series(
        &self,
        asset: &AssetRef,
        network: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: &str,
    ) -> Vec<PricePoint>;

    /// Current prices per symbol in the requested currency.
    async fn fetch_spot_prices(
        &self,
        symbols: &[String],
        currency: &str,
    ) -> std::result::Result<HashMap<String, Decimal>, SourceError>;
}
