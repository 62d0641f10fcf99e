use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::{
    AddressClassification, GasRecord, HistoricalPrice, RawTransfer, Repository, StoreError,
    TokenBalance, Wallet,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::closest_within;

#[derive(Debug, Default)]
struct Inner {
    wallets: HashMap<String, Wallet>,
    transfer_ids: HashSet<String>,
    transfers: HashMap<String, Vec<RawTransfer>>,
    gas_records: HashMap<String, GasRecord>,
    prices: HashMap<(String, String), BTreeMap<i64, HistoricalPrice>>,
    balances: HashMap<String, HashMap<String, TokenBalance>>,
    classifications: Vec<AddressClassification>,
}

/// In-memory Repository with the same merge semantics as the Redis store.
/// Backs the offline mode and every test that drives the pipeline.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<Inner>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryLedgerStore {
    async fn list_wallets(&self) -> Result<Vec<Wallet>, StoreError> {
        let inner = self.inner.lock().await;
        let mut wallets: Vec<Wallet> = inner.wallets.values().cloned().collect();
        wallets.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(wallets)
    }

    async fn get_wallet(&self, address: &str) -> Result<Option<Wallet>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.wallets.get(address).cloned())
    }

    async fn upsert_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.wallets.insert(wallet.address.clone(), wallet.clone());
        Ok(())
    }

    async fn mark_wallet_synced(
        &self,
        address: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(wallet) = inner.wallets.get_mut(address) {
            wallet.last_sync_at = Some(at);
        }
        Ok(())
    }

    async fn transfers_for_wallet(&self, address: &str) -> Result<Vec<RawTransfer>, StoreError> {
        let inner = self.inner.lock().await;
        let mut transfers = inner.transfers.get(address).cloned().unwrap_or_default();
        transfers.sort_by(|a, b| (a.block_number, &a.id).cmp(&(b.block_number, &b.id)));
        Ok(transfers)
    }

    async fn has_transfer(&self, id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.transfer_ids.contains(id))
    }

    async fn append_transfers(&self, records: &[RawTransfer]) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut written = 0usize;

        for record in records {
            if !inner.transfer_ids.insert(record.id.clone()) {
                continue;
            }
            inner
                .transfers
                .entry(record.wallet_address.clone())
                .or_default()
                .push(record.clone());
            written += 1;
        }

        Ok(written)
    }

    async fn gas_records_for_wallet(&self, address: &str) -> Result<Vec<GasRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<GasRecord> = inner
            .gas_records
            .values()
            .filter(|record| record.wallet_address == address)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.block_number);
        Ok(records)
    }

    async fn has_gas_record(&self, hash: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.gas_records.contains_key(hash))
    }

    async fn append_gas_record(&self, record: &GasRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.gas_records.contains_key(&record.hash) {
            return Ok(false);
        }
        inner
            .gas_records
            .insert(record.hash.clone(), record.clone());
        Ok(true)
    }

    async fn merge_prices(&self, points: &[HistoricalPrice]) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut appended = 0usize;

        for point in points {
            let key = (point.network.clone(), point.asset_key().to_string());
            let series = inner.prices.entry(key).or_default();
            if series
                .insert(point.timestamp.timestamp(), point.clone())
                .is_none()
            {
                appended += 1;
            }
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
        let inner = self.inner.lock().await;
        let key = (network.to_string(), asset_key.to_string());
        Ok(inner
            .prices
            .get(&key)
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn balances_for_wallet(&self, address: &str) -> Result<Vec<TokenBalance>, StoreError> {
        let inner = self.inner.lock().await;
        let mut balances: Vec<TokenBalance> = inner
            .balances
            .get(address)
            .map(|by_field| by_field.values().cloned().collect())
            .unwrap_or_default();
        balances.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(balances)
    }

    async fn upsert_balance(&self, balance: &TokenBalance) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let field = format!("{}:{}", balance.symbol, balance.network);
        inner
            .balances
            .entry(balance.wallet_address.clone())
            .or_default()
            .insert(field, balance.clone());
        Ok(())
    }

    async fn clear_balances(&self, address: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.balances.remove(address);
        Ok(())
    }

    async fn list_classifications(&self) -> Result<Vec<AddressClassification>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.classifications.clone())
    }

    async fn upsert_classification(
        &self,
        rule: &AddressClassification,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner
            .classifications
            .iter_mut()
            .find(|existing| existing.id == rule.id)
        {
            Some(existing) => *existing = rule.clone(),
            None => inner.classifications.push(rule.clone()),
        }
        Ok(())
    }

    async fn delete_classification(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.classifications.len();
        inner.classifications.retain(|rule| rule.id != id);
        Ok(inner.classifications.len() < before)
    }
}
