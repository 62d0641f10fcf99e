use chrono::{DateTime, Duration, Utc};
use config_manager::SystemConfig;
use ledger_core::numeric::{gas_cost_eth, gas_cost_usd};
use ledger_core::{
    classify, normalize_address, AssetRef, ChainDataSource, GasRecord, HistoricalPrice,
    ImportProgress, ImportStage, PriceOrigin, PriceSource, ProgressSink, RawTransfer, Repository,
    SourceError, StoreError,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod balance;
pub use balance::{BalanceRefresher, BalanceSummary};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("unknown wallet: {0} (add it before importing)")]
    UnknownWallet(String),
    #[error("import failed for wallet {wallet} during {stage} stage: {message}")]
    Stage {
        wallet: String,
        stage: ImportStage,
        message: String,
    },
    #[error("balance refresh failed for wallet {wallet}: {message}")]
    Refresh { wallet: String, message: String },
}

impl From<StoreError> for ImportError {
    fn from(err: StoreError) -> Self {
        ImportError::Store(err.to_string())
    }
}

impl From<config_manager::ConfigurationError> for ImportError {
    fn from(err: config_manager::ConfigurationError) -> Self {
        ImportError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;

/// Failure inside one stage, before it is tagged with the wallet and stage
/// name for the caller.
#[derive(Error, Debug)]
enum StageFailure {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Source(#[from] SourceError),
    #[error("{0}")]
    Data(String),
}

impl From<ledger_core::CoreError> for StageFailure {
    fn from(err: ledger_core::CoreError) -> Self {
        StageFailure::Data(err.to_string())
    }
}

/// Import tuning carried by the pipeline, lifted out of the system
/// configuration at wiring time.
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub network: String,
    /// Networks swept by the balance refresh
    pub networks: Vec<String>,
    pub price_tolerance_secs: i64,
    pub price_window_before_secs: i64,
    pub price_window_after_secs: i64,
    pub price_resolution: String,
    pub native_symbol: String,
    pub currency: String,
    pub dummy_balance_mode: bool,
}

impl ImportSettings {
    pub fn from_config(config: &SystemConfig) -> Self {
        Self {
            network: config.network.default_network.clone(),
            networks: config.network.enabled_networks.clone(),
            price_tolerance_secs: config.import.price_tolerance_secs,
            price_window_before_secs: config.import.price_window_before_secs,
            price_window_after_secs: config.import.price_window_after_secs,
            price_resolution: config.import.price_resolution.clone(),
            native_symbol: config.import.native_symbol.clone(),
            currency: config.import.currency.clone(),
            dummy_balance_mode: config.system.dummy_balance_mode,
        }
    }
}

/// Outcome counters of one wallet import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub wallet_address: String,
    pub pages_fetched: u64,
    pub new_transfers: usize,
    pub gas_records_written: usize,
    pub gas_items_skipped: usize,
    pub price_points_added: usize,
    pub price_items_skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Per-wallet outcome of a batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub wallet_address: String,
    pub summary: Option<ImportSummary>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BatchReport {
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

struct PriceLookup {
    price: Option<Decimal>,
    points_added: usize,
}

/// The incremental transaction-import pipeline.
///
/// One call brings the local record set for one wallet up to date with the
/// external source: transfers, then gas, then prices, then finalization.
/// Stages run strictly in order, items within a stage strictly sequentially
/// (they share one rate-limit budget), and completed stages are never rolled
/// back - re-running is safe because every merge is a keyed upsert.
pub struct ImportPipeline {
    repo: Arc<dyn Repository>,
    chain: Arc<dyn ChainDataSource>,
    prices: Arc<dyn PriceSource>,
    settings: ImportSettings,
}

impl ImportPipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        chain: Arc<dyn ChainDataSource>,
        prices: Arc<dyn PriceSource>,
        settings: ImportSettings,
    ) -> Self {
        Self {
            repo,
            chain,
            prices,
            settings,
        }
    }

    /// Import one wallet. Progress is reported through the per-call sink.
    pub async fn import_wallet(
        &self,
        address: &str,
        sink: &ProgressSink,
    ) -> Result<ImportSummary> {
        let wallet = normalize_address(address);
        let started_at = Utc::now();

        if self.repo.get_wallet(&wallet).await?.is_none() {
            return Err(ImportError::UnknownWallet(wallet));
        }

        info!("🔄 Starting import for wallet {}", wallet);

        let (new_transfers, pages_fetched) = self
            .run_transfer_stage(&wallet, sink, started_at)
            .await
            .map_err(|e| stage_error(&wallet, ImportStage::Transfers, e))?;

        let (gas_records_written, gas_items_skipped) = self
            .run_gas_stage(&wallet, sink, started_at)
            .await
            .map_err(|e| stage_error(&wallet, ImportStage::Gas, e))?;

        let (price_points_added, price_items_skipped) = self
            .run_price_stage(&wallet, sink, started_at)
            .await
            .map_err(|e| stage_error(&wallet, ImportStage::Prices, e))?;

        let finished_at = Utc::now();
        self.repo.mark_wallet_synced(&wallet, finished_at).await?;

        sink.emit(ImportProgress {
            wallet_address: wallet.clone(),
            stage: ImportStage::Complete,
            current: 1,
            total: Some(1),
            current_item: wallet.clone(),
            started_at,
        });

        info!(
            "✅ Import complete for {}: {} new transfers, {} gas records, {} price points",
            wallet, new_transfers, gas_records_written, price_points_added
        );

        Ok(ImportSummary {
            wallet_address: wallet,
            pages_fetched,
            new_transfers,
            gas_records_written,
            gas_items_skipped,
            price_points_added,
            price_items_skipped,
            started_at,
            finished_at,
        })
    }

    /// Import every tracked wallet. A wallet-level failure is recorded and
    /// the batch continues with the next wallet.
    pub async fn import_all(&self, sink: &ProgressSink) -> Result<BatchReport> {
        let wallets = self.repo.list_wallets().await?;
        info!("🔄 Batch import of {} wallets", wallets.len());

        let mut report = BatchReport::default();

        for wallet in wallets {
            match self.import_wallet(&wallet.address, sink).await {
                Ok(summary) => report.outcomes.push(BatchOutcome {
                    wallet_address: wallet.address,
                    summary: Some(summary),
                    error: None,
                }),
                Err(e) => {
                    warn!("⚠️  Wallet {} failed, continuing batch: {}", wallet.address, e);
                    report.outcomes.push(BatchOutcome {
                        wallet_address: wallet.address,
                        summary: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        info!(
            "📊 Batch finished: {}/{} wallets succeeded",
            report.succeeded(),
            report.outcomes.len()
        );

        Ok(report)
    }

    /// Hashes among a wallet's transfers that still lack a GasRecord, so
    /// per-item skips stay independently verifiable.
    pub async fn gas_gaps(&self, address: &str) -> Result<Vec<String>> {
        let wallet = normalize_address(address);
        let transfers = self.repo.transfers_for_wallet(&wallet).await?;

        let mut gaps = Vec::new();
        let mut seen = HashSet::new();
        for transfer in &transfers {
            if seen.insert(transfer.hash.clone()) && !self.repo.has_gas_record(&transfer.hash).await? {
                gaps.push(transfer.hash.clone());
            }
        }

        Ok(gaps)
    }

    // -- Stage 1: transfer ingestion ---------------------------------------

    async fn run_transfer_stage(
        &self,
        wallet: &str,
        sink: &ProgressSink,
        started_at: DateTime<Utc>,
    ) -> std::result::Result<(usize, u64), StageFailure> {
        let existing = self.repo.transfers_for_wallet(wallet).await?;
        let from_block = existing.iter().map(|t| t.block_number).max();
        let rules = self.repo.list_classifications().await?;

        match from_block {
            Some(block) => info!("📄 Resuming transfer fetch from block {}", block),
            None => info!("📄 No prior transfers, fetching from genesis"),
        }

        let mut cursor: Option<String> = None;
        let mut pages = 0u64;
        let mut written = 0usize;

        loop {
            let page = self
                .chain
                .fetch_transfers(wallet, &self.settings.network, from_block, cursor.take())
                .await?;
            pages += 1;

            let mut batch = Vec::with_capacity(page.items.len());
            for item in page.items {
                let id = RawTransfer::composite_id(item.block_number, &item.unique_id);
                if self.repo.has_transfer(&id).await? {
                    debug!("Skipping already-imported transfer {}", id);
                    continue;
                }

                let mut record = RawTransfer::from_source(item, wallet);
                record.transaction_class = Some(classify(&record, wallet, &rules));
                batch.push(record);
            }

            let current_item = batch
                .last()
                .map(|record| record.hash.clone())
                .unwrap_or_else(|| format!("page {}", pages));

            let page_written = self.repo.append_transfers(&batch).await?;
            written += page_written;

            sink.emit(ImportProgress {
                wallet_address: wallet.to_string(),
                stage: ImportStage::Transfers,
                current: pages,
                total: None,
                current_item,
                started_at,
            });

            debug!("📄 Page {}: {} new transfers", pages, page_written);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(
            "📊 Transfer stage: {} pages, {} new transfers",
            pages, written
        );
        Ok((written, pages))
    }

    // -- Stage 2: gas backfill ---------------------------------------------

    async fn run_gas_stage(
        &self,
        wallet: &str,
        sink: &ProgressSink,
        started_at: DateTime<Utc>,
    ) -> std::result::Result<(usize, usize), StageFailure> {
        let transfers = self.repo.transfers_for_wallet(wallet).await?;

        // Unique hashes still missing a gas record, in block order.
        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        for transfer in &transfers {
            if seen.insert(transfer.hash.clone())
                && !self.repo.has_gas_record(&transfer.hash).await?
            {
                pending.push((transfer.hash.clone(), transfer.timestamp));
            }
        }

        let total = pending.len() as u64;
        let mut written = 0usize;
        let mut skipped = 0usize;

        // Sequential on purpose: the receipts share one rate-limit budget.
        for (index, (hash, timestamp)) in pending.into_iter().enumerate() {
            sink.emit(ImportProgress {
                wallet_address: wallet.to_string(),
                stage: ImportStage::Gas,
                current: index as u64 + 1,
                total: Some(total),
                current_item: hash.clone(),
                started_at,
            });

            match self.backfill_gas(wallet, &hash, timestamp).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    // Per-item failure: logged and skipped, the stage goes on
                    warn!("⚠️  Skipping gas backfill for {}: {}", hash, e);
                    skipped += 1;
                }
            }
        }

        info!(
            "📊 Gas stage: {} records written, {} skipped",
            written, skipped
        );
        Ok((written, skipped))
    }

    async fn backfill_gas(
        &self,
        wallet: &str,
        hash: &str,
        timestamp: DateTime<Utc>,
    ) -> std::result::Result<bool, StageFailure> {
        let receipt = self.chain.fetch_receipt(hash, &self.settings.network).await?;

        let eth_cost = gas_cost_eth(&receipt.gas_used, &receipt.effective_gas_price)?;

        let native = AssetRef::Symbol(self.settings.native_symbol.clone());
        let lookup = self.resolve_price_at(&native, timestamp).await?;
        let eth_price = lookup.price.ok_or_else(|| {
            StageFailure::Data(format!(
                "no {} price near {}",
                self.settings.native_symbol, timestamp
            ))
        })?;

        let now = Utc::now();
        let record = GasRecord {
            id: GasRecord::id_for(hash),
            wallet_address: wallet.to_string(),
            hash: hash.to_string(),
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            gas_price: receipt.effective_gas_price,
            gas_cost_eth: eth_cost,
            gas_cost_usd: gas_cost_usd(eth_cost, eth_price),
            timestamp,
            created_at: now,
        };

        Ok(self.repo.append_gas_record(&record).await?)
    }

    // -- Stage 3: price backfill -------------------------------------------

    async fn run_price_stage(
        &self,
        wallet: &str,
        sink: &ProgressSink,
        started_at: DateTime<Utc>,
    ) -> std::result::Result<(usize, usize), StageFailure> {
        let transfers = self.repo.transfers_for_wallet(wallet).await?;

        // Group transfer timestamps by unique asset, keeping first-seen order.
        let mut order: Vec<AssetRef> = Vec::new();
        let mut groups: HashMap<String, Vec<(DateTime<Utc>, String)>> = HashMap::new();
        for transfer in &transfers {
            let asset_ref = transfer.asset_ref();
            let key = asset_ref.key().to_string();
            if !groups.contains_key(&key) {
                order.push(asset_ref);
            }
            groups
                .entry(key)
                .or_default()
                .push((transfer.timestamp, transfer.asset.clone()));
        }

        let total = transfers.len() as u64;
        let mut current = 0u64;
        let mut added = 0usize;
        let mut skipped = 0usize;

        for asset_ref in order {
            let entries = groups.remove(asset_ref.key()).unwrap_or_default();
            for (timestamp, symbol) in entries {
                current += 1;
                sink.emit(ImportProgress {
                    wallet_address: wallet.to_string(),
                    stage: ImportStage::Prices,
                    current,
                    total: Some(total),
                    current_item: format!("{} @ {}", symbol, timestamp.to_rfc3339()),
                    started_at,
                });

                match self.resolve_price_at(&asset_ref, timestamp).await {
                    Ok(lookup) => added += lookup.points_added,
                    Err(e) => {
                        warn!(
                            "⚠️  Skipping price backfill for {} at {}: {}",
                            asset_ref, timestamp, e
                        );
                        skipped += 1;
                    }
                }
            }
        }

        info!(
            "📊 Price stage: {} points merged, {} lookups skipped",
            added, skipped
        );
        Ok((added, skipped))
    }

    /// Price of an asset at a target instant: a stored point within the
    /// tolerance window wins; otherwise one series fetch covering
    /// [t - window_before, t + window_after] is merged into the cache.
    async fn resolve_price_at(
        &self,
        asset: &AssetRef,
        at: DateTime<Utc>,
    ) -> std::result::Result<PriceLookup, StageFailure> {
        if let Some(cached) = self
            .repo
            .find_price_near(
                asset.key(),
                &self.settings.network,
                at,
                self.settings.price_tolerance_secs,
            )
            .await?
        {
            debug!("🎯 Price cache hit for {} near {}", asset, at);
            return Ok(PriceLookup {
                price: Some(cached.price),
                points_added: 0,
            });
        }

        let start = at - Duration::seconds(self.settings.price_window_before_secs);
        let end = at + Duration::seconds(self.settings.price_window_after_secs);

        let series = self
            .prices
            .fetch_historical_series(
                asset,
                &self.settings.network,
                start,
                end,
                &self.settings.price_resolution,
            )
            .await;

        if series.is_empty() {
            return Ok(PriceLookup {
                price: None,
                points_added: 0,
            });
        }

        let now = Utc::now();
        let (symbol, contract_address) = match asset {
            AssetRef::Symbol(symbol) => (Some(symbol.clone()), None),
            AssetRef::Contract(contract) => (None, Some(contract.clone())),
        };

        let points: Vec<HistoricalPrice> = series
            .iter()
            .map(|point| HistoricalPrice {
                symbol: symbol.clone(),
                contract_address: contract_address.clone(),
                network: self.settings.network.clone(),
                price: point.price,
                currency: self.settings.currency.clone(),
                timestamp: point.timestamp,
                source: PriceOrigin::Historical,
                created_at: now,
            })
            .collect();

        let points_added = self.repo.merge_prices(&points).await?;

        let price = series
            .into_iter()
            .min_by_key(|point| (point.timestamp.timestamp() - at.timestamp()).abs())
            .map(|point| point.price);

        Ok(PriceLookup {
            price,
            points_added,
        })
    }
}

fn stage_error(wallet: &str, stage: ImportStage, failure: StageFailure) -> ImportError {
    ImportError::Stage {
        wallet: wallet.to_string(),
        stage,
        message: failure.to_string(),
    }
}
