use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use import_pipeline::{BalanceRefresher, ImportError, ImportPipeline, ImportSettings};
use ledger_core::{
    AddressClassification, ChainDataSource, ImportStage, PricePoint, PriceSource, ProgressSink,
    Repository, SourceError, SourceReceipt, SourceTokenBalance, SourceTransfer, TransactionClass,
    TransferPage, Wallet,
};
use persistence_layer::MemoryLedgerStore;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const WALLET: &str = "0x00000000000000000000000000000000000000aa";
const OTHER_WALLET: &str = "0x00000000000000000000000000000000000000ab";
const MINTER: &str = "0x00000000000000000000000000000000000000bb";

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn settings() -> ImportSettings {
    ImportSettings {
        network: "ethereum".to_string(),
        networks: vec!["ethereum".to_string()],
        price_tolerance_secs: 300,
        price_window_before_secs: 120,
        price_window_after_secs: 1200,
        price_resolution: "5m".to_string(),
        native_symbol: "ETH".to_string(),
        currency: "usd".to_string(),
        dummy_balance_mode: false,
    }
}

/// Incoming native transfer; every two consecutive transfers share one
/// transaction hash and block.
fn make_item(index: u64) -> SourceTransfer {
    SourceTransfer {
        unique_id: format!("0xt{}:log:0", index),
        block_number: 1000 + index / 2,
        hash: format!("0xhash{}", index / 2),
        from_address: MINTER.to_string(),
        to_address: WALLET.to_string(),
        value: Decimal::ONE,
        asset: "ETH".to_string(),
        category: "external".to_string(),
        contract_address: None,
        decimals: None,
        timestamp: base_time() + Duration::seconds(index as i64),
    }
}

fn receipts_for_hashes(count: u64) -> HashMap<String, SourceReceipt> {
    (0..count)
        .map(|i| {
            (
                format!("0xhash{}", i),
                SourceReceipt {
                    gas_used: "0x5208".to_string(),
                    effective_gas_price: "0x3b9aca00".to_string(),
                    block_number: 1000 + i,
                },
            )
        })
        .collect()
}

#[derive(Default)]
struct ScriptedChainSource {
    pages: Mutex<VecDeque<TransferPage>>,
    from_blocks: Mutex<Vec<Option<u64>>>,
    receipts: HashMap<String, SourceReceipt>,
    fail_for: Option<String>,
    native_balance: Decimal,
    token_balances: Vec<SourceTokenBalance>,
}

#[async_trait]
impl ChainDataSource for ScriptedChainSource {
    async fn fetch_transfers(
        &self,
        address: &str,
        _network: &str,
        from_block: Option<u64>,
        _page_cursor: Option<String>,
    ) -> Result<TransferPage, SourceError> {
        if self.fail_for.as_deref() == Some(address) {
            return Err(SourceError::RateLimited);
        }
        self.from_blocks.lock().unwrap().push(from_block);
        Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn fetch_receipt(
        &self,
        hash: &str,
        _network: &str,
    ) -> Result<SourceReceipt, SourceError> {
        self.receipts.get(hash).cloned().ok_or_else(|| SourceError::Api {
            status: 404,
            message: format!("no receipt for {}", hash),
        })
    }

    async fn fetch_native_balance(
        &self,
        _address: &str,
        _network: &str,
    ) -> Result<Decimal, SourceError> {
        Ok(self.native_balance)
    }

    async fn fetch_token_balances(
        &self,
        _address: &str,
        _network: &str,
    ) -> Result<Vec<SourceTokenBalance>, SourceError> {
        Ok(self.token_balances.clone())
    }
}

struct ScriptedPriceSource {
    price: Decimal,
    series_calls: Mutex<u64>,
    spot: HashMap<String, Decimal>,
}

impl ScriptedPriceSource {
    fn with_price(price: i64) -> Self {
        Self {
            price: Decimal::from(price),
            series_calls: Mutex::new(0),
            spot: HashMap::new(),
        }
    }

    fn calls(&self) -> u64 {
        *self.series_calls.lock().unwrap()
    }
}

#[async_trait]
impl PriceSource for ScriptedPriceSource {
    async fn fetch_historical_series(
        &self,
        _asset: &ledger_core::AssetRef,
        _network: &str,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _resolution: &str,
    ) -> Vec<PricePoint> {
        *self.series_calls.lock().unwrap() += 1;
        // two 5-minute-grid points inside the requested window
        vec![
            PricePoint {
                price: self.price,
                timestamp: start + Duration::seconds(120),
            },
            PricePoint {
                price: self.price,
                timestamp: start + Duration::seconds(420),
            },
        ]
    }

    async fn fetch_spot_prices(
        &self,
        symbols: &[String],
        _currency: &str,
    ) -> Result<HashMap<String, Decimal>, SourceError> {
        Ok(symbols
            .iter()
            .filter_map(|symbol| self.spot.get(symbol).map(|price| (symbol.clone(), *price)))
            .collect())
    }
}

async fn seeded_store() -> Arc<MemoryLedgerStore> {
    let store = Arc::new(MemoryLedgerStore::new());
    store
        .upsert_wallet(&Wallet::new(WALLET, Some("main".to_string())))
        .await
        .unwrap();
    store
}

fn chain_with_pages(
    pages: Vec<TransferPage>,
    receipts: HashMap<String, SourceReceipt>,
) -> Arc<ScriptedChainSource> {
    Arc::new(ScriptedChainSource {
        pages: Mutex::new(VecDeque::from(pages)),
        receipts,
        ..Default::default()
    })
}

#[tokio::test]
async fn two_page_initial_import() {
    let store = seeded_store().await;
    let chain = chain_with_pages(
        vec![
            TransferPage {
                items: (0..150).map(make_item).collect(),
                next_cursor: Some("out:".to_string()),
            },
            TransferPage {
                items: (150..180).map(make_item).collect(),
                next_cursor: None,
            },
        ],
        receipts_for_hashes(90),
    );
    let prices = Arc::new(ScriptedPriceSource::with_price(2000));
    let pipeline = ImportPipeline::new(store.clone(), chain, prices.clone(), settings());

    let (sink, mut rx) = ProgressSink::channel();
    let summary = pipeline.import_wallet(WALLET, &sink).await.unwrap();
    drop(sink);

    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.new_transfers, 180);
    assert_eq!(summary.gas_records_written, 90);
    assert_eq!(summary.gas_items_skipped, 0);
    assert_eq!(summary.price_items_skipped, 0);

    let transfers = store.transfers_for_wallet(WALLET).await.unwrap();
    assert_eq!(transfers.len(), 180);
    // incoming from an unconfigured counterpart
    assert!(transfers
        .iter()
        .all(|t| t.transaction_class == Some(TransactionClass::OtherIncome)));

    // Transfer-stage progress: one event per page with current 1 then 2.
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let page_events: Vec<u64> = events
        .iter()
        .filter(|e| e.stage == ImportStage::Transfers)
        .map(|e| e.current)
        .collect();
    assert_eq!(page_events, vec![1, 2]);
    assert_eq!(events.last().unwrap().stage, ImportStage::Complete);

    // `current` never decreases within a stage.
    for stage in [ImportStage::Transfers, ImportStage::Gas, ImportStage::Prices] {
        let currents: Vec<u64> = events
            .iter()
            .filter(|e| e.stage == stage)
            .map(|e| e.current)
            .collect();
        assert!(currents.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    // Gas completeness: one record per unique hash, simple-transfer costs.
    let gas = store.gas_records_for_wallet(WALLET).await.unwrap();
    assert_eq!(gas.len(), 90);
    assert_eq!(gas[0].gas_cost_eth.to_string(), "0.000021000000000000");
    assert_eq!(gas[0].gas_cost_usd.to_string(), "0.04");
    assert!(pipeline.gas_gaps(WALLET).await.unwrap().is_empty());

    // All transfer timestamps sit inside one tolerance window, so a single
    // series fetch serves the whole import.
    assert_eq!(prices.calls(), 1);
    assert_eq!(
        store.prices_for_asset("ETH", "ethereum").await.unwrap().len(),
        2
    );

    let wallet = store.get_wallet(WALLET).await.unwrap().unwrap();
    assert!(wallet.last_sync_at.is_some());
}

#[tokio::test]
async fn rerun_resumes_from_max_block_and_is_idempotent() {
    let store = seeded_store().await;
    let first_chain = chain_with_pages(
        vec![TransferPage {
            items: (0..10).map(make_item).collect(),
            next_cursor: None,
        }],
        receipts_for_hashes(5),
    );
    let prices = Arc::new(ScriptedPriceSource::with_price(2000));

    let first = ImportPipeline::new(store.clone(), first_chain, prices.clone(), settings());
    let summary = first.import_wallet(WALLET, &ProgressSink::none()).await.unwrap();
    assert_eq!(summary.new_transfers, 10);
    let first_sync = store
        .get_wallet(WALLET)
        .await
        .unwrap()
        .unwrap()
        .last_sync_at
        .unwrap();
    let calls_after_first = prices.calls();
    let prices_after_first = store.prices_for_asset("ETH", "ethereum").await.unwrap().len();

    // The provider treats from_block inclusively, so the boundary page comes
    // back with already-imported transfers.
    let second_chain = chain_with_pages(
        vec![TransferPage {
            items: (8..10).map(make_item).collect(),
            next_cursor: None,
        }],
        receipts_for_hashes(5),
    );
    let second = ImportPipeline::new(
        store.clone(),
        second_chain.clone(),
        prices.clone(),
        settings(),
    );
    let rerun = second.import_wallet(WALLET, &ProgressSink::none()).await.unwrap();

    // Resumption: the request starts at the stored max block, not genesis.
    assert_eq!(second_chain.from_blocks.lock().unwrap()[0], Some(1004));

    // Idempotence: nothing new anywhere, yet the sync marker advances.
    assert_eq!(rerun.new_transfers, 0);
    assert_eq!(rerun.gas_records_written, 0);
    assert_eq!(rerun.price_points_added, 0);
    assert_eq!(prices.calls(), calls_after_first);
    assert_eq!(
        store.prices_for_asset("ETH", "ethereum").await.unwrap().len(),
        prices_after_first
    );
    assert_eq!(store.transfers_for_wallet(WALLET).await.unwrap().len(), 10);

    let second_sync = store
        .get_wallet(WALLET)
        .await
        .unwrap()
        .unwrap()
        .last_sync_at
        .unwrap();
    assert!(second_sync >= first_sync);
}

#[tokio::test]
async fn duplicate_page_yields_no_duplicate_records() {
    let store = seeded_store().await;
    let items: Vec<SourceTransfer> = (0..10).map(make_item).collect();
    let chain = chain_with_pages(
        vec![
            TransferPage {
                items: items.clone(),
                next_cursor: Some("in:again".to_string()),
            },
            TransferPage {
                items,
                next_cursor: None,
            },
        ],
        receipts_for_hashes(5),
    );
    let prices = Arc::new(ScriptedPriceSource::with_price(2000));
    let pipeline = ImportPipeline::new(store.clone(), chain, prices, settings());

    let summary = pipeline.import_wallet(WALLET, &ProgressSink::none()).await.unwrap();

    assert_eq!(summary.pages_fetched, 2);
    assert_eq!(summary.new_transfers, 10);
    let transfers = store.transfers_for_wallet(WALLET).await.unwrap();
    assert_eq!(transfers.len(), 10);

    // for every id, at most one stored record
    let mut ids: Vec<&str> = transfers.iter().map(|t| t.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn classification_rules_apply_at_ingest() {
    let store = seeded_store().await;
    store
        .upsert_classification(&AddressClassification::new(
            "minting contract",
            TransactionClass::Emission,
            Some(MINTER.to_string()),
            None,
        ))
        .await
        .unwrap();

    let chain = chain_with_pages(
        vec![TransferPage {
            items: (0..4).map(make_item).collect(),
            next_cursor: None,
        }],
        receipts_for_hashes(2),
    );
    let prices = Arc::new(ScriptedPriceSource::with_price(2000));
    let pipeline = ImportPipeline::new(store.clone(), chain, prices, settings());

    pipeline.import_wallet(WALLET, &ProgressSink::none()).await.unwrap();

    let transfers = store.transfers_for_wallet(WALLET).await.unwrap();
    assert!(transfers
        .iter()
        .all(|t| t.transaction_class == Some(TransactionClass::Emission)));
}

#[tokio::test]
async fn transfer_stage_failure_names_wallet_and_stage() {
    let store = seeded_store().await;
    let chain = Arc::new(ScriptedChainSource {
        fail_for: Some(WALLET.to_string()),
        ..Default::default()
    });
    let prices = Arc::new(ScriptedPriceSource::with_price(2000));
    let pipeline = ImportPipeline::new(store, chain, prices, settings());

    let error = pipeline
        .import_wallet(WALLET, &ProgressSink::none())
        .await
        .unwrap_err();

    match error {
        ImportError::Stage { wallet, stage, .. } => {
            assert_eq!(wallet, WALLET);
            assert_eq!(stage, ImportStage::Transfers);
        }
        other => panic!("expected stage error, got {:?}", other),
    }
}

#[tokio::test]
async fn batch_continues_past_failing_wallet() {
    let store = seeded_store().await;
    store
        .upsert_wallet(&Wallet::new(OTHER_WALLET, None))
        .await
        .unwrap();

    // WALLET imports fine, OTHER_WALLET's source call fails.
    let chain = Arc::new(ScriptedChainSource {
        pages: Mutex::new(VecDeque::from(vec![TransferPage {
            items: (0..2).map(make_item).collect(),
            next_cursor: None,
        }])),
        receipts: receipts_for_hashes(1),
        fail_for: Some(OTHER_WALLET.to_string()),
        ..Default::default()
    });
    let prices = Arc::new(ScriptedPriceSource::with_price(2000));
    let pipeline = ImportPipeline::new(store, chain, prices, settings());

    let report = pipeline.import_all(&ProgressSink::none()).await.unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);

    let failed = report
        .outcomes
        .iter()
        .find(|o| o.wallet_address == OTHER_WALLET)
        .unwrap();
    assert!(failed.error.as_deref().unwrap().contains("transfers"));
}

#[tokio::test]
async fn gas_item_failure_is_skipped_and_reported() {
    let store = seeded_store().await;
    // Four transfers over two hashes; only the first hash has a receipt.
    let chain = chain_with_pages(
        vec![TransferPage {
            items: (0..4).map(make_item).collect(),
            next_cursor: None,
        }],
        receipts_for_hashes(1),
    );
    let prices = Arc::new(ScriptedPriceSource::with_price(2000));
    let pipeline = ImportPipeline::new(store.clone(), chain, prices, settings());

    let summary = pipeline.import_wallet(WALLET, &ProgressSink::none()).await.unwrap();

    assert_eq!(summary.gas_records_written, 1);
    assert_eq!(summary.gas_items_skipped, 1);
    assert_eq!(
        pipeline.gas_gaps(WALLET).await.unwrap(),
        vec!["0xhash1".to_string()]
    );

    // The wallet still finishes its import pass.
    assert!(store
        .get_wallet(WALLET)
        .await
        .unwrap()
        .unwrap()
        .last_sync_at
        .is_some());
}

#[tokio::test]
async fn unknown_wallet_is_rejected_before_any_fetch() {
    let store = Arc::new(MemoryLedgerStore::new());
    let chain = Arc::new(ScriptedChainSource::default());
    let prices = Arc::new(ScriptedPriceSource::with_price(2000));
    let pipeline = ImportPipeline::new(store, chain.clone(), prices, settings());

    let error = pipeline
        .import_wallet(WALLET, &ProgressSink::none())
        .await
        .unwrap_err();
    assert!(matches!(error, ImportError::UnknownWallet(_)));
    assert!(chain.from_blocks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn balance_refresh_replaces_table() {
    let store = seeded_store().await;
    let chain = Arc::new(ScriptedChainSource {
        native_balance: Decimal::new(25, 1), // 2.5 ETH
        token_balances: vec![SourceTokenBalance {
            contract_address: "0x00000000000000000000000000000000000000dd".to_string(),
            symbol: "USDC".to_string(),
            name: Some("USD Coin".to_string()),
            balance: Decimal::from(100),
            decimals: Some(6),
        }],
        ..Default::default()
    });
    let mut prices = ScriptedPriceSource::with_price(2000);
    prices.spot.insert("ETH".to_string(), Decimal::from(2000));
    prices.spot.insert("USDC".to_string(), Decimal::ONE);
    let prices = Arc::new(prices);

    let refresher = BalanceRefresher::new(store.clone(), chain.clone(), prices.clone(), settings());
    let summary = refresher.refresh_wallet(WALLET).await.unwrap();

    assert_eq!(summary.assets, 2);
    assert_eq!(summary.total_value, Decimal::from(5100));

    let balances = store.balances_for_wallet(WALLET).await.unwrap();
    assert_eq!(balances.len(), 2);
    assert_eq!(balances[0].symbol, "ETH");
    assert_eq!(balances[0].value, Decimal::from(5000));
    assert_eq!(balances[1].symbol, "USDC");
    assert_eq!(balances[1].value, Decimal::from(100));

    // Spot prices land in the price cache tagged with their origin.
    let cached = store.prices_for_asset("ETH", "ethereum").await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].source, ledger_core::PriceOrigin::Balance);

    // Dummy mode clears the table without touching the provider.
    let mut offline = settings();
    offline.dummy_balance_mode = true;
    let dummy = BalanceRefresher::new(store.clone(), chain, prices, offline);
    let cleared = dummy.refresh_wallet(WALLET).await.unwrap();
    assert_eq!(cleared.assets, 0);
    assert!(store.balances_for_wallet(WALLET).await.unwrap().is_empty());
}
