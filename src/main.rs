use alchemy_client::{AlchemyChainClient, AlchemyPriceClient};
use anyhow::{anyhow, bail, Context, Result};
use config_manager::SystemConfig;
use import_pipeline::{BalanceRefresher, ImportPipeline, ImportSettings};
use ledger_core::numeric::shorten_address;
use ledger_core::{
    is_evm_address, AddressClassification, ProgressSink, Repository, TransactionClass, Wallet,
};
use persistence_layer::RedisLedgerStore;
use retry_utils::AdaptiveRateLimiter;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_usage() {
    println!("ledger_tracker - wallet ledger reconciliation");
    println!();
    println!("Usage:");
    println!("  ledger_tracker add-wallet <address> [name]");
    println!("  ledger_tracker add-rule <name> <class> [--wallet <address>] [--contract <address>]");
    println!("  ledger_tracker import <address>");
    println!("  ledger_tracker import-all");
    println!("  ledger_tracker balances <address>");
    println!("  ledger_tracker gas-gaps <address>");
    println!("  ledger_tracker export <transfers|gas|balances> <path.csv>");
    println!();
    println!("Configuration comes from config.toml and LEDGER__-prefixed env vars.");
}

struct App {
    store: Arc<RedisLedgerStore>,
    pipeline: ImportPipeline,
    refresher: BalanceRefresher,
}

impl App {
    fn build(store: Arc<RedisLedgerStore>, config: &SystemConfig) -> Result<Self> {
        // One limiter instance: every provider call in this process shares
        // the same adaptive delay.
        let limiter = Arc::new(AdaptiveRateLimiter::new());

        let chain = Arc::new(
            AlchemyChainClient::new(&config.provider, limiter.clone())
                .map_err(|e| anyhow!("chain client: {}", e))?,
        );
        let prices = Arc::new(
            AlchemyPriceClient::new(&config.provider, limiter)
                .map_err(|e| anyhow!("price client: {}", e))?,
        );

        let settings = ImportSettings::from_config(config);
        let pipeline = ImportPipeline::new(
            store.clone(),
            chain.clone(),
            prices.clone(),
            settings.clone(),
        );
        let refresher = BalanceRefresher::new(store.clone(), chain, prices, settings);

        Ok(Self {
            store,
            pipeline,
            refresher,
        })
    }
}

/// Drain a progress channel into the log until the sink is dropped.
fn spawn_progress_logger(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<ledger_core::ImportProgress>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let total = event
                .total
                .map(|t| t.to_string())
                .unwrap_or_else(|| "?".to_string());
            info!(
                "[{}] {} {}/{} {}",
                shorten_address(&event.wallet_address),
                event.stage,
                event.current,
                total,
                event.current_item
            );
        }
    })
}

async fn cmd_import(app: &App, address: &str) -> Result<()> {
    let (sink, rx) = ProgressSink::channel();
    let logger = spawn_progress_logger(rx);

    let result = app.pipeline.import_wallet(address, &sink).await;
    drop(sink);
    logger.await.ok();

    let summary = result?;
    println!(
        "Imported {}: {} new transfers over {} pages, {} gas records ({} skipped), {} price points ({} lookups skipped)",
        summary.wallet_address,
        summary.new_transfers,
        summary.pages_fetched,
        summary.gas_records_written,
        summary.gas_items_skipped,
        summary.price_points_added,
        summary.price_items_skipped,
    );
    Ok(())
}

async fn cmd_import_all(app: &App) -> Result<()> {
    let (sink, rx) = ProgressSink::channel();
    let logger = spawn_progress_logger(rx);

    let result = app.pipeline.import_all(&sink).await;
    drop(sink);
    logger.await.ok();

    let report = result?;
    for outcome in &report.outcomes {
        match (&outcome.summary, &outcome.error) {
            (Some(summary), _) => println!(
                "{}: {} new transfers, {} gas records",
                outcome.wallet_address, summary.new_transfers, summary.gas_records_written
            ),
            (None, Some(error)) => println!("{}: FAILED - {}", outcome.wallet_address, error),
            (None, None) => {}
        }
    }

    if report.failed() > 0 {
        bail!(
            "{} of {} wallets failed to import",
            report.failed(),
            report.outcomes.len()
        );
    }
    Ok(())
}

async fn cmd_balances(app: &App, address: &str) -> Result<()> {
    let summary = app.refresher.refresh_wallet(address).await?;
    println!(
        "Refreshed {} assets for {} (total value {})",
        summary.assets, summary.wallet_address, summary.total_value
    );

    for balance in app
        .store
        .balances_for_wallet(&summary.wallet_address)
        .await
        .map_err(|e| anyhow!("{}", e))?
    {
        println!(
            "  {:<8} {:>24} @ {:>12} = {}",
            balance.symbol, balance.balance, balance.price, balance.value
        );
    }
    Ok(())
}

async fn cmd_gas_gaps(app: &App, address: &str) -> Result<()> {
    let gaps = app.pipeline.gas_gaps(address).await?;
    if gaps.is_empty() {
        println!("No missing gas records for {}", address);
    } else {
        println!("{} transactions missing gas records:", gaps.len());
        for hash in gaps {
            println!("  {}", hash);
        }
    }
    Ok(())
}

async fn cmd_add_wallet(store: &RedisLedgerStore, args: &[String]) -> Result<()> {
    let Some(address) = args.first() else {
        bail!("usage: add-wallet <address> [name]");
    };
    if !is_evm_address(address) {
        bail!("'{}' is not a valid address", address);
    }

    let wallet = Wallet::new(address, args.get(1).cloned());
    if store
        .get_wallet(&wallet.address)
        .await
        .map_err(|e| anyhow!("{}", e))?
        .is_some()
    {
        bail!("wallet {} is already tracked", wallet.address);
    }

    store
        .upsert_wallet(&wallet)
        .await
        .map_err(|e| anyhow!("{}", e))?;
    println!("Tracking wallet {}", wallet.address);
    Ok(())
}

async fn cmd_add_rule(store: &RedisLedgerStore, args: &[String]) -> Result<()> {
    let (Some(name), Some(class)) = (args.first(), args.get(1)) else {
        bail!("usage: add-rule <name> <class> [--wallet <address>] [--contract <address>]");
    };
    let class: TransactionClass = class.parse().map_err(|e| anyhow!("{}", e))?;

    let mut wallet_address = None;
    let mut contract_address = None;
    let mut rest = args[2..].iter();
    while let Some(flag) = rest.next() {
        match flag.as_str() {
            "--wallet" => wallet_address = rest.next().cloned(),
            "--contract" => contract_address = rest.next().cloned(),
            other => bail!("unknown flag: {}", other),
        }
    }

    let rule = AddressClassification::new(name, class, wallet_address, contract_address);
    rule.validate().map_err(|e| anyhow!("{}", e))?;

    store
        .upsert_classification(&rule)
        .await
        .map_err(|e| anyhow!("{}", e))?;
    println!("Added rule '{}' -> {}", rule.name, rule.transaction_class);
    Ok(())
}

async fn cmd_export(store: &RedisLedgerStore, args: &[String]) -> Result<()> {
    let (Some(kind), Some(path)) = (args.first(), args.get(1)) else {
        bail!("usage: export <transfers|gas|balances> <path.csv>");
    };

    let wallets = store.list_wallets().await.map_err(|e| anyhow!("{}", e))?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("cannot open {} for writing", path))?;
    let mut rows = 0usize;

    match kind.as_str() {
        "transfers" => {
            writer.write_record([
                "wallet", "id", "block_number", "hash", "from", "to", "value", "asset",
                "category", "contract", "decimals", "timestamp", "class",
            ])?;
            for wallet in &wallets {
                for t in store
                    .transfers_for_wallet(&wallet.address)
                    .await
                    .map_err(|e| anyhow!("{}", e))?
                {
                    writer.write_record([
                        t.wallet_address.clone(),
                        t.id.clone(),
                        t.block_number.to_string(),
                        t.hash.clone(),
                        t.from_address.clone(),
                        t.to_address.clone(),
                        t.value.to_string(),
                        t.asset.clone(),
                        t.category.clone(),
                        t.contract_address.clone().unwrap_or_default(),
                        t.decimals.to_string(),
                        t.timestamp.to_rfc3339(),
                        t.transaction_class
                            .map(|c| c.to_string())
                            .unwrap_or_default(),
                    ])?;
                    rows += 1;
                }
            }
        }
        "gas" => {
            writer.write_record([
                "wallet", "hash", "block_number", "gas_used", "gas_price", "gas_cost_eth",
                "gas_cost_usd", "timestamp",
            ])?;
            for wallet in &wallets {
                for g in store
                    .gas_records_for_wallet(&wallet.address)
                    .await
                    .map_err(|e| anyhow!("{}", e))?
                {
                    writer.write_record([
                        g.wallet_address.clone(),
                        g.hash.clone(),
                        g.block_number.to_string(),
                        g.gas_used.clone(),
                        g.gas_price.clone(),
                        g.gas_cost_eth.to_string(),
                        g.gas_cost_usd.to_string(),
                        g.timestamp.to_rfc3339(),
                    ])?;
                    rows += 1;
                }
            }
        }
        "balances" => {
            writer.write_record([
                "wallet", "symbol", "name", "balance", "price", "value", "network",
                "updated_at",
            ])?;
            for wallet in &wallets {
                for b in store
                    .balances_for_wallet(&wallet.address)
                    .await
                    .map_err(|e| anyhow!("{}", e))?
                {
                    writer.write_record([
                        b.wallet_address.clone(),
                        b.symbol.clone(),
                        b.name.clone().unwrap_or_default(),
                        b.balance.to_string(),
                        b.price.to_string(),
                        b.value.to_string(),
                        b.network.clone(),
                        b.updated_at.to_rfc3339(),
                    ])?;
                    rows += 1;
                }
            }
        }
        other => bail!("unknown export kind: {}", other),
    }

    writer.flush()?;
    println!("Wrote {} rows to {}", rows, path);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    let config = SystemConfig::load().context("failed to load configuration")?;
    let store = Arc::new(
        RedisLedgerStore::new(&config.redis.url)
            .await
            .map_err(|e| anyhow!("store unavailable: {}", e))?,
    );

    match command.as_str() {
        "add-wallet" => cmd_add_wallet(&store, &args[1..]).await,
        "add-rule" => cmd_add_rule(&store, &args[1..]).await,
        "export" => cmd_export(&store, &args[1..]).await,
        "import" => {
            let Some(address) = args.get(1) else {
                bail!("usage: import <address>");
            };
            let app = App::build(store, &config)?;
            cmd_import(&app, address).await
        }
        "import-all" => {
            let app = App::build(store, &config)?;
            cmd_import_all(&app).await
        }
        "balances" => {
            let Some(address) = args.get(1) else {
                bail!("usage: balances <address>");
            };
            let app = App::build(store, &config)?;
            cmd_balances(&app, address).await
        }
        "gas-gaps" => {
            let Some(address) = args.get(1) else {
                bail!("usage: gas-gaps <address>");
            };
            let app = App::build(store, &config)?;
            cmd_gas_gaps(&app, address).await
        }
        other => {
            print_usage();
            bail!("unknown command: {}", other)
        }
    }
}
