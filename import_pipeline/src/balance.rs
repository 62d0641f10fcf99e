use crate::{ImportError, ImportSettings, Result};
use chrono::Utc;
use ledger_core::numeric::token_value;
use ledger_core::{
    normalize_address, ChainDataSource, HistoricalPrice, PriceOrigin, PriceSource, Repository,
    SourceError, TokenBalance,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of one balance refresh.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub wallet_address: String,
    pub assets: usize,
    pub total_value: Decimal,
}

/// Single-shot sibling of the import pipeline: fetches present-moment
/// balances and prices (not historical) and replaces the wallet's balance
/// table wholesale. No pagination or resume state.
pub struct BalanceRefresher {
    repo: Arc<dyn Repository>,
    chain: Arc<dyn ChainDataSource>,
    prices: Arc<dyn PriceSource>,
    settings: ImportSettings,
}

fn refresh_error(wallet: &str, err: SourceError) -> ImportError {
    ImportError::Refresh {
        wallet: wallet.to_string(),
        message: err.to_string(),
    }
}

impl BalanceRefresher {
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

    pub async fn refresh_wallet(&self, address: &str) -> Result<BalanceSummary> {
        let wallet = normalize_address(address);

        if self.repo.get_wallet(&wallet).await?.is_none() {
            return Err(ImportError::UnknownWallet(wallet));
        }

        // Offline toggle: clear the table, touch no network.
        if self.settings.dummy_balance_mode {
            info!("🧪 Dummy balance mode: clearing balances for {}", wallet);
            self.repo.clear_balances(&wallet).await?;
            return Ok(BalanceSummary {
                wallet_address: wallet,
                assets: 0,
                total_value: Decimal::ZERO,
            });
        }

        // Each call is a full refresh of this wallet's balance table,
        // swept across every enabled network.
        self.repo.clear_balances(&wallet).await?;

        let mut total_value = Decimal::ZERO;
        let mut assets = 0usize;

        for network in self.settings.networks.clone() {
            let (count, value) = self.refresh_network(&wallet, &network).await?;
            assets += count;
            total_value += value;
        }

        info!(
            "💰 Refreshed {} balances for {} (total {})",
            assets, wallet, total_value
        );

        Ok(BalanceSummary {
            wallet_address: wallet,
            assets,
            total_value,
        })
    }

    async fn refresh_network(&self, wallet: &str, network: &str) -> Result<(usize, Decimal)> {
        let native_balance = self
            .chain
            .fetch_native_balance(wallet, network)
            .await
            .map_err(|e| refresh_error(wallet, e))?;

        let tokens = self
            .chain
            .fetch_token_balances(wallet, network)
            .await
            .map_err(|e| refresh_error(wallet, e))?;

        let mut symbols: Vec<String> = Vec::with_capacity(tokens.len() + 1);
        symbols.push(self.settings.native_symbol.clone());
        symbols.extend(tokens.iter().map(|t| t.symbol.clone()));
        symbols.sort();
        symbols.dedup();

        let spot = self
            .prices
            .fetch_spot_prices(&symbols, &self.settings.currency)
            .await
            .map_err(|e| refresh_error(wallet, e))?;

        let now = Utc::now();
        let mut total_value = Decimal::ZERO;
        let mut assets = 0usize;
        let mut price_rows: Vec<HistoricalPrice> = Vec::new();

        let native_price = spot
            .get(&self.settings.native_symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let native_value = token_value(native_balance, native_price);

        self.repo
            .upsert_balance(&TokenBalance {
                wallet_address: wallet.to_string(),
                symbol: self.settings.native_symbol.clone(),
                name: None,
                balance: native_balance,
                price: native_price,
                value: native_value,
                network: network.to_string(),
                decimals: Some(18),
                updated_at: now,
            })
            .await?;
        total_value += native_value;
        assets += 1;

        if native_price > Decimal::ZERO {
            price_rows.push(HistoricalPrice {
                symbol: Some(self.settings.native_symbol.clone()),
                contract_address: None,
                network: network.to_string(),
                price: native_price,
                currency: self.settings.currency.clone(),
                timestamp: now,
                source: PriceOrigin::Balance,
                created_at: now,
            });
        }

        for token in tokens {
            let price = spot.get(&token.symbol).copied().unwrap_or(Decimal::ZERO);
            let value = token_value(token.balance, price);
            debug!(
                "💳 {} {} on {}: {} x {} = {}",
                wallet, token.symbol, network, token.balance, price, value
            );

            self.repo
                .upsert_balance(&TokenBalance {
                    wallet_address: wallet.to_string(),
                    symbol: token.symbol.clone(),
                    name: token.name,
                    balance: token.balance,
                    price,
                    value,
                    network: network.to_string(),
                    decimals: token.decimals,
                    updated_at: now,
                })
                .await?;
            total_value += value;
            assets += 1;

            if price > Decimal::ZERO {
                price_rows.push(HistoricalPrice {
                    symbol: Some(token.symbol),
                    contract_address: Some(token.contract_address),
                    network: network.to_string(),
                    price,
                    currency: self.settings.currency.clone(),
                    timestamp: now,
                    source: PriceOrigin::Balance,
                    created_at: now,
                });
            }
        }

        if !price_rows.is_empty() {
            self.repo.merge_prices(&price_rows).await?;
        }

        Ok((assets, total_value))
    }
}
