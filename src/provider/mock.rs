//! Deterministic in-process provider for wiring and aggregator tests.
//!
//! No network. Every poll tick writes a ticker and a current-minute candle
//! for each subscribed pair; the price is a stable function of the pair's
//! symbol so assertions can be written against it.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use super::{
    CandlePrice, CurrencyPair, PriceStore, Provider, ProviderName, TickerPrice, telemetry,
};

const NAME: ProviderName = ProviderName::Mock;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const MOCK_VOLUME: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 2);

/// Stable synthetic price for a symbol: a function of its bytes, scaled to
/// a plausible range.
fn mock_price(symbol: &str) -> Decimal {
    let seed: u32 = symbol.bytes().map(u32::from).sum();
    Decimal::new(i64::from(seed % 10_000) + 100, 2)
}

/// Synthetic market-data provider.
pub struct MockProvider {
    store: Arc<PriceStore>,
}

impl MockProvider {
    /// Creates the provider and starts its synthetic feed immediately.
    pub fn new(cancel: CancellationToken, pairs: &[CurrencyPair]) -> Self {
        let store = Arc::new(PriceStore::new(NAME));
        let added = store.subscribe_pairs(pairs);
        telemetry::websocket_subscribed_pairs(NAME, added.len());

        let poll_store = store.clone();
        tokio::spawn(async move {
            let mut tick = interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        for pair in poll_store.subscribed_pairs() {
                            let symbol = pair.to_string();
                            let price = mock_price(&symbol);
                            poll_store.set_ticker(
                                symbol.clone(),
                                TickerPrice { price, volume: MOCK_VOLUME },
                            );
                            let now_secs = Utc::now().timestamp();
                            poll_store.replace_candles(
                                symbol,
                                vec![CandlePrice {
                                    price,
                                    volume: MOCK_VOLUME,
                                    timestamp_ms: (now_secs / 60 * 60 + 60) * 1000,
                                }],
                            );
                        }
                    }
                }
            }
        });

        Self { store }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> ProviderName {
        NAME
    }

    fn get_ticker_prices(&self, pairs: &[CurrencyPair]) -> HashMap<CurrencyPair, TickerPrice> {
        self.store.get_ticker_prices(pairs)
    }

    fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> HashMap<CurrencyPair, Vec<CandlePrice>> {
        self.store.get_candle_prices(pairs)
    }

    /// Everything it is asked about is "available".
    async fn get_available_pairs(&self) -> Result<HashSet<String>> {
        Ok(self
            .store
            .subscribed_pairs()
            .iter()
            .map(ToString::to_string)
            .collect())
    }

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<()> {
        let added = self.store.subscribe_pairs(pairs);
        telemetry::websocket_subscribed_pairs(NAME, added.len());
        Ok(())
    }

    fn start_connections(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_price_is_deterministic() {
        assert_eq!(mock_price("ATOMUSDT"), mock_price("ATOMUSDT"));
        assert!(mock_price("ATOMUSDT") > Decimal::ZERO);
        assert_ne!(mock_price("ATOMUSDT"), mock_price("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_feed_populates_subscribed_pairs() {
        let pair = CurrencyPair::new("ATOM", "USDT");
        let cancel = CancellationToken::new();
        let provider = MockProvider::new(cancel.clone(), &[pair.clone()]);

        let mut tickers = HashMap::new();
        for _ in 0..50 {
            tickers = provider.get_ticker_prices(&[pair.clone()]);
            if !tickers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();

        assert_eq!(tickers[&pair].price, mock_price("ATOMUSDT"));
        assert!(!provider.get_candle_prices(&[pair.clone()]).is_empty());
    }

    #[tokio::test]
    async fn test_store_is_stable_after_cancellation() {
        let pair = CurrencyPair::new("ATOM", "USDT");
        let cancel = CancellationToken::new();
        let provider = MockProvider::new(cancel.clone(), &[pair.clone()]);

        for _ in 0..50 {
            if !provider.get_ticker_prices(&[pair.clone()]).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();

        // Let any in-flight tick drain, then the caches must stop moving.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let tickers = provider.get_ticker_prices(&[pair.clone()]);
        let candles = provider.get_candle_prices(&[pair.clone()]);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(provider.get_ticker_prices(&[pair.clone()]), tickers);
        assert_eq!(provider.get_candle_prices(&[pair.clone()]), candles);
    }
}
