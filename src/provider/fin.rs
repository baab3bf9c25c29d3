//! Kujira FIN connector (REST polling).
//!
//! FIN is an order-book DEX whose indexer exposes a CoinGecko-style pair
//! and ticker listing plus a candle endpoint keyed by pool contract
//! address. Subscribing a pair therefore resolves its pool address first;
//! the poll loop then refreshes tickers in bulk and candles per pool with
//! 5-minute bins.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use log::warn;
use serde::Deserialize;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    CandlePrice, CurrencyPair, Endpoint, Error, PriceStore, Provider, ProviderName, TickerPrice,
    http_client, past_unix_time_ms, resolve_urls, telemetry,
};

const NAME: ProviderName = ProviderName::Fin;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const CANDLE_BIN: &str = "5m";
const CANDLE_LOOKBACK: Duration = Duration::from_secs(30 * 60);

/// Default REST endpoint (Kujira indexer).
pub fn default_rest_url() -> Url {
    "https://api.kujira.app".parse().unwrap()
}

#[derive(Deserialize)]
struct FinPair {
    /// e.g. `"ATOM_USDT"`.
    ticker_id: String,
    /// FIN market contract address.
    pool_id: String,
}

#[derive(Deserialize)]
struct FinPairs {
    pairs: Vec<FinPair>,
}

#[derive(Deserialize)]
struct FinTicker {
    ticker_id: String,
    last_price: String,
    base_volume: String,
}

#[derive(Deserialize)]
struct FinTickers {
    tickers: Vec<FinTicker>,
}

#[derive(Deserialize)]
struct FinCandle {
    /// Bin close time, RFC 3339.
    bin: String,
    close: String,
    volume: String,
}

#[derive(Deserialize)]
struct FinCandles {
    candles: Vec<FinCandle>,
}

fn canonical(ticker_id: &str) -> String {
    ticker_id.replace('_', "").to_uppercase()
}

/// Kujira FIN market-data provider.
pub struct FinProvider {
    store: Arc<PriceStore>,
    http: reqwest::Client,
    rest_url: Url,
    /// Canonical pair string → pool contract address.
    pools: Arc<RwLock<HashMap<String, String>>>,
}

impl FinProvider {
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (_, rest_url, _) =
            resolve_urls(NAME, endpoint, default_rest_url(), default_rest_url())?;
        let provider = Self {
            store: Arc::new(PriceStore::new(NAME)),
            http: http_client(),
            rest_url,
            pools: Arc::new(RwLock::new(HashMap::new())),
        };
        provider.subscribe_currency_pairs(pairs).await?;
        provider.spawn_poll_loop(cancel);
        Ok(provider)
    }

    async fn fetch_pairs(&self) -> Result<Vec<FinPair>> {
        let url = self.rest_url.join("/api/coingecko/pairs")?;
        let resp: FinPairs = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.pairs)
    }

    fn spawn_poll_loop(&self, cancel: CancellationToken) {
        let store = self.store.clone();
        let http = self.http.clone();
        let rest_url = self.rest_url.clone();
        let pools = self.pools.clone();
        tokio::spawn(async move {
            let mut tick = interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        if let Err(err) = poll_tickers(&http, &rest_url, &store).await {
                            warn!("{NAME}: polling tickers: {err:#}");
                            telemetry::failure(NAME, "rest");
                        }
                        for pair in store.subscribed_pairs() {
                            let pool = pools.read().unwrap().get(&pair.to_string()).cloned();
                            let Some(pool) = pool else { continue };
                            if let Err(err) =
                                poll_candles(&http, &rest_url, &store, &pair, &pool).await
                            {
                                warn!("{NAME}: polling candles for {pair}: {err:#}");
                                telemetry::failure(NAME, "rest");
                            }
                        }
                    }
                }
            }
        });
    }
}

async fn poll_tickers(http: &reqwest::Client, rest_url: &Url, store: &PriceStore) -> Result<()> {
    let url = rest_url.join("/api/coingecko/tickers")?;
    let resp: FinTickers = http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let subscribed: HashSet<String> = store
        .subscribed_pairs()
        .iter()
        .map(ToString::to_string)
        .collect();
    for ticker in resp.tickers {
        let symbol = canonical(&ticker.ticker_id);
        if !subscribed.contains(&symbol) {
            continue;
        }
        match TickerPrice::new(&ticker.last_price, &ticker.base_volume) {
            Ok(price) => store.set_ticker(symbol, price),
            Err(err) => {
                warn!("{NAME}: dropping ticker for {}: {err}", ticker.ticker_id);
                telemetry::failure(NAME, "numeric");
            }
        }
    }
    Ok(())
}

async fn poll_candles(
    http: &reqwest::Client,
    rest_url: &Url,
    store: &PriceStore,
    pair: &CurrencyPair,
    pool: &str,
) -> Result<()> {
    let mut url = rest_url.join("/api/trades/candles")?;
    url.query_pairs_mut()
        .append_pair("contract", pool)
        .append_pair("precision", CANDLE_BIN)
        .append_pair("from", &past_unix_time_ms(CANDLE_LOOKBACK).to_string());
    let resp: FinCandles = http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let mut candles = Vec::new();
    for raw in resp.candles {
        let bin = DateTime::parse_from_rfc3339(&raw.bin)
            .with_context(|| format!("bad bin time {:?}", raw.bin))?;
        candles.push(CandlePrice::new(
            &raw.close,
            &raw.volume,
            bin.timestamp_millis(),
        )?);
    }
    candles.sort_by_key(|candle| candle.timestamp_ms);
    store.replace_candles(pair.to_string(), candles);
    Ok(())
}

#[async_trait]
impl Provider for FinProvider {
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

    async fn get_available_pairs(&self) -> Result<HashSet<String>> {
        Ok(self
            .fetch_pairs()
            .await?
            .into_iter()
            .map(|pair| canonical(&pair.ticker_id))
            .collect())
    }

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<()> {
        let listed = self.fetch_pairs().await?;
        let by_symbol: HashMap<String, String> = listed
            .into_iter()
            .map(|pair| (canonical(&pair.ticker_id), pair.pool_id))
            .collect();
        let confirmed: Vec<CurrencyPair> = pairs
            .iter()
            .filter(|pair| {
                let known = by_symbol.contains_key(&pair.to_string());
                if !known {
                    warn!("{NAME}: pair {pair} not advertised by provider, dropping");
                }
                known
            })
            .cloned()
            .collect();
        let added = self.store.subscribe_pairs(&confirmed);
        if added.is_empty() {
            return Ok(());
        }
        let mut pools = self.pools.write().unwrap();
        for pair in &added {
            let symbol = pair.to_string();
            let pool = by_symbol
                .get(&symbol)
                .cloned()
                .ok_or_else(|| Error::UnknownPool(symbol.clone()))?;
            pools.insert(symbol, pool);
        }
        drop(pools);
        telemetry::websocket_subscribed_pairs(NAME, added.len());
        Ok(())
    }

    fn start_connections(&self) {}
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    const PAIRS_JSON: &str = r#"{"pairs":[
        {"ticker_id":"ATOM_USDT","base":"ATOM","target":"USDT","pool_id":"kujira1pool"}
    ]}"#;
    const TICKERS_JSON: &str = r#"{"tickers":[
        {"ticker_id":"ATOM_USDT","last_price":"13.41","base_volume":"520.5","pool_id":"kujira1pool"}
    ]}"#;
    const CANDLES_JSON: &str = r#"{"candles":[
        {"bin":"2024-01-01T00:05:00Z","open":"13.3","close":"13.35","volume":"50"},
        {"bin":"2024-01-01T00:10:00Z","open":"13.35","close":"13.41","volume":"61"}
    ]}"#;

    #[tokio::test]
    async fn test_poll_resolves_pool_and_fills_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/coingecko/pairs"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAIRS_JSON))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/coingecko/tickers"))
            .respond_with(ResponseTemplate::new(200).set_body_string(TICKERS_JSON))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/trades/candles"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CANDLES_JSON))
            .mount(&server)
            .await;

        let endpoint = Endpoint {
            name: NAME,
            rest_url: Some(server.uri().parse().unwrap()),
            websocket_url: None,
            api_key: None,
        };
        let pair = CurrencyPair::new("ATOM", "USDT");
        let cancel = CancellationToken::new();
        let provider = FinProvider::new(cancel.clone(), Some(endpoint), &[pair.clone()])
            .await
            .unwrap();

        assert_eq!(
            provider.pools.read().unwrap().get("ATOMUSDT"),
            Some(&"kujira1pool".to_string())
        );

        // The candle fetch is the last step of a poll tick; once it lands,
        // the ticker is in place too.
        let mut candles = HashMap::new();
        for _ in 0..50 {
            candles = provider.get_candle_prices(&[pair.clone()]);
            if !candles.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();

        assert_eq!(candles[&pair].len(), 2);
        assert_eq!(candles[&pair][1].price, dec!(13.41));

        let tickers = provider.get_ticker_prices(&[pair.clone()]);
        assert_eq!(tickers[&pair].price, dec!(13.41));
        assert_eq!(tickers[&pair].volume, dec!(520.5));
    }
}
