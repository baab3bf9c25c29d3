//! Uniswap v3 connector (GraphQL subgraph polling).
//!
//! Prices come from a v3 subgraph rather than the chain itself. Queries are
//! pool-indexed and batched: one request fetches `poolMinuteDatas` (candles)
//! and `poolHourDatas` (volume) for every subscribed pool. A pair's price is
//! `token0Price` or `token1Price` depending on which side of the pool the
//! base token sits, and the ticker's volume folds the last 24 hourly
//! `volumeUSDTracked` figures into one number.

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use log::warn;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    CandlePrice, CurrencyPair, Endpoint, PriceStore, Provider, ProviderName, TickerPrice,
    http_client, resolve_urls, telemetry,
};

const NAME: ProviderName = ProviderName::Uniswap;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Hourly bars folded into the 24h ticker volume.
const VOLUME_HOURS: usize = 24;

/// Default subgraph endpoint.
pub fn default_rest_url() -> Url {
    "https://api.thegraph.com/subgraphs/name/uniswap/uniswap-v3"
        .parse()
        .unwrap()
}

/// Where a pair's liquidity lives and how the pool is oriented.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Pool contract address, lowercase hex.
    pub address: String,
    /// Whether the pair's base currency is the pool's `token0`.
    pub base_is_token0: bool,
}

fn default_pools() -> HashMap<String, PoolConfig> {
    [
        (
            "WETHUSDC".to_string(),
            PoolConfig {
                address: "0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640".to_string(),
                base_is_token0: false,
            },
        ),
        (
            "WBTCWETH".to_string(),
            PoolConfig {
                address: "0xcbcdf062e5f2b4f85cd76ad307bfe0cdc8ba8a1a".to_string(),
                base_is_token0: true,
            },
        ),
    ]
    .into()
}

const POOL_DATA_QUERY: &str = "\
query ($pools: [String!]) {
  poolMinuteDatas(first: 100, orderBy: periodStartUnix, orderDirection: desc, \
where: {pool_in: $pools}) {
    pool { id } periodStartUnix token0Price token1Price volumeUSDTracked
  }
  poolHourDatas(first: 200, orderBy: periodStartUnix, orderDirection: desc, \
where: {pool_in: $pools}) {
    pool { id } periodStartUnix token0Price token1Price volumeUSDTracked
  }
}";

#[derive(Deserialize)]
struct GraphResponse {
    data: Option<GraphData>,
    errors: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GraphData {
    #[serde(rename = "poolMinuteDatas")]
    minutes: Vec<PoolData>,
    #[serde(rename = "poolHourDatas")]
    hours: Vec<PoolData>,
}

#[derive(Deserialize)]
struct PoolData {
    pool: PoolId,
    #[serde(rename = "periodStartUnix")]
    period_start: i64,
    #[serde(rename = "token0Price")]
    token0_price: String,
    #[serde(rename = "token1Price")]
    token1_price: String,
    #[serde(rename = "volumeUSDTracked")]
    volume_usd: String,
}

#[derive(Deserialize)]
struct PoolId {
    id: String,
}

impl PoolData {
    fn price(&self, base_is_token0: bool) -> &str {
        if base_is_token0 {
            &self.token0_price
        } else {
            &self.token1_price
        }
    }
}

/// Uniswap v3 subgraph market-data provider.
pub struct UniswapProvider {
    store: Arc<PriceStore>,
    http: reqwest::Client,
    graph_url: Url,
    pools: HashMap<String, PoolConfig>,
}

impl UniswapProvider {
    /// Creates the provider with the built-in pool table.
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        Self::with_pools(cancel, endpoint, pairs, default_pools()).await
    }

    /// Creates the provider with a caller-supplied pair → pool table.
    pub async fn with_pools(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
        pools: HashMap<String, PoolConfig>,
    ) -> Result<Self> {
        let (_, graph_url, _) =
            resolve_urls(NAME, endpoint, default_rest_url(), default_rest_url())?;
        let provider = Self {
            store: Arc::new(PriceStore::new(NAME)),
            http: http_client(),
            graph_url,
            pools,
        };
        provider.subscribe_currency_pairs(pairs).await?;
        provider.spawn_poll_loop(cancel);
        Ok(provider)
    }

    fn spawn_poll_loop(&self, cancel: CancellationToken) {
        let store = self.store.clone();
        let http = self.http.clone();
        let graph_url = self.graph_url.clone();
        let pools = self.pools.clone();
        tokio::spawn(async move {
            let mut tick = interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        if let Err(err) = poll_pools(&http, &graph_url, &store, &pools).await {
                            warn!("{NAME}: polling subgraph: {err:#}");
                            telemetry::failure(NAME, "graphql");
                        }
                    }
                }
            }
        });
    }
}

async fn poll_pools(
    http: &reqwest::Client,
    graph_url: &Url,
    store: &PriceStore,
    pools: &HashMap<String, PoolConfig>,
) -> Result<()> {
    // Only query pools backing subscribed pairs.
    let mut symbol_config: HashMap<String, &PoolConfig> = HashMap::new();
    for pair in store.subscribed_pairs() {
        let symbol = pair.to_string();
        if let Some(config) = pools.get(&symbol) {
            symbol_config.insert(symbol, config);
        }
    }
    if symbol_config.is_empty() {
        return Ok(());
    }
    let address_symbol: HashMap<&str, &str> = symbol_config
        .iter()
        .map(|(symbol, config)| (config.address.as_str(), symbol.as_str()))
        .collect();
    let addresses: Vec<&str> = address_symbol.keys().copied().collect();

    let resp: GraphResponse = http
        .post(graph_url.clone())
        .json(&json!({"query": POOL_DATA_QUERY, "variables": {"pools": addresses}}))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if let Some(errors) = resp.errors {
        bail!("subgraph errors: {errors}");
    }
    let Some(data) = resp.data else {
        bail!("subgraph response had no data");
    };

    // Candles from the minute series, oldest first.
    let mut candles_by_symbol: HashMap<String, Vec<CandlePrice>> = HashMap::new();
    for row in &data.minutes {
        let Some(&symbol) = address_symbol.get(row.pool.id.as_str()) else {
            continue;
        };
        let base_is_token0 = symbol_config[symbol].base_is_token0;
        match CandlePrice::new(
            row.price(base_is_token0),
            &row.volume_usd,
            (row.period_start + 60) * 1000,
        ) {
            Ok(candle) => candles_by_symbol
                .entry(symbol.to_string())
                .or_default()
                .push(candle),
            Err(err) => {
                warn!("{NAME}: dropping minute bar for {symbol}: {err}");
                telemetry::failure(NAME, "numeric");
            }
        }
    }
    for (symbol, mut candles) in candles_by_symbol {
        candles.sort_by_key(|candle| candle.timestamp_ms);
        store.replace_candles(symbol, candles);
    }

    // 24h ticker volume folded from the hourly series.
    let mut volume_by_symbol: HashMap<&str, (Decimal, usize)> = HashMap::new();
    for row in &data.hours {
        let Some(&symbol) = address_symbol.get(row.pool.id.as_str()) else {
            continue;
        };
        let entry = volume_by_symbol.entry(symbol).or_insert((Decimal::ZERO, 0));
        if entry.1 >= VOLUME_HOURS {
            continue;
        }
        match Decimal::from_str(&row.volume_usd) {
            Ok(volume) => {
                entry.0 += volume;
                entry.1 += 1;
            }
            Err(_) => telemetry::failure(NAME, "numeric"),
        }
    }

    // Ticker price is the newest minute bar for each pool.
    for (symbol, config) in &symbol_config {
        let Some(latest) = data
            .minutes
            .iter()
            .filter(|row| row.pool.id == config.address)
            .max_by_key(|row| row.period_start)
        else {
            continue;
        };
        let volume = volume_by_symbol
            .get(symbol.as_str())
            .map(|(total, _)| *total)
            .unwrap_or(Decimal::ZERO);
        match Decimal::from_str(latest.price(config.base_is_token0)) {
            Ok(price) => store.set_ticker(symbol.clone(), TickerPrice { price, volume }),
            Err(_) => {
                warn!("{NAME}: dropping ticker for {symbol}: bad price");
                telemetry::failure(NAME, "numeric");
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Provider for UniswapProvider {
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

    /// The universe is the configured pool table.
    async fn get_available_pairs(&self) -> Result<HashSet<String>> {
        Ok(self.pools.keys().cloned().collect())
    }

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<()> {
        let confirmed: Vec<CurrencyPair> = pairs
            .iter()
            .filter(|pair| {
                let known = self.pools.contains_key(&pair.to_string());
                if !known {
                    warn!("{NAME}: no pool configured for {pair}, dropping");
                }
                known
            })
            .cloned()
            .collect();
        let added = self.store.subscribe_pairs(&confirmed);
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

    const GRAPH_JSON: &str = r#"{"data":{
        "poolMinuteDatas":[
            {"pool":{"id":"0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640"},"periodStartUnix":1704067260,"token0Price":"0.0003125","token1Price":"3200.5","volumeUSDTracked":"1500.25"},
            {"pool":{"id":"0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640"},"periodStartUnix":1704067200,"token0Price":"0.0003126","token1Price":"3198.75","volumeUSDTracked":"900.5"}
        ],
        "poolHourDatas":[
            {"pool":{"id":"0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640"},"periodStartUnix":1704067200,"token0Price":"0.0003125","token1Price":"3200.5","volumeUSDTracked":"10000"},
            {"pool":{"id":"0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640"},"periodStartUnix":1704063600,"token0Price":"0.0003126","token1Price":"3198.75","volumeUSDTracked":"20000"}
        ]
    }}"#;

    #[tokio::test]
    async fn test_poll_derives_price_and_folds_volume() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GRAPH_JSON))
            .mount(&server)
            .await;

        let endpoint = Endpoint {
            name: NAME,
            rest_url: Some(server.uri().parse().unwrap()),
            websocket_url: None,
            api_key: None,
        };
        let pair = CurrencyPair::new("WETH", "USDC");
        let cancel = CancellationToken::new();
        let provider = UniswapProvider::new(cancel.clone(), Some(endpoint), &[pair.clone()])
            .await
            .unwrap();

        let mut tickers = HashMap::new();
        for _ in 0..50 {
            tickers = provider.get_ticker_prices(&[pair.clone()]);
            if !tickers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();

        // WETH is token1 in the USDC/WETH pool, so the price is token1Price.
        assert_eq!(tickers[&pair].price, dec!(3200.5));
        assert_eq!(tickers[&pair].volume, dec!(30000));

        let candles = provider.get_candle_prices(&[pair.clone()]);
        let list = &candles[&pair];
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].timestamp_ms, 1_704_067_260_000);
        assert_eq!(list[1].timestamp_ms, 1_704_067_320_000);
        assert_eq!(list[1].price, dec!(3200.5));
    }

    #[tokio::test]
    async fn test_pair_without_pool_is_dropped() {
        let cancel = CancellationToken::new();
        let provider = UniswapProvider::new(
            cancel.clone(),
            None,
            &[CurrencyPair::new("FOO", "BAR")],
        )
        .await
        .unwrap();
        cancel.cancel();
        assert!(provider.store.subscribed_pairs().is_empty());
    }
}
