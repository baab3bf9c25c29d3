//! Market-data providers and the machinery they share.
//!
//! A provider is a long-lived connector to one exchange or aggregator API.
//! Each one feeds a [`PriceStore`] from its transport of choice (WebSocket
//! push, REST polling or a GraphQL subgraph) and answers the same two
//! queries: the latest ticker and the recent candle window for a set of
//! [`CurrencyPair`]s.
//!
//! # Components
//!
//! - [`Provider`]: the capability set every connector implements
//! - [`PriceStore`]: concurrent per-provider cache of tickers and candles
//! - [`WsController`]: reconnecting WebSocket connection pool
//! - [`ProviderName`] / [`new_provider`]: the closed registry and factory
//! - [`Endpoint`]: optional per-provider endpoint override
//!
//! # Example
//!
//! ```no_run
//! use oraclefeed::provider::{self, CurrencyPair, ProviderName};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cancel = CancellationToken::new();
//! let pairs = vec![CurrencyPair::new("ATOM", "USDT")];
//!
//! let binance =
//!     provider::new_provider(ProviderName::Binance, None, cancel.clone(), &pairs).await?;
//! binance.start_connections();
//!
//! // ... later, from the aggregator:
//! let tickers = binance.get_ticker_prices(&pairs);
//! for (pair, ticker) in tickers {
//!     println!("{pair}: {} @ {}", ticker.volume, ticker.price);
//! }
//!
//! // Tear everything down.
//! cancel.cancel();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod ws;

pub mod alphavantage;
pub mod binance;
pub mod bitget;
pub mod coinbase;
pub mod cryptocom;
pub mod fin;
pub mod gate;
pub mod gateway;
pub mod huobi;
pub mod kraken;
pub mod mexc;
pub mod mock;
pub mod okx;
pub mod polygon;
pub mod uniswap;

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use error::Error;
pub use store::PriceStore;
pub use types::{CandlePrice, CurrencyPair, Endpoint, TickerPrice, Trade};
pub use ws::{PingMessage, PingPolicy, WsController, WsHandle};

/// The closed set of supported providers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::FromStr,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    #[display("binance")]
    Binance,
    #[display("bitget")]
    Bitget,
    #[display("coinbase")]
    Coinbase,
    #[display("cryptocom")]
    Cryptocom,
    #[display("gate")]
    Gate,
    #[display("huobi")]
    Huobi,
    #[display("kraken")]
    Kraken,
    #[display("mexc")]
    Mexc,
    #[display("okx")]
    Okx,
    #[display("polygon")]
    Polygon,
    #[display("osmosis")]
    Osmosis,
    #[display("astroport")]
    Astroport,
    #[display("kujira")]
    Kujira,
    #[display("camelot")]
    Camelot,
    #[display("curve")]
    Curve,
    #[display("balancer")]
    Balancer,
    #[display("pancake")]
    Pancake,
    #[display("crescent")]
    Crescent,
    #[display("fin")]
    Fin,
    #[display("uniswap")]
    Uniswap,
    #[display("alphavantage")]
    Alphavantage,
    #[display("mock")]
    Mock,
}

/// The capability set shared by every connector.
///
/// Query methods read the provider's [`PriceStore`] and never block on the
/// network; an empty result simply means no data has arrived yet.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider's registry name.
    fn name(&self) -> ProviderName;

    /// Latest ticker per requested pair. Possibly-partial, never an error.
    fn get_ticker_prices(&self, pairs: &[CurrencyPair]) -> HashMap<CurrencyPair, TickerPrice>;

    /// Recent candle window per requested pair, deep-copied so the caller
    /// may mutate it freely.
    fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> HashMap<CurrencyPair, Vec<CandlePrice>>;

    /// The provider's advertised universe of tradeable pairs, in canonical
    /// `BASEQUOTE` form.
    async fn get_available_pairs(&self) -> Result<HashSet<String>>;

    /// Subscribes additional pairs, after gating them against the advertised
    /// universe. Already-subscribed pairs are a no-op.
    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<()>;

    /// Activates background workers. A no-op for polling providers, whose
    /// loop starts in the constructor.
    fn start_connections(&self);
}

/// Instantiates any provider by name.
///
/// The returned provider has confirmed pair availability and registered its
/// subscriptions; WebSocket-backed providers still need
/// [`start_connections`](Provider::start_connections) to open sockets.
pub async fn new_provider(
    name: ProviderName,
    endpoint: Option<Endpoint>,
    cancel: CancellationToken,
    pairs: &[CurrencyPair],
) -> Result<Box<dyn Provider>> {
    use ProviderName::*;
    let provider: Box<dyn Provider> = match name {
        Binance => Box::new(binance::BinanceProvider::new(cancel, endpoint, pairs).await?),
        Bitget => Box::new(bitget::BitgetProvider::new(cancel, endpoint, pairs).await?),
        Coinbase => Box::new(coinbase::CoinbaseProvider::new(cancel, endpoint, pairs).await?),
        Cryptocom => Box::new(cryptocom::CryptocomProvider::new(cancel, endpoint, pairs).await?),
        Gate => Box::new(gate::GateProvider::new(cancel, endpoint, pairs).await?),
        Huobi => Box::new(huobi::HuobiProvider::new(cancel, endpoint, pairs).await?),
        Kraken => Box::new(kraken::KrakenProvider::new(cancel, endpoint, pairs).await?),
        Mexc => Box::new(mexc::MexcProvider::new(cancel, endpoint, pairs).await?),
        Okx => Box::new(okx::OkxProvider::new(cancel, endpoint, pairs).await?),
        Polygon => Box::new(polygon::PolygonProvider::new(cancel, endpoint, pairs).await?),
        Osmosis | Astroport | Kujira | Camelot | Curve | Balancer | Pancake | Crescent => {
            Box::new(gateway::GatewayProvider::new(name, cancel, endpoint, pairs).await?)
        }
        Fin => Box::new(fin::FinProvider::new(cancel, endpoint, pairs).await?),
        Uniswap => Box::new(uniswap::UniswapProvider::new(cancel, endpoint, pairs).await?),
        Alphavantage => {
            Box::new(alphavantage::AlphavantageProvider::new(cancel, endpoint, pairs).await?)
        }
        Mock => Box::new(mock::MockProvider::new(cancel, pairs)),
    };
    Ok(provider)
}

/// Intersects the requested pairs with a provider's advertised universe.
///
/// Pairs outside the universe are logged at warn and dropped, so one
/// misconfigured pair cannot break a whole provider.
pub(crate) fn filter_available_pairs(
    name: ProviderName,
    requested: &[CurrencyPair],
    available: &HashSet<String>,
) -> Vec<CurrencyPair> {
    requested
        .iter()
        .filter(|pair| {
            let known = available.contains(&pair.to_string());
            if !known {
                warn!("{name}: pair {pair} not advertised by provider, dropping");
            }
            known
        })
        .cloned()
        .collect()
}

/// Applies an optional [`Endpoint`] override on top of a provider's default
/// URLs, after checking it belongs to `name`. Returns
/// `(websocket_url, rest_url, api_key)`.
pub(crate) fn resolve_urls(
    name: ProviderName,
    endpoint: Option<Endpoint>,
    default_ws: url::Url,
    default_rest: url::Url,
) -> Result<(url::Url, url::Url, Option<String>), Error> {
    match endpoint {
        None => Ok((default_ws, default_rest, None)),
        Some(endpoint) => {
            let endpoint = endpoint.check(name)?;
            Ok((
                endpoint.websocket_url.unwrap_or(default_ws),
                endpoint.rest_url.unwrap_or(default_rest),
                endpoint.api_key,
            ))
        }
    }
}

/// Shared HTTP client configuration: 10 s timeout, no Nagle.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .tcp_nodelay(true)
        .build()
        .unwrap()
}

/// Unix milliseconds of the instant `d` before now, at second precision.
pub fn past_unix_time_ms(d: Duration) -> i64 {
    (Utc::now().timestamp() - d.as_secs() as i64) * 1000
}

/// Converts Unix seconds to Unix milliseconds.
pub fn secs_to_ms(secs: i64) -> i64 {
    secs * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_name_round_trips() {
        assert_eq!(ProviderName::Binance.to_string(), "binance");
        assert_eq!("huobi".parse::<ProviderName>().unwrap(), ProviderName::Huobi);
        assert!("nosuch".parse::<ProviderName>().is_err());
    }

    #[test]
    fn test_availability_gate_drops_unknown_pairs() {
        let universe: HashSet<String> = ["ATOMUSDT".to_string()].into();
        let requested = vec![
            CurrencyPair::new("ATOM", "USDT"),
            CurrencyPair::new("FOO", "BAR"),
        ];
        let kept = filter_available_pairs(ProviderName::Binance, &requested, &universe);
        assert_eq!(kept, vec![CurrencyPair::new("ATOM", "USDT")]);
    }

    #[test]
    fn test_secs_to_ms() {
        assert_eq!(secs_to_ms(1_704_067_200), 1_704_067_200_000);
    }

    #[test]
    fn test_past_unix_time_ms_is_in_the_past() {
        let now_ms = Utc::now().timestamp() * 1000;
        let past = past_unix_time_ms(Duration::from_secs(300));
        assert!(past <= now_ms - 300_000);
    }
}
