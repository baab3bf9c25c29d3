//! Coinbase Exchange connector.
//!
//! Coinbase has no server-side 1-minute candles on its feed, so alongside
//! the `ticker` channel this provider subscribes `matches` and folds each
//! trade into the minute bucket it belongs to (see
//! [`PriceStore::add_trade`][super::store::PriceStore]).

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;
use yawc::frame::OpCode;

use super::{
    CandlePrice, CurrencyPair, Endpoint, PingMessage, PingPolicy, PriceStore, Provider,
    ProviderName, TickerPrice, Trade, WsController, WsHandle, filter_available_pairs, http_client,
    resolve_urls, telemetry,
    ws::MessageHandler,
};

const NAME: ProviderName = ProviderName::Coinbase;

/// Default WebSocket endpoint.
pub fn default_ws_url() -> Url {
    "wss://ws-feed.exchange.coinbase.com".parse().unwrap()
}

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://api.exchange.coinbase.com".parse().unwrap()
}

fn product_id(pair: &CurrencyPair) -> String {
    pair.join("-")
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum CoinbaseMessage {
    #[serde(rename = "ticker")]
    Ticker(CoinbaseTicker),
    #[serde(rename = "match")]
    Match(CoinbaseMatch),
    #[serde(rename = "last_match")]
    LastMatch(CoinbaseMatch),
    #[serde(rename = "subscriptions")]
    Subscriptions(serde_json::Value),
    #[serde(rename = "error")]
    Error(serde_json::Value),
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct CoinbaseTicker {
    product_id: String,
    price: String,
    volume_24h: String,
}

#[derive(Deserialize)]
struct CoinbaseMatch {
    product_id: String,
    price: String,
    size: String,
    /// RFC 3339 execution time.
    time: String,
}

fn fold_match(store: &PriceStore, matched: CoinbaseMatch) {
    let Ok(time) = DateTime::parse_from_rfc3339(&matched.time) else {
        warn!(
            "{NAME}: dropping match for {}: bad time {:?}",
            matched.product_id, matched.time
        );
        telemetry::failure(NAME, "decode");
        return;
    };
    let trade = Trade {
        time_secs: time.timestamp(),
        price: matched.price,
        size: matched.size,
    };
    store.add_trade(matched.product_id, &trade);
}

pub(crate) fn handle_message(store: &PriceStore, payload: &[u8]) {
    let Ok(message) = serde_json::from_slice::<CoinbaseMessage>(payload) else {
        warn!("{NAME}: unable to parse frame ({} bytes)", payload.len());
        telemetry::failure(NAME, "decode");
        return;
    };
    match message {
        CoinbaseMessage::Ticker(ticker) => match TickerPrice::new(&ticker.price, &ticker.volume_24h)
        {
            Ok(price) => store.set_ticker(ticker.product_id, price),
            Err(err) => {
                warn!("{NAME}: dropping ticker for {}: {err}", ticker.product_id);
                telemetry::failure(NAME, "numeric");
            }
        },
        CoinbaseMessage::Match(matched) | CoinbaseMessage::LastMatch(matched) => {
            fold_match(store, matched);
        }
        CoinbaseMessage::Subscriptions(_) => {}
        CoinbaseMessage::Error(body) => warn!("{NAME}: error frame: {body}"),
        CoinbaseMessage::Other => debug!("{NAME}: ignoring unknown frame type"),
    }
}

/// Coinbase Exchange market-data provider.
pub struct CoinbaseProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
}

impl CoinbaseProvider {
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (ws_url, rest_url, _) =
            resolve_urls(NAME, endpoint, default_ws_url(), default_rest_url())?;
        let store = Arc::new(PriceStore::with_symbols(
            NAME,
            Box::new(product_id),
            Box::new(product_id),
        ));
        let provider = Self {
            store,
            ws: WsController::new(NAME, ws_url, cancel),
            http: http_client(),
            rest_url,
        };
        provider.subscribe_currency_pairs(pairs).await?;
        Ok(provider)
    }

    fn subscription_msgs(pairs: &[CurrencyPair]) -> Vec<serde_json::Value> {
        let products: Vec<String> = pairs.iter().map(product_id).collect();
        vec![json!({
            "type": "subscribe",
            "product_ids": products,
            "channels": ["ticker", "matches"],
        })]
    }

    fn handler(store: Arc<PriceStore>) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], _handle: &WsHandle| {
            handle_message(&store, payload)
        })
    }
}

#[async_trait]
impl Provider for CoinbaseProvider {
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
        #[derive(Deserialize)]
        struct Product {
            id: String,
        }
        let url = self.rest_url.join("/products")?;
        let products: Vec<Product> = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(products
            .into_iter()
            .map(|p| p.id.replace('-', "").to_uppercase())
            .collect())
    }

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<()> {
        let available = self.get_available_pairs().await?;
        let confirmed = filter_available_pairs(NAME, pairs, &available);
        let added = self.store.subscribe_pairs(&confirmed);
        if added.is_empty() {
            return Ok(());
        }
        telemetry::websocket_subscribed_pairs(NAME, added.len());
        self.ws.add_connection(
            Self::subscription_msgs(&added),
            Self::handler(self.store.clone()),
            PingPolicy::Disabled,
            PingMessage::Frame,
        );
        Ok(())
    }

    fn start_connections(&self) {
        self.ws.start_connections();
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;

    use super::*;

    fn store() -> PriceStore {
        PriceStore::with_symbols(NAME, Box::new(product_id), Box::new(product_id))
    }

    #[test]
    fn test_ticker_dispatch() {
        let store = store();
        handle_message(
            &store,
            br#"{"type":"ticker","sequence":100,"product_id":"ATOM-USD","price":"13.47","volume_24h":"8123.9","best_bid":"13.46","best_ask":"13.48"}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USD");
        let out = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out[&pair].price, dec!(13.47));
        assert_eq!(out[&pair].volume, dec!(8123.9));
    }

    #[test]
    fn test_matches_fold_into_single_candle() {
        let store = store();
        handle_message(
            &store,
            br#"{"type":"match","trade_id":1,"product_id":"BTC-USD","size":"0.5","price":"43000.00","side":"buy","time":"2024-01-01T00:00:00.000000Z"}"#,
        );
        handle_message(
            &store,
            br#"{"type":"match","trade_id":2,"product_id":"BTC-USD","size":"0.25","price":"43010.00","side":"sell","time":"2024-01-01T00:00:30.000000Z"}"#,
        );

        let pair = CurrencyPair::new("BTC", "USD");
        let out = store.get_candle_prices(&[pair.clone()]);
        let candles = &out[&pair];
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].price, dec!(43010.00));
        assert_eq!(candles[0].volume, dec!(0.75));
        assert_eq!(candles[0].timestamp_ms, 1_704_067_260_000);
    }

    #[test]
    fn test_subscriptions_ack_ignored() {
        let store = store();
        handle_message(
            &store,
            br#"{"type":"subscriptions","channels":[{"name":"ticker","product_ids":["ATOM-USD"]}]}"#,
        );
        assert!(
            store
                .get_ticker_prices(&[CurrencyPair::new("ATOM", "USD")])
                .is_empty()
        );
    }
}
