//! Crypto.com spot connector.
//!
//! Instruments are `BASE_QUOTE`. The server drives the heartbeat: it sends
//! `public/heartbeat` requests inside the data stream and expects a
//! `public/respond-heartbeat` echo with the same id, which the message
//! handler sends back through the connection handle.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;
use yawc::frame::OpCode;

use super::{
    CandlePrice, CurrencyPair, Endpoint, PingMessage, PingPolicy, PriceStore, Provider,
    ProviderName, TickerPrice, WsController, WsHandle, filter_available_pairs, http_client,
    resolve_urls, telemetry,
    ws::MessageHandler,
};

const NAME: ProviderName = ProviderName::Cryptocom;

/// Default WebSocket endpoint (market-data stream).
pub fn default_ws_url() -> Url {
    "wss://stream.crypto.com/v2/market".parse().unwrap()
}

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://api.crypto.com".parse().unwrap()
}

fn instrument(pair: &CurrencyPair) -> String {
    pair.join("_")
}

#[derive(Deserialize)]
struct CryptocomMessage {
    #[serde(default)]
    id: Option<i64>,
    method: String,
    #[serde(default)]
    result: Option<CryptocomResult>,
}

#[derive(Deserialize)]
struct CryptocomResult {
    channel: String,
    instrument_name: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct CryptocomTicker {
    /// Latest trade price.
    a: f64,
    /// 24h traded volume.
    v: f64,
}

#[derive(Deserialize)]
struct CryptocomCandle {
    /// Bar start, Unix milliseconds.
    t: i64,
    /// Close price.
    c: f64,
    /// Volume.
    v: f64,
}

pub(crate) fn handle_message(store: &PriceStore, handle: &WsHandle, payload: &[u8]) {
    let Ok(message) = serde_json::from_slice::<CryptocomMessage>(payload) else {
        warn!("{NAME}: unable to parse frame ({} bytes)", payload.len());
        telemetry::failure(NAME, "decode");
        return;
    };

    if message.method == "public/heartbeat" {
        if let Some(id) = message.id {
            handle.send_json(&json!({"id": id, "method": "public/respond-heartbeat"}));
        }
        return;
    }

    let Some(result) = message.result else {
        debug!("{NAME}: ignoring {} reply", message.method);
        return;
    };
    match result.channel.as_str() {
        "ticker" => {
            let Ok(tickers) = serde_json::from_value::<Vec<CryptocomTicker>>(result.data) else {
                warn!("{NAME}: malformed ticker payload ({} bytes)", payload.len());
                telemetry::failure(NAME, "decode");
                return;
            };
            for ticker in tickers {
                match TickerPrice::from_f64(ticker.a, ticker.v) {
                    Ok(price) => store.set_ticker(result.instrument_name.clone(), price),
                    Err(err) => {
                        warn!("{NAME}: dropping ticker for {}: {err}", result.instrument_name);
                        telemetry::failure(NAME, "numeric");
                    }
                }
            }
        }
        "candlestick" => {
            let Ok(candles) = serde_json::from_value::<Vec<CryptocomCandle>>(result.data) else {
                warn!("{NAME}: malformed candlestick payload ({} bytes)", payload.len());
                telemetry::failure(NAME, "decode");
                return;
            };
            for bar in candles {
                match CandlePrice::from_f64(bar.c, bar.v, bar.t + 60_000) {
                    Ok(candle) => store.set_candle(result.instrument_name.clone(), candle),
                    Err(err) => {
                        warn!("{NAME}: dropping candle for {}: {err}", result.instrument_name);
                        telemetry::failure(NAME, "numeric");
                    }
                }
            }
        }
        other => debug!("{NAME}: ignoring channel {other}"),
    }
}

/// Crypto.com spot market-data provider.
pub struct CryptocomProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
}

impl CryptocomProvider {
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (ws_url, rest_url, _) =
            resolve_urls(NAME, endpoint, default_ws_url(), default_rest_url())?;
        let store = Arc::new(PriceStore::with_symbols(
            NAME,
            Box::new(instrument),
            Box::new(instrument),
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
        let channels: Vec<String> = pairs
            .iter()
            .flat_map(|pair| {
                let name = instrument(pair);
                [format!("ticker.{name}"), format!("candlestick.1m.{name}")]
            })
            .collect();
        vec![json!({"id": 1, "method": "subscribe", "params": {"channels": channels}})]
    }

    fn handler(store: Arc<PriceStore>) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], handle: &WsHandle| {
            handle_message(&store, handle, payload)
        })
    }
}

#[async_trait]
impl Provider for CryptocomProvider {
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
        struct Instrument {
            instrument_name: String,
        }
        #[derive(Deserialize)]
        struct InstrumentsResult {
            instruments: Vec<Instrument>,
        }
        #[derive(Deserialize)]
        struct Response {
            result: InstrumentsResult,
        }
        let url = self.rest_url.join("/v2/public/get-instruments")?;
        let resp: Response = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp
            .result
            .instruments
            .into_iter()
            .map(|inst| inst.instrument_name.replace('_', "").to_uppercase())
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
        PriceStore::with_symbols(NAME, Box::new(instrument), Box::new(instrument))
    }

    #[test]
    fn test_ticker_dispatch() {
        let store = store();
        let (handle, _rx) = WsHandle::pair();
        handle_message(
            &store,
            &handle,
            br#"{"id":-1,"method":"subscribe","code":0,"result":{"channel":"ticker","instrument_name":"ATOM_USDT","subscription":"ticker.ATOM_USDT","data":[{"h":13.75,"l":13.25,"a":13.5,"v":5120.5,"c":0.01}]}}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out[&pair].price, dec!(13.5));
        assert_eq!(out[&pair].volume, dec!(5120.5));
    }

    #[tokio::test]
    async fn test_heartbeat_echoed_with_same_id() {
        let store = store();
        let (handle, mut rx) = WsHandle::pair();
        handle_message(
            &store,
            &handle,
            br#"{"id":1587523073344,"method":"public/heartbeat","code":0}"#,
        );

        let frame = rx.recv().await.unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(reply["id"], 1_587_523_073_344_i64);
        assert_eq!(reply["method"], "public/respond-heartbeat");
        assert!(
            store
                .get_ticker_prices(&[CurrencyPair::new("ATOM", "USDT")])
                .is_empty()
        );
    }
}
