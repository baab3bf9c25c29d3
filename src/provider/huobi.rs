//! Huobi spot connector.
//!
//! Every inbound frame is gzip-compressed JSON and must be decompressed by
//! the handler before parsing; the controller stays payload-agnostic. The
//! heartbeat is inverted relative to most venues: the server sends
//! `{"ping": n}` inside the data stream and the handler echoes
//! `{"pong": n}` back on the same connection.

use std::{
    collections::{HashMap, HashSet},
    io::Read,
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use flate2::read::GzDecoder;
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

const NAME: ProviderName = ProviderName::Huobi;

/// Default WebSocket endpoint.
pub fn default_ws_url() -> Url {
    "wss://api.huobi.pro/ws".parse().unwrap()
}

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://api.huobi.pro".parse().unwrap()
}

fn ticker_channel(pair: &CurrencyPair) -> String {
    format!("market.{}.ticker", pair.to_string().to_lowercase())
}

fn candle_channel(pair: &CurrencyPair) -> String {
    format!("market.{}.kline.1min", pair.to_string().to_lowercase())
}

#[derive(Deserialize)]
struct HuobiPing {
    ping: u64,
}

#[derive(Deserialize)]
struct HuobiEnvelope {
    ch: String,
    tick: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HuobiTicker {
    last_price: f64,
    vol: f64,
}

#[derive(Deserialize)]
struct HuobiKline {
    /// Bar start, Unix seconds.
    id: i64,
    close: f64,
    vol: f64,
}

pub(crate) fn handle_frame(store: &PriceStore, handle: &WsHandle, payload: &[u8]) {
    let mut body = Vec::new();
    if GzDecoder::new(payload).read_to_end(&mut body).is_err() {
        // Tolerate the occasional uncompressed frame.
        body = payload.to_vec();
    }
    handle_json(store, handle, &body);
}

fn handle_json(store: &PriceStore, handle: &WsHandle, body: &[u8]) {
    if let Ok(ping) = serde_json::from_slice::<HuobiPing>(body) {
        handle.send_json(&json!({"pong": ping.ping}));
        return;
    }
    if let Ok(envelope) = serde_json::from_slice::<HuobiEnvelope>(body) {
        if envelope.ch.ends_with(".ticker") {
            let Ok(ticker) = serde_json::from_value::<HuobiTicker>(envelope.tick) else {
                warn!("{NAME}: malformed ticker payload ({} bytes)", body.len());
                telemetry::failure(NAME, "decode");
                return;
            };
            match TickerPrice::from_f64(ticker.last_price, ticker.vol) {
                Ok(price) => store.set_ticker(envelope.ch, price),
                Err(err) => {
                    warn!("{NAME}: dropping ticker: {err}");
                    telemetry::failure(NAME, "numeric");
                }
            }
        } else if envelope.ch.contains(".kline.") {
            let Ok(kline) = serde_json::from_value::<HuobiKline>(envelope.tick) else {
                warn!("{NAME}: malformed kline payload ({} bytes)", body.len());
                telemetry::failure(NAME, "decode");
                return;
            };
            match CandlePrice::from_f64(kline.close, kline.vol, (kline.id + 60) * 1000) {
                Ok(candle) => store.set_candle(envelope.ch, candle),
                Err(err) => {
                    warn!("{NAME}: dropping kline: {err}");
                    telemetry::failure(NAME, "numeric");
                }
            }
        } else {
            debug!("{NAME}: ignoring channel {}", envelope.ch);
        }
        return;
    }
    // Subscription acks ({"id":…,"status":"ok","subbed":…}) land here.
    if serde_json::from_slice::<serde_json::Value>(body).is_ok() {
        return;
    }
    warn!("{NAME}: unable to parse frame ({} bytes)", body.len());
    telemetry::failure(NAME, "decode");
}

/// Huobi spot market-data provider.
pub struct HuobiProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
}

impl HuobiProvider {
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (ws_url, rest_url, _) =
            resolve_urls(NAME, endpoint, default_ws_url(), default_rest_url())?;
        let store = Arc::new(PriceStore::with_symbols(
            NAME,
            Box::new(ticker_channel),
            Box::new(candle_channel),
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
        pairs
            .iter()
            .flat_map(|pair| {
                [
                    json!({"sub": ticker_channel(pair)}),
                    json!({"sub": candle_channel(pair)}),
                ]
            })
            .collect()
    }

    fn handler(store: Arc<PriceStore>) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], handle: &WsHandle| {
            handle_frame(&store, handle, payload)
        })
    }
}

#[async_trait]
impl Provider for HuobiProvider {
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
        struct Symbol {
            symbol: String,
        }
        #[derive(Deserialize)]
        struct Response {
            data: Vec<Symbol>,
        }
        let url = self.rest_url.join("/v1/common/symbols")?;
        let resp: Response = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp
            .data
            .into_iter()
            .map(|s| s.symbol.to_uppercase())
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
    use std::io::Write;

    use flate2::{Compression, write::GzEncoder};
    use rust_decimal::dec;

    use super::*;

    fn gzip(body: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).unwrap();
        encoder.finish().unwrap()
    }

    fn store() -> PriceStore {
        PriceStore::with_symbols(NAME, Box::new(ticker_channel), Box::new(candle_channel))
    }

    #[tokio::test]
    async fn test_server_ping_is_echoed_as_pong() {
        let store = store();
        let (handle, mut rx) = WsHandle::pair();
        handle_frame(&store, &handle, &gzip(br#"{"ping": 1492420473027}"#));

        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame.payload[..], br#"{"pong":1492420473027}"#);
        assert!(
            store
                .get_ticker_prices(&[CurrencyPair::new("ATOM", "USDT")])
                .is_empty()
        );
    }

    #[test]
    fn test_gzipped_ticker_dispatch() {
        let store = store();
        let (handle, _rx) = WsHandle::pair();
        handle_frame(
            &store,
            &handle,
            &gzip(
                br#"{"ch":"market.atomusdt.ticker","ts":1704067212000,"tick":{"open":13.2,"close":13.5,"lastPrice":13.25,"vol":9100.25,"count":100}}"#,
            ),
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out[&pair].price, dec!(13.25));
        assert_eq!(out[&pair].volume, dec!(9100.25));
    }

    #[test]
    fn test_gzipped_kline_dispatch() {
        let store = store();
        let (handle, _rx) = WsHandle::pair();
        handle_frame(
            &store,
            &handle,
            &gzip(
                br#"{"ch":"market.atomusdt.kline.1min","ts":1704067212000,"tick":{"id":1704067200,"open":13.4,"close":13.5,"low":13.25,"high":13.75,"vol":50.5}}"#,
            ),
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_candle_prices(&[pair.clone()]);
        assert_eq!(out[&pair][0].price, dec!(13.5));
        assert_eq!(out[&pair][0].timestamp_ms, 1_704_067_260_000);
    }
}
