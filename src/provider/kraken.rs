//! Kraken spot connector.
//!
//! Kraken's channel payloads are positional JSON arrays
//! (`[channelID, data, channelName, pair]`) rather than objects, and the
//! venue still calls Bitcoin `XBT`; pair names are normalized to `BTC` on
//! the way in and denormalized on the way out.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;
use yawc::frame::OpCode;

use super::{
    CandlePrice, CurrencyPair, Endpoint, PingMessage, PingPolicy, PriceStore, Provider,
    ProviderName, TickerPrice, WsController, WsHandle, filter_available_pairs, http_client, resolve_urls,
    telemetry,
    ws::MessageHandler,
};

const NAME: ProviderName = ProviderName::Kraken;

/// Default WebSocket endpoint.
pub fn default_ws_url() -> Url {
    "wss://ws.kraken.com".parse().unwrap()
}

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://api.kraken.com".parse().unwrap()
}

fn ws_pair(pair: &CurrencyPair) -> String {
    pair.join("/")
}

/// Rewrites Kraken's `XBT` base/quote codes to `BTC` in a `BASE/QUOTE`
/// pair name. Anything else passes through unchanged.
pub fn normalize_btc_pair(pair: &str) -> String {
    match pair.split_once('/') {
        Some((base, quote)) => {
            let base = if base == "XBT" { "BTC" } else { base };
            let quote = if quote == "XBT" { "BTC" } else { quote };
            format!("{base}/{quote}")
        }
        None => pair.to_string(),
    }
}

/// The inverse rewrite, applied when talking to Kraken.
fn denormalize_btc_pair(pair: &CurrencyPair) -> String {
    let base = if pair.base == "BTC" { "XBT" } else { pair.base.as_str() };
    let quote = if pair.quote == "BTC" { "XBT" } else { pair.quote.as_str() };
    format!("{base}/{quote}")
}

pub(crate) fn handle_message(store: &PriceStore, payload: &[u8]) {
    let Ok(value) = serde_json::from_slice::<Value>(payload) else {
        warn!("{NAME}: unable to parse frame ({} bytes)", payload.len());
        telemetry::failure(NAME, "decode");
        return;
    };

    // Status/heartbeat/subscription events are objects; data frames are
    // positional arrays.
    let Some(frame) = value.as_array() else {
        debug!(
            "{NAME}: event frame: {}",
            value["event"].as_str().unwrap_or("unknown")
        );
        return;
    };
    if frame.len() < 4 {
        telemetry::failure(NAME, "decode");
        return;
    }
    let channel = frame[frame.len() - 2].as_str().unwrap_or_default();
    let Some(pair) = frame[frame.len() - 1].as_str() else {
        telemetry::failure(NAME, "decode");
        return;
    };
    let symbol = normalize_btc_pair(pair);

    if channel == "ticker" {
        // data: {"c":["last","lot"],"v":["today","24h"]}
        let (Some(last), Some(volume)) = (frame[1]["c"][0].as_str(), frame[1]["v"][1].as_str())
        else {
            warn!("{NAME}: malformed ticker for {symbol}");
            telemetry::failure(NAME, "decode");
            return;
        };
        match TickerPrice::new(last, volume) {
            Ok(price) => store.set_ticker(symbol, price),
            Err(err) => {
                warn!("{NAME}: dropping ticker for {symbol}: {err}");
                telemetry::failure(NAME, "numeric");
            }
        }
    } else if channel.starts_with("ohlc") {
        // data: [time, etime, open, high, low, close, vwap, volume, count]
        let (Some(end_secs), Some(close), Some(volume)) = (
            frame[1][1].as_str(),
            frame[1][5].as_str(),
            frame[1][7].as_str(),
        ) else {
            warn!("{NAME}: malformed ohlc for {symbol}");
            telemetry::failure(NAME, "decode");
            return;
        };
        let Ok(end_secs) = end_secs.parse::<f64>() else {
            telemetry::failure(NAME, "decode");
            return;
        };
        match CandlePrice::new(close, volume, (end_secs as i64) * 1000) {
            Ok(candle) => store.set_candle(symbol, candle),
            Err(err) => {
                warn!("{NAME}: dropping ohlc for {symbol}: {err}");
                telemetry::failure(NAME, "numeric");
            }
        }
    } else {
        debug!("{NAME}: ignoring channel {channel}");
    }
}

/// Kraken spot market-data provider.
pub struct KrakenProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
}

impl KrakenProvider {
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (ws_url, rest_url, _) =
            resolve_urls(NAME, endpoint, default_ws_url(), default_rest_url())?;
        let store = Arc::new(PriceStore::with_symbols(
            NAME,
            Box::new(ws_pair),
            Box::new(ws_pair),
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
        let names: Vec<String> = pairs.iter().map(denormalize_btc_pair).collect();
        vec![
            json!({"event": "subscribe", "pair": names, "subscription": {"name": "ticker"}}),
            json!({"event": "subscribe", "pair": names, "subscription": {"name": "ohlc", "interval": 1}}),
        ]
    }

    fn handler(store: Arc<PriceStore>) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], _handle: &WsHandle| {
            handle_message(&store, payload)
        })
    }
}

#[async_trait]
impl Provider for KrakenProvider {
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
        struct AssetPair {
            wsname: Option<String>,
        }
        #[derive(Deserialize)]
        struct Response {
            result: HashMap<String, AssetPair>,
        }
        let url = self.rest_url.join("/0/public/AssetPairs")?;
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
            .into_values()
            .filter_map(|pair| pair.wsname)
            .map(|wsname| normalize_btc_pair(&wsname).replace('/', "").to_uppercase())
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
            PingPolicy::Enabled,
            PingMessage::Json(json!({"event": "ping"})),
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
        PriceStore::with_symbols(NAME, Box::new(ws_pair), Box::new(ws_pair))
    }

    #[test]
    fn test_normalize_btc_pair() {
        assert_eq!(normalize_btc_pair("XBT/USDT"), "BTC/USDT");
        assert_eq!(normalize_btc_pair("ETH/XBT"), "ETH/BTC");
        assert_eq!(normalize_btc_pair("ATOM/USDT"), "ATOM/USDT");
        assert_eq!(normalize_btc_pair("XBTUSDT"), "XBTUSDT");
    }

    #[test]
    fn test_ticker_frame_dispatch_remaps_xbt() {
        let store = store();
        handle_message(
            &store,
            br#"[42,{"a":["43010.1","1","1.000"],"b":["43000.0","2","2.000"],"c":["43005.5","0.05"],"v":["120.5","2400.75"]},"ticker","XBT/USDT"]"#,
        );

        let pair = CurrencyPair::new("BTC", "USDT");
        let out = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out[&pair].price, dec!(43005.5));
        assert_eq!(out[&pair].volume, dec!(2400.75));
    }

    #[test]
    fn test_ohlc_frame_dispatch() {
        let store = store();
        handle_message(
            &store,
            br#"[43,["1704067200.123","1704067260.000000","13.50","13.56","13.48","13.54","13.52","88.25","21"],"ohlc-1","ATOM/USDT"]"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_candle_prices(&[pair.clone()]);
        assert_eq!(out[&pair][0].price, dec!(13.54));
        assert_eq!(out[&pair][0].volume, dec!(88.25));
        assert_eq!(out[&pair][0].timestamp_ms, 1_704_067_260_000);
    }

    #[test]
    fn test_status_frames_ignored() {
        let store = store();
        handle_message(&store, br#"{"event":"systemStatus","status":"online"}"#);
        handle_message(&store, br#"{"event":"heartbeat"}"#);
        assert!(
            store
                .get_ticker_prices(&[CurrencyPair::new("ATOM", "USDT")])
                .is_empty()
        );
    }
}
