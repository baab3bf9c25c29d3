//! Gate.io spot connector (v3 websocket API).
//!
//! Markets are `BASE_QUOTE`. Ticker and kline updates arrive as JSON-RPC
//! notifications (`ticker.update` / `kline.update`) with positional params.

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

const NAME: ProviderName = ProviderName::Gate;

/// Default WebSocket endpoint.
pub fn default_ws_url() -> Url {
    "wss://ws.gate.io/v3/".parse().unwrap()
}

/// Default REST endpoint (v4, used only to enumerate markets).
pub fn default_rest_url() -> Url {
    "https://api.gateio.ws".parse().unwrap()
}

fn market(pair: &CurrencyPair) -> String {
    pair.join("_")
}

#[derive(Deserialize)]
struct GateNotification {
    method: String,
    params: Value,
}

#[derive(Deserialize)]
struct GateTicker {
    last: String,
    #[serde(rename = "baseVolume")]
    base_volume: String,
}

fn handle_ticker_update(store: &PriceStore, params: &Value) {
    let (Some(market), Ok(ticker)) = (
        params[0].as_str(),
        serde_json::from_value::<GateTicker>(params[1].clone()),
    ) else {
        warn!("{NAME}: malformed ticker.update params");
        telemetry::failure(NAME, "decode");
        return;
    };
    match TickerPrice::new(&ticker.last, &ticker.base_volume) {
        Ok(price) => store.set_ticker(market.to_uppercase(), price),
        Err(err) => {
            warn!("{NAME}: dropping ticker for {market}: {err}");
            telemetry::failure(NAME, "numeric");
        }
    }
}

// kline.update rows: [time, open, close, highest, lowest, volume, amount, market]
fn handle_kline_update(store: &PriceStore, params: &Value) {
    let Some(rows) = params.as_array() else {
        telemetry::failure(NAME, "decode");
        return;
    };
    for row in rows {
        let (Some(start_secs), Some(close), Some(volume), Some(market)) = (
            row[0].as_i64(),
            row[2].as_str(),
            row[5].as_str(),
            row[7].as_str(),
        ) else {
            warn!("{NAME}: malformed kline.update row");
            telemetry::failure(NAME, "decode");
            continue;
        };
        match CandlePrice::new(close, volume, (start_secs + 60) * 1000) {
            Ok(candle) => store.set_candle(market.to_uppercase(), candle),
            Err(err) => {
                warn!("{NAME}: dropping kline for {market}: {err}");
                telemetry::failure(NAME, "numeric");
            }
        }
    }
}

pub(crate) fn handle_message(store: &PriceStore, payload: &[u8]) {
    if let Ok(note) = serde_json::from_slice::<GateNotification>(payload) {
        match note.method.as_str() {
            "ticker.update" => handle_ticker_update(store, &note.params),
            "kline.update" => handle_kline_update(store, &note.params),
            other => debug!("{NAME}: ignoring method {other}"),
        }
        return;
    }
    // RPC replies ({"error":null,"result":…,"id":n}) and pongs land here.
    if serde_json::from_slice::<Value>(payload).is_ok() {
        return;
    }
    warn!("{NAME}: unable to parse frame ({} bytes)", payload.len());
    telemetry::failure(NAME, "decode");
}

/// Gate.io spot market-data provider.
pub struct GateProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
}

impl GateProvider {
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (ws_url, rest_url, _) =
            resolve_urls(NAME, endpoint, default_ws_url(), default_rest_url())?;
        let store = Arc::new(PriceStore::with_symbols(
            NAME,
            Box::new(market),
            Box::new(market),
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
        let markets: Vec<String> = pairs.iter().map(market).collect();
        let mut msgs = vec![json!({"id": 1, "method": "ticker.subscribe", "params": markets})];
        // kline.subscribe takes a single (market, interval) pair per request.
        msgs.extend(markets.iter().enumerate().map(|(i, market)| {
            json!({"id": i + 2, "method": "kline.subscribe", "params": [market, 60]})
        }));
        msgs
    }

    fn handler(store: Arc<PriceStore>) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], _handle: &WsHandle| {
            handle_message(&store, payload)
        })
    }
}

#[async_trait]
impl Provider for GateProvider {
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
        struct Market {
            id: String,
        }
        let url = self.rest_url.join("/api/v4/spot/currency_pairs")?;
        let markets: Vec<Market> = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(markets
            .into_iter()
            .map(|m| m.id.replace('_', "").to_uppercase())
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
            PingMessage::Json(json!({"id": 0, "method": "server.ping", "params": []})),
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
        PriceStore::with_symbols(NAME, Box::new(market), Box::new(market))
    }

    #[test]
    fn test_ticker_update_dispatch() {
        let store = store();
        handle_message(
            &store,
            br#"{"method":"ticker.update","params":["ATOM_USDT",{"period":86400,"last":"13.52","baseVolume":"9000.1","quoteVolume":"121000"}],"id":null}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out[&pair].price, dec!(13.52));
        assert_eq!(out[&pair].volume, dec!(9000.1));
    }

    #[test]
    fn test_kline_update_dispatch() {
        let store = store();
        handle_message(
            &store,
            br#"{"method":"kline.update","params":[[1704067200,"13.50","13.53","13.55","13.48","77.5","1047.2","ATOM_USDT"]],"id":null}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_candle_prices(&[pair.clone()]);
        assert_eq!(out[&pair][0].price, dec!(13.53));
        assert_eq!(out[&pair][0].volume, dec!(77.5));
        assert_eq!(out[&pair][0].timestamp_ms, 1_704_067_260_000);
    }

    #[test]
    fn test_rpc_reply_ignored() {
        let store = store();
        handle_message(&store, br#"{"error":null,"result":{"status":"success"},"id":1}"#);
        assert!(
            store
                .get_ticker_prices(&[CurrencyPair::new("ATOM", "USDT")])
                .is_empty()
        );
    }
}
