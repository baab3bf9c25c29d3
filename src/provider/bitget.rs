//! Bitget spot connector.
//!
//! Same envelope shape as OKX (`arg` + `data`), with `instType: "sp"` in
//! every subscription argument. The heartbeat is the literal string `ping`.

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
    ProviderName, TickerPrice, WsController, WsHandle, filter_available_pairs, http_client, resolve_urls,
    telemetry,
    ws::MessageHandler,
};

const NAME: ProviderName = ProviderName::Bitget;

/// Default WebSocket endpoint.
pub fn default_ws_url() -> Url {
    "wss://ws.bitget.com/spot/v1/stream".parse().unwrap()
}

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://api.bitget.com".parse().unwrap()
}

#[derive(Deserialize)]
struct BitgetArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Deserialize)]
struct BitgetEnvelope {
    arg: BitgetArg,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct BitgetTicker {
    #[serde(rename = "instId")]
    inst_id: String,
    last: String,
    #[serde(rename = "baseVolume")]
    base_volume: String,
}

pub(crate) fn handle_message(store: &PriceStore, payload: &[u8]) {
    if payload == b"pong" {
        return;
    }
    if let Ok(envelope) = serde_json::from_slice::<BitgetEnvelope>(payload) {
        match envelope.arg.channel.as_str() {
            "ticker" => {
                let Ok(tickers) = serde_json::from_value::<Vec<BitgetTicker>>(envelope.data)
                else {
                    warn!("{NAME}: malformed ticker payload ({} bytes)", payload.len());
                    telemetry::failure(NAME, "decode");
                    return;
                };
                for ticker in tickers {
                    match TickerPrice::new(&ticker.last, &ticker.base_volume) {
                        Ok(price) => store.set_ticker(ticker.inst_id.to_uppercase(), price),
                        Err(err) => {
                            warn!("{NAME}: dropping ticker for {}: {err}", ticker.inst_id);
                            telemetry::failure(NAME, "numeric");
                        }
                    }
                }
            }
            "candle1m" => {
                let Ok(rows) = serde_json::from_value::<Vec<Vec<String>>>(envelope.data) else {
                    warn!("{NAME}: malformed candle payload ({} bytes)", payload.len());
                    telemetry::failure(NAME, "decode");
                    return;
                };
                for row in rows {
                    if row.len() < 6 {
                        telemetry::failure(NAME, "decode");
                        continue;
                    }
                    let Ok(start_ms) = row[0].parse::<i64>() else {
                        telemetry::failure(NAME, "decode");
                        continue;
                    };
                    match CandlePrice::new(&row[4], &row[5], start_ms + 60_000) {
                        Ok(candle) => {
                            store.set_candle(envelope.arg.inst_id.to_uppercase(), candle);
                        }
                        Err(err) => {
                            warn!("{NAME}: dropping candle for {}: {err}", envelope.arg.inst_id);
                            telemetry::failure(NAME, "numeric");
                        }
                    }
                }
            }
            other => debug!("{NAME}: ignoring channel {other}"),
        }
        return;
    }
    if let Ok(event) = serde_json::from_slice::<serde_json::Value>(payload)
        && event.get("event").is_some()
    {
        debug!("{NAME}: event frame: {}", event["event"]);
        return;
    }
    warn!("{NAME}: unable to parse frame ({} bytes)", payload.len());
    telemetry::failure(NAME, "decode");
}

/// Bitget spot market-data provider.
pub struct BitgetProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
}

impl BitgetProvider {
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (ws_url, rest_url, _) =
            resolve_urls(NAME, endpoint, default_ws_url(), default_rest_url())?;
        let store = Arc::new(PriceStore::new(NAME));
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
        let args: Vec<serde_json::Value> = pairs
            .iter()
            .flat_map(|pair| {
                [
                    json!({"instType": "sp", "channel": "ticker", "instId": pair.to_string()}),
                    json!({"instType": "sp", "channel": "candle1m", "instId": pair.to_string()}),
                ]
            })
            .collect();
        vec![json!({"op": "subscribe", "args": args})]
    }

    fn handler(store: Arc<PriceStore>) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], _handle: &WsHandle| {
            handle_message(&store, payload)
        })
    }
}

#[async_trait]
impl Provider for BitgetProvider {
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
            #[serde(rename = "symbolName")]
            symbol_name: String,
        }
        #[derive(Deserialize)]
        struct Response {
            data: Vec<Product>,
        }
        let url = self.rest_url.join("/api/spot/v1/public/products")?;
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
            .map(|p| p.symbol_name.to_uppercase())
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
            PingMessage::Text("ping".into()),
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

    #[test]
    fn test_ticker_dispatch() {
        let store = PriceStore::new(NAME);
        handle_message(
            &store,
            br#"{"action":"snapshot","arg":{"instType":"sp","channel":"ticker","instId":"ATOMUSDT"},"data":[{"instId":"ATOMUSDT","last":"13.51","baseVolume":"4100.2","high24h":"13.8"}]}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out[&pair].price, dec!(13.51));
        assert_eq!(out[&pair].volume, dec!(4100.2));
    }

    #[test]
    fn test_candle_dispatch() {
        let store = PriceStore::new(NAME);
        handle_message(
            &store,
            br#"{"action":"update","arg":{"instType":"sp","channel":"candle1m","instId":"ATOMUSDT"},"data":[["1704067200000","13.50","13.53","13.47","13.52","66.6"]]}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_candle_prices(&[pair.clone()]);
        assert_eq!(out[&pair][0].price, dec!(13.52));
        assert_eq!(out[&pair][0].timestamp_ms, 1_704_067_260_000);
    }

    #[test]
    fn test_pong_and_event_ignored() {
        let store = PriceStore::new(NAME);
        handle_message(&store, b"pong");
        handle_message(&store, br#"{"event":"subscribe","arg":{"instType":"sp","channel":"ticker","instId":"ATOMUSDT"}}"#);
        assert!(
            store
                .get_ticker_prices(&[CurrencyPair::new("ATOM", "USDT")])
                .is_empty()
        );
    }
}
