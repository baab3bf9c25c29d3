//! OKX spot connector.
//!
//! One socket per subscription batch, carrying the `tickers` and `candle1m`
//! channels for each pair. Instrument ids are `BASE-QUOTE`. OKX expects the
//! literal string `ping` as an application heartbeat and answers `pong`.

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

const NAME: ProviderName = ProviderName::Okx;

/// Default WebSocket endpoint.
pub fn default_ws_url() -> Url {
    "wss://ws.okx.com:8443/ws/v5/public".parse().unwrap()
}

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://www.okx.com".parse().unwrap()
}

fn inst_id(pair: &CurrencyPair) -> String {
    pair.join("-")
}

#[derive(Deserialize)]
struct OkxArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Deserialize)]
struct OkxEnvelope {
    arg: OkxArg,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct OkxTicker {
    #[serde(rename = "instId")]
    inst_id: String,
    last: String,
    #[serde(rename = "vol24h")]
    volume: String,
}

#[derive(Deserialize)]
struct OkxEvent {
    event: String,
}

pub(crate) fn handle_message(store: &PriceStore, payload: &[u8]) {
    // Heartbeat reply to our text ping.
    if payload == b"pong" {
        return;
    }
    if let Ok(envelope) = serde_json::from_slice::<OkxEnvelope>(payload) {
        match envelope.arg.channel.as_str() {
            "tickers" => {
                let Ok(tickers) = serde_json::from_value::<Vec<OkxTicker>>(envelope.data) else {
                    warn!("{NAME}: malformed tickers payload ({} bytes)", payload.len());
                    telemetry::failure(NAME, "decode");
                    return;
                };
                for ticker in tickers {
                    match TickerPrice::new(&ticker.last, &ticker.volume) {
                        Ok(price) => store.set_ticker(ticker.inst_id, price),
                        Err(err) => {
                            warn!("{NAME}: dropping ticker for {}: {err}", ticker.inst_id);
                            telemetry::failure(NAME, "numeric");
                        }
                    }
                }
            }
            "candle1m" => {
                // Rows are ["ts","o","h","l","c","vol",…]; ts is the bar's
                // start, the store keeps the bar's end.
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
                        Ok(candle) => store.set_candle(envelope.arg.inst_id.clone(), candle),
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
    if let Ok(event) = serde_json::from_slice::<OkxEvent>(payload) {
        debug!("{NAME}: event frame: {}", event.event);
        return;
    }
    warn!("{NAME}: unable to parse frame ({} bytes)", payload.len());
    telemetry::failure(NAME, "decode");
}

/// OKX spot market-data provider.
pub struct OkxProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
}

impl OkxProvider {
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (ws_url, rest_url, _) =
            resolve_urls(NAME, endpoint, default_ws_url(), default_rest_url())?;
        let store = Arc::new(PriceStore::with_symbols(
            NAME,
            Box::new(inst_id),
            Box::new(inst_id),
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
        let args: Vec<serde_json::Value> = pairs
            .iter()
            .flat_map(|pair| {
                [
                    json!({"channel": "tickers", "instId": inst_id(pair)}),
                    json!({"channel": "candle1m", "instId": inst_id(pair)}),
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
impl Provider for OkxProvider {
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
            #[serde(rename = "instId")]
            inst_id: String,
        }
        #[derive(Deserialize)]
        struct Response {
            data: Vec<Instrument>,
        }
        let mut url = self.rest_url.join("/api/v5/market/tickers")?;
        url.query_pairs_mut().append_pair("instType", "SPOT");
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
            .map(|inst| inst.inst_id.replace('-', "").to_uppercase())
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

    fn store() -> PriceStore {
        PriceStore::with_symbols(NAME, Box::new(inst_id), Box::new(inst_id))
    }

    #[test]
    fn test_ticker_frame_dispatch() {
        let store = store();
        handle_message(
            &store,
            br#"{"arg":{"channel":"tickers","instId":"ATOM-USDT"},"data":[{"instId":"ATOM-USDT","last":"13.555","lastSz":"0.1","vol24h":"2222","high24h":"14"}]}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out[&pair].price, dec!(13.555));
        assert_eq!(out[&pair].volume, dec!(2222));
    }

    #[test]
    fn test_candle_frame_dispatch() {
        let store = store();
        handle_message(
            &store,
            br#"{"arg":{"channel":"candle1m","instId":"ATOM-USDT"},"data":[["1704067200000","13.5","13.6","13.4","13.55","120","1620"]]}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_candle_prices(&[pair.clone()]);
        assert_eq!(out[&pair][0].price, dec!(13.55));
        assert_eq!(out[&pair][0].volume, dec!(120));
        assert_eq!(out[&pair][0].timestamp_ms, 1_704_067_260_000);
    }

    #[test]
    fn test_event_and_pong_frames_ignored() {
        let store = store();
        handle_message(&store, b"pong");
        handle_message(
            &store,
            br#"{"event":"subscribe","arg":{"channel":"tickers","instId":"ATOM-USDT"}}"#,
        );
        assert!(
            store
                .get_ticker_prices(&[CurrencyPair::new("ATOM", "USDT")])
                .is_empty()
        );
    }
}
