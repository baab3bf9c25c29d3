//! MEXC spot connector (v3 websocket API).
//!
//! Symbols are the canonical `BASEQUOTE` string uppercased; channels are the
//! v3 `spot@public.miniTicker` and `spot@public.kline` streams.

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

const NAME: ProviderName = ProviderName::Mexc;

/// Default WebSocket endpoint.
pub fn default_ws_url() -> Url {
    "wss://wbs.mexc.com/ws".parse().unwrap()
}

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://api.mexc.com".parse().unwrap()
}

fn ticker_stream(pair: &CurrencyPair) -> String {
    format!("spot@public.miniTicker.v3.api@{pair}@UTC+8")
}

fn kline_stream(pair: &CurrencyPair) -> String {
    format!("spot@public.kline.v3.api@{pair}@Min1")
}

#[derive(Deserialize)]
struct MexcEnvelope {
    /// Channel the update arrived on.
    c: String,
    d: serde_json::Value,
    /// Symbol, e.g. `"ATOMUSDT"`.
    s: String,
}

#[derive(Deserialize)]
struct MexcMiniTicker {
    /// Last price.
    p: String,
    /// 24h base volume.
    v: String,
}

#[derive(Deserialize)]
struct MexcKlineData {
    k: MexcKline,
}

#[derive(Deserialize)]
struct MexcKline {
    /// Bar start, Unix seconds.
    t: i64,
    /// Close price.
    c: String,
    /// Base volume.
    v: String,
}

/// Command acknowledgement / pong: `{"id":0,"code":0,"msg":"…"}`.
#[derive(Deserialize)]
struct MexcAck {
    code: i64,
    msg: String,
}

pub(crate) fn handle_message(store: &PriceStore, payload: &[u8]) {
    if let Ok(envelope) = serde_json::from_slice::<MexcEnvelope>(payload) {
        if envelope.c.contains("miniTicker") {
            let Ok(ticker) = serde_json::from_value::<MexcMiniTicker>(envelope.d) else {
                warn!("{NAME}: malformed ticker payload ({} bytes)", payload.len());
                telemetry::failure(NAME, "decode");
                return;
            };
            match TickerPrice::new(&ticker.p, &ticker.v) {
                Ok(price) => store.set_ticker(envelope.s.to_uppercase(), price),
                Err(err) => {
                    warn!("{NAME}: dropping ticker for {}: {err}", envelope.s);
                    telemetry::failure(NAME, "numeric");
                }
            }
        } else if envelope.c.contains("kline") {
            let Ok(data) = serde_json::from_value::<MexcKlineData>(envelope.d) else {
                warn!("{NAME}: malformed kline payload ({} bytes)", payload.len());
                telemetry::failure(NAME, "decode");
                return;
            };
            match CandlePrice::new(&data.k.c, &data.k.v, (data.k.t + 60) * 1000) {
                Ok(candle) => store.set_candle(envelope.s.to_uppercase(), candle),
                Err(err) => {
                    warn!("{NAME}: dropping kline for {}: {err}", envelope.s);
                    telemetry::failure(NAME, "numeric");
                }
            }
        } else {
            debug!("{NAME}: ignoring channel {}", envelope.c);
        }
        return;
    }
    if let Ok(ack) = serde_json::from_slice::<MexcAck>(payload) {
        debug!("{NAME}: ack code={} msg={}", ack.code, ack.msg);
        return;
    }
    warn!("{NAME}: unable to parse frame ({} bytes)", payload.len());
    telemetry::failure(NAME, "decode");
}

/// MEXC spot market-data provider.
pub struct MexcProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
}

impl MexcProvider {
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
        let params: Vec<String> = pairs
            .iter()
            .flat_map(|pair| [ticker_stream(pair), kline_stream(pair)])
            .collect();
        vec![json!({"method": "SUBSCRIPTION", "params": params})]
    }

    fn handler(store: Arc<PriceStore>) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], _handle: &WsHandle| {
            handle_message(&store, payload)
        })
    }
}

#[async_trait]
impl Provider for MexcProvider {
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
        struct ExchangeInfo {
            symbols: Vec<Symbol>,
        }
        let url = self.rest_url.join("/api/v3/exchangeInfo")?;
        let info: ExchangeInfo = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(info
            .symbols
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
            PingPolicy::Enabled,
            PingMessage::Json(json!({"method": "PING"})),
        );
        Ok(())
    }

    fn start_connections(&self) {
        self.ws.start_connections();
    }
}
