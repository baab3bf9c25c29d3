//! Binance spot connector.
//!
//! Subscribes two channels per pair, `@ticker` for 24h ticker statistics
//! and `@kline_1m` for 1-minute bars, and dispatches both into the price
//! store. Subscription acknowledgements
//! (`{"result":null,"id":n}`) are dropped silently.

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

const NAME: ProviderName = ProviderName::Binance;

/// Default WebSocket endpoint.
pub fn default_ws_url() -> Url {
    "wss://stream.binance.com:9443/ws".parse().unwrap()
}

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://api.binance.com".parse().unwrap()
}

fn ticker_channel(pair: &CurrencyPair) -> String {
    format!("{}@ticker", pair.to_string().to_lowercase())
}

fn candle_channel(pair: &CurrencyPair) -> String {
    format!("{}@kline_1m", pair.to_string().to_lowercase())
}

/// 24h ticker statistics frame (reduced to the fields the oracle consumes).
#[derive(Deserialize)]
struct BinanceTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "v")]
    volume: String,
}

#[derive(Deserialize)]
struct BinanceKlineEvent {
    #[serde(rename = "k")]
    kline: BinanceKline,
}

#[derive(Deserialize)]
struct BinanceKline {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    /// Bar close time, Unix milliseconds.
    #[serde(rename = "T")]
    close_time: i64,
}

/// Subscription acknowledgement: `{"result":null,"id":1}`.
#[derive(Deserialize)]
struct BinanceAck {
    id: u64,
}

pub(crate) fn handle_message(store: &PriceStore, payload: &[u8]) {
    if let Ok(ticker) = serde_json::from_slice::<BinanceTicker>(payload) {
        match TickerPrice::new(&ticker.last_price, &ticker.volume) {
            Ok(price) => store.set_ticker(format!("{}@ticker", ticker.symbol.to_lowercase()), price),
            Err(err) => {
                warn!("{NAME}: dropping ticker for {}: {err}", ticker.symbol);
                telemetry::failure(NAME, "numeric");
            }
        }
        return;
    }
    if let Ok(event) = serde_json::from_slice::<BinanceKlineEvent>(payload) {
        let kline = event.kline;
        match CandlePrice::new(&kline.close, &kline.volume, kline.close_time) {
            Ok(candle) => {
                store.set_candle(format!("{}@kline_1m", kline.symbol.to_lowercase()), candle);
            }
            Err(err) => {
                warn!("{NAME}: dropping kline for {}: {err}", kline.symbol);
                telemetry::failure(NAME, "numeric");
            }
        }
        return;
    }
    if let Ok(ack) = serde_json::from_slice::<BinanceAck>(payload) {
        debug!("{NAME}: subscription ack id={}", ack.id);
        return;
    }
    warn!("{NAME}: unable to parse frame ({} bytes)", payload.len());
    telemetry::failure(NAME, "decode");
}

/// Binance spot market-data provider.
pub struct BinanceProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
}

impl BinanceProvider {
    /// Connects the provider to its endpoints and registers `pairs`,
    /// gated against the exchange's advertised symbols.
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
        let params: Vec<String> = pairs
            .iter()
            .flat_map(|pair| [ticker_channel(pair), candle_channel(pair)])
            .collect();
        vec![json!({"method": "SUBSCRIBE", "params": params, "id": 1})]
    }

    fn handler(store: Arc<PriceStore>) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], _handle: &WsHandle| {
            handle_message(&store, payload)
        })
    }
}

#[async_trait]
impl Provider for BinanceProvider {
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
        let url = self.rest_url.join("/api/v3/ticker/price")?;
        let symbols: Vec<Symbol> = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(symbols.into_iter().map(|s| s.symbol.to_uppercase()).collect())
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
