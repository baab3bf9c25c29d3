//! Polygon.io forex connector.
//!
//! Polygon requires authentication on the socket itself: the first message
//! after connect is an `auth` frame carrying the API key, followed by the
//! subscriptions. Currency aggregates (`CA.*`) update both the ticker and
//! the candle cache; status frames are logged and nothing else.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;
use yawc::frame::OpCode;

use super::{
    CandlePrice, CurrencyPair, Endpoint, Error, PingMessage, PingPolicy, PriceStore, Provider,
    ProviderName, TickerPrice, WsController, WsHandle, filter_available_pairs, http_client, resolve_urls,
    telemetry,
    ws::MessageHandler,
};

const NAME: ProviderName = ProviderName::Polygon;

/// Default WebSocket endpoint (forex cluster).
pub fn default_ws_url() -> Url {
    "wss://socket.polygon.io/forex".parse().unwrap()
}

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://api.polygon.io".parse().unwrap()
}

fn fx_pair(pair: &CurrencyPair) -> String {
    pair.join("/")
}

#[derive(Deserialize)]
#[serde(tag = "ev")]
enum PolygonEvent {
    /// Per-minute currency aggregate.
    #[serde(rename = "CA")]
    Aggregate(PolygonAggregate),
    /// Connection / auth status.
    #[serde(rename = "status")]
    Status(PolygonStatus),
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct PolygonAggregate {
    /// Pair, e.g. `"EUR/USD"`.
    pair: String,
    /// Close price of the window.
    c: f64,
    /// Volume (tick count for forex).
    v: f64,
    /// Window end, Unix milliseconds.
    e: i64,
}

#[derive(Deserialize)]
struct PolygonStatus {
    status: String,
    message: String,
}

pub(crate) fn handle_message(store: &PriceStore, payload: &[u8]) {
    // Polygon batches events into arrays.
    let Ok(events) = serde_json::from_slice::<Vec<PolygonEvent>>(payload) else {
        warn!("{NAME}: unable to parse frame ({} bytes)", payload.len());
        telemetry::failure(NAME, "decode");
        return;
    };
    for event in events {
        match event {
            PolygonEvent::Aggregate(agg) => {
                match TickerPrice::from_f64(agg.c, agg.v) {
                    Ok(price) => store.set_ticker(agg.pair.clone(), price),
                    Err(err) => {
                        warn!("{NAME}: dropping aggregate for {}: {err}", agg.pair);
                        telemetry::failure(NAME, "numeric");
                        continue;
                    }
                }
                match CandlePrice::from_f64(agg.c, agg.v, agg.e) {
                    Ok(candle) => store.set_candle(agg.pair, candle),
                    Err(err) => {
                        warn!("{NAME}: dropping aggregate candle: {err}");
                        telemetry::failure(NAME, "numeric");
                    }
                }
            }
            PolygonEvent::Status(status) => {
                info!("{NAME}: status {}: {}", status.status, status.message);
            }
            PolygonEvent::Other => debug!("{NAME}: ignoring unknown event"),
        }
    }
}

/// Polygon.io forex market-data provider.
pub struct PolygonProvider {
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
    api_key: String,
}

impl PolygonProvider {
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (ws_url, rest_url, api_key) =
            resolve_urls(NAME, endpoint, default_ws_url(), default_rest_url())?;
        let api_key = api_key.ok_or(Error::MissingApiKey(NAME))?;
        let store = Arc::new(PriceStore::with_symbols(
            NAME,
            Box::new(fx_pair),
            Box::new(fx_pair),
        ));
        let provider = Self {
            store,
            ws: WsController::new(NAME, ws_url, cancel),
            http: http_client(),
            rest_url,
            api_key,
        };
        provider.subscribe_currency_pairs(pairs).await?;
        Ok(provider)
    }

    fn subscription_msgs(api_key: &str, pairs: &[CurrencyPair]) -> Vec<serde_json::Value> {
        let aggregates: Vec<String> = pairs.iter().map(|p| format!("CA.{}", fx_pair(p))).collect();
        let quotes: Vec<String> = pairs.iter().map(|p| format!("C.{}", fx_pair(p))).collect();
        vec![
            json!({"action": "auth", "params": api_key}),
            json!({"action": "subscribe", "params": aggregates.join(",")}),
            json!({"action": "subscribe", "params": quotes.join(",")}),
        ]
    }

    fn handler(store: Arc<PriceStore>) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], _handle: &WsHandle| {
            handle_message(&store, payload)
        })
    }
}

#[async_trait]
impl Provider for PolygonProvider {
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
        struct FxTicker {
            /// e.g. `"C:EURUSD"`.
            ticker: String,
        }
        #[derive(Deserialize)]
        struct Response {
            results: Vec<FxTicker>,
        }
        let mut url = self.rest_url.join("/v3/reference/tickers")?;
        url.query_pairs_mut()
            .append_pair("market", "fx")
            .append_pair("limit", "1000")
            .append_pair("apiKey", &self.api_key);
        let resp: Response = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp
            .results
            .into_iter()
            .map(|t| {
                t.ticker
                    .strip_prefix("C:")
                    .unwrap_or(&t.ticker)
                    .to_uppercase()
            })
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
            Self::subscription_msgs(&self.api_key, &added),
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
        PriceStore::with_symbols(NAME, Box::new(fx_pair), Box::new(fx_pair))
    }

    #[test]
    fn test_aggregate_updates_ticker_and_candle() {
        let store = store();
        handle_message(
            &store,
            br#"[{"ev":"CA","pair":"EUR/USD","o":1.0,"c":1.09375,"h":1.1,"l":1.05,"v":754.0,"s":1704067200000,"e":1704067260000}]"#,
        );

        let pair = CurrencyPair::new("EUR", "USD");
        let tickers = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(tickers[&pair].price, dec!(1.09375));
        assert_eq!(tickers[&pair].volume, dec!(754.0));

        let candles = store.get_candle_prices(&[pair.clone()]);
        assert_eq!(candles[&pair][0].price, dec!(1.09375));
        assert_eq!(candles[&pair][0].timestamp_ms, 1_704_067_260_000);
    }

    #[test]
    fn test_status_frames_only_logged() {
        let store = store();
        handle_message(
            &store,
            br#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#,
        );
        assert!(
            store
                .get_ticker_prices(&[CurrencyPair::new("EUR", "USD")])
                .is_empty()
        );
    }

    #[test]
    fn test_auth_frame_comes_first() {
        let msgs =
            PolygonProvider::subscription_msgs("secret", &[CurrencyPair::new("EUR", "USD")]);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0], json!({"action": "auth", "params": "secret"}));
        assert_eq!(msgs[1]["params"], "CA.EUR/USD");
        assert_eq!(msgs[2]["params"], "C.EUR/USD");
    }
}
