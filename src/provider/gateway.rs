//! OJO-operated price gateways.
//!
//! Eight on-chain venues (Osmosis, Astroport, Kujira, Camelot, Curve,
//! Balancer, PancakeSwap, Crescent) are fronted by gateways that all speak
//! the same protocol: after subscribing, the server streams a JSON object
//! keyed by `BASE/QUOTE` pair name whose values are either a ticker object
//! or a list of candle objects. Dispatch attempts the ticker decode first
//! and falls back to the candle list; anything else is ignored.
//!
//! Some sources list a pair only in the reverse orientation (Crescent lists
//! `BCRE/CRE` but the feed wants `CRE/BCRE`); such pairs are queried
//! reversed and their price inverted on the way into the store.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use log::warn;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;
use yawc::frame::OpCode;

use super::{
    CandlePrice, CurrencyPair, Endpoint, PingMessage, PingPolicy, PriceStore, Provider,
    ProviderName, TickerPrice, WsController, WsHandle, http_client, resolve_urls, telemetry,
    ws::MessageHandler,
};

fn default_host(name: ProviderName) -> Option<&'static str> {
    use ProviderName::*;
    Some(match name {
        Osmosis => "osmosis-api.prod.ojo.network",
        Astroport => "astroport-api.prod.ojo.network",
        Kujira => "kujira-api.prod.ojo.network",
        Camelot => "camelot-api.prod.ojo.network",
        Curve => "curve-api.prod.ojo.network",
        Balancer => "balancer-api.prod.ojo.network",
        Pancake => "pancake-api.prod.ojo.network",
        Crescent => "crescent-api.prod.ojo.network",
        _ => return None,
    })
}

/// Pairs a gateway lists only in reverse orientation. Queried reversed and
/// inverted before they reach the store.
fn reversed_pairs(name: ProviderName) -> Vec<CurrencyPair> {
    match name {
        ProviderName::Crescent => vec![CurrencyPair::new("CRE", "BCRE")],
        _ => Vec::new(),
    }
}

#[derive(Deserialize)]
struct GatewayTicker {
    #[serde(rename = "Price")]
    price: String,
    #[serde(rename = "Volume")]
    volume: String,
}

#[derive(Deserialize)]
struct GatewayCandle {
    #[serde(rename = "Price")]
    price: String,
    #[serde(rename = "Volume")]
    volume: String,
    #[serde(rename = "TimeStamp")]
    timestamp_ms: i64,
}

/// Each value in a gateway frame is one of these two shapes.
#[derive(Deserialize)]
#[serde(untagged)]
enum GatewayEntry {
    Ticker(GatewayTicker),
    Candles(Vec<GatewayCandle>),
}

fn invert(price: Decimal) -> Option<Decimal> {
    if price.is_zero() {
        return None;
    }
    Some(Decimal::ONE / price)
}

pub(crate) fn handle_message(
    name: ProviderName,
    store: &PriceStore,
    inverted: &HashSet<String>,
    payload: &[u8],
) {
    // Subscription acknowledgement sentinel.
    if payload == b"ack" || payload == br#""ack""# {
        return;
    }
    let Ok(frame) = serde_json::from_slice::<HashMap<String, serde_json::Value>>(payload) else {
        warn!("{name}: unable to parse frame ({} bytes)", payload.len());
        telemetry::failure(name, "decode");
        return;
    };
    for (symbol, value) in frame {
        let Ok(entry) = serde_json::from_value::<GatewayEntry>(value) else {
            continue;
        };
        let invert_symbol = inverted.contains(&symbol);
        match entry {
            GatewayEntry::Ticker(ticker) => {
                let parsed = TickerPrice::new(&ticker.price, &ticker.volume);
                match parsed {
                    Ok(mut price) => {
                        if invert_symbol {
                            let Some(inverse) = invert(price.price) else {
                                warn!("{name}: zero price for {symbol}, dropping");
                                telemetry::failure(name, "numeric");
                                continue;
                            };
                            price.price = inverse;
                        }
                        store.set_ticker(symbol, price);
                    }
                    Err(err) => {
                        warn!("{name}: dropping ticker for {symbol}: {err}");
                        telemetry::failure(name, "numeric");
                    }
                }
            }
            GatewayEntry::Candles(candles) => {
                for raw in candles {
                    match CandlePrice::new(&raw.price, &raw.volume, raw.timestamp_ms) {
                        Ok(mut candle) => {
                            if invert_symbol {
                                let Some(inverse) = invert(candle.price) else {
                                    warn!("{name}: zero price for {symbol}, dropping");
                                    telemetry::failure(name, "numeric");
                                    continue;
                                };
                                candle.price = inverse;
                            }
                            store.set_candle(symbol.clone(), candle);
                        }
                        Err(err) => {
                            warn!("{name}: dropping candle for {symbol}: {err}");
                            telemetry::failure(name, "numeric");
                        }
                    }
                }
            }
        }
    }
}

/// Symbol translation for a gateway: `BASE/QUOTE`, flipped for pairs the
/// source lists in reverse orientation.
fn gateway_symbol(reversed: &HashSet<CurrencyPair>, pair: &CurrencyPair) -> String {
    if reversed.contains(pair) {
        pair.reversed().join("/")
    } else {
        pair.join("/")
    }
}

/// Market-data provider for one OJO-operated gateway.
pub struct GatewayProvider {
    name: ProviderName,
    store: Arc<PriceStore>,
    ws: WsController,
    http: reqwest::Client,
    rest_url: Url,
    inverted_symbols: Arc<HashSet<String>>,
}

impl GatewayProvider {
    /// Creates the provider for any of the gateway-backed venues; other
    /// names are an invalid-endpoint error.
    pub async fn new(
        name: ProviderName,
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let Some(host) = default_host(name) else {
            anyhow::bail!("{name} is not a gateway-backed provider");
        };
        let default_ws = format!("wss://{host}/ws").parse()?;
        let default_rest = format!("https://{host}").parse()?;
        let (ws_url, rest_url, _) = resolve_urls(name, endpoint, default_ws, default_rest)?;

        let reversed: Arc<HashSet<CurrencyPair>> =
            Arc::new(reversed_pairs(name).into_iter().collect());
        let inverted_symbols: Arc<HashSet<String>> = Arc::new(
            reversed
                .iter()
                .map(|pair| pair.reversed().join("/"))
                .collect(),
        );

        let ticker_reversed = reversed.clone();
        let candle_reversed = reversed.clone();
        let store = Arc::new(PriceStore::with_symbols(
            name,
            Box::new(move |pair| gateway_symbol(&ticker_reversed, pair)),
            Box::new(move |pair| gateway_symbol(&candle_reversed, pair)),
        ));

        let provider = Self {
            name,
            store,
            ws: WsController::new(name, ws_url, cancel),
            http: http_client(),
            rest_url,
            inverted_symbols,
        };
        provider.subscribe_currency_pairs(pairs).await?;
        Ok(provider)
    }

    fn handler(
        name: ProviderName,
        store: Arc<PriceStore>,
        inverted: Arc<HashSet<String>>,
    ) -> MessageHandler {
        Arc::new(move |_opcode: OpCode, payload: &[u8], _handle: &WsHandle| {
            handle_message(name, &store, &inverted, payload)
        })
    }
}

#[async_trait]
impl Provider for GatewayProvider {
    fn name(&self) -> ProviderName {
        self.name
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
        let url = self.rest_url.join("/api/pairs")?;
        let pairs: Vec<String> = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(pairs
            .into_iter()
            .map(|pair| pair.replace('/', "").to_uppercase())
            .collect())
    }

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<()> {
        let available = self.get_available_pairs().await?;
        // A reversed-orientation pair is advertised under its reverse name.
        let confirmed: Vec<CurrencyPair> = pairs
            .iter()
            .filter(|pair| {
                let symbol = self.store.ticker_symbol(pair).replace('/', "");
                let known = available.contains(&symbol);
                if !known {
                    warn!(
                        "{}: pair {pair} not advertised by provider, dropping",
                        self.name
                    );
                }
                known
            })
            .cloned()
            .collect();
        let added = self.store.subscribe_pairs(&confirmed);
        if added.is_empty() {
            return Ok(());
        }
        telemetry::websocket_subscribed_pairs(self.name, added.len());
        let symbols: Vec<String> = added
            .iter()
            .map(|pair| self.store.ticker_symbol(pair))
            .collect();
        self.ws.add_connection(
            vec![json!({"subscribe": symbols})],
            Self::handler(self.name, self.store.clone(), self.inverted_symbols.clone()),
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

    fn crescent_store() -> (PriceStore, HashSet<String>) {
        let reversed: Arc<HashSet<CurrencyPair>> =
            Arc::new(reversed_pairs(ProviderName::Crescent).into_iter().collect());
        let inverted: HashSet<String> = reversed
            .iter()
            .map(|pair| pair.reversed().join("/"))
            .collect();
        let ticker_reversed = reversed.clone();
        let store = PriceStore::with_symbols(
            ProviderName::Crescent,
            Box::new(move |pair| gateway_symbol(&ticker_reversed, pair)),
            Box::new(move |pair| gateway_symbol(&reversed, pair)),
        );
        (store, inverted)
    }

    #[test]
    fn test_ticker_dispatch() {
        let (store, inverted) = crescent_store();
        handle_message(
            ProviderName::Crescent,
            &store,
            &inverted,
            br#"{"ATOM/USDT":{"Price":"13.44","Volume":"1820.5"}}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out[&pair].price, dec!(13.44));
        assert_eq!(out[&pair].volume, dec!(1820.5));
    }

    #[test]
    fn test_candle_list_dispatch() {
        let (store, inverted) = crescent_store();
        handle_message(
            ProviderName::Crescent,
            &store,
            &inverted,
            br#"{"ATOM/USDT":[{"Price":"13.40","Volume":"10","TimeStamp":1704067260000},{"Price":"13.42","Volume":"12","TimeStamp":1704067320000}]}"#,
        );

        let pair = CurrencyPair::new("ATOM", "USDT");
        let out = store.get_candle_prices(&[pair.clone()]);
        assert_eq!(out[&pair].len(), 2);
    }

    #[test]
    fn test_reversed_pair_price_is_inverted() {
        let (store, inverted) = crescent_store();
        handle_message(
            ProviderName::Crescent,
            &store,
            &inverted,
            br#"{"BCRE/CRE":{"Price":"2.0","Volume":"100"}}"#,
        );

        let pair = CurrencyPair::new("CRE", "BCRE");
        let out = store.get_ticker_prices(&[pair.clone()]);
        assert_eq!(out[&pair].price, dec!(0.5));
    }

    #[test]
    fn test_unknown_value_shape_ignored() {
        let (store, inverted) = crescent_store();
        handle_message(ProviderName::Crescent, &store, &inverted, b"ack");
        handle_message(
            ProviderName::Crescent,
            &store,
            &inverted,
            br#"{"ATOM/USDT":"not a ticker or candle list"}"#,
        );
        assert!(
            store
                .get_ticker_prices(&[CurrencyPair::new("ATOM", "USDT")])
                .is_empty()
        );
    }
}
