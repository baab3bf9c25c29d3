//! AlphaVantage forex connector (REST polling).
//!
//! AlphaVantage has no push feed; a background task polls the FX_INTRADAY
//! endpoint for every subscribed pair and bulk-replaces that pair's candle
//! window on each tick. The response is CSV with fixed columns
//! `timestamp,open,high,low,close,volume` and timestamps in either
//! `YYYY-MM-DD HH:MM:SS` or bare `YYYY-MM-DD` form.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use log::warn;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    CandlePrice, CurrencyPair, Endpoint, Error, PriceStore, Provider, ProviderName, TickerPrice,
    filter_available_pairs, http_client, resolve_urls, telemetry,
};

const NAME: ProviderName = ProviderName::Alphavantage;

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const CANDLE_INTERVAL: &str = "15min";

/// Default REST endpoint.
pub fn default_rest_url() -> Url {
    "https://www.alphavantage.co".parse().unwrap()
}

fn parse_row_timestamp(raw: &str) -> Result<i64> {
    if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(datetime.and_utc().timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("bad timestamp {raw:?}"))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
        .timestamp_millis())
}

/// Parses an FX_INTRADAY CSV body into candles, ascending by time.
pub(crate) fn parse_intraday_csv(body: &str) -> Result<Vec<CandlePrice>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());
    let mut candles = Vec::new();
    for record in reader.records() {
        let record = record?;
        let (Some(timestamp), Some(close), Some(volume)) =
            (record.get(0), record.get(4), record.get(5))
        else {
            bail!("short csv row: {} columns", record.len());
        };
        candles.push(CandlePrice::new(close, volume, parse_row_timestamp(timestamp)?)?);
    }
    candles.sort_by_key(|candle| candle.timestamp_ms);
    Ok(candles)
}

async fn poll_pair(
    http: &reqwest::Client,
    rest_url: &Url,
    api_key: &str,
    store: &PriceStore,
    pair: &CurrencyPair,
) -> Result<()> {
    let mut url = rest_url.join("/query")?;
    url.query_pairs_mut()
        .append_pair("function", "FX_INTRADAY")
        .append_pair("from_symbol", &pair.base)
        .append_pair("to_symbol", &pair.quote)
        .append_pair("interval", CANDLE_INTERVAL)
        .append_pair("datatype", "csv")
        .append_pair("apikey", api_key);
    let body = http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let candles = parse_intraday_csv(&body)?;
    let Some(latest) = candles.last() else {
        return Ok(());
    };
    let symbol = store.ticker_symbol(pair);
    store.set_ticker(
        symbol.clone(),
        TickerPrice {
            price: latest.price,
            volume: latest.volume,
        },
    );
    store.replace_candles(symbol, candles);
    Ok(())
}

/// AlphaVantage FX market-data provider.
pub struct AlphavantageProvider {
    store: Arc<PriceStore>,
    http: reqwest::Client,
    rest_url: Url,
    api_key: String,
}

impl AlphavantageProvider {
    /// Creates the provider and starts its poll loop; there are no
    /// connections to open later.
    pub async fn new(
        cancel: CancellationToken,
        endpoint: Option<Endpoint>,
        pairs: &[CurrencyPair],
    ) -> Result<Self> {
        let (_, rest_url, api_key) =
            resolve_urls(NAME, endpoint, default_rest_url(), default_rest_url())?;
        let api_key = api_key.ok_or(Error::MissingApiKey(NAME))?;
        let provider = Self {
            store: Arc::new(PriceStore::new(NAME)),
            http: http_client(),
            rest_url,
            api_key,
        };
        provider.subscribe_currency_pairs(pairs).await?;
        provider.spawn_poll_loop(cancel);
        Ok(provider)
    }

    fn spawn_poll_loop(&self, cancel: CancellationToken) {
        let store = self.store.clone();
        let http = self.http.clone();
        let rest_url = self.rest_url.clone();
        let api_key = self.api_key.clone();
        tokio::spawn(async move {
            let mut tick = interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        for pair in store.subscribed_pairs() {
                            if let Err(err) =
                                poll_pair(&http, &rest_url, &api_key, &store, &pair).await
                            {
                                warn!("{NAME}: polling {pair}: {err:#}");
                                telemetry::failure(NAME, "rest");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Provider for AlphavantageProvider {
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

    /// AlphaVantage advertises currencies, not pairs; the universe is every
    /// ordered combination of two known physical currency codes.
    async fn get_available_pairs(&self) -> Result<HashSet<String>> {
        let url = self.rest_url.join("/physical_currency_list/")?;
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(body.as_bytes());
        let mut codes = Vec::new();
        for record in reader.records() {
            let record = record?;
            if let Some(code) = record.get(0) {
                codes.push(code.to_uppercase());
            }
        }
        let mut pairs = HashSet::new();
        for base in &codes {
            for quote in &codes {
                if base != quote {
                    pairs.insert(format!("{base}{quote}"));
                }
            }
        }
        Ok(pairs)
    }

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<()> {
        let available = self.get_available_pairs().await?;
        let confirmed = filter_available_pairs(NAME, pairs, &available);
        let added = self.store.subscribe_pairs(&confirmed);
        telemetry::websocket_subscribed_pairs(NAME, added.len());
        Ok(())
    }

    fn start_connections(&self) {}
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, query_param},
    };

    use super::*;

    const INTRADAY_CSV: &str = "\
timestamp,open,high,low,close,volume
2024-01-01 00:45:00,1.0940,1.0950,1.0930,1.0945,0
2024-01-01 00:30:00,1.0935,1.0945,1.0925,1.0940,0
2024-01-01 00:15:00,1.0930,1.0940,1.0920,1.0935,0
";

    const CURRENCY_LIST_CSV: &str = "\
currency code,currency name
EUR,Euro
USD,United States Dollar
";

    #[test]
    fn test_parse_intraday_csv_ascending() {
        let candles = parse_intraday_csv(INTRADAY_CSV).unwrap();
        assert_eq!(candles.len(), 3);
        assert!(candles.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
        assert_eq!(candles[0].price, dec!(1.0935));
        assert_eq!(candles[2].price, dec!(1.0945));
    }

    #[test]
    fn test_parse_row_timestamp_both_forms() {
        assert_eq!(
            parse_row_timestamp("2024-01-01 00:15:00").unwrap(),
            1_704_068_100_000
        );
        assert_eq!(parse_row_timestamp("2024-01-01").unwrap(), 1_704_067_200_000);
        assert!(parse_row_timestamp("january first").is_err());
    }

    #[tokio::test]
    async fn test_poll_fills_candles_from_csv() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/physical_currency_list/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CURRENCY_LIST_CSV))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("function", "FX_INTRADAY"))
            .and(query_param("from_symbol", "EUR"))
            .and(query_param("to_symbol", "USD"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INTRADAY_CSV))
            .mount(&server)
            .await;

        let endpoint = Endpoint {
            name: NAME,
            rest_url: Some(server.uri().parse().unwrap()),
            websocket_url: None,
            api_key: Some("demo".into()),
        };
        let pair = CurrencyPair::new("EUR", "USD");
        let cancel = CancellationToken::new();
        let provider = AlphavantageProvider::new(cancel.clone(), Some(endpoint), &[pair.clone()])
            .await
            .unwrap();

        // The first poll tick fires immediately; give it a moment to land.
        let mut candles = Vec::new();
        for _ in 0..50 {
            if let Some(list) = provider.get_candle_prices(&[pair.clone()]).remove(&pair) {
                candles = list;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();

        assert_eq!(candles.len(), 3);
        assert!(candles.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
        assert_eq!(
            candles.iter().map(|c| c.price).collect::<Vec<_>>(),
            vec![dec!(1.0935), dec!(1.0940), dec!(1.0945)]
        );

        let tickers = provider.get_ticker_prices(&[pair.clone()]);
        assert_eq!(tickers[&pair].price, dec!(1.0945));
    }

    #[tokio::test]
    async fn test_unknown_pair_dropped_by_gate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/physical_currency_list/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(CURRENCY_LIST_CSV))
            .mount(&server)
            .await;

        let endpoint = Endpoint {
            name: NAME,
            rest_url: Some(server.uri().parse().unwrap()),
            websocket_url: None,
            api_key: Some("demo".into()),
        };
        let cancel = CancellationToken::new();
        let provider = AlphavantageProvider::new(
            cancel.clone(),
            Some(endpoint),
            &[CurrencyPair::new("EUR", "USD"), CurrencyPair::new("FOO", "BAR")],
        )
        .await
        .unwrap();
        cancel.cancel();

        assert_eq!(
            provider.store.subscribed_pairs(),
            vec![CurrencyPair::new("EUR", "USD")]
        );
    }
}
