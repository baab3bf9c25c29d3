//! Value types shared by every provider.
//!
//! Prices and volumes are [`rust_decimal::Decimal`] throughout; exchanges ship
//! them as strings or floats and both conversions are validated here so a
//! malformed frame never reaches a cache.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ProviderName, error::Error};

/// An ordered currency pair: `1 base = price × quote`.
///
/// Asset codes are stored uppercase. The canonical string form is the two
/// codes concatenated with no separator (`"ATOMUSDT"`); provider-specific
/// renderings (`"ATOM-USDT"`, `"atomusdt@ticker"`, …) are produced by each
/// provider's translation function.
///
/// # Example
///
/// ```
/// use oraclefeed::CurrencyPair;
///
/// let pair = CurrencyPair::new("atom", "usdt");
/// assert_eq!(pair.to_string(), "ATOMUSDT");
/// assert_eq!(pair.reversed().to_string(), "USDTATOM");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    /// Base asset code, e.g. `"ATOM"`.
    pub base: String,
    /// Quote asset code, e.g. `"USDT"`.
    pub quote: String,
}

impl CurrencyPair {
    /// Creates a pair, uppercasing both codes.
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().to_uppercase(),
            quote: quote.as_ref().to_uppercase(),
        }
    }

    /// Returns the pair with base and quote swapped.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }

    /// Renders the pair with a separator, e.g. `join("-")` → `"ATOM-USDT"`.
    #[must_use]
    pub fn join(&self, sep: &str) -> String {
        format!("{}{sep}{}", self.base, self.quote)
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

/// Parses a price/volume string into a non-negative decimal.
fn parse_decimal(field: &'static str, value: &str) -> Result<Decimal, Error> {
    let dec: Decimal = value.trim().parse().map_err(|_| Error::InvalidDecimal {
        field,
        value: value.to_string(),
    })?;
    if dec.is_sign_negative() {
        return Err(Error::InvalidDecimal {
            field,
            value: value.to_string(),
        });
    }
    Ok(dec)
}

/// Converts an exchange-reported float into a non-negative decimal.
fn decimal_from_f64(field: &'static str, value: f64) -> Result<Decimal, Error> {
    let dec = Decimal::try_from(value).map_err(|_| Error::InvalidDecimal {
        field,
        value: value.to_string(),
    })?;
    if dec.is_sign_negative() {
        return Err(Error::InvalidDecimal {
            field,
            value: value.to_string(),
        });
    }
    Ok(dec)
}

/// Latest-trade snapshot for a pair: last price and 24h volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerPrice {
    /// Last traded price.
    pub price: Decimal,
    /// 24-hour traded volume, base-denominated.
    pub volume: Decimal,
}

impl TickerPrice {
    /// Parses a ticker from string-typed price and volume.
    ///
    /// Fails with [`Error::InvalidDecimal`] when either value is not a finite
    /// non-negative decimal.
    pub fn new(price: &str, volume: &str) -> Result<Self, Error> {
        Ok(Self {
            price: parse_decimal("ticker price", price)?,
            volume: parse_decimal("ticker volume", volume)?,
        })
    }

    /// Converts float-typed price and volume (Huobi-style payloads).
    pub fn from_f64(price: f64, volume: f64) -> Result<Self, Error> {
        Ok(Self {
            price: decimal_from_f64("ticker price", price)?,
            volume: decimal_from_f64("ticker volume", volume)?,
        })
    }
}

/// One OHLCV bar, reduced to what the oracle consumes: close price, volume
/// and the bar's end instant in Unix milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandlePrice {
    /// Close price of the bar.
    pub price: Decimal,
    /// Volume traded within the bar.
    pub volume: Decimal,
    /// End of the bar's window, Unix milliseconds.
    pub timestamp_ms: i64,
}

impl CandlePrice {
    /// Parses a candle from string-typed price and volume.
    pub fn new(price: &str, volume: &str, timestamp_ms: i64) -> Result<Self, Error> {
        Ok(Self {
            price: parse_decimal("candle price", price)?,
            volume: parse_decimal("candle volume", volume)?,
            timestamp_ms,
        })
    }

    /// Converts float-typed price and volume.
    pub fn from_f64(price: f64, volume: f64, timestamp_ms: i64) -> Result<Self, Error> {
        Ok(Self {
            price: decimal_from_f64("candle price", price)?,
            volume: decimal_from_f64("candle volume", volume)?,
            timestamp_ms,
        })
    }
}

/// A single trade, kept as an intermediate for providers that publish trades
/// rather than candles. Price and size stay as the exchange's strings until
/// the trade is folded into a candle.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Trade {
    /// Execution time, Unix seconds.
    pub time_secs: i64,
    /// Execution price as reported.
    pub price: String,
    /// Trade size as reported.
    pub size: String,
}

/// Per-provider endpoint override.
///
/// Providers carry hard-coded default REST and WebSocket endpoints; a host
/// config layer may hand one of these to redirect a provider (e.g. at a
/// gateway or a test double) or to supply an API key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    /// Provider this override applies to.
    pub name: ProviderName,
    /// Replacement REST base URL.
    #[serde(default)]
    pub rest_url: Option<Url>,
    /// Replacement WebSocket URL.
    #[serde(default)]
    pub websocket_url: Option<Url>,
    /// API key, for providers that require one (AlphaVantage, Polygon).
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Endpoint {
    /// Validates that the override targets `want`, returning it unchanged.
    pub(crate) fn check(self, want: ProviderName) -> Result<Self, Error> {
        if self.name != want {
            return Err(Error::InvalidEndpoint {
                want,
                got: self.name,
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;

    use super::*;

    #[test]
    fn test_pair_canonical_string() {
        let pair = CurrencyPair::new("atom", "Usdt");
        assert_eq!(pair.base, "ATOM");
        assert_eq!(pair.quote, "USDT");
        assert_eq!(pair.to_string(), "ATOMUSDT");
        assert_eq!(pair.join("-"), "ATOM-USDT");
        assert_eq!(pair.join("_"), "ATOM_USDT");
    }

    #[test]
    fn test_pair_reversed_involution() {
        let pair = CurrencyPair::new("CRE", "BCRE");
        assert_eq!(pair.reversed().to_string(), "BCRECRE");
        assert_eq!(pair.reversed().reversed(), pair);
    }

    #[test]
    fn test_ticker_price_parses_strings() {
        let ticker = TickerPrice::new("34.69000000", "2396974.02000000").unwrap();
        assert_eq!(ticker.price, dec!(34.69));
        assert_eq!(ticker.volume, dec!(2396974.02));
    }

    #[test]
    fn test_ticker_price_rejects_malformed() {
        assert!(TickerPrice::new("", "1").is_err());
        assert!(TickerPrice::new("12.3", "abc").is_err());
        assert!(TickerPrice::new("12..3", "1").is_err());
        assert!(TickerPrice::new("NaN", "1").is_err());
    }

    #[test]
    fn test_ticker_price_rejects_negative() {
        assert!(TickerPrice::new("-1", "1").is_err());
        assert!(TickerPrice::new("1", "-0.5").is_err());
        assert!(TickerPrice::from_f64(-0.1, 1.0).is_err());
    }

    #[test]
    fn test_candle_price_from_f64() {
        let candle = CandlePrice::from_f64(0.25, 12.5, 1_660_000_000_000).unwrap();
        assert_eq!(candle.price, dec!(0.25));
        assert_eq!(candle.volume, dec!(12.5));
        assert!(CandlePrice::from_f64(f64::NAN, 1.0, 0).is_err());
    }

    #[test]
    fn test_endpoint_check_rejects_wrong_provider() {
        let endpoint = Endpoint {
            name: ProviderName::Binance,
            rest_url: None,
            websocket_url: None,
            api_key: None,
        };
        assert!(endpoint.clone().check(ProviderName::Binance).is_ok());
        assert!(endpoint.check(ProviderName::Kraken).is_err());
    }
}
