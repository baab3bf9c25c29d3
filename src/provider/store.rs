//! Concurrent per-provider price cache.
//!
//! Every provider owns one [`PriceStore`]: the set of pairs it is expected to
//! report, the latest ticker per pair, and a sliding window of candles per
//! pair. Background workers write into it as frames arrive; the aggregator
//! reads snapshots out of it. Three independent read-write locks keep the
//! ticker and candle write paths from contending, and no lock is ever held
//! across I/O or parser code.

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
    time::Duration,
};

use chrono::Utc;
use log::warn;

use super::{
    CurrencyPair, ProviderName, telemetry,
    types::{CandlePrice, TickerPrice, Trade},
};

/// Default sliding retention window for candles.
pub const DEFAULT_CANDLE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Translation from a generic pair to this provider's symbol.
pub type SymbolFn = Box<dyn Fn(&CurrencyPair) -> String + Send + Sync>;

fn canonical_symbol() -> SymbolFn {
    Box::new(|pair| pair.to_string())
}

/// Thread-safe cache of subscribed pairs, tickers and windowed candles.
pub struct PriceStore {
    name: ProviderName,
    candle_period: Duration,
    subscribed: RwLock<BTreeMap<String, CurrencyPair>>,
    tickers: RwLock<HashMap<String, TickerPrice>>,
    candles: RwLock<HashMap<String, Vec<CandlePrice>>>,
    ticker_symbol: SymbolFn,
    candle_symbol: SymbolFn,
}

impl PriceStore {
    /// Creates a store whose ticker and candle symbols are the canonical
    /// `BASEQUOTE` string.
    pub fn new(name: ProviderName) -> Self {
        Self::with_symbols(name, canonical_symbol(), canonical_symbol())
    }

    /// Creates a store with provider-specific symbol translation functions.
    pub fn with_symbols(
        name: ProviderName,
        ticker_symbol: SymbolFn,
        candle_symbol: SymbolFn,
    ) -> Self {
        Self {
            name,
            candle_period: DEFAULT_CANDLE_PERIOD,
            subscribed: RwLock::new(BTreeMap::new()),
            tickers: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            ticker_symbol,
            candle_symbol,
        }
    }

    /// Overrides the candle retention window.
    #[must_use]
    pub fn with_candle_period(mut self, period: Duration) -> Self {
        self.candle_period = period;
        self
    }

    /// Provider this store belongs to.
    pub fn provider(&self) -> ProviderName {
        self.name
    }

    /// Renders `pair` as this provider's ticker-channel symbol.
    pub fn ticker_symbol(&self, pair: &CurrencyPair) -> String {
        (self.ticker_symbol)(pair)
    }

    /// Renders `pair` as this provider's candle-channel symbol.
    pub fn candle_symbol(&self, pair: &CurrencyPair) -> String {
        (self.candle_symbol)(pair)
    }

    /// Adds pairs to the subscribed set, returning only the pairs that were
    /// not already present. Re-subscribing is a no-op.
    pub fn subscribe_pairs(&self, pairs: &[CurrencyPair]) -> Vec<CurrencyPair> {
        let mut subscribed = self.subscribed.write().unwrap();
        let mut added = Vec::new();
        for pair in pairs {
            if subscribed.insert(pair.to_string(), pair.clone()).is_none() {
                added.push(pair.clone());
            }
        }
        added
    }

    /// Snapshot of the subscribed pairs.
    pub fn subscribed_pairs(&self) -> Vec<CurrencyPair> {
        self.subscribed.read().unwrap().values().cloned().collect()
    }

    /// Returns the latest ticker for each requested pair that has one.
    ///
    /// Pairs with no cached value are logged and skipped; the result map is
    /// possibly partial, never an error.
    pub fn get_ticker_prices(&self, pairs: &[CurrencyPair]) -> HashMap<CurrencyPair, TickerPrice> {
        let tickers = self.tickers.read().unwrap();
        let mut out = HashMap::new();
        for pair in pairs {
            let symbol = self.ticker_symbol(pair);
            match tickers.get(&symbol) {
                Some(ticker) => {
                    out.insert(pair.clone(), ticker.clone());
                }
                None => warn!("{}: missing ticker for {pair}", self.name),
            }
        }
        out
    }

    /// Returns a deep copy of the candle window for each requested pair that
    /// has one. Callers may mutate the returned lists freely.
    pub fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> HashMap<CurrencyPair, Vec<CandlePrice>> {
        let candles = self.candles.read().unwrap();
        let mut out = HashMap::new();
        for pair in pairs {
            let symbol = self.candle_symbol(pair);
            match candles.get(&symbol) {
                Some(list) => {
                    out.insert(pair.clone(), list.clone());
                }
                None => warn!("{}: missing candles for {pair}", self.name),
            }
        }
        out
    }

    /// Stores the latest ticker for a provider symbol. Latest value wins.
    pub(crate) fn set_ticker(&self, symbol: impl Into<String>, ticker: TickerPrice) {
        self.tickers.write().unwrap().insert(symbol.into(), ticker);
        telemetry::websocket_message(self.name, telemetry::MessageKind::Ticker);
    }

    /// Inserts a candle for a provider symbol, pruning entries that fell out
    /// of the retention window.
    pub(crate) fn set_candle(&self, symbol: impl Into<String>, candle: CandlePrice) {
        self.set_candle_at(symbol, candle, Utc::now().timestamp_millis());
    }

    pub(crate) fn set_candle_at(&self, symbol: impl Into<String>, candle: CandlePrice, now_ms: i64) {
        let stale = now_ms - self.candle_period.as_millis() as i64;
        let mut candles = self.candles.write().unwrap();
        let list = candles.entry(symbol.into()).or_default();
        prune_insert(list, candle, stale);
        drop(candles);
        telemetry::websocket_message(self.name, telemetry::MessageKind::Candle);
    }

    /// Replaces the whole candle window for a provider symbol. Used by
    /// polling providers that re-fetch their history on every tick.
    pub(crate) fn replace_candles(&self, symbol: impl Into<String>, list: Vec<CandlePrice>) {
        self.candles.write().unwrap().insert(symbol.into(), list);
        telemetry::websocket_message(self.name, telemetry::MessageKind::Candle);
    }

    /// Folds a trade into the 1-minute candle whose window contains it.
    ///
    /// A trade executed at second `s` belongs to the bucket ending at
    /// `floor(s / 60) × 60 + 60`. If that bucket already has a candle, the
    /// trade's size is added to its volume and its close becomes the trade's
    /// price; otherwise a fresh candle is inserted (with pruning).
    pub(crate) fn add_trade(&self, symbol: impl Into<String>, trade: &Trade) {
        self.add_trade_at(symbol, trade, Utc::now().timestamp_millis());
    }

    pub(crate) fn add_trade_at(&self, symbol: impl Into<String>, trade: &Trade, now_ms: i64) {
        let bucket_end_ms = (trade.time_secs / 60 * 60 + 60) * 1000;
        let fresh = match CandlePrice::new(&trade.price, &trade.size, bucket_end_ms) {
            Ok(candle) => candle,
            Err(err) => {
                warn!("{}: dropping trade: {err}", self.name);
                telemetry::failure(self.name, "numeric");
                return;
            }
        };

        let stale = now_ms - self.candle_period.as_millis() as i64;
        let mut candles = self.candles.write().unwrap();
        let list = candles.entry(symbol.into()).or_default();
        list.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

        // Walk newest to oldest: merge into an exact bucket match, otherwise
        // the trade opens a fresh candle.
        let mut merge_at = None;
        for (i, candle) in list.iter().enumerate() {
            if candle.timestamp_ms == bucket_end_ms {
                merge_at = Some(i);
                break;
            }
            if candle.timestamp_ms < bucket_end_ms {
                break;
            }
        }
        match merge_at {
            Some(i) => {
                list[i].volume += fresh.volume;
                list[i].price = fresh.price;
            }
            None => prune_insert(list, fresh, stale),
        }
        drop(candles);
        telemetry::websocket_message(self.name, telemetry::MessageKind::Trade);
    }
}

/// Prepends `candle` and drops every prior entry at or past the staleness
/// edge. Retention is strictly `timestamp > stale`.
fn prune_insert(list: &mut Vec<CandlePrice>, candle: CandlePrice, stale_ms: i64) {
    list.retain(|c| c.timestamp_ms > stale_ms);
    list.insert(0, candle);
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;

    use super::*;

    fn store() -> PriceStore {
        PriceStore::new(ProviderName::Mock)
    }

    fn pair() -> CurrencyPair {
        CurrencyPair::new("ATOM", "USDT")
    }

    #[test]
    fn test_empty_store_returns_empty_maps() {
        let store = store();
        assert!(store.get_ticker_prices(&[pair()]).is_empty());
        assert!(store.get_candle_prices(&[pair()]).is_empty());
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let store = store();
        let added = store.subscribe_pairs(&[pair(), pair()]);
        assert_eq!(added, vec![pair()]);
        assert!(store.subscribe_pairs(&[pair()]).is_empty());
        assert_eq!(store.subscribed_pairs(), vec![pair()]);
    }

    #[test]
    fn test_latest_ticker_wins() {
        let store = store();
        store.set_ticker("ATOMUSDT", TickerPrice::new("1.0", "10").unwrap());
        store.set_ticker("ATOMUSDT", TickerPrice::new("2.0", "20").unwrap());
        let out = store.get_ticker_prices(&[pair()]);
        assert_eq!(out[&pair()].price, dec!(2.0));
        assert_eq!(out[&pair()].volume, dec!(20));
    }

    #[test]
    fn test_candle_copy_is_isolated() {
        let store = store();
        store.set_candle_at("ATOMUSDT", CandlePrice::new("1", "1", 1_000).unwrap(), 1_000);
        let mut first = store.get_candle_prices(&[pair()]);
        first.get_mut(&pair()).unwrap().clear();
        let second = store.get_candle_prices(&[pair()]);
        assert_eq!(second[&pair()].len(), 1);
    }

    #[test]
    fn test_stale_candles_pruned_on_insert() {
        let now = 100_000;
        let store = store().with_candle_period(Duration::from_secs(60));
        store.set_candle_at("ATOMUSDT", CandlePrice::new("1", "1", now - 90_000).unwrap(), now);
        store.set_candle_at("ATOMUSDT", CandlePrice::new("2", "1", now - 30_000).unwrap(), now);
        store.set_candle_at("ATOMUSDT", CandlePrice::new("3", "1", now).unwrap(), now);
        let out = store.get_candle_prices(&[pair()]);
        let times: Vec<i64> = out[&pair()].iter().map(|c| c.timestamp_ms).collect();
        assert_eq!(times, vec![now, now - 30_000]);
    }

    #[test]
    fn test_candle_at_stale_edge_is_pruned() {
        let now = 600_000;
        let store = store().with_candle_period(Duration::from_secs(60));
        let edge = now - 60_000;
        store.set_candle_at("ATOMUSDT", CandlePrice::new("1", "1", edge).unwrap(), now);
        store.set_candle_at("ATOMUSDT", CandlePrice::new("2", "1", now).unwrap(), now);
        let out = store.get_candle_prices(&[pair()]);
        assert_eq!(out[&pair()].len(), 1);
        assert_eq!(out[&pair()][0].timestamp_ms, now);
    }

    #[test]
    fn test_trades_fold_into_minute_bucket() {
        let store = store();
        let now_ms = 1_704_067_260_000;
        let first = Trade {
            time_secs: 1_704_067_200,
            price: "43000.00".into(),
            size: "0.5".into(),
        };
        let second = Trade {
            time_secs: 1_704_067_230,
            price: "43010.00".into(),
            size: "0.25".into(),
        };
        store.add_trade_at("BTCUSD", &first, now_ms);
        store.add_trade_at("BTCUSD", &second, now_ms);

        let btc = CurrencyPair::new("BTC", "USD");
        let out = store.get_candle_prices(&[btc.clone()]);
        let candles = &out[&btc];
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].price, dec!(43010.00));
        assert_eq!(candles[0].volume, dec!(0.75));
        assert_eq!(candles[0].timestamp_ms, 1_704_067_260_000);
    }

    #[test]
    fn test_trade_volume_fold_is_commutative() {
        let now_ms = 1_704_067_260_000;
        let a = Trade {
            time_secs: 1_704_067_201,
            price: "10".into(),
            size: "0.5".into(),
        };
        let b = Trade {
            time_secs: 1_704_067_202,
            price: "11".into(),
            size: "0.25".into(),
        };

        let fold = |first: &Trade, second: &Trade| {
            let store = store();
            store.add_trade_at("X", first, now_ms);
            store.add_trade_at("X", second, now_ms);
            let pair = CurrencyPair::new("X", "");
            store.get_candle_prices(&[pair.clone()]).remove(&pair).unwrap()
        };
        assert_eq!(fold(&a, &b)[0].volume, fold(&b, &a)[0].volume);
    }

    #[test]
    fn test_trade_in_new_bucket_adds_candle() {
        let store = store();
        let now_ms = 1_704_067_330_000;
        let old = Trade {
            time_secs: 1_704_067_200,
            price: "10".into(),
            size: "1".into(),
        };
        let newer = Trade {
            time_secs: 1_704_067_290,
            price: "12".into(),
            size: "2".into(),
        };
        store.add_trade_at("X", &old, now_ms);
        store.add_trade_at("X", &newer, now_ms);

        let pair = CurrencyPair::new("X", "");
        let out = store.get_candle_prices(&[pair.clone()]);
        let times: Vec<i64> = out[&pair].iter().map(|c| c.timestamp_ms).collect();
        assert_eq!(times, vec![1_704_067_320_000, 1_704_067_260_000]);
    }

    #[test]
    fn test_malformed_trade_leaves_cache_unchanged() {
        let store = store();
        let bad = Trade {
            time_secs: 1_704_067_200,
            price: "not-a-number".into(),
            size: "1".into(),
        };
        store.add_trade_at("X", &bad, 1_704_067_260_000);
        assert!(store.get_candle_prices(&[CurrencyPair::new("X", "")]).is_empty());
    }
}
