//! # oraclefeed
//!
//! Real-time market-data aggregation for oracle price feeders.
//!
//! The crate maintains long-lived connectors (**providers**) to a set of
//! heterogeneous exchanges and aggregator APIs (centralized venues over
//! WebSocket, REST pollers, a GraphQL subgraph) and exposes one uniform
//! in-process query surface over all of them: the latest ticker and the
//! recent 1-minute candle window for a set of currency pairs. Downstream
//! code (the oracle aggregator) combines the per-provider views into
//! medians and TWAPs; nothing here persists data, listens on a port or
//! ranks providers.
//!
//! ## Features
//!
//! - ~20 concrete providers behind one [`Provider`] trait
//! - Reconnecting WebSocket pools with subscription replay and per-venue
//!   heartbeat quirks (gzip frames, server-initiated pings, auth frames)
//! - A concurrent per-provider price store with windowed candles and
//!   trade-to-candle folding
//! - Pair-availability gating so a misconfigured pair never takes down a
//!   provider
//!
//! ## Quick start
//!
//! ```no_run
//! use oraclefeed::{CurrencyPair, ProviderName, provider};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cancel = CancellationToken::new();
//! let pairs = vec![
//!     CurrencyPair::new("ATOM", "USDT"),
//!     CurrencyPair::new("BTC", "USDT"),
//! ];
//!
//! let binance =
//!     provider::new_provider(ProviderName::Binance, None, cancel.clone(), &pairs).await?;
//! binance.start_connections();
//!
//! // The aggregator polls the unified view.
//! let tickers = binance.get_ticker_prices(&pairs);
//! let candles = binance.get_candle_prices(&pairs);
//! # let _ = (tickers, candles);
//!
//! // One cancellation tears down every worker.
//! cancel.cancel();
//! # Ok(())
//! # }
//! ```

pub mod provider;

pub use provider::{
    CandlePrice, CurrencyPair, Endpoint, Error, PriceStore, Provider, ProviderName, TickerPrice,
    Trade, new_provider,
};

/// Re-exported decimal type from rust_decimal.
///
/// Every price, volume and size in the crate is one of these.
pub use rust_decimal::Decimal;
