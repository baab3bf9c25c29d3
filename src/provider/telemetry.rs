//! Counter wrappers over the `metrics` facade.
//!
//! The crate records counters only; whether anything listens is up to the
//! host binary (a Prometheus exporter, a no-op recorder, nothing).

use std::fmt;

use metrics::counter;

use super::ProviderName;

/// What kind of market-data message a provider just processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Ticker,
    Candle,
    Trade,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticker => f.write_str("ticker"),
            Self::Candle => f.write_str("candle"),
            Self::Trade => f.write_str("trade"),
        }
    }
}

/// A websocket worker is about to redial its endpoint.
pub(crate) fn websocket_reconnect(provider: ProviderName) {
    counter!("websocket.reconnect", "provider" => provider.to_string()).increment(1);
}

/// Pairs were accepted into a provider's subscription set.
pub(crate) fn websocket_subscribed_pairs(provider: ProviderName, count: usize) {
    counter!("websocket.subscribe.currency_pairs", "provider" => provider.to_string())
        .increment(count as u64);
}

/// A market-data message was parsed and stored.
pub(crate) fn websocket_message(provider: ProviderName, kind: MessageKind) {
    counter!(
        "websocket.message",
        "provider" => provider.to_string(),
        "type" => kind.to_string(),
    )
    .increment(1);
}

/// A message or response was dropped (decode failure, bad numeric, …).
pub(crate) fn failure(provider: ProviderName, kind: &'static str) {
    counter!(
        "failure",
        "provider" => provider.to_string(),
        "type" => kind,
    )
    .increment(1);
}
