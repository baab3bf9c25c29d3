//! Typed errors for provider construction and numeric conversion.
//!
//! Transport-level failures (dial errors, HTTP status, decode errors on a
//! single frame) are handled in place, logged and retried or dropped, and
//! never surface through this enum. What remains typed is the small set of
//! failures a caller can act on: a misdirected endpoint override, a missing
//! credential, and malformed numerics.

use std::fmt;

use super::ProviderName;

/// Errors surfaced by provider constructors and value-type parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An [`Endpoint`](super::Endpoint) override was handed to a provider it
    /// does not belong to. The provider is not started.
    InvalidEndpoint {
        /// Provider being constructed.
        want: ProviderName,
        /// Provider named by the override.
        got: ProviderName,
    },
    /// A price, volume or size failed to parse as a finite non-negative
    /// decimal.
    InvalidDecimal {
        /// Which value failed, for log context.
        field: &'static str,
        /// The offending input.
        value: String,
    },
    /// The provider requires an API key and neither the override nor the
    /// environment supplied one.
    MissingApiKey(ProviderName),
    /// A pair was requested from a pool-indexed provider with no configured
    /// pool address.
    UnknownPool(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEndpoint { want, got } => {
                write!(f, "endpoint for {got} handed to provider {want}")
            }
            Self::InvalidDecimal { field, value } => {
                write!(f, "invalid {field}: {value:?}")
            }
            Self::MissingApiKey(name) => write!(f, "provider {name} requires an api key"),
            Self::UnknownPool(pair) => write!(f, "no pool address configured for {pair}"),
        }
    }
}

impl std::error::Error for Error {}
