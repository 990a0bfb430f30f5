//! Symbol normalization across venues.
//!
//! The engine works with a venue-neutral [`Symbol`]. Each venue renders it
//! in its own format:
//! - Aster: `BTCUSDT`
//! - OKX: `BTC-USDT-SWAP`
//! - Backpack: `BTC_USDC_PERP` (Backpack perps settle in USDC)

use super::traits::Venue;
use crate::error::ExchangeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Quote assets recognized when splitting a concatenated symbol like `BTCUSDT`.
const KNOWN_QUOTES: [&str; 3] = ["USDT", "USDC", "USD"];

/// Venue-neutral instrument identifier (perpetual on `base`/`quote`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol {
    pub base: String,
    pub quote: String,
}

impl Symbol {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_ascii_uppercase(),
            quote: quote.into().to_ascii_uppercase(),
        }
    }

    /// Render in the venue's native format.
    pub fn native(&self, venue: Venue) -> String {
        match venue {
            Venue::Aster => format!("{}{}", self.base, self.quote),
            Venue::Okx => format!("{}-{}-SWAP", self.base, self.quote),
            Venue::Backpack => {
                // Backpack lists USDC-margined perps only
                let quote = if self.quote == "USDT" { "USDC" } else { self.quote.as_str() };
                format!("{}_{}_PERP", self.base, quote)
            }
        }
    }

    /// Parse a venue-native symbol back to the neutral form.
    ///
    /// Backpack's USDC quote maps back to USDT so the same session symbol
    /// addresses all three venues.
    pub fn from_native(venue: Venue, native: &str) -> Result<Self, ExchangeError> {
        let symbol: Symbol = native.parse()?;
        match venue {
            Venue::Backpack if symbol.quote == "USDC" => Ok(Symbol::new(symbol.base, "USDT")),
            _ => Ok(symbol),
        }
    }
}

impl FromStr for Symbol {
    type Err = ExchangeError;

    /// Accepts `BTCUSDT`, `BTC/USDT`, `BTC/USDT:USDT`, `BTC-USDT-SWAP`,
    /// `BTC_USDC_PERP` and a bare base asset (`BTC`, quote defaults to USDT).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_uppercase();
        if raw.is_empty() {
            return Err(ExchangeError::UnknownSymbol(s.to_string()));
        }

        // Drop settlement suffix (":USDT") and contract suffixes
        let raw = raw.split(':').next().unwrap_or_default();
        let raw = raw
            .strip_suffix("-SWAP")
            .or_else(|| raw.strip_suffix("_PERP"))
            .unwrap_or(raw);

        for sep in ['/', '-', '_'] {
            if let Some((base, quote)) = raw.split_once(sep) {
                if base.is_empty() || quote.is_empty() {
                    return Err(ExchangeError::UnknownSymbol(s.to_string()));
                }
                return Ok(Symbol::new(base, quote));
            }
        }

        for quote in KNOWN_QUOTES {
            if let Some(base) = raw.strip_suffix(quote) {
                if !base.is_empty() {
                    return Ok(Symbol::new(base, quote));
                }
            }
        }

        if raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Ok(Symbol::new(raw, "USDT"));
        }

        Err(ExchangeError::UnknownSymbol(s.to_string()))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}
