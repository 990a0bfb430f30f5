//! Builds venue adapters from account configuration.

use super::aster::AsterClient;
use super::backpack::BackpackClient;
use super::okx::OkxClient;
use super::paper::PaperExchange;
use super::traits::{ExchangeAdapter, Venue};
use crate::config::{AccountConfig, VenueConfig};
use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::info;

/// Live adapter for an account, used directly or as a paper feed.
fn live_adapter(account: &AccountConfig, venue: &VenueConfig) -> Result<Arc<dyn ExchangeAdapter>> {
    Ok(match account.exchange {
        Venue::Aster => Arc::new(AsterClient::new(account, venue)?),
        Venue::Okx => Arc::new(OkxClient::new(account, venue)?),
        Venue::Backpack => Arc::new(BackpackClient::new(venue)?),
    })
}

/// Connect an account.
///
/// In dry-run mode the returned adapter is a paper account that trades
/// against the venue's live public book. Otherwise the live client is
/// returned, which requires credentials.
pub fn connect(
    account: &AccountConfig,
    venue: &VenueConfig,
    dry_run: bool,
) -> Result<Arc<dyn ExchangeAdapter>> {
    let live = live_adapter(account, venue)?;

    if dry_run {
        info!(
            account = %account.id,
            venue = %account.exchange,
            balance = %venue.paper_balance,
            "📝 Paper account on live {} prices",
            account.exchange
        );
        let paper = PaperExchange::new(account.exchange, venue.paper_balance)
            .with_feed(live)
            .with_fees(venue.maker_fee, venue.taker_fee);
        return Ok(Arc::new(paper));
    }

    if account.exchange == Venue::Backpack {
        bail!(
            "account '{}': Backpack supports market data only; run without --real-trade",
            account.id
        );
    }
    if !account.has_credentials() {
        bail!("account '{}' has no API credentials", account.id);
    }
    if account.exchange == Venue::Okx && account.passphrase.as_deref().unwrap_or_default().is_empty() {
        bail!("account '{}': OKX requires a passphrase", account.id);
    }

    info!(account = %account.id, venue = %account.exchange, "🔌 Live account connected");
    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn account(exchange: Venue, key: &str) -> AccountConfig {
        AccountConfig {
            id: format!("{}-main", exchange.short_code().to_lowercase()),
            exchange,
            label: String::new(),
            api_key: key.to_string(),
            secret_key: key.to_string(),
            passphrase: None,
            testnet: false,
        }
    }

    #[test]
    fn test_dry_run_wraps_paper_venue() {
        let config = Config::default();
        let acct = account(Venue::Backpack, "");
        let adapter = connect(&acct, config.venues.get(Venue::Backpack), true).unwrap();
        assert_eq!(adapter.venue(), Venue::Backpack);
    }

    #[test]
    fn test_live_backpack_is_refused() {
        let config = Config::default();
        let acct = account(Venue::Backpack, "key");
        assert!(connect(&acct, config.venues.get(Venue::Backpack), false).is_err());
    }

    #[test]
    fn test_live_requires_credentials() {
        let config = Config::default();
        assert!(connect(&account(Venue::Aster, ""), &config.venues.aster, false).is_err());
        assert!(connect(&account(Venue::Aster, "k"), &config.venues.aster, false).is_ok());
        // OKX without passphrase
        assert!(connect(&account(Venue::Okx, "k"), &config.venues.okx, false).is_err());
    }
}
