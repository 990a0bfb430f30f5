//! Wire types for Backpack public endpoints.

use serde::Deserialize;

/// Order book depth. Levels are `[price, quantity]`; ordering is not relied on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Depth {
    pub asks: Vec<[String; 2]>,
    pub bids: Vec<[String; 2]>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Error body returned on failed requests.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    #[serde(default)]
    pub message: String,
}
