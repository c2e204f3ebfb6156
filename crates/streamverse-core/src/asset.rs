//! Asset metadata as published by `GET /info`.

use serde::{Deserialize, Serialize};

use crate::chunk;
use crate::payment::format_units;

/// Everything a client needs before it starts paying for chunks. Fetching
/// it costs nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInfo {
    /// Content address of the asset.
    pub asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub duration_secs: f64,
    pub chunk_duration_secs: f64,
    pub total_chunks: u32,
    pub size_bytes: u64,
    /// Atomic units per chunk.
    pub price_per_chunk: u64,
    /// `price_per_chunk * total_chunks`, atomic units.
    pub total_price: u64,
    /// `total_price` as a decimal string, e.g. `"0.013"`.
    pub total_price_display: String,
    pub network: String,
    pub pay_to: String,
    pub currency: String,
}

impl AssetInfo {
    /// Build the info record from an asset's stored attributes.
    #[allow(clippy::too_many_arguments)]
    pub fn describe(
        asset: &str,
        title: Option<String>,
        duration_secs: f64,
        chunk_duration_secs: f64,
        size_bytes: u64,
        price_per_chunk: u64,
        network: &str,
        pay_to: &str,
        currency: &str,
    ) -> Self {
        let total_chunks = if size_bytes == 0 {
            0
        } else {
            chunk::chunk_count(duration_secs, chunk_duration_secs)
        };
        let total_price = price_per_chunk.saturating_mul(total_chunks as u64);
        Self {
            asset: asset.to_string(),
            title,
            duration_secs,
            chunk_duration_secs,
            total_chunks,
            size_bytes,
            price_per_chunk,
            total_price,
            total_price_display: format_units(total_price),
            network: network.to_string(),
            pay_to: pay_to.to_string(),
            currency: currency.to_string(),
        }
    }

    /// An asset with no chunks cannot be streamed.
    pub fn is_available(&self) -> bool {
        self.total_chunks > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_totals() {
        let info = AssetInfo::describe(
            "ab", None, 125.0, 10.0, 12_500_000, 1000, "polygon-amoy", "0x1", "USDC",
        );
        assert_eq!(info.total_chunks, 13);
        assert_eq!(info.total_price, 13_000);
        assert_eq!(info.total_price_display, "0.013");
        assert!(info.is_available());
    }

    #[test]
    fn test_empty_asset_unavailable() {
        let info = AssetInfo::describe("ab", None, 125.0, 10.0, 0, 1000, "n", "0x1", "USDC");
        assert_eq!(info.total_chunks, 0);
        assert!(!info.is_available());
    }
}
