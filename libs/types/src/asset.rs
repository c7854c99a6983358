//! Asset identification and kind inference.

use crate::bar::Sid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse asset classification stored alongside each bundle symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Equity,
    Crypto,
    Future,
    Unknown,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Equity => "equity",
            AssetKind::Crypto => "crypto",
            AssetKind::Future => "future",
            AssetKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> AssetKind {
        match s {
            "equity" => AssetKind::Equity,
            "crypto" => AssetKind::Crypto,
            "future" => AssetKind::Future,
            _ => AssetKind::Unknown,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infer an asset kind from symbol naming conventions.
///
/// `BTC/USDT` and `ETH-USD` read as crypto pairs; `ESH25`-style contract
/// codes (letters ending in a two-digit year) read as futures; everything
/// else defaults to equity.
pub fn infer_asset_kind(symbol: &str) -> AssetKind {
    if symbol.contains('/') || symbol.contains('-') {
        return AssetKind::Crypto;
    }

    if symbol.len() >= 4 {
        let tail: Vec<char> = symbol.chars().rev().take(2).collect();
        if tail.len() == 2 && tail.iter().all(|c| c.is_ascii_digit()) {
            return AssetKind::Future;
        }
    }

    AssetKind::Equity
}

/// An asset as the read portal sees it: a bundle-local sid plus the symbol
/// it was ingested under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub sid: Sid,
    pub symbol: String,
}

impl Asset {
    pub fn new(sid: Sid, symbol: impl Into<String>) -> Self {
        Self {
            sid,
            symbol: symbol.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_inference_follows_symbol_shape() {
        assert_eq!(infer_asset_kind("BTC/USDT"), AssetKind::Crypto);
        assert_eq!(infer_asset_kind("ETH-USD"), AssetKind::Crypto);
        assert_eq!(infer_asset_kind("ESH25"), AssetKind::Future);
        assert_eq!(infer_asset_kind("NQM24"), AssetKind::Future);
        assert_eq!(infer_asset_kind("AAPL"), AssetKind::Equity);
        assert_eq!(infer_asset_kind("F"), AssetKind::Equity);
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in [AssetKind::Equity, AssetKind::Crypto, AssetKind::Future] {
            assert_eq!(AssetKind::parse(kind.as_str()), kind);
        }
        assert_eq!(AssetKind::parse("bond"), AssetKind::Unknown);
    }
}
