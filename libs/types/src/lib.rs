//! # Vela Canonical Types
//!
//! Shared type definitions for the Vela market-data plane: the exact-decimal
//! OHLCV bar schema, timeframes, asset identification, and the validation
//! rules every bar must satisfy before it is allowed anywhere near the store.
//!
//! ## Design Philosophy
//!
//! - **No Precision Loss**: all prices and volumes are `rust_decimal::Decimal`
//!   at scale 8, constructed from the provider's wire *string* - never routed
//!   through binary floating point.
//! - **One Canonical Shape**: every adapter, the live aggregator, the store
//!   and the portal exchange data exclusively as [`BarBatch`] - a sorted,
//!   deduplicated collection of [`BarRow`]s.
//! - **Validation at the Boundary**: OHLCV invariants are checked when a
//!   batch is assembled from raw provider data; a violation blocks the whole
//!   batch from being written.
//!
//! ## Quick Start
//!
//! ```rust
//! use types::{decimal_from_wire, BarRow, BarBatch, Timeframe};
//! use chrono::{TimeZone, Utc};
//!
//! let row = BarRow {
//!     ts: Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap(),
//!     sid: 1,
//!     open: decimal_from_wire("100.0").unwrap(),
//!     high: decimal_from_wire("105.5").unwrap(),
//!     low: decimal_from_wire("99.25").unwrap(),
//!     close: decimal_from_wire("102.5").unwrap(),
//!     volume: decimal_from_wire("15000").unwrap(),
//! };
//! let batch = BarBatch::from_rows(vec![row]);
//! assert_eq!(batch.len(), 1);
//! assert!(Timeframe::D1.is_daily());
//! ```

pub mod asset;
pub mod bar;
pub mod timeframe;
pub mod validation;

pub use asset::{infer_asset_kind, Asset, AssetKind};
pub use bar::{
    decimal_from_wire, BarBatch, BarField, BarRow, Sid, WireDecimalError, PRICE_PRECISION,
    PRICE_SCALE,
};
pub use timeframe::Timeframe;
pub use validation::{quality_report, validate_bars, QualityReport, ValidationError};
