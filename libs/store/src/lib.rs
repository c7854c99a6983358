//! # Vela Columnar Bar Store
//!
//! Partitioned, compressed Parquet storage for canonical OHLCV bars.
//!
//! ## Layout
//!
//! Under a bundle root:
//!
//! ```text
//! daily_bars/year=YYYY/month=MM/data.parquet
//! minute_bars/year=YYYY/month=MM/day=DD/data.parquet
//! ```
//!
//! Files are self-describing: the embedded Arrow schema carries
//! `decimal(18, 8)` price columns and UTC time columns, and readers reject
//! any file whose schema does not match. Writes are atomic - data lands in a
//! sibling temp file and is renamed into place, so no reader ever observes a
//! partial file. Bar files are write-once; re-ingesting a partition replaces
//! it wholesale via the same rename.

pub mod error;
pub mod reader;
pub mod schema;
pub mod writer;

pub use error::{Result, StoreError};
pub use reader::BarReader;
pub use schema::{daily_bars_schema, minute_bars_schema, Partition};
pub use writer::{BarCompression, BarWriter, WrittenFile};
