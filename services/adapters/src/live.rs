//! Live tick-stream to OHLCV bar aggregation.
//!
//! Trade ticks are bucketed into fixed-width windows `[t0, t0 + delta)` by
//! flooring the tick instant. A bucket stays open until a strictly later
//! tick arrives; finalization emits a canonical [`BarRow`] on the output
//! channel and rotates. Empty buckets are never emitted - downstream
//! consumers tolerate gaps - and a late tick (before the open bucket) is
//! dropped with a warning: bars already emitted are never back-filled.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use types::{BarRow, Sid};

/// One trade event from a streaming broker connection. The price arrives as
/// its wire string, already converted to an exact decimal at the connection
/// edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeTick {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub price: Decimal,
    pub volume: Decimal,
}

/// Running state of one open bucket.
#[derive(Debug, Clone)]
struct OpenBucket {
    start: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    ticks: u64,
}

impl OpenBucket {
    fn seed(start: DateTime<Utc>, tick: &TradeTick) -> Self {
        Self {
            start,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
            ticks: 1,
        }
    }

    fn absorb(&mut self, tick: &TradeTick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume;
        self.ticks += 1;
    }

    fn into_bar(self, sid: Sid) -> BarRow {
        BarRow {
            ts: self.start,
            sid,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

struct SymbolState {
    sid: Sid,
    width: Duration,
    bucket: Option<OpenBucket>,
}

/// Tick-stream to bar aggregator for any number of symbols.
pub struct BarAggregator {
    default_width: Duration,
    symbols: HashMap<String, SymbolState>,
    tx: mpsc::Sender<BarRow>,
    emitted: u64,
    dropped_late: u64,
}

impl BarAggregator {
    /// Build an aggregator emitting completed bars on `tx`. The default
    /// bucket width is 60 seconds.
    pub fn new(tx: mpsc::Sender<BarRow>) -> Self {
        Self {
            default_width: Duration::seconds(60),
            symbols: HashMap::new(),
            tx,
            emitted: 0,
            dropped_late: 0,
        }
    }

    /// Register a symbol with its sid and an optional bucket-width
    /// override. Ticks for unregistered symbols are dropped.
    pub fn register_symbol(&mut self, symbol: &str, sid: Sid, width: Option<Duration>) {
        self.symbols.insert(
            symbol.to_string(),
            SymbolState {
                sid,
                width: width.unwrap_or(self.default_width),
                bucket: None,
            },
        );
    }

    /// Bars emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Late ticks dropped so far.
    pub fn dropped_late(&self) -> u64 {
        self.dropped_late
    }

    fn bucket_start(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
        let width_us = width.num_microseconds().unwrap_or(60_000_000).max(1);
        let us = ts.timestamp_micros();
        DateTime::from_timestamp_micros(us - us.rem_euclid(width_us))
            .expect("floored timestamp is in range")
    }

    /// Feed one tick. Emits at most one completed bar (the previous bucket)
    /// when the tick opens a later window.
    pub async fn on_tick(&mut self, tick: TradeTick) -> Result<(), mpsc::error::SendError<BarRow>> {
        let Some(state) = self.symbols.get_mut(&tick.symbol) else {
            debug!(symbol = %tick.symbol, "tick_for_unregistered_symbol_dropped");
            return Ok(());
        };
        let start = Self::bucket_start(tick.ts, state.width);

        match &mut state.bucket {
            None => {
                state.bucket = Some(OpenBucket::seed(start, &tick));
            }
            Some(bucket) if start == bucket.start => {
                bucket.absorb(&tick);
            }
            Some(bucket) if start > bucket.start => {
                let sid = state.sid;
                let completed = std::mem::replace(bucket, OpenBucket::seed(start, &tick));
                let bar = completed.into_bar(sid);
                debug!(
                    symbol = %tick.symbol,
                    ts = %bar.ts,
                    ticks = self.emitted + 1,
                    "bar_emitted"
                );
                self.emitted += 1;
                self.tx.send(bar).await?;
            }
            Some(bucket) => {
                // Tick predates the open bucket: emitted history is
                // immutable, so the tick is dropped.
                self.dropped_late += 1;
                warn!(
                    symbol = %tick.symbol,
                    tick_ts = %tick.ts,
                    bucket_start = %bucket.start,
                    "late_tick_dropped"
                );
            }
        }
        Ok(())
    }

    /// Finalize and emit every open bucket; used at shutdown. The stream
    /// never re-opens an emitted bucket.
    pub async fn flush(&mut self) -> Result<(), mpsc::error::SendError<BarRow>> {
        let mut completed = Vec::new();
        for state in self.symbols.values_mut() {
            if let Some(bucket) = state.bucket.take() {
                completed.push(bucket.into_bar(state.sid));
            }
        }
        completed.sort_by_key(|bar| bar.ts);
        for bar in completed {
            self.emitted += 1;
            self.tx.send(bar).await?;
        }
        Ok(())
    }
}
