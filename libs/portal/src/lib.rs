//! # Vela Data Portal
//!
//! Read path for simulation and live engines: point-in-time field values and
//! backward-looking history windows over the columnar store, with hard
//! no-lookahead enforcement.
//!
//! The portal owns an optional simulation clock. Once set, any query for an
//! instant strictly after the clock fails with [`PortalError::Lookahead`] -
//! a safety property, not a recoverable condition. The clock only moves
//! forward; rewinding it is a programming error.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::fmt;
use store::BarReader;
use thiserror::Error;
use tracing::debug;
use types::{Asset, BarBatch, BarField, Sid};

/// Result type alias for portal queries.
pub type Result<T> = std::result::Result<T, PortalError>;

/// Query resolution: which bar store a query reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Daily,
    Minute,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Daily => "daily",
            Resolution::Minute => "minute",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for portal queries.
#[derive(Debug, Error)]
pub enum PortalError {
    /// Query instant is strictly after the simulation clock
    #[error("lookahead: requested {requested}, simulation time is {simulation_time}")]
    Lookahead {
        requested: DateTime<Utc>,
        simulation_time: DateTime<Utc>,
    },

    /// No row exists at the requested instant
    #[error("no data available: {detail}")]
    NoDataAvailable { detail: String },

    /// The portal was built without a reader for this resolution
    #[error("no {resolution} reader configured")]
    ReaderAbsent { resolution: Resolution },

    /// Attempt to move the simulation clock backwards
    #[error("simulation clock may only advance: current {current}, requested {requested}")]
    NonMonotonicClock {
        current: DateTime<Utc>,
        requested: DateTime<Utc>,
    },

    /// Underlying store failure
    #[error(transparent)]
    Store(#[from] store::StoreError),
}

/// One `(ts, sid, value)` point of a history window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesPoint {
    pub ts: DateTime<Utc>,
    pub sid: Sid,
    pub value: Decimal,
}

/// Decimal-typed read portal over one bundle's bar store.
pub struct DataPortal {
    daily_reader: Option<BarReader>,
    minute_reader: Option<BarReader>,
    simulation_time: Option<DateTime<Utc>>,
}

impl DataPortal {
    /// Build a portal from whichever readers exist. At least one reader is
    /// required. Without a simulation clock, lookahead checks are disabled
    /// (live-trading mode).
    pub fn new(
        daily_reader: Option<BarReader>,
        minute_reader: Option<BarReader>,
        simulation_time: Option<DateTime<Utc>>,
    ) -> std::result::Result<Self, &'static str> {
        if daily_reader.is_none() && minute_reader.is_none() {
            return Err("at least one of daily_reader or minute_reader must be provided");
        }
        Ok(Self {
            daily_reader,
            minute_reader,
            simulation_time,
        })
    }

    pub fn simulation_time(&self) -> Option<DateTime<Utc>> {
        self.simulation_time
    }

    /// Advance the simulation clock. Strictly monotonic: the new instant
    /// must be later than the current one.
    pub fn set_simulation_time(&mut self, now: DateTime<Utc>) -> Result<()> {
        if let Some(current) = self.simulation_time {
            if now <= current {
                debug_assert!(false, "simulation clock moved backwards");
                return Err(PortalError::NonMonotonicClock {
                    current,
                    requested: now,
                });
            }
        }
        self.simulation_time = Some(now);
        debug!(now = %now, "simulation_time_advanced");
        Ok(())
    }

    fn gate_lookahead(&self, at: DateTime<Utc>) -> Result<()> {
        if let Some(now) = self.simulation_time {
            if at > now {
                return Err(PortalError::Lookahead {
                    requested: at,
                    simulation_time: now,
                });
            }
        }
        Ok(())
    }

    fn reader(&self, resolution: Resolution) -> Result<&BarReader> {
        let reader = match resolution {
            Resolution::Daily => self.daily_reader.as_ref(),
            Resolution::Minute => self.minute_reader.as_ref(),
        };
        reader.ok_or(PortalError::ReaderAbsent { resolution })
    }

    fn load_window(
        &self,
        resolution: Resolution,
        sids: &[Sid],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarBatch> {
        let reader = self.reader(resolution)?;
        let batch = match resolution {
            Resolution::Daily => reader.load_daily(sids, start.date_naive(), end.date_naive())?,
            Resolution::Minute => reader.load_minute(sids, start, end)?,
        };
        Ok(batch)
    }

    /// Field values at one exact instant, keyed by sid.
    ///
    /// Daily queries match on the calendar date; minute queries match the
    /// instant exactly. An empty result is [`PortalError::NoDataAvailable`].
    pub fn spot(
        &self,
        assets: &[Asset],
        field: BarField,
        at: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<Vec<(Sid, Decimal)>> {
        self.gate_lookahead(at)?;
        let sids: Vec<Sid> = assets.iter().map(|a| a.sid).collect();
        let batch = self.load_window(resolution, &sids, at, at)?;

        let values: Vec<(Sid, Decimal)> = batch
            .iter()
            .filter(|row| match resolution {
                Resolution::Daily => row.ts.date_naive() == at.date_naive(),
                Resolution::Minute => row.ts == at,
            })
            .map(|row| (row.sid, row.field(field)))
            .collect();

        if values.is_empty() {
            return Err(PortalError::NoDataAvailable {
                detail: format!(
                    "no {resolution} row at {at} for {} asset(s)",
                    assets.len()
                ),
            });
        }

        debug!(
            field = %field,
            at = %at,
            assets = assets.len(),
            rows = values.len(),
            "spot_value_loaded"
        );
        Ok(values)
    }

    /// The last `bar_count` bars at or before `end_at` per asset, ascending
    /// in time. When fewer bars exist, returns what is available without
    /// padding.
    pub fn history(
        &self,
        assets: &[Asset],
        end_at: DateTime<Utc>,
        bar_count: usize,
        field: BarField,
        resolution: Resolution,
    ) -> Result<Vec<SeriesPoint>> {
        self.gate_lookahead(end_at)?;
        let sids: Vec<Sid> = assets.iter().map(|a| a.sid).collect();

        // Load a window wide enough to cover bar_count bars with slack for
        // weekends and session gaps, then trim per asset.
        let lookback = match resolution {
            Resolution::Daily => Duration::days((bar_count as i64).max(1) * 2 + 7),
            Resolution::Minute => Duration::minutes((bar_count as i64).max(1) * 2 + 60),
        };
        let batch = self.load_window(resolution, &sids, end_at - lookback, end_at)?;

        let mut points = Vec::new();
        for sid in batch.sids() {
            let mut per_sid: Vec<SeriesPoint> = batch
                .iter()
                .filter(|row| row.sid == sid && row.ts <= end_at)
                .map(|row| SeriesPoint {
                    ts: row.ts,
                    sid,
                    value: row.field(field),
                })
                .collect();
            per_sid.sort_by_key(|p| p.ts);
            let keep = per_sid.len().saturating_sub(bar_count);
            points.extend(per_sid.into_iter().skip(keep));
        }

        if points.is_empty() {
            return Err(PortalError::NoDataAvailable {
                detail: format!(
                    "no {resolution} history ending {end_at} for {} asset(s)",
                    assets.len()
                ),
            });
        }

        debug!(
            field = %field,
            end_at = %end_at,
            bar_count,
            rows = points.len(),
            "history_window_loaded"
        );
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use store::{BarCompression, BarWriter};
    use tempfile::{tempdir, TempDir};
    use types::{BarRow, Timeframe};

    fn daily_row(day: u32, close: Decimal) -> BarRow {
        BarRow {
            ts: Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap(),
            sid: 1,
            open: close - dec!(1),
            high: close + dec!(1),
            low: close - dec!(2),
            close,
            volume: dec!(1000),
        }
    }

    fn seeded_store() -> TempDir {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let batch = BarBatch::from_rows(vec![
            daily_row(1, dec!(100.50)),
            daily_row(2, dec!(102.50)),
            daily_row(3, dec!(104.50)),
        ]);
        writer.write(&batch, Timeframe::D1, BarCompression::Zstd).unwrap();
        dir
    }

    fn portal(dir: &TempDir, simulation_time: Option<DateTime<Utc>>) -> DataPortal {
        DataPortal::new(Some(BarReader::new(dir.path())), None, simulation_time).unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn spot_returns_exact_close() {
        let dir = seeded_store();
        let portal = portal(&dir, None);
        let assets = [Asset::new(1, "AAPL")];

        let values = portal
            .spot(&assets, BarField::Close, at(2), Resolution::Daily)
            .unwrap();
        assert_eq!(values, vec![(1, dec!(102.50))]);
    }

    #[test]
    fn spot_without_row_is_no_data() {
        let dir = seeded_store();
        let portal = portal(&dir, None);
        let assets = [Asset::new(1, "AAPL")];

        let err = portal
            .spot(&assets, BarField::Close, at(15), Resolution::Daily)
            .unwrap_err();
        assert!(matches!(err, PortalError::NoDataAvailable { .. }));
    }

    #[test]
    fn history_returns_ascending_window() {
        let dir = seeded_store();
        let portal = portal(&dir, None);
        let assets = [Asset::new(1, "AAPL")];

        let points = portal
            .history(&assets, at(3), 2, BarField::Close, Resolution::Daily)
            .unwrap();
        let closes: Vec<Decimal> = points.iter().map(|p| p.value).collect();
        assert_eq!(closes, vec![dec!(102.50), dec!(104.50)]);
    }

    #[test]
    fn history_shorter_than_requested_is_not_padded() {
        let dir = seeded_store();
        let portal = portal(&dir, None);
        let assets = [Asset::new(1, "AAPL")];

        let points = portal
            .history(&assets, at(3), 10, BarField::Close, Resolution::Daily)
            .unwrap();
        assert_eq!(points.len(), 3);
    }

    #[test]
    fn lookahead_is_rejected() {
        let dir = seeded_store();
        let portal = portal(&dir, Some(at(1)));
        let assets = [Asset::new(1, "AAPL")];

        let err = portal
            .spot(&assets, BarField::Close, at(2), Resolution::Daily)
            .unwrap_err();
        assert!(matches!(err, PortalError::Lookahead { .. }));

        let err = portal
            .history(&assets, at(2), 1, BarField::Close, Resolution::Daily)
            .unwrap_err();
        assert!(matches!(err, PortalError::Lookahead { .. }));

        // The gated instant itself is allowed.
        assert!(portal
            .spot(&assets, BarField::Close, at(1), Resolution::Daily)
            .is_ok());
    }

    #[test]
    fn simulation_clock_is_strictly_monotonic() {
        let dir = seeded_store();
        let mut portal = portal(&dir, Some(at(2)));
        assert!(portal.set_simulation_time(at(3)).is_ok());

        // Debug assertions are on in tests; verify the release-mode error
        // path by catching the panic.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            portal.set_simulation_time(at(2))
        }));
        assert!(result.is_err() || matches!(result, Ok(Err(PortalError::NonMonotonicClock { .. }))));
    }

    #[test]
    fn absent_reader_is_an_error() {
        let dir = seeded_store();
        let portal = portal(&dir, None);
        let err = portal
            .spot(&[Asset::new(1, "AAPL")], BarField::Close, at(1), Resolution::Minute)
            .unwrap_err();
        assert!(matches!(
            err,
            PortalError::ReaderAbsent {
                resolution: Resolution::Minute
            }
        ));
    }

    #[test]
    fn no_readers_at_all_is_a_construction_error() {
        assert!(DataPortal::new(None, None, None).is_err());
    }
}
