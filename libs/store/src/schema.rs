//! Canonical Arrow schemas and row <-> RecordBatch conversion.

use crate::error::{Result, StoreError};
use arrow::array::{
    Array, ArrayRef, Date32Array, Date32Builder, Decimal128Array, Decimal128Builder, Int64Array,
    Int64Builder, TimestampMicrosecondArray, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use types::{BarRow, PRICE_PRECISION, PRICE_SCALE};

fn price_type() -> DataType {
    DataType::Decimal128(PRICE_PRECISION, PRICE_SCALE as i8)
}

/// Schema for daily bars: calendar date plus decimal(18, 8) OHLCV.
pub fn daily_bars_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("date", DataType::Date32, false),
        Field::new("sid", DataType::Int64, false),
        Field::new("open", price_type(), false),
        Field::new("high", price_type(), false),
        Field::new("low", price_type(), false),
        Field::new("close", price_type(), false),
        Field::new("volume", price_type(), false),
    ]))
}

/// Schema for intraday bars: microsecond UTC timestamp plus decimal OHLCV.
pub fn minute_bars_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            "ts",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("sid", DataType::Int64, false),
        Field::new("open", price_type(), false),
        Field::new("high", price_type(), false),
        Field::new("low", price_type(), false),
        Field::new("close", price_type(), false),
        Field::new("volume", price_type(), false),
    ]))
}

/// Verify that a file's schema matches the canonical one, field for field.
pub fn check_schema(actual: &Schema, expected: &Schema, path: &Path) -> Result<()> {
    if actual.fields().len() != expected.fields().len() {
        return Err(StoreError::SchemaMismatch {
            path: path.to_path_buf(),
            detail: format!(
                "expected {} columns, found {}",
                expected.fields().len(),
                actual.fields().len()
            ),
        });
    }
    for (want, got) in expected.fields().iter().zip(actual.fields().iter()) {
        if want.name() != got.name() || want.data_type() != got.data_type() {
            return Err(StoreError::SchemaMismatch {
                path: path.to_path_buf(),
                detail: format!(
                    "column '{}': expected {:?}, found '{}': {:?}",
                    want.name(),
                    want.data_type(),
                    got.name(),
                    got.data_type()
                ),
            });
        }
    }
    Ok(())
}

/// Derived partition key for one bar file. Daily partitions omit the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    pub year: i32,
    pub month: u32,
    pub day: Option<u32>,
}

impl Partition {
    /// Partition for a bar instant at the given granularity.
    pub fn for_instant(ts: DateTime<Utc>, with_day: bool) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
            day: with_day.then(|| ts.day()),
        }
    }

    /// Relative directory, e.g. `year=2023/month=01/day=05`.
    pub fn relative_dir(&self) -> String {
        match self.day {
            Some(day) => format!(
                "year={:04}/month={:02}/day={:02}",
                self.year, self.month, day
            ),
            None => format!("year={:04}/month={:02}", self.year, self.month),
        }
    }

    /// First instant covered by this partition.
    pub fn start(&self) -> Option<DateTime<Utc>> {
        let date = NaiveDate::from_ymd_opt(self.year, self.month, self.day.unwrap_or(1))?;
        Some(date.and_hms_opt(0, 0, 0)?.and_utc())
    }

    /// First instant after this partition.
    pub fn end_exclusive(&self) -> Option<DateTime<Utc>> {
        let start = self.start()?;
        match self.day {
            Some(_) => Some(start + Duration::days(1)),
            None => {
                let (year, month) = if self.month == 12 {
                    (self.year + 1, 1)
                } else {
                    (self.year, self.month + 1)
                };
                Some(
                    NaiveDate::from_ymd_opt(year, month, 1)?
                        .and_hms_opt(0, 0, 0)?
                        .and_utc(),
                )
            }
        }
    }
}

fn unix_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date is valid")
}

pub(crate) fn date_to_days(date: NaiveDate) -> i32 {
    (date - unix_epoch_date()).num_days() as i32
}

pub(crate) fn days_to_instant(days: i32) -> DateTime<Utc> {
    (unix_epoch_date() + Duration::days(days as i64))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
        .and_utc()
}

/// Scale a canonical decimal to the i128 mantissa stored in Decimal128
/// columns. Values are rescaled to exactly [`PRICE_SCALE`] first.
pub(crate) fn decimal_to_i128(value: Decimal) -> Result<i128> {
    let mut normalized = value;
    if normalized.scale() > PRICE_SCALE {
        normalized =
            normalized.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointNearestEven);
    }
    let diff = PRICE_SCALE - normalized.scale();
    let factor = 10i128
        .checked_pow(diff)
        .ok_or_else(|| StoreError::DecimalOutOfRange(value.to_string()))?;
    normalized
        .mantissa()
        .checked_mul(factor)
        .ok_or_else(|| StoreError::DecimalOutOfRange(value.to_string()))
}

pub(crate) fn i128_to_decimal(mantissa: i128) -> Result<Decimal> {
    Decimal::try_from_i128_with_scale(mantissa, PRICE_SCALE)
        .map_err(|e| StoreError::DecimalOutOfRange(e.to_string()))
}

/// Build a RecordBatch in the canonical schema from bar rows.
pub(crate) fn record_batch_from_rows(rows: &[BarRow], daily: bool) -> Result<RecordBatch> {
    let schema = if daily {
        daily_bars_schema()
    } else {
        minute_bars_schema()
    };

    let mut sid_builder = Int64Builder::new();
    let mut open_builder = Decimal128Builder::new().with_data_type(price_type());
    let mut high_builder = Decimal128Builder::new().with_data_type(price_type());
    let mut low_builder = Decimal128Builder::new().with_data_type(price_type());
    let mut close_builder = Decimal128Builder::new().with_data_type(price_type());
    let mut volume_builder = Decimal128Builder::new().with_data_type(price_type());

    let time_column: ArrayRef = if daily {
        let mut dates = Date32Builder::new();
        for row in rows {
            dates.append_value(date_to_days(row.ts.date_naive()));
        }
        Arc::new(dates.finish())
    } else {
        let mut stamps = TimestampMicrosecondBuilder::new().with_timezone("UTC");
        for row in rows {
            stamps.append_value(row.ts.timestamp_micros());
        }
        Arc::new(stamps.finish())
    };

    for row in rows {
        sid_builder.append_value(row.sid);
        open_builder.append_value(decimal_to_i128(row.open)?);
        high_builder.append_value(decimal_to_i128(row.high)?);
        low_builder.append_value(decimal_to_i128(row.low)?);
        close_builder.append_value(decimal_to_i128(row.close)?);
        volume_builder.append_value(decimal_to_i128(row.volume)?);
    }

    let columns: Vec<ArrayRef> = vec![
        time_column,
        Arc::new(sid_builder.finish()),
        Arc::new(open_builder.finish()),
        Arc::new(high_builder.finish()),
        Arc::new(low_builder.finish()),
        Arc::new(close_builder.finish()),
        Arc::new(volume_builder.finish()),
    ];

    RecordBatch::try_new(schema, columns).map_err(Into::into)
}

fn decimal_column<'a>(batch: &'a RecordBatch, index: usize, path: &Path) -> Result<&'a Decimal128Array> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Decimal128Array>()
        .ok_or_else(|| StoreError::SchemaMismatch {
            path: path.to_path_buf(),
            detail: format!("column {index} is not decimal128"),
        })
}

/// Decode a RecordBatch back into canonical bar rows.
pub(crate) fn rows_from_record_batch(
    batch: &RecordBatch,
    daily: bool,
    path: &Path,
) -> Result<Vec<BarRow>> {
    let sids = batch
        .column(1)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| StoreError::SchemaMismatch {
            path: path.to_path_buf(),
            detail: "sid column is not int64".to_string(),
        })?;
    let opens = decimal_column(batch, 2, path)?;
    let highs = decimal_column(batch, 3, path)?;
    let lows = decimal_column(batch, 4, path)?;
    let closes = decimal_column(batch, 5, path)?;
    let volumes = decimal_column(batch, 6, path)?;

    let mut rows = Vec::with_capacity(batch.num_rows());

    if daily {
        let dates = batch
            .column(0)
            .as_any()
            .downcast_ref::<Date32Array>()
            .ok_or_else(|| StoreError::SchemaMismatch {
                path: path.to_path_buf(),
                detail: "date column is not date32".to_string(),
            })?;
        for i in 0..batch.num_rows() {
            rows.push(BarRow {
                ts: days_to_instant(dates.value(i)),
                sid: sids.value(i),
                open: i128_to_decimal(opens.value(i))?,
                high: i128_to_decimal(highs.value(i))?,
                low: i128_to_decimal(lows.value(i))?,
                close: i128_to_decimal(closes.value(i))?,
                volume: i128_to_decimal(volumes.value(i))?,
            });
        }
    } else {
        let stamps = batch
            .column(0)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .ok_or_else(|| StoreError::SchemaMismatch {
                path: path.to_path_buf(),
                detail: "ts column is not timestamp[us]".to_string(),
            })?;
        for i in 0..batch.num_rows() {
            let micros = stamps.value(i);
            let ts = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| StoreError::InvalidTimestamp(micros.to_string()))?;
            rows.push(BarRow {
                ts,
                sid: sids.value(i),
                open: i128_to_decimal(opens.value(i))?,
                high: i128_to_decimal(highs.value(i))?,
                low: i128_to_decimal(lows.value(i))?,
                close: i128_to_decimal(closes.value(i))?,
                volume: i128_to_decimal(volumes.value(i))?,
            });
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample_row() -> BarRow {
        BarRow {
            ts: Utc.with_ymd_and_hms(2023, 6, 15, 14, 30, 0).unwrap(),
            sid: 7,
            open: dec!(101.25),
            high: dec!(102.5),
            low: dec!(100.75),
            close: dec!(101.875),
            volume: dec!(1234.5),
        }
    }

    #[test]
    fn partition_dirs_are_zero_padded() {
        let ts = Utc.with_ymd_and_hms(2023, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(
            Partition::for_instant(ts, false).relative_dir(),
            "year=2023/month=01"
        );
        assert_eq!(
            Partition::for_instant(ts, true).relative_dir(),
            "year=2023/month=01/day=05"
        );
    }

    #[test]
    fn partition_bounds_cover_month_and_day() {
        let month = Partition {
            year: 2023,
            month: 12,
            day: None,
        };
        assert_eq!(
            month.end_exclusive().unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        let day = Partition {
            year: 2023,
            month: 2,
            day: Some(28),
        };
        assert_eq!(
            day.end_exclusive().unwrap(),
            Utc.with_ymd_and_hms(2023, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn record_batch_round_trips_minute_rows() {
        let rows = vec![sample_row()];
        let batch = record_batch_from_rows(&rows, false).unwrap();
        let back = rows_from_record_batch(&batch, false, Path::new("mem")).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn record_batch_round_trips_daily_rows() {
        let mut row = sample_row();
        row.ts = Utc.with_ymd_and_hms(2023, 6, 15, 0, 0, 0).unwrap();
        let rows = vec![row];
        let batch = record_batch_from_rows(&rows, true).unwrap();
        let back = rows_from_record_batch(&batch, true, Path::new("mem")).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn decimal_mantissa_conversion_is_exact() {
        let value = dec!(100.12345678);
        let mantissa = decimal_to_i128(value).unwrap();
        assert_eq!(mantissa, 10_012_345_678);
        assert_eq!(i128_to_decimal(mantissa).unwrap(), value);
    }
}
