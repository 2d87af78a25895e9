//! Typed interpretation of decoded column data.

use chrono::{NaiveDate, TimeDelta};
use serde::Serialize;

use super::dictionary::Dictionary;
use crate::workbook::CellValue;

const MILLIS_PER_DAY: f64 = 86_400_000.0;
const DECIMAL_SCALE: f64 = 10_000.0;

/// A value as stored, before the column's declared type is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Int(i64),
    Real(f64),
    Text(String),
    Null,
}

impl RawValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Int(n) => Some(*n as f64),
            RawValue::Real(n) => Some(*n),
            RawValue::Text(s) => s.trim().parse().ok(),
            RawValue::Null => None,
        }
    }
}

/// Declared data type code of a model column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Int64,
    Double,
    DateTime,
    Decimal,
    Boolean,
    Other(i64),
}

impl ColumnType {
    pub fn from_code(code: i64) -> Self {
        match code {
            2 => ColumnType::Text,
            6 => ColumnType::Int64,
            8 => ColumnType::Double,
            9 => ColumnType::DateTime,
            10 => ColumnType::Decimal,
            11 => ColumnType::Boolean,
            other => ColumnType::Other(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            ColumnType::Text => 2,
            ColumnType::Int64 => 6,
            ColumnType::Double => 8,
            ColumnType::DateTime => 9,
            ColumnType::Decimal => 10,
            ColumnType::Boolean => 11,
            ColumnType::Other(code) => code,
        }
    }
}

/// How the data ids of a column map to stored values.
#[derive(Debug, Clone, Copy)]
pub enum ColumnEncoding<'d> {
    /// `dictionary[id - base_id]`; positions outside the dictionary are null.
    Dictionary {
        dictionary: &'d Dictionary,
        base_id: i64,
    },
    /// `(id + base_id) / magnitude`; id 0 is null when the column is nullable.
    Value {
        base_id: i64,
        magnitude: f64,
        nullable: bool,
    },
}

impl ColumnEncoding<'_> {
    pub fn raw_value(&self, id: u32) -> RawValue {
        match *self {
            ColumnEncoding::Dictionary {
                dictionary,
                base_id,
            } => usize::try_from(i64::from(id) - base_id)
                .ok()
                .and_then(|position| dictionary.get(position))
                .unwrap_or(RawValue::Null),
            ColumnEncoding::Value {
                base_id,
                magnitude,
                nullable,
            } => {
                if nullable && id == 0 {
                    return RawValue::Null;
                }
                let value = i64::from(id) + base_id;
                if magnitude == 0.0 || magnitude == 1.0 {
                    RawValue::Int(value)
                } else {
                    RawValue::Real(value as f64 / magnitude)
                }
            }
        }
    }
}

pub fn materialize_column(ids: &[u32], encoding: &ColumnEncoding<'_>, ty: ColumnType) -> Vec<CellValue> {
    ids.iter()
        .map(|id| convert_column_value(encoding.raw_value(*id), ty))
        .collect()
}

pub fn convert_column_value(raw: RawValue, ty: ColumnType) -> CellValue {
    if raw == RawValue::Null {
        return CellValue::Null;
    }
    match ty {
        ColumnType::Text => match raw {
            RawValue::Text(s) => CellValue::Text(s),
            other => pass_through(other),
        },
        ColumnType::DateTime => match raw.as_f64().and_then(days_to_utc) {
            Some(dt) => CellValue::DateUtc(dt),
            None => pass_through(raw),
        },
        ColumnType::Decimal => match raw.as_f64() {
            Some(n) => CellValue::Number(n / DECIMAL_SCALE),
            None => pass_through(raw),
        },
        ColumnType::Boolean => match raw.as_f64() {
            Some(n) => CellValue::Bool(n != 0.0),
            None => pass_through(raw),
        },
        ColumnType::Int64 | ColumnType::Double | ColumnType::Other(_) => pass_through(raw),
    }
}

fn pass_through(raw: RawValue) -> CellValue {
    match raw {
        RawValue::Int(n) => CellValue::Number(n as f64),
        RawValue::Real(n) => CellValue::Number(n),
        RawValue::Text(s) => CellValue::Text(s),
        RawValue::Null => CellValue::Null,
    }
}

/// Days since 1899-12-30, fractional part as time of day.
fn days_to_utc(days: f64) -> Option<chrono::DateTime<chrono::Utc>> {
    if !days.is_finite() {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (days * MILLIS_PER_DAY).round();
    if millis.abs() > i64::MAX as f64 {
        return None;
    }
    let delta = TimeDelta::try_milliseconds(millis as i64)?;
    epoch.checked_add_signed(delta).map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn day_counts_become_utc_dates() {
        let expected = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).single().expect("date");
        assert_eq!(
            convert_column_value(RawValue::Int(44927), ColumnType::DateTime),
            CellValue::DateUtc(expected)
        );
        let noon = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).single().expect("date");
        assert_eq!(
            convert_column_value(RawValue::Real(44927.5), ColumnType::DateTime),
            CellValue::DateUtc(noon)
        );
    }

    #[test]
    fn decimals_are_scaled_and_booleans_mapped() {
        assert_eq!(
            convert_column_value(RawValue::Int(123_400), ColumnType::Decimal),
            CellValue::Number(12.34)
        );
        assert_eq!(convert_column_value(RawValue::Int(1), ColumnType::Boolean), CellValue::Bool(true));
        assert_eq!(convert_column_value(RawValue::Int(0), ColumnType::Boolean), CellValue::Bool(false));
        assert_eq!(convert_column_value(RawValue::Null, ColumnType::Int64), CellValue::Null);
        assert_eq!(
            convert_column_value(RawValue::Int(7), ColumnType::Other(19)),
            CellValue::Number(7.0)
        );
    }

    #[test]
    fn dictionary_positions_are_relative_to_base_id() {
        let dictionary = Dictionary::Text(vec!["Red".into(), "Blue".into()]);
        let encoding = ColumnEncoding::Dictionary {
            dictionary: &dictionary,
            base_id: 3,
        };
        let values = materialize_column(&[3, 4, 5, 2], &encoding, ColumnType::Text);
        assert_eq!(
            values,
            vec![
                CellValue::Text("Red".into()),
                CellValue::Text("Blue".into()),
                CellValue::Null,
                CellValue::Null
            ]
        );
    }

    #[test]
    fn value_encoded_ids_apply_base_and_magnitude() {
        let encoding = ColumnEncoding::Value {
            base_id: 10,
            magnitude: 1.0,
            nullable: true,
        };
        let values = materialize_column(&[0, 1, 5], &encoding, ColumnType::Int64);
        assert_eq!(values, vec![CellValue::Null, CellValue::Number(11.0), CellValue::Number(15.0)]);

        let scaled = ColumnEncoding::Value {
            base_id: 0,
            magnitude: 10.0,
            nullable: false,
        };
        assert_eq!(scaled.raw_value(0), RawValue::Real(0.0));
        assert_eq!(scaled.raw_value(25), RawValue::Real(2.5));
    }

    #[test]
    fn type_codes_round_trip() {
        for code in [2, 6, 8, 9, 10, 11, 17] {
            assert_eq!(ColumnType::from_code(code).code(), code);
        }
    }
}
