// ABOUTME: Change-detection strategies - boundary predicate and next watermark per cycle
// ABOUTME: Timestamp-column and integer-sequence detection; log-based detection is reserved

use serde::{Deserialize, Serialize};

use crate::error::{ReplicatorError, Result};
use crate::iceberg::types::Value;
use crate::sync::watermark::WatermarkValue;

/// Row filter handed to a row source.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionPredicate {
    /// First run: no lower bound.
    All,
    /// Rows whose `column` is strictly greater than `value`.
    GreaterThan {
        column: String,
        value: WatermarkValue,
    },
}

/// Decides which rows changed since the last cycle and what the next watermark is.
pub trait ChangeDetectionStrategy: Send + Sync {
    /// Column the strategy watches.
    fn column(&self) -> &str;

    /// Predicate selecting rows newer than `previous`.
    fn boundary_predicate(&self, previous: Option<&WatermarkValue>) -> Result<ExtractionPredicate>;

    /// Running maximum of `previous` and the non-null `observed` values.
    fn next_watermark(
        &self,
        previous: Option<WatermarkValue>,
        observed: &[Value],
    ) -> Result<Option<WatermarkValue>>;
}

/// Kind of change detection configured for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ChangeDetectionKind {
    /// Monotonic last-modified timestamp column
    #[default]
    Timestamp,
    /// Monotonic integer column (identity, rowversion, sequence)
    Integer,
}

impl ChangeDetectionKind {
    pub fn strategy(&self, column: &str) -> Box<dyn ChangeDetectionStrategy> {
        match self {
            ChangeDetectionKind::Timestamp => Box::new(TimestampColumn::new(column)),
            ChangeDetectionKind::Integer => Box::new(IntegerSequence::new(column)),
        }
    }
}

impl std::str::FromStr for ChangeDetectionKind {
    type Err = ReplicatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "timestamp" => Ok(ChangeDetectionKind::Timestamp),
            "integer" => Ok(ChangeDetectionKind::Integer),
            other => Err(ReplicatorError::Config(format!(
                "unknown change detection '{}' (expected timestamp or integer)",
                other
            ))),
        }
    }
}

fn predicate_for(column: &str, previous: Option<&WatermarkValue>) -> ExtractionPredicate {
    match previous {
        None => ExtractionPredicate::All,
        Some(value) => ExtractionPredicate::GreaterThan {
            column: column.to_string(),
            value: *value,
        },
    }
}

fn running_max(
    column: &str,
    previous: Option<WatermarkValue>,
    observed: &[Value],
    accept: impl Fn(&Value) -> Option<WatermarkValue>,
) -> Result<Option<WatermarkValue>> {
    let mut max = previous;
    for value in observed {
        if value.is_null() {
            continue;
        }
        let candidate = accept(value).ok_or_else(|| {
            ReplicatorError::InvalidData(format!(
                "watermark column '{}' holds unsupported value {}",
                column, value
            ))
        })?;
        let greater = match &max {
            None => true,
            Some(current) => {
                candidate.compare(current).ok_or_else(|| {
                    ReplicatorError::InvalidData(format!(
                        "watermark column '{}' mixes value kinds ({} vs {})",
                        column, candidate, current
                    ))
                })? == std::cmp::Ordering::Greater
            }
        };
        if greater {
            max = Some(candidate);
        }
    }
    Ok(max)
}

/// Rows whose last-modified timestamp exceeds the watermark.
#[derive(Debug, Clone)]
pub struct TimestampColumn {
    column: String,
}

impl TimestampColumn {
    pub fn new(column: &str) -> Self {
        Self {
            column: column.to_string(),
        }
    }
}

impl ChangeDetectionStrategy for TimestampColumn {
    fn column(&self) -> &str {
        &self.column
    }

    fn boundary_predicate(&self, previous: Option<&WatermarkValue>) -> Result<ExtractionPredicate> {
        if let Some(WatermarkValue::Integer(_)) = previous {
            return Err(ReplicatorError::InvalidData(format!(
                "stored watermark for '{}' is an integer but change detection is timestamp",
                self.column
            )));
        }
        Ok(predicate_for(&self.column, previous))
    }

    fn next_watermark(
        &self,
        previous: Option<WatermarkValue>,
        observed: &[Value],
    ) -> Result<Option<WatermarkValue>> {
        running_max(&self.column, previous, observed, |v| match v {
            Value::Timestamp(_) | Value::Timestamptz(_) | Value::Date(_) => {
                WatermarkValue::from_value(v)
            }
            _ => None,
        })
    }
}

/// Rows whose monotonically increasing integer exceeds the watermark.
#[derive(Debug, Clone)]
pub struct IntegerSequence {
    column: String,
}

impl IntegerSequence {
    pub fn new(column: &str) -> Self {
        Self {
            column: column.to_string(),
        }
    }
}

impl ChangeDetectionStrategy for IntegerSequence {
    fn column(&self) -> &str {
        &self.column
    }

    fn boundary_predicate(&self, previous: Option<&WatermarkValue>) -> Result<ExtractionPredicate> {
        if let Some(WatermarkValue::Timestamp(_)) = previous {
            return Err(ReplicatorError::InvalidData(format!(
                "stored watermark for '{}' is a timestamp but change detection is integer",
                self.column
            )));
        }
        Ok(predicate_for(&self.column, previous))
    }

    fn next_watermark(
        &self,
        previous: Option<WatermarkValue>,
        observed: &[Value],
    ) -> Result<Option<WatermarkValue>> {
        running_max(&self.column, previous, observed, |v| match v {
            Value::Int(_) | Value::Long(_) => WatermarkValue::from_value(v),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_first_run_has_no_lower_bound() {
        let strategy = TimestampColumn::new("updated_at");
        assert_eq!(
            strategy.boundary_predicate(None).unwrap(),
            ExtractionPredicate::All
        );
    }

    #[test]
    fn test_boundary_uses_previous_watermark() {
        let strategy = TimestampColumn::new("updated_at");
        let previous = WatermarkValue::Timestamp(ts(3));
        assert_eq!(
            strategy.boundary_predicate(Some(&previous)).unwrap(),
            ExtractionPredicate::GreaterThan {
                column: "updated_at".to_string(),
                value: previous,
            }
        );
    }

    #[test]
    fn test_next_watermark_is_running_max() {
        let strategy = TimestampColumn::new("updated_at");
        let observed = vec![
            Value::Timestamp(ts(5)),
            Value::Null,
            Value::Timestamp(ts(9)),
            Value::Timestamp(ts(2)),
        ];
        assert_eq!(
            strategy
                .next_watermark(Some(WatermarkValue::Timestamp(ts(1))), &observed)
                .unwrap(),
            Some(WatermarkValue::Timestamp(ts(9)))
        );
        // Nothing observed keeps the previous value
        assert_eq!(
            strategy
                .next_watermark(Some(WatermarkValue::Timestamp(ts(1))), &[])
                .unwrap(),
            Some(WatermarkValue::Timestamp(ts(1)))
        );
        assert_eq!(strategy.next_watermark(None, &[Value::Null]).unwrap(), None);
    }

    #[test]
    fn test_integer_sequence() {
        let strategy = IntegerSequence::new("id");
        let next = strategy
            .next_watermark(None, &[Value::Long(4), Value::Int(11), Value::Long(7)])
            .unwrap();
        assert_eq!(next, Some(WatermarkValue::Integer(11)));

        let err = strategy
            .next_watermark(None, &[Value::String("x".into())])
            .unwrap_err();
        assert!(matches!(err, ReplicatorError::InvalidData(_)));
    }

    #[test]
    fn test_mismatched_stored_watermark_rejected() {
        let strategy = IntegerSequence::new("id");
        assert!(strategy
            .boundary_predicate(Some(&WatermarkValue::Timestamp(ts(1))))
            .is_err());
        let strategy = TimestampColumn::new("updated_at");
        assert!(strategy
            .boundary_predicate(Some(&WatermarkValue::Integer(1)))
            .is_err());
    }

    #[test]
    fn test_kind_parses_and_builds_strategy() {
        let kind: ChangeDetectionKind = "Integer".parse().unwrap();
        assert_eq!(kind, ChangeDetectionKind::Integer);
        assert_eq!(kind.strategy("seq").column(), "seq");
        assert!("log".parse::<ChangeDetectionKind>().is_err());
    }
}
