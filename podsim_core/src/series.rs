//! Minute-aligned time series.
//!
//! Every series in the pipeline is indexed by unix minute (seconds since the
//! epoch divided by 60). Missing minutes are stored as `None` so a series can
//! carry gaps without losing alignment.

use chrono::{DateTime, Utc};

/// Unix minute containing the given instant
pub fn minute_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

/// Unix minute containing the given epoch-seconds instant
pub fn minute_of_seconds(seconds: f64) -> i64 {
    (seconds / 60.0).floor() as i64
}

/// First instant of a unix minute
pub fn minute_start(minute: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(minute * 60, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Epoch seconds (fractional) of an instant
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Instant for fractional epoch seconds, rounded to the millisecond
pub fn from_epoch_seconds(seconds: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((seconds * 1000.0).round() as i64)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A minute-aligned series that may contain gaps
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries<T> {
    start: i64,
    values: Vec<Option<T>>,
}

impl<T> TimeSeries<T> {
    /// An empty series anchored at `start`
    pub fn empty(start: i64) -> Self {
        Self {
            start,
            values: Vec::new(),
        }
    }

    /// A gap-free series starting at `start`
    pub fn from_values(start: i64, values: impl IntoIterator<Item = T>) -> Self {
        Self {
            start,
            values: values.into_iter().map(Some).collect(),
        }
    }

    /// A series with explicit gaps
    pub fn from_options(start: i64, values: Vec<Option<T>>) -> Self {
        Self { start, values }
    }

    /// First minute covered
    pub fn start(&self) -> i64 {
        self.start
    }

    /// One past the last minute covered
    pub fn end(&self) -> i64 {
        self.start + self.values.len() as i64
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at `minute`, `None` for gaps and out-of-range minutes
    pub fn get(&self, minute: i64) -> Option<&T> {
        if minute < self.start {
            return None;
        }
        self.values
            .get((minute - self.start) as usize)
            .and_then(|v| v.as_ref())
    }

    /// Store a value, growing the series with gaps as needed
    pub fn set(&mut self, minute: i64, value: T) {
        if self.values.is_empty() {
            self.start = minute;
        } else if minute < self.start {
            let shift = (self.start - minute) as usize;
            let mut grown = Vec::with_capacity(self.values.len() + shift);
            grown.extend(std::iter::repeat_with(|| None).take(shift));
            grown.append(&mut self.values);
            self.values = grown;
            self.start = minute;
        }
        let idx = (minute - self.start) as usize;
        if idx >= self.values.len() {
            self.values.resize_with(idx + 1, || None);
        }
        self.values[idx] = Some(value);
    }

    /// Raw slots, gaps included
    pub fn values(&self) -> &[Option<T>] {
        &self.values
    }

    /// Iterate `(minute, value)` pairs over the covered range
    pub fn iter(&self) -> impl Iterator<Item = (i64, Option<&T>)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(move |(i, v)| (self.start + i as i64, v.as_ref()))
    }

    /// Last minute holding a value
    pub fn last_valid_minute(&self) -> Option<i64> {
        self.values
            .iter()
            .rposition(|v| v.is_some())
            .map(|i| self.start + i as i64)
    }

    /// First minute holding a value
    pub fn first_valid_minute(&self) -> Option<i64> {
        self.values
            .iter()
            .position(|v| v.is_some())
            .map(|i| self.start + i as i64)
    }

    pub fn map<U, F>(&self, mut f: F) -> TimeSeries<U>
    where
        F: FnMut(&T) -> U,
    {
        TimeSeries {
            start: self.start,
            values: self.values.iter().map(|v| v.as_ref().map(&mut f)).collect(),
        }
    }
}

impl<T: Clone> TimeSeries<T> {
    /// Reindex onto `[start, end)`; minutes outside the source become gaps
    pub fn window(&self, start: i64, end: i64) -> Self {
        let values = (start..end.max(start))
            .map(|minute| self.get(minute).cloned())
            .collect();
        Self { start, values }
    }
}

impl TimeSeries<f64> {
    /// Values with gaps replaced by `fill`
    pub fn dense(&self, fill: f64) -> Vec<f64> {
        self.values.iter().map(|v| v.unwrap_or(fill)).collect()
    }

    /// Add `amount` at `minute`, treating a gap as zero
    pub fn accumulate(&mut self, minute: i64, amount: f64) {
        let current = self.get(minute).copied().unwrap_or(0.0);
        self.set(minute, current + amount);
    }

    /// Sum of all defined values
    pub fn sum(&self) -> f64 {
        self.values.iter().flatten().sum()
    }

    /// Minute-wise sum over the union of both ranges, gaps counted as zero
    pub fn add(&self, other: &TimeSeries<f64>) -> TimeSeries<f64> {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        let values = (start..end)
            .map(|minute| {
                match (self.get(minute), other.get(minute)) {
                    (None, None) => None,
                    (a, b) => Some(a.copied().unwrap_or(0.0) + b.copied().unwrap_or(0.0)),
                }
            })
            .collect();
        TimeSeries { start, values }
    }

    /// Running total; gaps keep the previous total
    pub fn cumulative(&self) -> TimeSeries<f64> {
        let mut total = 0.0;
        let values = self
            .values
            .iter()
            .map(|v| {
                total += v.unwrap_or(0.0);
                Some(total)
            })
            .collect();
        TimeSeries {
            start: self.start,
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_grows_in_both_directions() {
        let mut series = TimeSeries::empty(0);
        series.set(100, 1.0);
        series.set(103, 4.0);
        series.set(98, -2.0);

        assert_eq!(series.start(), 98);
        assert_eq!(series.end(), 104);
        assert_eq!(series.get(98), Some(&-2.0));
        assert_eq!(series.get(99), None);
        assert_eq!(series.get(100), Some(&1.0));
        assert_eq!(series.get(103), Some(&4.0));
        assert_eq!(series.get(200), None);
    }

    #[test]
    fn test_add_aligns_by_minute() {
        let a = TimeSeries::from_values(10, vec![1.0, 1.0, 1.0]);
        let b = TimeSeries::from_values(12, vec![2.0, 2.0]);
        let sum = a.add(&b);

        assert_eq!(sum.start(), 10);
        assert_eq!(sum.dense(0.0), vec![1.0, 1.0, 3.0, 2.0]);
    }

    #[test]
    fn test_window_introduces_gaps() {
        let a = TimeSeries::from_values(10, vec![1.0, 2.0]);
        let w = a.window(9, 13);
        assert_eq!(w.values(), &[None, Some(1.0), Some(2.0), None]);
        assert_eq!(w.last_valid_minute(), Some(11));
        assert_eq!(w.first_valid_minute(), Some(10));
    }

    #[test]
    fn test_cumulative_skips_gaps() {
        let a = TimeSeries::from_options(0, vec![Some(1.0), None, Some(2.0)]);
        assert_eq!(a.cumulative().dense(0.0), vec![1.0, 1.0, 3.0]);
    }

    #[test]
    fn test_minute_conversions() {
        let at = from_epoch_seconds(3_661.5);
        assert_eq!(minute_of(at), 61);
        assert_eq!(minute_of_seconds(3_661.5), 61);
        assert_eq!(minute_start(61).timestamp(), 3_660);
        assert!((epoch_seconds(at) - 3_661.5).abs() < 1e-9);
    }
}
