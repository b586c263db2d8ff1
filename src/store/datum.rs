//! Datum: the value cell behind one label tuple of one metric

use super::metric::ValueType;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Histogram bucket counts.
///
/// `bounds` holds the upper bound of every bucket; the last bound is always
/// `f64::INFINITY`.
#[derive(Debug, Clone, PartialEq)]
pub struct Buckets {
    pub bounds: Vec<f64>,
    pub counts: Vec<u64>,
    pub count: u64,
    pub sum: f64,
}

impl Buckets {
    pub fn new(bounds: &[f64]) -> Self {
        let mut bounds: Vec<f64> = bounds.iter().copied().filter(|b| b.is_finite()).collect();
        bounds.push(f64::INFINITY);
        Buckets {
            counts: vec![0; bounds.len()],
            bounds,
            count: 0,
            sum: 0.0,
        }
    }

    /// Record a value in the first bucket whose upper bound exceeds it
    pub fn observe(&mut self, value: f64) {
        let index = self
            .bounds
            .iter()
            .position(|max| value < *max)
            .unwrap_or(self.bounds.len() - 1);
        self.counts[index] += 1;
        self.count += 1;
        self.sum += value;
    }

    /// Lower and upper bound of bucket `index`
    pub fn range(&self, index: usize) -> (f64, f64) {
        let min = if index == 0 { 0.0 } else { self.bounds[index - 1] };
        (min, self.bounds[index])
    }
}

#[derive(Debug)]
enum Cell {
    Int(AtomicI64),
    /// f64 bits
    Float(AtomicU64),
    String(Mutex<String>),
    Buckets(Mutex<Buckets>),
}

/// A single metric value and the time it was last updated
#[derive(Debug)]
pub struct Datum {
    cell: Cell,
    /// Nanoseconds since the Unix epoch
    time: AtomicI64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

impl Datum {
    /// Create a zero-valued datum; `bounds` is only used for buckets
    pub fn new(value_type: ValueType, bounds: &[f64]) -> Self {
        let cell = match value_type {
            ValueType::Int => Cell::Int(AtomicI64::new(0)),
            ValueType::Float => Cell::Float(AtomicU64::new(0f64.to_bits())),
            ValueType::String => Cell::String(Mutex::new(String::new())),
            ValueType::Buckets => Cell::Buckets(Mutex::new(Buckets::new(bounds))),
        };
        Datum {
            cell,
            time: AtomicI64::new(0),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self.cell {
            Cell::Int(_) => ValueType::Int,
            Cell::Float(_) => ValueType::Float,
            Cell::String(_) => ValueType::String,
            Cell::Buckets(_) => ValueType::Buckets,
        }
    }

    /// Last update time; the epoch if never updated
    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.time.load(Ordering::Acquire))
    }

    fn stamp(&self, ts: DateTime<Utc>) {
        self.time.store(nanos(ts), Ordering::Release);
    }

    pub fn get_int(&self) -> i64 {
        match &self.cell {
            Cell::Int(v) => v.load(Ordering::Acquire),
            Cell::Float(v) => f64::from_bits(v.load(Ordering::Acquire)) as i64,
            Cell::String(s) => lock(s).trim().parse().unwrap_or(0),
            Cell::Buckets(b) => lock(b).sum as i64,
        }
    }

    pub fn get_float(&self) -> f64 {
        match &self.cell {
            Cell::Int(v) => v.load(Ordering::Acquire) as f64,
            Cell::Float(v) => f64::from_bits(v.load(Ordering::Acquire)),
            Cell::String(s) => lock(s).trim().parse().unwrap_or(0.0),
            Cell::Buckets(b) => lock(b).sum,
        }
    }

    pub fn get_string(&self) -> String {
        match &self.cell {
            Cell::String(s) => lock(s).clone(),
            _ => self.value_string(),
        }
    }

    pub fn set_int(&self, value: i64, ts: DateTime<Utc>) {
        match &self.cell {
            Cell::Int(v) => v.store(value, Ordering::Release),
            Cell::Float(v) => v.store((value as f64).to_bits(), Ordering::Release),
            Cell::String(s) => *lock(s) = value.to_string(),
            Cell::Buckets(b) => lock(b).observe(value as f64),
        }
        self.stamp(ts);
    }

    /// Add `delta`; floats and strings are handled as their numeric value
    pub fn inc_by(&self, delta: i64, ts: DateTime<Utc>) {
        match &self.cell {
            Cell::Int(v) => {
                v.fetch_add(delta, Ordering::AcqRel);
            }
            Cell::Float(_) => {
                self.add_float(delta as f64, ts);
                return;
            }
            Cell::String(s) => {
                let mut s = lock(s);
                let current: i64 = s.trim().parse().unwrap_or(0);
                *s = current.wrapping_add(delta).to_string();
            }
            Cell::Buckets(b) => lock(b).observe(delta as f64),
        }
        self.stamp(ts);
    }

    pub fn set_float(&self, value: f64, ts: DateTime<Utc>) {
        match &self.cell {
            Cell::Int(v) => v.store(value as i64, Ordering::Release),
            Cell::Float(v) => v.store(value.to_bits(), Ordering::Release),
            Cell::String(s) => *lock(s) = value.to_string(),
            Cell::Buckets(b) => lock(b).observe(value),
        }
        self.stamp(ts);
    }

    fn add_float(&self, delta: f64, ts: DateTime<Utc>) {
        if let Cell::Float(v) = &self.cell {
            let mut current = v.load(Ordering::Acquire);
            loop {
                let next = (f64::from_bits(current) + delta).to_bits();
                match v.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
            self.stamp(ts);
        }
    }

    pub fn set_string(&self, value: &str, ts: DateTime<Utc>) {
        match &self.cell {
            Cell::String(s) => *lock(s) = value.to_string(),
            Cell::Int(v) => v.store(value.trim().parse().unwrap_or(0), Ordering::Release),
            Cell::Float(v) => {
                v.store(value.trim().parse::<f64>().unwrap_or(0.0).to_bits(), Ordering::Release)
            }
            Cell::Buckets(b) => lock(b).observe(value.trim().parse().unwrap_or(0.0)),
        }
        self.stamp(ts);
    }

    /// Snapshot of the histogram, if this is a buckets datum
    pub fn buckets(&self) -> Option<Buckets> {
        match &self.cell {
            Cell::Buckets(b) => Some(lock(b).clone()),
            _ => None,
        }
    }

    /// Value as exported; histograms report their sum
    pub fn value_string(&self) -> String {
        match &self.cell {
            Cell::Int(v) => v.load(Ordering::Acquire).to_string(),
            Cell::Float(v) => f64::from_bits(v.load(Ordering::Acquire)).to_string(),
            Cell::String(s) => lock(s).clone(),
            Cell::Buckets(b) => lock(b).sum.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_new_datum_is_zero() {
        let d = Datum::new(ValueType::Int, &[]);
        assert_eq!(d.get_int(), 0);
        assert_eq!(d.time().timestamp(), 0);
        assert_eq!(d.value_type(), ValueType::Int);
    }

    #[test]
    fn test_int_inc_and_set() {
        let d = Datum::new(ValueType::Int, &[]);
        d.inc_by(1, ts(10));
        d.inc_by(5, ts(11));
        assert_eq!(d.get_int(), 6);
        assert_eq!(d.time().timestamp(), 11);
        d.set_int(-3, ts(12));
        assert_eq!(d.value_string(), "-3");
    }

    #[test]
    fn test_float_add_via_inc() {
        let d = Datum::new(ValueType::Float, &[]);
        d.set_float(1.5, ts(1));
        d.inc_by(2, ts(2));
        assert_eq!(d.get_float(), 3.5);
        assert_eq!(d.value_string(), "3.5");
    }

    #[test]
    fn test_string_datum() {
        let d = Datum::new(ValueType::String, &[]);
        d.set_string("hello", ts(1));
        assert_eq!(d.get_string(), "hello");
        assert_eq!(d.value_string(), "hello");
    }

    #[test]
    fn test_buckets_observe() {
        let d = Datum::new(ValueType::Buckets, &[10.0, 20.0]);
        for v in [1.0, 5.0, 12.0, 15.0, 19.0, 1000.0] {
            d.set_float(v, ts(1));
        }
        let b = d.buckets().unwrap();
        assert_eq!(b.bounds, vec![10.0, 20.0, f64::INFINITY]);
        assert_eq!(b.counts, vec![2, 3, 1]);
        assert_eq!(b.count, 6);
        assert_eq!(b.sum, 1052.0);
        assert_eq!(d.value_string(), "1052");
        assert_eq!(b.range(1), (10.0, 20.0));
    }

    #[test]
    fn test_boundary_value_goes_to_next_bucket() {
        let mut b = Buckets::new(&[10.0]);
        b.observe(10.0);
        assert_eq!(b.counts, vec![0, 1]);
    }
}
