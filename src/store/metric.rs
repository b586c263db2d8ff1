//! Metric: a named, label-dimensioned family of datums

use super::StoreError;
use super::datum::Datum;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Metric kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Counter,
    Gauge,
    Timer,
    Text,
    Histogram,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
            Kind::Timer => "timer",
            Kind::Text => "text",
            Kind::Histogram => "histogram",
        };
        write!(f, "{}", s)
    }
}

/// Runtime representation of a metric's datums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Float,
    String,
    Buckets,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Int => "Int",
            ValueType::Float => "Float",
            ValueType::String => "String",
            ValueType::Buckets => "Buckets",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
struct LabelValue {
    datum: Arc<Datum>,
    /// Removal deadline measured from the datum's last update
    expiry: Option<TimeDelta>,
}

/// One label tuple of a metric, as seen by exporters
#[derive(Debug, Clone)]
pub struct LabelSet {
    pub labels: BTreeMap<String, String>,
    pub datum: Arc<Datum>,
}

/// A metric and all of its datums
#[derive(Debug)]
pub struct Metric {
    pub name: String,
    pub program: String,
    pub kind: Kind,
    pub value_type: ValueType,
    pub keys: Vec<String>,
    pub buckets: Vec<f64>,
    pub hidden: bool,
    pub limit: Option<usize>,
    label_values: RwLock<HashMap<Vec<String>, LabelValue>>,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        kind: Kind,
        value_type: ValueType,
        keys: Vec<String>,
    ) -> Self {
        Metric {
            name: name.into(),
            program: program.into(),
            kind,
            value_type,
            keys,
            buckets: Vec::new(),
            hidden: false,
            limit: None,
            label_values: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    fn check_arity(&self, labels: &[String]) -> Result<(), StoreError> {
        if labels.len() != self.keys.len() {
            return Err(StoreError::KeyCount {
                metric: self.name.clone(),
                expected: self.keys.len(),
                found: labels.len(),
            });
        }
        Ok(())
    }

    /// Fetch the datum for `labels`, creating a zero datum on first use.
    ///
    /// When the metric has a limit and is full, the least recently updated
    /// tuple is evicted to make room.
    pub fn get_datum(&self, labels: &[String]) -> Result<Arc<Datum>, StoreError> {
        self.check_arity(labels)?;

        {
            let map = self.label_values.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(lv) = map.get(labels) {
                return Ok(Arc::clone(&lv.datum));
            }
        }

        let mut map = self.label_values.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(lv) = map.get(labels) {
            return Ok(Arc::clone(&lv.datum));
        }

        if let Some(limit) = self.limit {
            while map.len() >= limit {
                let oldest = map
                    .iter()
                    .min_by_key(|(_, lv)| lv.datum.time())
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(key) => {
                        map.remove(&key);
                    }
                    None => break,
                }
            }
        }

        let datum = Arc::new(Datum::new(self.value_type, &self.buckets));
        map.insert(
            labels.to_vec(),
            LabelValue {
                datum: Arc::clone(&datum),
                expiry: None,
            },
        );
        Ok(datum)
    }

    /// Remove the datum for `labels`; true if it existed
    pub fn remove_datum(&self, labels: &[String]) -> Result<bool, StoreError> {
        self.check_arity(labels)?;
        let mut map = self.label_values.write().unwrap_or_else(PoisonError::into_inner);
        Ok(map.remove(labels).is_some())
    }

    /// Schedule removal of `labels` once it has been idle for `expiry`
    pub fn expire_datum(&self, expiry: TimeDelta, labels: &[String]) -> Result<(), StoreError> {
        self.check_arity(labels)?;
        let mut map = self.label_values.write().unwrap_or_else(PoisonError::into_inner);
        match map.get_mut(labels) {
            Some(lv) => {
                lv.expiry = Some(expiry);
                Ok(())
            }
            None => Err(StoreError::NoSuchLabels {
                metric: self.name.clone(),
                labels: labels.to_vec(),
            }),
        }
    }

    /// Drop expired datums, returning how many were removed
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.label_values.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, lv| match lv.expiry {
            Some(expiry) => lv.datum.time() + expiry > now,
            None => true,
        });
        before - map.len()
    }

    /// Every label tuple with its datum, sorted by label values
    pub fn label_sets(&self) -> Vec<LabelSet> {
        let map = self.label_values.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(&Vec<String>, &LabelValue)> = map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(values, lv)| LabelSet {
                labels: self.keys.iter().cloned().zip(values.iter().cloned()).collect(),
                datum: Arc::clone(&lv.datum),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.label_values.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(Kind::Counter.to_string(), "counter");
        assert_eq!(Kind::Histogram.to_string(), "histogram");
    }

    #[test]
    fn test_get_datum_creates_once() {
        let m = Metric::new("foo", "prog", Kind::Counter, ValueType::Int, vec!["a".into()]);
        let d1 = m.get_datum(&labels(&["x"])).unwrap();
        d1.inc_by(1, ts(1));
        let d2 = m.get_datum(&labels(&["x"])).unwrap();
        assert_eq!(d2.get_int(), 1);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_key_count_mismatch() {
        let m = Metric::new("foo", "prog", Kind::Counter, ValueType::Int, vec!["a".into()]);
        let err = m.get_datum(&[]).unwrap_err();
        assert!(matches!(err, StoreError::KeyCount { expected: 1, found: 0, .. }));
    }

    #[test]
    fn test_limit_evicts_least_recently_updated() {
        let m = Metric::new("foo", "prog", Kind::Counter, ValueType::Int, vec!["a".into()])
            .with_limit(Some(2));
        m.get_datum(&labels(&["old"])).unwrap().inc_by(1, ts(1));
        m.get_datum(&labels(&["new"])).unwrap().inc_by(1, ts(5));
        m.get_datum(&labels(&["newer"])).unwrap().inc_by(1, ts(6));

        let names: Vec<String> = m
            .label_sets()
            .into_iter()
            .map(|ls| ls.labels["a"].clone())
            .collect();
        assert_eq!(names, vec!["new", "newer"]);
    }

    #[test]
    fn test_remove_and_expire() {
        let m = Metric::new("foo", "prog", Kind::Gauge, ValueType::Int, vec!["a".into()]);
        m.get_datum(&labels(&["x"])).unwrap().set_int(3, ts(100));
        m.get_datum(&labels(&["y"])).unwrap().set_int(4, ts(100));

        assert!(m.remove_datum(&labels(&["x"])).unwrap());
        assert!(!m.remove_datum(&labels(&["x"])).unwrap());

        m.expire_datum(TimeDelta::seconds(10), &labels(&["y"])).unwrap();
        assert_eq!(m.gc(ts(105)), 0);
        assert_eq!(m.gc(ts(111)), 1);
        assert!(m.is_empty());
    }

    #[test]
    fn test_expire_unknown_labels() {
        let m = Metric::new("foo", "prog", Kind::Gauge, ValueType::Int, vec!["a".into()]);
        assert!(m.expire_datum(TimeDelta::seconds(1), &labels(&["nope"])).is_err());
    }

    #[test]
    fn test_label_sets_sorted() {
        let m = Metric::new(
            "foo",
            "prog",
            Kind::Counter,
            ValueType::Int,
            vec!["k".into(), "v".into()],
        );
        m.get_datum(&labels(&["b", "1"])).unwrap();
        m.get_datum(&labels(&["a", "2"])).unwrap();
        let sets = m.label_sets();
        assert_eq!(sets[0].labels["k"], "a");
        assert_eq!(sets[1].labels["k"], "b");
        assert_eq!(sets[1].labels["v"], "1");
    }
}
