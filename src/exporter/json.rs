//! JSON dump of the store, written at the end of a one-shot run

use crate::store::{Kind, Store, ValueType};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub program: String,
    pub kind: Kind,
    pub keys: Vec<String>,
    pub label_values: Vec<LabelValueSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct LabelValueSnapshot {
    pub labels: BTreeMap<String, String>,
    pub value: Value,
    /// RFC 3339, UTC
    pub timestamp: String,
}

/// Every non-hidden metric, with a `prog` label added when `emit_prog_label`
pub fn snapshot(store: &Store, emit_prog_label: bool) -> Vec<MetricSnapshot> {
    let mut out = Vec::new();
    store.range(|metric| {
        if metric.hidden {
            return;
        }
        let label_values = metric
            .label_sets()
            .into_iter()
            .map(|ls| {
                let mut labels = ls.labels;
                if emit_prog_label {
                    labels.insert("prog".to_string(), metric.program.clone());
                }
                let value = match metric.value_type {
                    ValueType::Int => json!(ls.datum.get_int()),
                    ValueType::Float => json!(ls.datum.get_float()),
                    ValueType::String => json!(ls.datum.get_string()),
                    ValueType::Buckets => match ls.datum.buckets() {
                        Some(b) => {
                            let bins: BTreeMap<String, u64> = b
                                .bounds
                                .iter()
                                .zip(&b.counts)
                                .map(|(bound, count)| (bound.to_string(), *count))
                                .collect();
                            json!({ "buckets": bins, "count": b.count, "sum": b.sum })
                        }
                        None => Value::Null,
                    },
                };
                LabelValueSnapshot {
                    labels,
                    value,
                    timestamp: ls.datum.time().to_rfc3339(),
                }
            })
            .collect();
        out.push(MetricSnapshot {
            name: metric.name.clone(),
            program: metric.program.clone(),
            kind: metric.kind,
            keys: metric.keys.clone(),
            label_values,
        });
    });
    out
}

pub fn to_json(store: &Store, emit_prog_label: bool) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&snapshot(store, emit_prog_label))
}
