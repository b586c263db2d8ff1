//! Process-wide metric registry
//!
//! Each metric guards its own datums, so the store lock is only held while
//! metrics are added, removed or listed.

pub mod datum;
pub mod metric;

pub use datum::{Buckets, Datum};
pub use metric::{Kind, LabelSet, Metric, ValueType};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metric {name} already registered by program {program} as a {kind}")]
    KindConflict {
        name: String,
        program: String,
        kind: Kind,
    },

    #[error("metric {metric} takes {expected} keys, got {found}")]
    KeyCount {
        metric: String,
        expected: usize,
        found: usize,
    },

    #[error("metric {metric} has no datum for labels {labels:?}")]
    NoSuchLabels { metric: String, labels: Vec<String> },
}

/// Registry of metrics keyed by name
#[derive(Debug, Default)]
pub struct Store {
    metrics: RwLock<HashMap<String, Vec<Arc<Metric>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric.
    ///
    /// A metric of the same name from the same program is replaced. A metric
    /// of the same name from another program must have the same kind.
    pub fn add(&self, metric: Metric) -> Result<Arc<Metric>, StoreError> {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let entry = metrics.entry(metric.name.clone()).or_default();

        if let Some(other) = entry
            .iter()
            .find(|m| m.program != metric.program && m.kind != metric.kind)
        {
            return Err(StoreError::KindConflict {
                name: metric.name.clone(),
                program: other.program.clone(),
                kind: other.kind,
            });
        }

        entry.retain(|m| m.program != metric.program);
        let metric = Arc::new(metric);
        entry.push(Arc::clone(&metric));
        debug!(name = %metric.name, program = %metric.program, kind = %metric.kind, "metric registered");
        Ok(metric)
    }

    /// Fail with the conflict [`Store::add`] would report if `program`
    /// registered metrics of these names and kinds. Nothing is changed.
    pub fn check_conflicts<'a, I>(&self, program: &str, metrics: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (&'a str, Kind)>,
    {
        let registered = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        for (name, kind) in metrics {
            let Some(list) = registered.get(name) else {
                continue;
            };
            if let Some(other) = list.iter().find(|m| m.program != program && m.kind != kind) {
                return Err(StoreError::KindConflict {
                    name: name.to_string(),
                    program: other.program.clone(),
                    kind: other.kind,
                });
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str, program: &str) -> Option<Arc<Metric>> {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        metrics
            .get(name)
            .and_then(|list| list.iter().find(|m| m.program == program))
            .cloned()
    }

    /// Drop every metric owned by `program`
    pub fn remove_program(&self, program: &str) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.retain(|_, list| {
            list.retain(|m| m.program != program);
            !list.is_empty()
        });
    }

    /// Snapshot of all metrics, ordered by name then program
    pub fn metrics(&self) -> Vec<Arc<Metric>> {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Arc<Metric>> = metrics.values().flatten().cloned().collect();
        all.sort_by(|a, b| (&a.name, &a.program).cmp(&(&b.name, &b.program)));
        all
    }

    /// Visit every metric in snapshot order
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&Metric),
    {
        for metric in self.metrics() {
            f(&metric);
        }
    }

    /// Remove expired datums from every metric
    pub fn gc(&self) -> usize {
        let now = Utc::now();
        self.metrics().iter().map(|m| m.gc(now)).sum()
    }

    /// Run [`Store::gc`] every `interval` until `shutdown` fires
    pub fn spawn_gc_loop(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.gc();
                        if removed > 0 {
                            info!(removed, "expired datums removed");
                        }
                    }
                }
            }
        })
    }
}
