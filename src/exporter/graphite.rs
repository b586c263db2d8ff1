//! graphite plaintext format

use crate::store::{LabelSet, Metric};
use std::fmt::Write;
use std::time::Duration;

use super::format_labels;

/// `<prefix><program>.<name>[.<key>.<value>...] <value> <epoch>\n`.
///
/// Histograms emit one cumulative `bin_<bound>` line per bucket followed by
/// `.count` and `.sum` lines.
pub fn metric_to_graphite(prefix: &str, metric: &Metric, labels: &LabelSet, _interval: Duration) -> String {
    let name = format_labels(&metric.name, &labels.labels, ".", ".", "_");
    let epoch = labels.datum.time().timestamp();
    let mut out = String::new();

    match labels.datum.buckets() {
        Some(buckets) => {
            let mut cumulative = 0;
            for (bound, count) in buckets.bounds.iter().zip(&buckets.counts) {
                cumulative += count;
                let bin = if bound.is_infinite() {
                    "inf".to_string()
                } else {
                    bound.to_string()
                };
                let _ = writeln!(out, "{}{}.{}.bin_{} {} {}", prefix, metric.program, name, bin, cumulative, epoch);
            }
            let _ = writeln!(out, "{}{}.{}.count {} {}", prefix, metric.program, name, buckets.count, epoch);
            let _ = writeln!(out, "{}{}.{}.sum {} {}", prefix, metric.program, name, buckets.sum, epoch);
        }
        None => {
            let _ = writeln!(
                out,
                "{}{}.{} {} {}",
                prefix,
                metric.program,
                name,
                labels.datum.value_string(),
                epoch
            );
        }
    }
    out
}
