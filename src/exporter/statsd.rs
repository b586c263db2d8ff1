//! statsd line format

use crate::store::{Kind, LabelSet, Metric};
use std::time::Duration;

use super::format_labels;

/// `<prefix><program>.<name>[.<key>.<value>...]:<value>|<type>`
pub fn metric_to_statsd(prefix: &str, metric: &Metric, labels: &LabelSet, _interval: Duration) -> String {
    let kind = match metric.kind {
        Kind::Counter => "c",
        Kind::Timer => "ms",
        _ => "g",
    };
    format!(
        "{}{}.{}:{}|{}",
        prefix,
        metric.program,
        format_labels(&metric.name, &labels.labels, ".", ".", "_"),
        labels.datum.value_string(),
        kind
    )
}
