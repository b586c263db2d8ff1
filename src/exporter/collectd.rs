//! collectd unixsock `PUTVAL` format

use crate::store::{Kind, LabelSet, Metric};
use std::time::Duration;

use super::format_labels;

/// `PUTVAL "<host>/<prefix>mtail-<program>/<kind>-<name>[-<key>-<value>...]" interval=<secs> <epoch>:<value>\n`
pub fn metric_to_collectd(
    hostname: &str,
    prefix: &str,
    metric: &Metric,
    labels: &LabelSet,
    interval: Duration,
) -> String {
    format!(
        "PUTVAL \"{}/{}mtail-{}/{}-{}\" interval={} {}:{}\n",
        hostname,
        prefix,
        metric.program,
        collectd_type(metric.kind),
        format_labels(&metric.name, &labels.labels, "-", "-", "_"),
        interval.as_secs_f64().round(),
        labels.datum.time().timestamp(),
        labels.datum.value_string()
    )
}

/// collectd has no timer type
fn collectd_type(kind: Kind) -> String {
    match kind {
        Kind::Timer => "gauge".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::tests::{label_set, ts};
    use crate::store::ValueType;

    #[test]
    fn test_gauge_with_label() {
        let metric = Metric::new("bar", "prog", Kind::Gauge, ValueType::Int, vec!["label".into()]);
        let ls = label_set(&metric, &["quux"], 37, ts(1343124840));
        assert_eq!(
            metric_to_collectd("gunstar", "", &metric, &ls, Duration::from_secs(60)),
            "PUTVAL \"gunstar/mtail-prog/gauge-bar-label-quux\" interval=60 1343124840:37\n"
        );
    }

    #[test]
    fn test_counter_with_prefix() {
        let metric = Metric::new("foo", "prog", Kind::Counter, ValueType::Int, vec![]);
        let ls = label_set(&metric, &[], 37, ts(1343124840));
        assert_eq!(
            metric_to_collectd("gunstar", "prefix", &metric, &ls, Duration::from_secs(60)),
            "PUTVAL \"gunstar/prefixmtail-prog/counter-foo\" interval=60 1343124840:37\n"
        );
    }

    #[test]
    fn test_separator_in_label_is_replaced() {
        let metric = Metric::new("bar", "prog", Kind::Gauge, ValueType::Int, vec!["host".into()]);
        let ls = label_set(&metric, &["web-1"], 1, ts(10));
        assert_eq!(
            metric_to_collectd("h", "", &metric, &ls, Duration::from_secs(30)),
            "PUTVAL \"h/mtail-prog/gauge-bar-host-web_1\" interval=30 10:1\n"
        );
    }

    #[test]
    fn test_timer_is_sent_as_gauge() {
        let metric = Metric::new("lat", "prog", Kind::Timer, ValueType::Int, vec![]);
        let ls = label_set(&metric, &[], 5, ts(1343124840));
        assert_eq!(
            metric_to_collectd("h", "", &metric, &ls, Duration::from_secs(60)),
            "PUTVAL \"h/mtail-prog/gauge-lat\" interval=60 1343124840:5\n"
        );
    }
}
