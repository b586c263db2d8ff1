//! Exporter: pushes store snapshots to collectd, graphite and statsd
//!
//! Every push dials each target fresh, writes one line per label set of
//! every exported metric, and closes the connection. A failed push is
//! logged and the target is simply tried again on the next interval.

pub mod collectd;
pub mod graphite;
pub mod json;
pub mod statsd;

use crate::config::Config;
use crate::observability::{EXPORT_SUCCESS_TOTAL, EXPORT_TOTAL};
use crate::store::{Kind, LabelSet, Metric, Store};
use metrics::counter;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on dialling a target and on each write to it
const IO_DEADLINE: Duration = Duration::from_secs(10);

/// Join `name` with sorted `key<ksep>value` pairs, replacing `ksep` and
/// `sep` inside keys and values with `rep`
pub fn format_labels(name: &str, labels: &BTreeMap<String, String>, ksep: &str, sep: &str, rep: &str) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let clean = |s: &str| s.replace(ksep, rep).replace(sep, rep);
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}{}{}", clean(k), ksep, clean(v)))
        .collect();
    format!("{}{}{}", name, sep, pairs.join(sep))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Collectd,
    Graphite,
    Statsd,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Collectd => "collectd",
            Protocol::Graphite => "graphite",
            Protocol::Statsd => "statsd",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub protocol: Protocol,
    /// Socket path for collectd, `host:port` otherwise
    pub address: String,
    pub prefix: String,
}

impl PushTarget {
    /// Targets named by `config`, in collectd, graphite, statsd order
    pub fn from_config(config: &Config) -> Vec<PushTarget> {
        let mut targets = Vec::new();
        if let Some(address) = &config.collectd_socketpath {
            targets.push(PushTarget {
                protocol: Protocol::Collectd,
                address: address.clone(),
                prefix: config.collectd_prefix.clone(),
            });
        }
        if let Some(address) = &config.graphite_host_port {
            targets.push(PushTarget {
                protocol: Protocol::Graphite,
                address: address.clone(),
                prefix: config.graphite_prefix.clone(),
            });
        }
        if let Some(address) = &config.statsd_hostport {
            targets.push(PushTarget {
                protocol: Protocol::Statsd,
                address: address.clone(),
                prefix: config.statsd_prefix.clone(),
            });
        }
        targets
    }
}

#[derive(Debug, Clone)]
pub struct ExporterOptions {
    pub hostname: String,
    /// Zero disables the periodic push
    pub push_interval: Duration,
    pub targets: Vec<PushTarget>,
}

impl ExporterOptions {
    pub fn from_config(config: &Config) -> Self {
        ExporterOptions {
            hostname: config.hostname.clone().unwrap_or_else(system_hostname),
            push_interval: config.push_interval(),
            targets: PushTarget::from_config(config),
        }
    }
}

fn system_hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .find_map(|path| {
            std::fs::read_to_string(path)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// An open connection to a push target
enum Conn {
    Unix(UnixStream),
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Conn {
    async fn dial(protocol: Protocol, address: &str) -> io::Result<Conn> {
        match protocol {
            Protocol::Collectd => UnixStream::connect(address).await.map(Conn::Unix),
            Protocol::Graphite => TcpStream::connect(address).await.map(Conn::Tcp),
            Protocol::Statsd => {
                let remote = tokio::net::lookup_host(address)
                    .await?
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}", address)))?;
                let local = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(remote).await?;
                Ok(Conn::Udp(socket))
            }
        }
    }

    /// Datagram targets get one packet per line
    async fn write(&mut self, data: &str) -> io::Result<()> {
        match self {
            Conn::Unix(s) => s.write_all(data.as_bytes()).await,
            Conn::Tcp(s) => s.write_all(data.as_bytes()).await,
            Conn::Udp(s) => s.send(data.as_bytes()).await.map(|_| ()),
        }
    }

    async fn close(self) -> io::Result<()> {
        match self {
            Conn::Unix(mut s) => s.shutdown().await,
            Conn::Tcp(mut s) => s.shutdown().await,
            Conn::Udp(_) => Ok(()),
        }
    }
}

fn exported(metric: &Metric) -> bool {
    metric.kind != Kind::Text && !metric.hidden
}

pub struct Exporter {
    store: Arc<Store>,
    options: ExporterOptions,
}

impl Exporter {
    pub fn new(store: Arc<Store>, options: ExporterOptions) -> Self {
        Exporter { store, options }
    }

    pub fn options(&self) -> &ExporterOptions {
        &self.options
    }

    /// Render one line per label set for `target`
    pub fn format_line(&self, target: &PushTarget, metric: &Metric, labels: &LabelSet) -> String {
        let interval = self.options.push_interval;
        match target.protocol {
            Protocol::Collectd => {
                collectd::metric_to_collectd(&self.options.hostname, &target.prefix, metric, labels, interval)
            }
            Protocol::Graphite => graphite::metric_to_graphite(&target.prefix, metric, labels, interval),
            Protocol::Statsd => statsd::metric_to_statsd(&target.prefix, metric, labels, interval),
        }
    }

    /// Snapshot of every exported line for `target`
    pub fn lines(&self, target: &PushTarget) -> Vec<String> {
        let mut lines = Vec::new();
        self.store.range(|metric| {
            if !exported(metric) {
                return;
            }
            for labels in metric.label_sets() {
                lines.push(self.format_line(target, metric, &labels));
            }
        });
        lines
    }

    /// Push the current snapshot to one target
    pub async fn push_target(&self, target: &PushTarget) -> io::Result<()> {
        let lines = self.lines(target);
        let mut conn = timeout(IO_DEADLINE, Conn::dial(target.protocol, &target.address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial deadline exceeded"))??;
        for line in &lines {
            timeout(IO_DEADLINE, conn.write(line))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded"))??;
        }
        conn.close().await?;
        debug!(target = %target.protocol, address = %target.address, lines = lines.len(), "pushed");
        Ok(())
    }

    /// Push to every target; failures are logged and left for next time
    pub async fn push(&self) {
        for target in &self.options.targets {
            let name = target.protocol.to_string();
            counter!(EXPORT_TOTAL, "target" => name.clone()).increment(1);
            match self.push_target(target).await {
                Ok(()) => counter!(EXPORT_SUCCESS_TOTAL, "target" => name).increment(1),
                Err(err) => warn!(target = %name, address = %target.address, error = %err, "push failed"),
            }
        }
    }

    /// Push every interval until `cancel` fires.
    ///
    /// Returns `None` when there is nothing to push to or the interval is zero.
    pub fn spawn_push_loop(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.options.targets.is_empty() || self.options.push_interval.is_zero() {
            return None;
        }
        info!(
            interval = ?self.options.push_interval,
            targets = self.options.targets.len(),
            "starting push loop"
        );
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.options.push_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.push().await,
                }
            }
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::ValueType;
    use chrono::{DateTime, TimeZone, Utc};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, UnixListener};

    pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// The label set for `values`, after setting it to `value` at `when`
    pub(crate) fn label_set(metric: &Metric, values: &[&str], value: i64, when: DateTime<Utc>) -> LabelSet {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let datum = metric.get_datum(&values).unwrap();
        datum.set_int(value, when);
        LabelSet {
            labels: metric.keys.iter().cloned().zip(values).collect(),
            datum,
        }
    }

    fn store_with_metrics() -> Arc<Store> {
        let store = Arc::new(Store::new());
        let foo = store
            .add(Metric::new("foo", "prog", Kind::Counter, ValueType::Int, vec![]))
            .unwrap();
        foo.get_datum(&[]).unwrap().set_int(37, ts(1343124840));
        let text = store
            .add(Metric::new("note", "prog", Kind::Text, ValueType::String, vec![]))
            .unwrap();
        text.get_datum(&[]).unwrap().set_string("hi", ts(1));
        let hidden = store
            .add(Metric::new("secret", "prog", Kind::Gauge, ValueType::Int, vec![]).hidden(true))
            .unwrap();
        hidden.get_datum(&[]).unwrap().set_int(1, ts(1));
        store
    }

    fn exporter(store: Arc<Store>, targets: Vec<PushTarget>) -> Exporter {
        Exporter::new(
            store,
            ExporterOptions {
                hostname: "gunstar".to_string(),
                push_interval: Duration::from_secs(60),
                targets,
            },
        )
    }

    #[test]
    fn test_format_labels() {
        let mut labels = BTreeMap::new();
        assert_eq!(format_labels("m", &labels, ".", ".", "_"), "m");
        labels.insert("b".to_string(), "x.y".to_string());
        labels.insert("a".to_string(), "1".to_string());
        assert_eq!(format_labels("m", &labels, ".", ".", "_"), "m.a.1.b.x_y");
        assert_eq!(format_labels("m", &labels, "-", "-", "_"), "m-a-1-b-x.y");
    }

    #[test]
    fn test_format_labels_replaces_both_separators() {
        let mut labels = BTreeMap::new();
        labels.insert("k=ey".to_string(), "a,b=c".to_string());
        assert_eq!(format_labels("m", &labels, "=", ",", "_"), "m,k_ey=a_b_c");
    }

    #[test]
    fn test_text_and_hidden_metrics_are_skipped() {
        let target = PushTarget {
            protocol: Protocol::Statsd,
            address: "127.0.0.1:8125".to_string(),
            prefix: String::new(),
        };
        let exp = exporter(store_with_metrics(), vec![target.clone()]);
        assert_eq!(exp.lines(&target), vec!["prog.foo:37|c"]);
    }

    #[test]
    fn test_targets_from_config() {
        let config = Config {
            collectd_socketpath: Some("/run/collectd.sock".to_string()),
            statsd_hostport: Some("localhost:8125".to_string()),
            statsd_prefix: "x.".to_string(),
            ..Config::default()
        };
        let targets = PushTarget::from_config(&config);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].protocol, Protocol::Collectd);
        assert_eq!(targets[1].prefix, "x.");
        assert!(!ExporterOptions::from_config(&config).hostname.is_empty());
    }

    #[tokio::test]
    async fn test_push_to_graphite() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let received = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = String::new();
            conn.read_to_string(&mut buf).await.unwrap();
            buf
        });

        let target = PushTarget {
            protocol: Protocol::Graphite,
            address,
            prefix: String::new(),
        };
        let exp = exporter(store_with_metrics(), vec![target]);
        exp.push().await;
        assert_eq!(received.await.unwrap(), "prog.foo 37 1343124840\n");
    }

    #[tokio::test]
    async fn test_push_to_collectd_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collectd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let received = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = String::new();
            conn.read_to_string(&mut buf).await.unwrap();
            buf
        });

        let target = PushTarget {
            protocol: Protocol::Collectd,
            address: path.to_string_lossy().into_owned(),
            prefix: String::new(),
        };
        exporter(store_with_metrics(), vec![target.clone()])
            .push_target(&target)
            .await
            .unwrap();
        assert_eq!(
            received.await.unwrap(),
            "PUTVAL \"gunstar/mtail-prog/counter-foo\" interval=60 1343124840:37\n"
        );
    }

    #[tokio::test]
    async fn test_push_to_statsd() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = PushTarget {
            protocol: Protocol::Statsd,
            address: server.local_addr().unwrap().to_string(),
            prefix: "pre.".to_string(),
        };
        exporter(store_with_metrics(), vec![target.clone()])
            .push_target(&target)
            .await
            .unwrap();
        let mut buf = [0u8; 128];
        let n = timeout(Duration::from_secs(2), server.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"pre.prog.foo:37|c");
    }

    #[tokio::test]
    async fn test_failed_push_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let target = PushTarget {
            protocol: Protocol::Collectd,
            address: dir.path().join("absent.sock").to_string_lossy().into_owned(),
            prefix: String::new(),
        };
        let exp = exporter(store_with_metrics(), vec![target.clone()]);
        assert!(exp.push_target(&target).await.is_err());
        exp.push().await;
    }

    #[test]
    fn test_no_push_loop_without_targets_or_interval() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let cancel = CancellationToken::new();
        assert!(Arc::new(exporter(store_with_metrics(), vec![])).spawn_push_loop(cancel.clone()).is_none());

        let target = PushTarget {
            protocol: Protocol::Statsd,
            address: "127.0.0.1:8125".to_string(),
            prefix: String::new(),
        };
        let mut exp = exporter(store_with_metrics(), vec![target]);
        exp.options.push_interval = Duration::ZERO;
        assert!(Arc::new(exp).spawn_push_loop(cancel).is_none());
    }
}
