//! Tailer: finds log sources and merges their lines into one channel
//!
//! Patterns are globbed when added and again on every tick of the pattern
//! waker. Each new path gets a [`LogStream`]; a forwarding task copies its
//! lines into the shared channel. The channel closes only after every
//! stream and forwarder has exited.

pub mod logstream;

use crate::error::{Error, Result};
use crate::logline::LogLine;
use crate::observability::{LINES_TOTAL, LOG_COUNT};
use crate::waker::Waker;
use logstream::{LogStream, SocketKind, StreamKind, StreamOptions};
use metrics::{counter, gauge};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TailerOptions {
    pub one_shot: bool,
    /// Base names matching this are never tailed
    pub ignore_regex: Option<Regex>,
    /// Drives re-globbing; `None` disables the pattern poller
    pub pattern_waker: Option<Waker>,
    /// Wakes idle streams to check for new input
    pub stream_waker: Waker,
}

#[derive(Debug)]
struct Inner {
    lines: Mutex<Option<mpsc::Sender<LogLine>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    done: CancellationToken,
    globs: Mutex<BTreeSet<String>>,
    streams: tokio::sync::Mutex<HashMap<String, LogStream>>,
    options: TailerOptions,
}

/// Handle to a running tailer
#[derive(Debug, Clone)]
pub struct Tailer {
    inner: Arc<Inner>,
}

impl Tailer {
    /// Start tailing `patterns`, sending every line to `lines`.
    ///
    /// The tailer stops when `cancel` fires. In one-shot mode it also stops
    /// on its own once every stream is done.
    pub async fn new(
        lines: mpsc::Sender<LogLine>,
        cancel: &CancellationToken,
        options: TailerOptions,
        patterns: &[String],
    ) -> Result<Tailer> {
        let tailer = Tailer {
            inner: Arc::new(Inner {
                lines: Mutex::new(Some(lines)),
                cancel: cancel.child_token(),
                tracker: TaskTracker::new(),
                done: CancellationToken::new(),
                globs: Mutex::new(BTreeSet::new()),
                streams: tokio::sync::Mutex::new(HashMap::new()),
                options,
            }),
        };

        for pattern in patterns {
            if let Err(err) = tailer.add_pattern(pattern).await {
                tailer.inner.cancel.cancel();
                return Err(err);
            }
        }

        if !tailer.inner.options.one_shot {
            match tailer.inner.options.pattern_waker.clone() {
                Some(waker) => {
                    let poller = tailer.clone();
                    tailer.inner.tracker.spawn(async move { poller.poll_patterns(waker).await });
                }
                None => {
                    // a following tailer only stops on cancel
                    let cancel = tailer.inner.cancel.clone();
                    tailer.inner.tracker.spawn(async move { cancel.cancelled().await });
                }
            }
        }

        tailer.inner.tracker.close();
        let supervisor = Arc::clone(&tailer.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = supervisor.tracker.wait() => {}
                _ = supervisor.cancel.cancelled() => {}
            }
            supervisor.cancel.cancel();
            supervisor.tracker.wait().await;
            supervisor.lines.lock().unwrap_or_else(PoisonError::into_inner).take();
            info!("all log streams closed");
            supervisor.done.cancel();
        });

        Ok(tailer)
    }

    /// Tail everything `pattern` names: a socket URL, stdin, or a glob
    pub async fn add_pattern(&self, pattern: &str) -> Result<()> {
        let pattern = pattern.strip_prefix("file://").unwrap_or(pattern);
        if let Some((scheme, address)) = pattern.split_once("://") {
            let kind = SocketKind::from_scheme(scheme).ok_or_else(|| Error::UnsupportedScheme(pattern.to_string()))?;
            return self.tail_stream(address, StreamKind::Socket(kind), true).await;
        }
        if pattern == "-" || pattern == "/dev/stdin" {
            return self.tail_stream("-", StreamKind::Stdin, true).await;
        }

        let absolute = absolute(pattern).map_err(|err| Error::io(pattern, err))?;
        let absolute = absolute.to_string_lossy().into_owned();
        // validate before remembering it
        glob::Pattern::new(&absolute).map_err(|source| Error::Glob {
            pattern: absolute.clone(),
            source,
        })?;
        self.inner
            .globs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(absolute.clone());
        debug!(pattern = %absolute, "pattern added");

        let from_start = self.inner.options.one_shot;
        self.glob_and_tail(&absolute, from_start).await
    }

    /// True when `path` should not be tailed
    pub fn ignore(&self, path: &str) -> bool {
        let Ok(absolute) = absolute(path) else {
            return true;
        };
        let Ok(meta) = std::fs::metadata(&absolute) else {
            return true;
        };
        if meta.is_dir() {
            return true;
        }
        match (&self.inner.options.ignore_regex, absolute.file_name()) {
            (Some(re), Some(base)) => re.is_match(&base.to_string_lossy()),
            _ => false,
        }
    }

    /// Tail one filesystem path, unless it is already tailed
    pub async fn tail_path(&self, path: &str, from_start: bool) -> Result<()> {
        let meta = tokio::fs::metadata(path).await.map_err(|err| Error::io(path, err))?;
        let file_type = meta.file_type();
        let kind = if file_type.is_file() {
            StreamKind::File
        } else if file_type.is_fifo() {
            StreamKind::Pipe
        } else {
            return Err(Error::UnsupportedFileType { path: path.to_string() });
        };
        self.tail_stream(path, kind, from_start).await
    }

    /// Paths currently tailed, sorted
    pub async fn streams(&self) -> Vec<String> {
        let streams = self.inner.streams.lock().await;
        let mut paths: Vec<String> = streams.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Stop every stream and the poller
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Block until every stream has exited and the line channel is closed
    pub async fn wait(&self) {
        self.inner.done.cancelled().await;
    }

    async fn glob_and_tail(&self, pattern: &str, from_start: bool) -> Result<()> {
        let paths = glob::glob(pattern).map_err(|source| Error::Glob {
            pattern: pattern.to_string(),
            source,
        })?;
        for entry in paths {
            let path = match entry {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(err) => {
                    warn!(pattern, error = %err, "glob entry unreadable");
                    continue;
                }
            };
            if self.ignore(&path) || self.is_tailed(&path).await {
                continue;
            }
            if let Err(err) = self.tail_path(&path, from_start).await {
                warn!(path, error = %err, "failed to tail path");
            }
        }
        Ok(())
    }

    async fn is_tailed(&self, path: &str) -> bool {
        self.inner.streams.lock().await.contains_key(path)
    }

    async fn tail_stream(&self, path: &str, kind: StreamKind, from_start: bool) -> Result<()> {
        let sender = self
            .inner
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::Shutdown)?;

        let mut streams = self.inner.streams.lock().await;
        if streams.contains_key(path) {
            debug!(path, "already tailing");
            return Ok(());
        }

        let options = StreamOptions {
            waker: self.inner.options.stream_waker.clone(),
            one_shot: self.inner.options.one_shot,
            from_start,
        };
        let mut stream = LogStream::new(&self.inner.tracker, &self.inner.cancel, path, kind, options).await?;
        let mut rx = stream.lines().ok_or(Error::Shutdown)?;
        streams.insert(path.to_string(), stream);
        gauge!(LOG_COUNT).set(streams.len() as f64);
        drop(streams);
        info!(path, ?kind, "tailing");

        let inner = Arc::clone(&self.inner);
        let key = path.to_string();
        self.inner.tracker.spawn(async move {
            let lines_total = counter!(LINES_TOTAL, "logfile" => key.clone());
            while let Some(line) = rx.recv().await {
                lines_total.increment(1);
                if sender.send(line).await.is_err() {
                    debug!(path = %key, "merged line channel closed");
                    break;
                }
            }
            let mut streams = inner.streams.lock().await;
            streams.remove(&key);
            gauge!(LOG_COUNT).set(streams.len() as f64);
            debug!(path = %key, "stream removed");
        });
        Ok(())
    }

    async fn poll_patterns(&self, waker: Waker) {
        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => return,
                _ = waker.wait() => {}
            }
            let patterns: Vec<String> = self
                .inner
                .globs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect();
            for pattern in patterns {
                if let Err(err) = self.glob_and_tail(&pattern, true).await {
                    warn!(pattern, error = %err, "pattern poll failed");
                }
            }
        }
    }
}

fn absolute(path: &str) -> std::io::Result<PathBuf> {
    std::path::absolute(Path::new(path))
}
