//! Per-source readers feeding [`LogLine`]s to the tailer
//!
//! A [`LogStream`] owns one source (file, pipe, socket or stdin) and a task
//! that reads it. Lines arrive on the channel handed out by
//! [`LogStream::lines`] in the order they were read; the channel closes when
//! the reader exits.

pub mod cancel;
mod file;
mod pipe;
pub mod reader;
mod socket;
mod stdin;

use crate::error::{Error, Result};
use crate::logline::LogLine;
use crate::observability::LOG_ERRORS_TOTAL;
use crate::waker::Waker;
use cancel::{ReadDeadline, is_exitable, read_with_deadline, set_deadline_on_done};
use metrics::counter;
use reader::LineReader;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Lines buffered between a reader and the tailer
const LINE_BUFFER: usize = 1024;
/// Bytes requested per read
const READ_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Unix,
    Unixgram,
    Tcp,
    Udp,
}

impl SocketKind {
    /// Map a URL scheme to a socket kind
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "unix" => Some(SocketKind::Unix),
            "unixgram" => Some(SocketKind::Unixgram),
            "tcp" => Some(SocketKind::Tcp),
            "udp" => Some(SocketKind::Udp),
            _ => None,
        }
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, SocketKind::Unixgram | SocketKind::Udp)
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketKind::Unix => "unix",
            SocketKind::Unixgram => "unixgram",
            SocketKind::Tcp => "tcp",
            SocketKind::Udp => "udp",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    File,
    Pipe,
    Socket(SocketKind),
    Stdin,
}

/// How a stream reads its source
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Wakes the reader when it is idle at end of input
    pub waker: Waker,
    /// Read to the end once, then complete
    pub one_shot: bool,
    /// Start a file at offset 0 instead of its current end
    pub from_start: bool,
}

/// A running reader over one log source
#[derive(Debug)]
pub struct LogStream {
    kind: StreamKind,
    pathname: String,
    lines: Option<mpsc::Receiver<LogLine>>,
    cancel: CancellationToken,
    complete: Arc<AtomicBool>,
}

impl LogStream {
    /// Open `pathname` and start its reader on `tracker`.
    ///
    /// The stream stops when `cancel` fires, when [`LogStream::stop`] is
    /// called, or when its source is exhausted.
    pub async fn new(
        tracker: &TaskTracker,
        cancel: &CancellationToken,
        pathname: &str,
        kind: StreamKind,
        options: StreamOptions,
    ) -> Result<LogStream> {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let ctx = Context {
            pathname: Arc::from(pathname),
            tx,
            cancel: cancel.child_token(),
            tracker: tracker.clone(),
            options,
            complete: Arc::new(AtomicBool::new(false)),
        };
        let stream = LogStream {
            kind,
            pathname: pathname.to_string(),
            lines: Some(rx),
            cancel: ctx.cancel.clone(),
            complete: Arc::clone(&ctx.complete),
        };

        match kind {
            StreamKind::File => {
                let file = file::open(pathname).await?;
                tracker.spawn(file::run(ctx, file));
            }
            StreamKind::Pipe => {
                let pipe = pipe::open(pathname)?;
                tracker.spawn(pipe::run(ctx, pipe));
            }
            StreamKind::Socket(socket_kind) => {
                let socket = socket::bind(socket_kind, pathname).await?;
                tracker.spawn(socket::run(ctx, socket));
            }
            StreamKind::Stdin => {
                tracker.spawn(stdin::run(ctx, tokio::io::stdin()));
            }
        }
        debug!(pathname, ?kind, "log stream started");
        Ok(stream)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    /// The line channel. Handed out once; later calls return `None`.
    pub fn lines(&mut self) -> Option<mpsc::Receiver<LogLine>> {
        self.lines.take()
    }

    /// Ask the reader to finish; buffered partial input is flushed
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// True once the reader has exited
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// State shared by a stream's reader tasks
#[derive(Debug, Clone)]
struct Context {
    pathname: Arc<str>,
    tx: mpsc::Sender<LogLine>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    options: StreamOptions,
    complete: Arc<AtomicBool>,
}

impl Context {
    /// Forward `lines`; false once nobody is listening
    async fn send(&self, lines: Vec<LogLine>) -> bool {
        for line in lines {
            if self.tx.send(line).await.is_err() {
                debug!(pathname = %self.pathname, "line receiver dropped");
                return false;
            }
        }
        true
    }

    async fn flush(&self, reader: &mut LineReader) -> bool {
        match reader.flush() {
            Some(line) => self.send(vec![line]).await,
            None => true,
        }
    }

    /// A read deadline that is set when `token` is cancelled
    fn deadline(&self, token: &CancellationToken) -> ReadDeadline {
        let deadline = ReadDeadline::new();
        set_deadline_on_done(&self.tracker, token.clone(), deadline.clone());
        deadline
    }

    fn read_error(&self, err: &std::io::Error) {
        warn!(pathname = %self.pathname, error = %err, "read failed");
        counter!(LOG_ERRORS_TOTAL, "logfile" => self.pathname.to_string()).increment(1);
    }

    /// Mark the stream done and release its deadline task
    fn finish(&self) {
        self.complete.store(true, Ordering::Release);
        self.cancel.cancel();
        debug!(pathname = %self.pathname, "log stream complete");
    }
}

/// Read `source` until it closes or `token` is cancelled, then flush
async fn read_to_close<R>(ctx: &Context, token: &CancellationToken, mut source: R, filename: Arc<str>)
where
    R: AsyncRead + Unpin,
{
    let deadline = ctx.deadline(token);
    let mut reader = LineReader::new(filename);
    let mut buf = vec![0u8; READ_SIZE];
    loop {
        match read_with_deadline(&mut source, &mut buf, &deadline).await {
            Ok(0) => break,
            Ok(n) => {
                if !ctx.send(reader.feed(&buf[..n])).await {
                    return;
                }
            }
            Err(err) if is_exitable(&err) => break,
            Err(err) => {
                ctx.read_error(&err);
                break;
            }
        }
    }
    ctx.flush(&mut reader).await;
}

fn io_error(path: &str, err: std::io::Error) -> Error {
    counter!(LOG_ERRORS_TOTAL, "logfile" => path.to_string()).increment(1);
    Error::io(path, err)
}
