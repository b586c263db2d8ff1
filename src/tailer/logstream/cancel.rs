//! Read deadlines used to interrupt blocked reads on cancellation

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// A settable deadline shared between a reader and whoever wants to stop it
#[derive(Debug, Clone)]
pub struct ReadDeadline {
    tx: Arc<watch::Sender<Option<Instant>>>,
}

impl Default for ReadDeadline {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadDeadline {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        ReadDeadline { tx: Arc::new(tx) }
    }

    pub fn set(&self, at: Instant) {
        self.tx.send_replace(Some(at));
    }

    pub fn expired(&self) -> bool {
        matches!(*self.tx.borrow(), Some(at) if at <= Instant::now())
    }

    /// Resolve once the deadline has passed
    pub async fn passed(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        _ = rx.changed() => {}
                    }
                }
                None => {
                    // `self.tx` outlives this future, so changed() only returns on a set
                    let _ = rx.changed().await;
                }
            }
        }
    }
}

/// Read into `buf`, failing with `TimedOut` once `deadline` passes
pub async fn read_with_deadline<R>(reader: &mut R, buf: &mut [u8], deadline: &ReadDeadline) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        biased;
        _ = deadline.passed() => Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")),
        result = reader.read(buf) => result,
    }
}

/// Set an immediate deadline on `deadline` once `cancel` fires
pub fn set_deadline_on_done(tracker: &TaskTracker, cancel: CancellationToken, deadline: ReadDeadline) {
    tracker.spawn(async move {
        cancel.cancelled().await;
        debug!("cancelled, setting read deadline to interrupt read");
        deadline.set(Instant::now());
    });
}

/// True when a stream should stop reading because of `err`
pub fn is_exitable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_deadline_interrupts_blocked_read() {
        // the writer half stays open, so the read would block forever
        let (mut reader, _writer) = tokio::io::duplex(64);
        let deadline = ReadDeadline::new();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        set_deadline_on_done(&tracker, cancel.clone(), deadline.clone());

        let read = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            read_with_deadline(&mut reader, &mut buf, &deadline).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!read.is_finished());
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), read)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(is_exitable(&err));
    }

    #[tokio::test]
    async fn test_data_before_deadline_is_read() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"hello").await.unwrap();
        let deadline = ReadDeadline::new();
        let mut buf = [0u8; 16];
        let n = read_with_deadline(&mut reader, &mut buf, &deadline).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(!deadline.expired());
    }

    #[test]
    fn test_exitable_errors() {
        assert!(is_exitable(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_exitable(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
