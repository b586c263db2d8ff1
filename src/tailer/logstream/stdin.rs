//! Standard input stream, read until EOF

use super::{Context, read_to_close};
use std::sync::Arc;
use tokio::io::AsyncRead;

pub(super) async fn run<R>(ctx: Context, source: R)
where
    R: AsyncRead + Unpin,
{
    let token = ctx.cancel.clone();
    read_to_close(&ctx, &token, source, Arc::clone(&ctx.pathname)).await;
    ctx.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailer::logstream::StreamOptions;
    use crate::waker::Waker;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    fn context() -> (Context, mpsc::Receiver<crate::logline::LogLine>) {
        let (tx, rx) = mpsc::channel(16);
        let ctx = Context {
            pathname: Arc::from("-"),
            tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            options: StreamOptions {
                waker: Waker::timed(Duration::from_millis(10)),
                one_shot: false,
                from_start: true,
            },
            complete: Arc::new(AtomicBool::new(false)),
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_reads_until_eof_and_flushes() {
        let (ctx, mut rx) = context();
        let complete = Arc::clone(&ctx.complete);
        let (source, mut sink) = tokio::io::duplex(64);
        let task = tokio::spawn(run(ctx, source));

        sink.write_all(b"one\ntw").await.unwrap();
        sink.write_all(b"o").await.unwrap();
        drop(sink);

        assert_eq!(rx.recv().await.unwrap().line, "one");
        let last = rx.recv().await.unwrap();
        assert_eq!(last.line, "two");
        assert_eq!(&*last.filename, "-");
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(complete.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_read() {
        let (ctx, mut rx) = context();
        let cancel = ctx.cancel.clone();
        let (source, _sink) = tokio::io::duplex(64);
        let task = tokio::spawn(run(ctx, source));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }
}
