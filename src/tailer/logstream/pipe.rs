//! Named pipe stream, read until the last writer closes

use super::cancel::{is_exitable, read_with_deadline};
use super::reader::LineReader;
use super::{Context, READ_SIZE, io_error};
use crate::error::Result;
use std::sync::Arc;
use tokio::net::unix::pipe;
use tracing::debug;

pub(super) fn open(path: &str) -> Result<pipe::Receiver> {
    pipe::OpenOptions::new()
        .open_receiver(path)
        .map_err(|err| io_error(path, err))
}

pub(super) async fn run(ctx: Context, mut pipe: pipe::Receiver) {
    let deadline = ctx.deadline(&ctx.cancel);
    let mut reader = LineReader::new(Arc::clone(&ctx.pathname));
    let mut buf = vec![0u8; READ_SIZE];
    let mut seen_data = false;

    loop {
        match read_with_deadline(&mut pipe, &mut buf, &deadline).await {
            Ok(0) if seen_data || ctx.options.one_shot => {
                debug!(pathname = %ctx.pathname, "pipe writer closed");
                break;
            }
            Ok(0) => {
                // no writer has connected yet
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break,
                    _ = ctx.options.waker.wait() => {}
                }
            }
            Ok(n) => {
                seen_data = true;
                if !ctx.send(reader.feed(&buf[..n])).await {
                    break;
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
    ctx.finish();
}

#[cfg(test)]
mod tests {
    use crate::tailer::logstream::{LogStream, StreamKind, StreamOptions};
    use crate::waker::Waker;
    use std::process::Command;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::unix::pipe;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    #[tokio::test]
    async fn test_pipe_reads_until_writer_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo");
        let status = Command::new("mkfifo").arg(&path).status().unwrap();
        assert!(status.success());

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let options = StreamOptions {
            waker: Waker::timed(Duration::from_millis(10)),
            one_shot: false,
            from_start: true,
        };
        let mut stream = LogStream::new(&tracker, &cancel, path.to_str().unwrap(), StreamKind::Pipe, options)
            .await
            .unwrap();
        let mut lines = stream.lines().unwrap();

        let mut writer = pipe::OpenOptions::new().open_sender(&path).unwrap();
        writer.write_all(b"1\n2\n3").await.unwrap();
        drop(writer);

        let mut got = Vec::new();
        while let Some(line) = timeout(Duration::from_secs(2), lines.recv()).await.unwrap() {
            got.push(line.line);
        }
        assert_eq!(got, vec!["1", "2", "3"]);
        assert!(stream.is_complete());
    }
}
