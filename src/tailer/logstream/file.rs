//! Regular file stream with truncation and rotation handling

use super::cancel::{is_exitable, read_with_deadline};
use super::reader::LineReader;
use super::{Context, READ_SIZE, io_error};
use crate::error::Result;
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// Device and inode of an open file
type Identity = (u64, u64);

pub(super) async fn open(path: &str) -> Result<File> {
    File::open(path).await.map_err(|err| io_error(path, err))
}

async fn identity(file: &File) -> Option<Identity> {
    file.metadata().await.ok().map(|m| (m.dev(), m.ino()))
}

enum Change {
    None,
    Truncated,
    Rotated(File),
}

/// Compare the open handle against what is now at `path`
async fn check(path: &str, file: &File, id: Option<Identity>, offset: u64) -> Change {
    if let Ok(meta) = tokio::fs::metadata(path).await
        && Some((meta.dev(), meta.ino())) != id
        && let Ok(new_file) = File::open(path).await
    {
        return Change::Rotated(new_file);
    }
    match file.metadata().await {
        Ok(meta) if meta.len() < offset => Change::Truncated,
        _ => Change::None,
    }
}

pub(super) async fn run(ctx: Context, mut file: File) {
    let path = Arc::clone(&ctx.pathname);
    let deadline = ctx.deadline(&ctx.cancel);
    let mut reader = LineReader::new(Arc::clone(&path));
    let mut id = identity(&file).await;
    let mut buf = vec![0u8; READ_SIZE];

    let mut offset = if ctx.options.from_start {
        0
    } else {
        match file.seek(SeekFrom::End(0)).await {
            Ok(end) => end,
            Err(err) => {
                ctx.read_error(&err);
                ctx.finish();
                return;
            }
        }
    };

    loop {
        match read_with_deadline(&mut file, &mut buf, &deadline).await {
            Ok(0) => {}
            Ok(n) => {
                offset += n as u64;
                if !ctx.send(reader.feed(&buf[..n])).await {
                    break;
                }
                continue;
            }
            Err(err) if is_exitable(&err) => break,
            Err(err) => {
                ctx.read_error(&err);
                break;
            }
        }

        if ctx.options.one_shot {
            break;
        }

        match check(&path, &file, id, offset).await {
            Change::Truncated => {
                info!(pathname = %path, offset, "file truncated, seeking to start");
                if let Err(err) = file.seek(SeekFrom::Start(0)).await {
                    ctx.read_error(&err);
                    break;
                }
                offset = 0;
                reader.reset();
                continue;
            }
            Change::Rotated(new_file) => {
                info!(pathname = %path, "file rotated, reopening");
                // drain whatever landed in the old file since the last read
                while let Ok(n) = file.read(&mut buf).await
                    && n > 0
                {
                    if !ctx.send(reader.feed(&buf[..n])).await {
                        ctx.finish();
                        return;
                    }
                }
                if !ctx.flush(&mut reader).await {
                    break;
                }
                file = new_file;
                id = identity(&file).await;
                offset = 0;
                continue;
            }
            Change::None => {}
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ctx.options.waker.wait() => {}
        }
    }

    debug!(pathname = %path, offset, "file stream exiting");
    ctx.flush(&mut reader).await;
    ctx.finish();
}
