//! Socket streams: listeners accept connections, datagram sockets split
//! each packet into lines.

use super::reader::LineReader;
use super::{Context, SocketKind, read_to_close};
use crate::error::{Error, Result};
use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket, UnixDatagram, UnixListener};
use tracing::{debug, info};

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 65536;

pub(super) enum Socket {
    Unix(UnixListener),
    Tcp(TcpListener),
    Unixgram(UnixDatagram),
    Udp(UdpSocket),
}

pub(super) async fn bind(kind: SocketKind, address: &str) -> Result<Socket> {
    let bound = match kind {
        SocketKind::Unix => UnixListener::bind(address).map(Socket::Unix),
        SocketKind::Unixgram => UnixDatagram::bind(address).map(Socket::Unixgram),
        SocketKind::Tcp => TcpListener::bind(address).await.map(Socket::Tcp),
        SocketKind::Udp => UdpSocket::bind(address).await.map(Socket::Udp),
    };
    let socket = bound.map_err(|err| Error::io(format!("{}://{}", kind, address), err))?;
    info!(%kind, address, "listening for log lines");
    Ok(socket)
}

pub(super) async fn run(ctx: Context, socket: Socket) {
    match socket {
        Socket::Unix(listener) => {
            let listener = &listener;
            accept_loop(&ctx, || async move { listener.accept().await.map(|(s, _)| s) }).await;
            remove_socket_file(&ctx).await;
        }
        Socket::Tcp(listener) => {
            let listener = &listener;
            accept_loop(&ctx, || async move { listener.accept().await.map(|(s, _)| s) }).await;
        }
        Socket::Unixgram(socket) => {
            let socket = &socket;
            datagram_loop(&ctx, || async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            })
            .await;
            remove_socket_file(&ctx).await;
        }
        Socket::Udp(socket) => {
            let socket = &socket;
            datagram_loop(&ctx, || async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            })
            .await;
        }
    }
    ctx.finish();
}

/// Accept connections until cancelled, reading each on its own task.
///
/// In one-shot mode the first connection is read inline and then the
/// listener closes.
async fn accept_loop<S, F, Fut>(ctx: &Context, mut accept: F)
where
    S: tokio::io::AsyncRead + Unpin + Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<S>>,
{
    loop {
        let conn = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            conn = accept() => conn,
        };
        let conn = match conn {
            Ok(conn) => conn,
            Err(err) => {
                ctx.read_error(&err);
                return;
            }
        };
        debug!(pathname = %ctx.pathname, "connection accepted");

        let token = ctx.cancel.child_token();
        if ctx.options.one_shot {
            read_to_close(ctx, &token, conn, Arc::clone(&ctx.pathname)).await;
            token.cancel();
            return;
        }
        let conn_ctx = ctx.clone();
        ctx.tracker.spawn(async move {
            read_to_close(&conn_ctx, &token, conn, Arc::clone(&conn_ctx.pathname)).await;
            // releases this connection's deadline task
            token.cancel();
        });
    }
}

/// Feed every datagram through a fresh line reader
async fn datagram_loop<F, Fut>(ctx: &Context, mut recv: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<Vec<u8>>>,
{
    loop {
        let packet = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            packet = recv() => packet,
        };
        let packet = match packet {
            Ok(packet) => packet,
            Err(err) => {
                ctx.read_error(&err);
                return;
            }
        };

        let mut reader = LineReader::new(Arc::clone(&ctx.pathname));
        let mut lines = reader.feed(&packet);
        lines.extend(reader.flush());
        if !ctx.send(lines).await || ctx.options.one_shot {
            return;
        }
    }
}

async fn remove_socket_file(ctx: &Context) {
    if let Err(err) = tokio::fs::remove_file(&*ctx.pathname).await
        && err.kind() != io::ErrorKind::NotFound
    {
        debug!(pathname = %ctx.pathname, error = %err, "failed to remove socket file");
    }
}
