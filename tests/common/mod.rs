//! Minimal HTTP/1.1 fixture server for transfer tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Honour `Range` and send the whole remainder.
    Serve,
    /// Answer every request with this status and no body.
    Status(u16),
    /// First connection sends `after` body bytes then hangs; later ones serve.
    StallOnce { after: usize },
    /// Every connection sends `after` body bytes then hangs.
    StallAlways { after: usize },
    /// 200 with a close-delimited body and no `Content-Length`.
    NoLength,
    /// Always 200 with the full body, whatever `Range` says.
    IgnoreRange,
    /// First connection declares the full length, sends `after` body bytes
    /// and closes; later ones serve.
    CloseOnce { after: usize },
    /// Wait `delay` before answering each request, then serve.
    SlowHeaders { delay: Duration },
}

pub struct TestServer {
    addr: SocketAddr,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

impl TestServer {
    pub async fn start(body: Vec<u8>, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let body = Arc::new(body);
        let connections = Arc::new(AtomicUsize::new(0));

        let recorded = ranges.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let body = body.clone();
                let recorded = recorded.clone();
                let index = connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = handle(socket, &body, behavior, index, &recorded).await;
                });
            }
        });

        Self { addr, ranges }
    }

    pub fn url(&self) -> String {
        format!("http://{}/stream.m4s", self.addr)
    }

    /// The `Range` header of every request received so far, in order.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }
}

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

async fn handle(
    mut socket: TcpStream,
    body: &[u8],
    behavior: Behavior,
    index: usize,
    recorded: &Mutex<Vec<Option<String>>>,
) -> std::io::Result<()> {
    let head = read_head(&mut socket).await?;
    let range = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    });
    recorded.lock().unwrap().push(range.clone());

    let start = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok())
        .unwrap_or(0);

    if let Behavior::SlowHeaders { delay } = behavior {
        tokio::time::sleep(delay).await;
    }

    let mut close_after = None;
    let stall_after = match behavior {
        Behavior::Status(code) => {
            let response = format!(
                "HTTP/1.1 {} Fixture\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                code
            );
            return socket.write_all(response.as_bytes()).await;
        }
        Behavior::NoLength => {
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
                .await?;
            write_body(&mut socket, body).await?;
            return socket.shutdown().await;
        }
        Behavior::IgnoreRange => {
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(response.as_bytes()).await?;
            write_body(&mut socket, body).await?;
            return socket.shutdown().await;
        }
        Behavior::Serve | Behavior::SlowHeaders { .. } => None,
        Behavior::CloseOnce { after } => {
            close_after = (index == 0).then_some(after);
            None
        }
        Behavior::StallOnce { after } => (index == 0).then_some(after),
        Behavior::StallAlways { after } => Some(after),
    };

    if start >= body.len() && start > 0 {
        let response = format!(
            "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            body.len()
        );
        return socket.write_all(response.as_bytes()).await;
    }

    let remainder = &body[start..];
    let response = if range.is_some() {
        format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            start,
            body.len() - 1,
            body.len(),
            remainder.len()
        )
    } else {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            remainder.len()
        )
    };
    socket.write_all(response.as_bytes()).await?;

    if let Some(after) = close_after {
        write_body(&mut socket, &remainder[..after.min(remainder.len())]).await?;
        return socket.shutdown().await;
    }

    match stall_after {
        Some(after) => {
            let n = after.min(remainder.len());
            write_body(&mut socket, &remainder[..n]).await?;
            socket.flush().await?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
        None => {
            write_body(&mut socket, remainder).await?;
            socket.shutdown().await
        }
    }
}

async fn read_head(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn write_body(socket: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    for piece in body.chunks(16 * 1024) {
        socket.write_all(piece).await?;
    }
    Ok(())
}
