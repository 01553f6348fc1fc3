//! HTTP ingress server

use burrow_relay_db::{ConnectionLog, Repository};
use burrow_router::TunnelRegistry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Request heads larger than this are rejected outright.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Chunk size for streaming-sensitive response bodies.
const STREAM_CHUNK: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum HttpIngressError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Subdomain-routing HTTP ingress. One instance serves both the plaintext
/// and the TLS listener.
pub struct HttpIngress {
    domain: String,
    registry: Arc<TunnelRegistry>,
    repo: Option<Arc<dyn Repository>>,
}

impl HttpIngress {
    pub fn new(domain: impl Into<String>, registry: Arc<TunnelRegistry>) -> Self {
        Self {
            domain: domain.into(),
            registry,
            repo: None,
        }
    }

    /// Record proxied exchanges through the repository.
    pub fn with_repository(mut self, repo: Arc<dyn Repository>) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Plaintext accept loop.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let ingress = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = ingress.handle_connection(socket, peer_addr).await {
                            debug!(%peer_addr, "http connection ended with error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("http listener accept error: {}", e);
                }
            }
        }
    }

    /// TLS accept loop; after the handshake the plaintext path applies.
    pub async fn run_tls(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let ingress = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(socket).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(%peer_addr, "tls handshake failed: {}", e);
                                return;
                            }
                        };
                        if let Err(e) = ingress.handle_connection(tls_stream, peer_addr).await {
                            debug!(%peer_addr, "https connection ended with error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("https listener accept error: {}", e);
                }
            }
        }
    }

    /// Serve one public connection: route by Host, open a mux stream, relay
    /// the raw exchange.
    async fn handle_connection<S>(&self, mut socket: S, peer_addr: SocketAddr) -> Result<(), HttpIngressError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();

        let Some(head) = read_head(&mut socket).await? else {
            return Ok(());
        };
        let Some(request) = RequestHead::parse(&head.bytes[..head.head_len]) else {
            write_error(&mut socket, 400, "Bad Request", "Invalid request\n").await?;
            return Ok(());
        };

        if request.path == "/health" || request.path.starts_with("/health?") {
            return self.handle_health(&mut socket).await;
        }

        let Some(host) = request.host.as_deref() else {
            write_error(&mut socket, 400, "Bad Request", "No Host header\n").await?;
            return Ok(());
        };
        let Some(subdomain) = extract_subdomain(host, &self.domain) else {
            write_error(&mut socket, 400, "Bad Request", "Invalid subdomain\n").await?;
            return Ok(());
        };

        let Some(binding) = self.registry.get_by_subdomain(&subdomain) else {
            debug!(subdomain, "no tunnel for subdomain");
            write_error(&mut socket, 404, "Not Found", "Tunnel not found\n").await?;
            return Ok(());
        };

        let stream = match binding.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(subdomain, "failed to open stream: {}", e);
                write_error(&mut socket, 502, "Bad Gateway", "Failed to connect to tunnel\n").await?;
                return Ok(());
            }
        };

        let exchange = relay_exchange(socket, stream, &head.bytes).await?;
        let duration = started.elapsed();

        info!(
            subdomain,
            method = %request.method,
            path = %request.path,
            status = exchange.status.unwrap_or(0),
            bytes = exchange.bytes_to_client,
            ?duration,
            "request proxied"
        );

        if let Some(repo) = &self.repo {
            let entry = ConnectionLog {
                tunnel_id: binding.id.clone(),
                client_ip: Some(peer_addr.ip().to_string()),
                request_method: Some(request.method),
                request_path: Some(request.path),
                response_status: exchange.status.map(i32::from),
                bytes_sent: exchange.bytes_to_client as i64,
                bytes_received: exchange.bytes_from_client as i64,
                duration_ms: duration.as_millis() as i64,
            };
            if let Err(e) = repo.log_connection(entry).await {
                debug!("failed to record connection log: {}", e);
            }
        }

        Ok(())
    }

    async fn handle_health<S>(&self, socket: &mut S) -> Result<(), HttpIngressError>
    where
        S: AsyncWrite + Unpin,
    {
        let body = serde_json::json!({
            "status": "healthy",
            "tunnels": self.registry.count(),
        })
        .to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await?;
        socket.flush().await?;
        Ok(())
    }
}

/// Byte totals and response status of one relayed exchange.
struct Exchange {
    status: Option<u16>,
    bytes_to_client: u64,
    bytes_from_client: u64,
}

/// Relay one buffered request through `stream` and the response back over
/// `socket`. The client→stream direction keeps pumping concurrently so
/// request bodies and upgraded protocols flow; the response side decides
/// between exact-length, streaming (flush per chunk), and read-to-EOF
/// copies based on the response head.
async fn relay_exchange<S>(
    socket: S,
    stream: burrow_mux::MuxStream,
    buffered: &[u8],
) -> Result<Exchange, HttpIngressError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_r, mut client_w) = tokio::io::split(socket);
    let (mut stream_r, mut stream_w) = tokio::io::split(stream);

    stream_w.write_all(buffered).await?;
    stream_w.flush().await?;

    let bytes_from_client = Arc::new(AtomicU64::new(buffered.len() as u64));
    let upstream_counter = bytes_from_client.clone();
    let upstream = tokio::spawn(async move {
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = match client_r.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if stream_w.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if stream_w.flush().await.is_err() {
                break;
            }
            upstream_counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    });

    // Read the response head back from the tunnel.
    let Some(head) = read_head(&mut stream_r).await? else {
        upstream.abort();
        let _ = write_error(&mut client_w, 502, "Bad Gateway", "Failed to read response\n").await;
        return Ok(Exchange {
            status: None,
            bytes_to_client: 0,
            bytes_from_client: bytes_from_client.load(Ordering::Relaxed),
        });
    };
    let response = ResponseHead::parse(&head.bytes[..head.head_len]);

    client_w.write_all(&head.bytes).await?;
    client_w.flush().await?;
    let mut bytes_to_client = head.bytes.len() as u64;
    let body_prefix = (head.bytes.len() - head.head_len) as u64;

    match &response {
        Some(r) if r.status == 101 => {
            // Upgraded connection: transparent byte pipe until either side
            // closes. The upstream pump carries the client half.
            bytes_to_client += copy_streaming(&mut stream_r, &mut client_w).await?;
        }
        Some(r) if r.is_streaming => {
            bytes_to_client += copy_streaming(&mut stream_r, &mut client_w).await?;
        }
        Some(r) => match r.content_length {
            Some(length) => {
                let remaining = length.saturating_sub(body_prefix);
                bytes_to_client += copy_exact(&mut stream_r, &mut client_w, remaining).await?;
            }
            None => {
                bytes_to_client += tokio::io::copy(&mut stream_r, &mut client_w).await?;
                client_w.flush().await?;
            }
        },
        None => {
            // Unparseable head; relay the rest verbatim.
            bytes_to_client += tokio::io::copy(&mut stream_r, &mut client_w).await?;
            client_w.flush().await?;
        }
    }

    upstream.abort();
    client_w.flush().await?;

    Ok(Exchange {
        status: response.map(|r| r.status),
        bytes_to_client,
        bytes_from_client: bytes_from_client.load(Ordering::Relaxed),
    })
}

/// Copy exactly `remaining` bytes, then flush once.
async fn copy_exact<R, W>(r: &mut R, w: &mut W, mut remaining: u64) -> Result<u64, HttpIngressError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let mut buf = [0u8; STREAM_CHUNK];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = r.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        copied += n as u64;
        remaining -= n as u64;
    }
    w.flush().await?;
    Ok(copied)
}

/// Copy until EOF, flushing after every chunk so event streams reach the
/// public client without buffering delay.
async fn copy_streaming<R, W>(r: &mut R, w: &mut W) -> Result<u64, HttpIngressError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let mut buf = [0u8; STREAM_CHUNK];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        copied += n as u64;
    }
    Ok(copied)
}

/// A buffered header section, possibly followed by body bytes that arrived
/// in the same reads.
struct Head {
    bytes: Vec<u8>,
    head_len: usize,
}

/// Read until the end of the HTTP header section. `None` means the peer
/// went away before completing a head.
async fn read_head<R>(r: &mut R) -> Result<Option<Head>, HttpIngressError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        bytes.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subsequence(&bytes, b"\r\n\r\n") {
            return Ok(Some(Head {
                bytes,
                head_len: pos + 4,
            }));
        }
        if bytes.len() > MAX_HEAD_BYTES {
            return Err(HttpIngressError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "header section too large",
            )));
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parsed request line and routing headers.
struct RequestHead {
    method: String,
    path: String,
    host: Option<String>,
}

impl RequestHead {
    fn parse(head: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(head).ok()?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let path = parts.next()?.to_string();

        let mut host = None;
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("host") {
                    host = Some(value.trim().to_string());
                }
            }
        }

        Some(Self { method, path, host })
    }
}

/// Parsed response status line and forwarding-relevant headers.
struct ResponseHead {
    status: u16,
    content_length: Option<u64>,
    is_streaming: bool,
}

impl ResponseHead {
    fn parse(head: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(head).ok()?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next()?;
        let status = status_line.split_whitespace().nth(1)?.parse::<u16>().ok()?;

        let mut content_length = None;
        let mut is_streaming = false;
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            match name.as_str() {
                "content-length" => content_length = value.parse::<u64>().ok(),
                "content-type" if value.starts_with("text/event-stream") => is_streaming = true,
                "transfer-encoding" if value.eq_ignore_ascii_case("chunked") => is_streaming = true,
                "x-accel-buffering" if value.eq_ignore_ascii_case("no") => is_streaming = true,
                _ => {}
            }
        }

        Some(Self {
            status,
            content_length,
            is_streaming,
        })
    }
}

/// Host-header subdomain extraction: strip any port, require the host to be
/// strictly under the server domain, and return the prefix.
fn extract_subdomain(host: &str, domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{domain}");
    if host == domain || !host.ends_with(&suffix) {
        return None;
    }
    let subdomain = host.strip_suffix(&suffix)?;
    if subdomain.is_empty() {
        return None;
    }
    Some(subdomain.to_string())
}

async fn write_error<W>(w: &mut W, code: u16, reason: &str, body: &str) -> Result<(), HttpIngressError>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    w.write_all(response.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}
