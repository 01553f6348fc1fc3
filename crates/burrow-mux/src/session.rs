//! Multiplexed session wrapper

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, trace};
use yamux::{Config, Connection, Control, Mode};

/// One bidirectional stream within a mux session, adapted to tokio I/O.
pub type MuxStream = Compat<yamux::Stream>;

/// Mux session errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("mux connection error: {0}")]
    Connection(#[from] yamux::ConnectionError),
}

/// A yamux session over one TCP connection.
///
/// The underlying connection is driven by a dedicated task; dropping the
/// session does not stop it, closing does. Once closed, `open` fails and
/// the session is never re-opened.
pub struct MuxSession {
    control: Control,
    inbound: Mutex<mpsc::Receiver<MuxStream>>,
    closed: watch::Receiver<bool>,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl MuxSession {
    /// Wrap the relay-side half of a mux connection.
    pub fn server<S>(socket: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(socket, Mode::Server)
    }

    /// Wrap the client-side half. Used by in-process test clients.
    pub fn client<S>(socket: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(socket, Mode::Client)
    }

    fn new<S>(socket: S, mode: Mode) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::new(socket.compat(), Config::default(), mode);
        let control = connection.control();

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (closed_tx, closed_rx) = watch::channel(false);

        // The connection only makes progress while its stream of inbound
        // streams is polled, so the driver task runs for the session's
        // whole lifetime even if nobody accepts.
        tokio::spawn(async move {
            let streams = yamux::into_stream(connection);
            tokio::pin!(streams);
            while let Some(next) = streams.next().await {
                match next {
                    Ok(stream) => {
                        trace!("inbound mux stream");
                        if inbound_tx.try_send(stream.compat()).is_err() {
                            // Receiver gone or backlogged; the stream is
                            // dropped but the session keeps being driven.
                            trace!("dropping unclaimed inbound mux stream");
                        }
                    }
                    Err(e) => {
                        debug!("mux session ended: {}", e);
                        break;
                    }
                }
            }
            let _ = closed_tx.send(true);
        });

        Self {
            control,
            inbound: Mutex::new(inbound_rx),
            closed: closed_rx,
        }
    }

    /// Open a new outbound stream. Fails once the session is closed.
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        let mut control = self.control.clone();
        let stream = control.open_stream().await?;
        Ok(stream.compat())
    }

    /// Accept the next inbound stream. Returns `None` once the session is
    /// closed and the backlog is drained.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.inbound.lock().await.recv().await
    }

    /// Close the session. All streams observe EOF and future `open` calls
    /// fail. Idempotent.
    pub async fn close(&self) {
        let mut control = self.control.clone();
        let _ = control.close().await;
    }

    /// Resolves when the session's driver exits, whether through `close`
    /// or because the peer went away.
    pub async fn closed(&self) {
        self.watch_closed().await
    }

    /// Detached variant of [`closed`](Self::closed): the returned future
    /// outlives the handle, so a lifecycle watcher can keep waiting after
    /// ownership of the session moves elsewhere.
    pub fn watch_closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut closed = self.closed.clone();
        async move {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Whether the session has already terminated.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
