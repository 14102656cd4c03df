//! Socket ownership for the on-device component.
//!
//! [`ConnectionManager`] keeps at most one live socket per client. The socket is
//! opened lazily by the first request, re-opened by the first request after it
//! closes, and retried while the device refuses connections (the component
//! is typically still starting up).
//!
//! Each socket gets a background reader task that feeds received bytes
//! through a [`FrameDecoder`] and hands complete responses to the
//! [`PendingRequests`] arena.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::RpcError;
use crate::pending::PendingRequests;
use crate::protocol::{DeviceResponse, FrameDecoder};

const READ_CHUNK: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// A bidirectional async byte stream to the device.
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

/// Opens streams to the device.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn DeviceStream>>;
}

/// Plain TCP, the transport real devices use.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn DeviceStream>> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Connect errors worth waiting out: the component is not listening yet, or
/// the socket broke while being set up.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::BrokenPipe
    )
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

type Slot = Mutex<Option<Arc<Connection>>>;

/// One established socket.
pub(crate) struct Connection {
    generation: u64,
    writer: Mutex<WriteHalf<Box<dyn DeviceStream>>>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one encoded frame in a single write.
    pub(crate) async fn write_frame(&self, frame: &[u8]) -> Result<(), RpcError> {
        let mut writer = self.writer.lock().await;
        trace!(frame_bytes = frame.len(), generation = self.generation, "writing frame");
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

pub(crate) struct ConnectionManager {
    host: String,
    port: u16,
    reconnect_delay: Duration,
    connector: Arc<dyn Connector>,
    current: Arc<Slot>,
    next_generation: AtomicU64,
    pending: Arc<PendingRequests>,
}

impl ConnectionManager {
    pub(crate) fn new(
        host: String,
        port: u16,
        reconnect_delay: Duration,
        connector: Arc<dyn Connector>,
        pending: Arc<PendingRequests>,
    ) -> Self {
        Self {
            host,
            port,
            reconnect_delay,
            connector,
            current: Arc::new(Mutex::new(None)),
            next_generation: AtomicU64::new(1),
            pending,
        }
    }

    /// Return the live connection, opening one if needed.
    ///
    /// Concurrent callers queue behind a single connect attempt. Refused
    /// connections are retried after a fixed delay with no attempt limit; the
    /// caller's request timeout bounds the wait.
    pub(crate) async fn ensure_connected(&self) -> Result<Arc<Connection>, RpcError> {
        let mut slot = self.current.lock().await;
        if let Some(connection) = slot.as_ref() {
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
        }

        let mut attempts: u32 = 0;
        let stream = loop {
            attempts += 1;
            match self.connector.connect(&self.host, self.port).await {
                Ok(stream) => break stream,
                Err(e) if is_transient(&e) => {
                    trace!(error = %e, attempts, "device refused connection, retrying");
                    tokio::time::sleep(self.reconnect_delay).await;
                }
                Err(e) => {
                    debug!(error = %e, host = %self.host, port = self.port, "connect failed");
                    return Err(RpcError::Io(e));
                }
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(self.spawn_connection(stream, generation));
        *slot = Some(connection.clone());
        debug!(host = %self.host, port = self.port, generation, attempts, "connected to device");
        Ok(connection)
    }

    fn spawn_connection(&self, stream: Box<dyn DeviceStream>, generation: u64) -> Connection {
        let (read_half, write_half) = tokio::io::split(stream);
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            read_half,
            generation,
            closed.clone(),
            self.pending.clone(),
            Arc::downgrade(&self.current),
        ));
        Connection {
            generation,
            writer: Mutex::new(write_half),
            closed,
            reader,
        }
    }

    /// Drop a connection that failed a write. Requests in flight on it are
    /// rejected.
    pub(crate) async fn discard(&self, generation: u64) {
        let mut slot = self.current.lock().await;
        if slot.as_ref().map(|c| c.generation) == Some(generation) {
            if let Some(connection) = slot.take() {
                connection.closed.store(true, Ordering::SeqCst);
            }
            let failed = self.pending.fail_generation(generation);
            debug!(generation, failed, "discarded device connection");
        }
    }

    /// Close the current socket, if any.
    pub(crate) async fn close(&self) {
        let connection = self.current.lock().await.take();
        if let Some(connection) = connection {
            connection.closed.store(true, Ordering::SeqCst);
            connection.reader.abort();
            let failed = self.pending.fail_generation(connection.generation);
            debug!(generation = connection.generation, failed, "closed device connection");
        }
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }
}

/// Reader task: decode frames until the socket closes, then clear the stored
/// connection and reject whatever was still waiting on it.
async fn read_loop(
    mut reader: ReadHalf<Box<dyn DeviceStream>>,
    generation: u64,
    closed: Arc<AtomicBool>,
    pending: Arc<PendingRequests>,
    slot: Weak<Slot>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, generation, "device socket read failed");
                break;
            }
        };
        trace!(bytes = n, generation, "received chunk");

        for frame in decoder.feed(&buf[..n]) {
            match frame.and_then(DeviceResponse::from_frame) {
                Ok(response) => {
                    let id = response.id().to_string();
                    if !pending.resolve(response) {
                        warn!(request_id = %id, "dropping response for unknown request");
                    }
                }
                Err(e) => error!(error = %e, generation, "dropping malformed frame"),
            }
        }
    }

    if !decoder.is_idle() {
        warn!(generation, "socket closed mid-frame");
    }

    closed.store(true, Ordering::SeqCst);
    let failed = pending.fail_generation(generation);
    debug!(generation, failed, "device connection closed");

    if let Some(slot) = slot.upgrade() {
        let mut current = slot.lock().await;
        if current.as_ref().map(|c| c.generation) == Some(generation) {
            // Dropping the last handle aborts this task; nothing follows.
            current.take();
        }
    }
}
