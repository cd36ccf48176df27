//! Duplex byte streams over a domain socket, a TCP socket, or a USB bulk
//! endpoint pair.
//!
//! Every form has the same contract: `read` and `write` may run at the same
//! time (each has its own lock), `stop` is idempotent and can be called from
//! any task to unblock a pending `read` or `write`, and `close` stops and
//! then releases the transport.

mod socket;
#[cfg(feature = "usb")]
mod usb;

use std::{io, path::Path, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};

pub use socket::SocketConnection;
#[cfg(feature = "usb")]
pub use usb::UsbConnection;

use crate::address::TransportError;

/// Upper bound on how long a single `read` waits for data before returning
/// an empty buffer.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors surfaced by an open [Connection].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The peer closed or reset the stream, or the connection was stopped.
    #[error("end of stream")]
    EndOfStream,

    /// `stop` was called before the write finished. The first `written`
    /// bytes went out; the rest may be retried on another connection.
    #[error("connection stopped after writing {written} of {total} bytes")]
    Stopped {
        /// Bytes already handed to the transport.
        written: usize,
        /// Bytes the caller asked to write.
        total: usize,
    },

    /// A non-transient transport failure while the connection was live.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A duplex byte stream to a single peer.
pub enum Connection {
    /// Unix domain socket, TCP socket, or any other async byte stream.
    Socket(SocketConnection),

    /// USB bulk endpoint pair.
    #[cfg(feature = "usb")]
    Usb(UsbConnection),
}

impl Connection {
    /// Wrap an async byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::Socket(SocketConnection::new(stream))
    }

    /// Read whatever bytes are available.
    ///
    /// An empty buffer means nothing arrived within the poll interval; the
    /// caller should check whether it is shutting down and call again.
    /// [ConnectionError::EndOfStream] means no more bytes will ever arrive.
    pub async fn read(&self) -> Result<Vec<u8>, ConnectionError> {
        match self {
            Self::Socket(socket) => socket.read().await,
            #[cfg(feature = "usb")]
            Self::Usb(usb) => usb.read().await,
        }
    }

    /// Write all of `data`, unless the connection is stopped first.
    pub async fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        match self {
            Self::Socket(socket) => socket.write(data).await,
            #[cfg(feature = "usb")]
            Self::Usb(usb) => usb.write(data).await,
        }
    }

    /// Interrupt any pending read or write. Idempotent.
    pub fn stop(&self) {
        match self {
            Self::Socket(socket) => socket.stop(),
            #[cfg(feature = "usb")]
            Self::Usb(usb) => usb.stop(),
        }
    }

    /// Stop, then release the transport. Idempotent; never fails.
    pub async fn close(&self) {
        match self {
            Self::Socket(socket) => socket.close().await,
            #[cfg(feature = "usb")]
            Self::Usb(usb) => usb.close().await,
        }
    }

    /// True once `stop` or `close` has been called.
    pub fn is_stopped(&self) -> bool {
        match self {
            Self::Socket(socket) => socket.is_stopped(),
            #[cfg(feature = "usb")]
            Self::Usb(usb) => usb.is_stopped(),
        }
    }

    #[cfg(unix)]
    pub(crate) async fn connect_pipe(path: &Path) -> Result<Self, TransportError> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        tracing::debug!(path = %path.display(), "connected to pipe");
        Ok(Self::from_stream(stream))
    }

    #[cfg(not(unix))]
    pub(crate) async fn connect_pipe(_path: &Path) -> Result<Self, TransportError> {
        Err(TransportError::Unsupported("pipe"))
    }

    pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = tokio::net::TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(host, port, "connected over tcp");
        Ok(Self::from_stream(stream))
    }

    #[cfg(feature = "usb")]
    pub(crate) async fn connect_usb(vendor_id: u16, product_id: u16, serial: &str) -> Result<Self, TransportError> {
        Ok(Self::Usb(UsbConnection::open(vendor_id, product_id, serial).await?))
    }

    #[cfg(not(feature = "usb"))]
    pub(crate) async fn connect_usb(_vendor_id: u16, _product_id: u16, _serial: &str) -> Result<Self, TransportError> {
        Err(TransportError::Unsupported("usb"))
    }
}

/// Resolves once the flag behind `stop` flips to true.
pub(crate) async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

pub(crate) fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

pub(crate) fn is_end_of_stream(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    )
}
