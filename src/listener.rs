//! Accepting [Connection]s on pipe and tcp addresses.

use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{net::TcpListener, sync::watch};

use crate::{
    address::TransportError,
    connection::{stopped, Connection},
};

/// Upper bound on one wait for an incoming connection.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Pause after a failed accept (out of file descriptors and the like).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

enum Inner {
    #[cfg(unix)]
    Pipe {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
    Tcp(TcpListener),
}

/// A bound server socket.
pub struct Listener {
    inner: Inner,
    stop: watch::Sender<bool>,
}

impl Listener {
    fn new(inner: Inner) -> Self {
        let (stop, _) = watch::channel(false);
        Self { inner, stop }
    }

    #[cfg(unix)]
    pub(crate) async fn bind_pipe(path: &Path) -> Result<Self, TransportError> {
        use tokio::net::{UnixListener, UnixStream};

        let listener = match UnixListener::bind(path) {
            Ok(listener) => listener,
            Err(error) => {
                tracing::debug!(
                    path = %path.display(),
                    error = format!("{:?}", error),
                    "pipe bind failed; probing for a live server"
                );
                if UnixStream::connect(path).await.is_ok() {
                    return Err(TransportError::AlreadyRunning(path.to_owned()));
                }

                tracing::warn!(path = %path.display(), "removing stale pipe");
                if let Err(error) = std::fs::remove_file(path) {
                    if error.kind() != io::ErrorKind::NotFound {
                        return Err(error.into());
                    }
                }
                UnixListener::bind(path)?
            }
        };

        tracing::info!(path = %path.display(), "listening on pipe");
        Ok(Self::new(Inner::Pipe {
            listener,
            path: path.to_owned(),
        }))
    }

    #[cfg(not(unix))]
    pub(crate) async fn bind_pipe(_path: &Path) -> Result<Self, TransportError> {
        Err(TransportError::Unsupported("pipe"))
    }

    pub(crate) async fn bind_tcp(host: &str, port: u16) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((host, port)).await?;
        tracing::info!(address = %listener.local_addr()?, "listening on tcp");
        Ok(Self::new(Inner::Tcp(listener)))
    }

    /// Address the tcp listener is bound to; `None` for pipes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            #[cfg(unix)]
            Inner::Pipe { .. } => None,
            Inner::Tcp(listener) => listener.local_addr().ok(),
        }
    }

    /// Wait for the next client.
    ///
    /// Returns `None` only once [Listener::stop] has been called. Failed
    /// accepts are logged and retried.
    pub async fn accept(&self) -> Option<Connection> {
        loop {
            if *self.stop.borrow() {
                return None;
            }

            let accepted = tokio::select! {
                biased;
                _ = stopped(self.stop.subscribe()) => return None,
                accepted = tokio::time::timeout(ACCEPT_POLL, self.accept_once()) => accepted,
            };

            match accepted {
                Err(_) => continue,
                Ok(Ok(connection)) => return Some(connection),
                Ok(Err(error)) => {
                    tracing::warn!(error = format!("{:?}", error), "accept failed; retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn accept_once(&self) -> io::Result<Connection> {
        match &self.inner {
            #[cfg(unix)]
            Inner::Pipe { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                tracing::debug!("accepted pipe client");
                Ok(Connection::from_stream(stream))
            }
            Inner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::debug!(peer = %peer, "accepted tcp client");
                Ok(Connection::from_stream(stream))
            }
        }
    }

    /// Make pending and future [Listener::accept] calls return `None`.
    pub fn stop(&self) {
        self.stop.send_if_modified(|stopped| !std::mem::replace(stopped, true));
    }

    /// Remove the filesystem artifacts of a pipe listener. No-op for tcp.
    pub fn cleanup(&self) {
        match &self.inner {
            #[cfg(unix)]
            Inner::Pipe { path, .. } => match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed pipe"),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = format!("{:?}", error),
                        "failed to remove pipe"
                    );
                }
            },
            Inner::Tcp(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Instant};

    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    use super::*;
    use crate::Address;

    #[cfg(unix)]
    fn pipe_address() -> (Address, PathBuf) {
        let path = std::env::temp_dir().join(format!("machined-{}.socket", uuid::Uuid::new_v4().simple()));
        (Address::Pipe { path: path.clone() }, path)
    }

    #[tokio::test]
    async fn test_tcp_accept_and_exchange() -> TestResult {
        let listener = "tcp:127.0.0.1:0".parse::<Address>()?.listen().await?;
        let port = listener.local_addr().ok_or("no local address")?.port();

        let client = Address::Tcp {
            host: "127.0.0.1".to_owned(),
            port,
        }
        .connect()
        .await?;
        let server = listener.accept().await.ok_or("listener stopped")?;

        client.write(b"ping").await?;
        let mut received = vec![];
        while received.len() < 4 {
            received.extend(server.read().await?);
        }
        assert_eq!(received, b"ping".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_ends_accept_promptly() -> TestResult {
        let listener = Arc::new("tcp:127.0.0.1:0".parse::<Address>()?.listen().await?);
        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await.is_none() })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        let stopped_at = Instant::now();
        listener.stop();
        assert!(tokio::time::timeout(ACCEPT_POLL * 2, accepting).await??);
        assert!(stopped_at.elapsed() < ACCEPT_POLL * 2);

        assert!(listener.accept().await.is_none());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_listen_connect_cleanup() -> TestResult {
        let (address, path) = pipe_address();
        let listener = address.listen().await?;
        assert!(path.exists());
        assert_eq!(listener.local_addr(), None);

        let client = address.connect().await?;
        let server = listener.accept().await.ok_or("listener stopped")?;
        server.write(b"{}").await?;
        let mut received = vec![];
        while received.len() < 2 {
            received.extend(client.read().await?);
        }
        assert_eq!(received, b"{}".to_vec());

        listener.stop();
        listener.cleanup();
        listener.cleanup();
        assert!(!path.exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_detects_live_server() -> TestResult {
        let (address, path) = pipe_address();
        let first = address.listen().await?;

        match address.listen().await {
            Err(TransportError::AlreadyRunning(running)) => assert_eq!(running, path),
            Err(error) => panic!("unexpected error {:?}", error),
            Ok(_) => panic!("second listener should not bind"),
        }

        first.cleanup();
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_replaces_stale_socket() -> TestResult {
        let (address, path) = pipe_address();
        // Bind and drop without cleanup, leaving the socket file behind.
        drop(std::os::unix::net::UnixListener::bind(&path)?);
        assert!(path.exists());

        let listener = address.listen().await?;
        let _client = address.connect().await?;
        assert!(listener.accept().await.is_some());

        listener.cleanup();
        Ok(())
    }
}
