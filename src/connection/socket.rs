use std::{
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{watch, Mutex},
};

use super::{is_end_of_stream, is_transient, stopped, ConnectionError, POLL_INTERVAL};

const READ_SIZE: usize = 4096;

type Reader = Pin<Box<dyn AsyncRead + Send>>;
type Writer = Pin<Box<dyn AsyncWrite + Send>>;

/// Socket-backed connection. Works with any async byte stream, which is how
/// domain sockets, TCP sockets and in-memory pipes all end up here.
pub struct SocketConnection {
    reader: Mutex<Reader>,
    writer: Mutex<Writer>,
    stop: watch::Sender<bool>,
    closed: AtomicBool,
}

impl SocketConnection {
    pub(crate) fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (stop, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Box::pin(reader)),
            writer: Mutex::new(Box::pin(writer)),
            stop,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub(crate) async fn read(&self) -> Result<Vec<u8>, ConnectionError> {
        if self.is_stopped() {
            return Err(ConnectionError::EndOfStream);
        }

        let mut reader = self.reader.lock().await;
        let mut buffer = vec![0; READ_SIZE];

        let result = tokio::select! {
            biased;
            _ = stopped(self.stop.subscribe()) => return Err(ConnectionError::EndOfStream),
            result = tokio::time::timeout(POLL_INTERVAL, reader.read(&mut buffer)) => result,
        };

        match result {
            // Nothing arrived this interval.
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(ConnectionError::EndOfStream),
            Ok(Ok(n)) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Ok(Err(error)) if is_transient(&error) => Ok(Vec::new()),
            Ok(Err(error)) if is_end_of_stream(&error) || self.is_stopped() => {
                tracing::debug!(error = format!("{:?}", error), "socket closed by peer");
                Err(ConnectionError::EndOfStream)
            }
            Ok(Err(error)) => Err(error.into()),
        }
    }

    pub(crate) async fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let total = data.len();
        let mut writer = self.writer.lock().await;
        let mut written = 0;

        while written < total {
            if self.is_stopped() {
                return Err(ConnectionError::Stopped { written, total });
            }

            let result = tokio::select! {
                biased;
                _ = stopped(self.stop.subscribe()) => return Err(ConnectionError::Stopped { written, total }),
                result = writer.write(&data[written..]) => result,
            };

            match result {
                Ok(0) => return Err(ConnectionError::EndOfStream),
                Ok(n) => written += n,
                Err(error) if is_transient(&error) => continue,
                Err(error) if is_end_of_stream(&error) => return Err(ConnectionError::EndOfStream),
                Err(_) if self.is_stopped() => return Err(ConnectionError::Stopped { written, total }),
                Err(error) => return Err(error.into()),
            }
        }

        match writer.flush().await {
            Ok(()) => Ok(()),
            Err(error) if is_end_of_stream(&error) => Err(ConnectionError::EndOfStream),
            Err(error) => Err(error.into()),
        }
    }

    pub(crate) fn stop(&self) {
        self.stop.send_if_modified(|stopped| !std::mem::replace(stopped, true));
    }

    pub(crate) async fn close(&self) {
        self.stop();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            tracing::debug!(error = format!("{:?}", error), "socket shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;
    use testresult::TestResult;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::connection::{Connection, ConnectionError, POLL_INTERVAL};

    #[tokio::test]
    async fn test_read_returns_empty_when_idle() -> TestResult {
        let (stream, _peer) = tokio::io::duplex(64);
        let connection = Connection::from_stream(stream);

        let started = Instant::now();
        assert_eq!(connection.read().await?, Vec::<u8>::new());
        assert!(started.elapsed() >= POLL_INTERVAL);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_and_write() -> TestResult {
        let (stream, mut peer) = tokio::io::duplex(64);
        let connection = Connection::from_stream(stream);

        peer.write_all(b"hello").await?;
        assert_eq!(connection.read().await?, b"hello".to_vec());

        connection.write(b"world").await?;
        let mut buffer = [0; 5];
        peer.read_exact(&mut buffer).await?;
        assert_eq!(&buffer, b"world");
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_close_is_end_of_stream() -> TestResult {
        let (stream, peer) = tokio::io::duplex(64);
        let connection = Connection::from_stream(stream);
        drop(peer);

        assert!(matches!(connection.read().await, Err(ConnectionError::EndOfStream)));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_unblocks_read_within_one_interval() -> TestResult {
        let (stream, _peer) = tokio::io::duplex(64);
        let connection = std::sync::Arc::new(Connection::from_stream(stream));

        let reader = {
            let connection = connection.clone();
            tokio::spawn(async move {
                loop {
                    match connection.read().await {
                        Ok(data) if data.is_empty() => continue,
                        other => return other,
                    }
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        let stopped_at = Instant::now();
        connection.stop();
        connection.stop();

        let result = tokio::time::timeout(POLL_INTERVAL * 2, reader).await??;
        assert!(matches!(result, Err(ConnectionError::EndOfStream)));
        assert!(stopped_at.elapsed() <= POLL_INTERVAL * 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_unblocks_write() -> TestResult {
        // A tiny pipe nobody drains, so the write blocks.
        let (stream, _peer) = tokio::io::duplex(8);
        let connection = std::sync::Arc::new(Connection::from_stream(stream));

        let writer = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.write(&[7; 64]).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        connection.stop();

        let result = tokio::time::timeout(POLL_INTERVAL, writer).await??;
        match result {
            Err(ConnectionError::Stopped { written, total }) => {
                assert_eq!(written, 8);
                assert_eq!(total, 64);
            }
            other => panic!("unexpected write result {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_signals_peer() -> TestResult {
        let (stream, mut peer) = tokio::io::duplex(64);
        let connection = Connection::from_stream(stream);

        connection.close().await;
        connection.close().await;
        assert!(connection.is_stopped());
        assert!(matches!(connection.read().await, Err(ConnectionError::EndOfStream)));

        let mut buffer = vec![];
        assert_eq!(peer.read_to_end(&mut buffer).await?, 0);
        Ok(())
    }
}
