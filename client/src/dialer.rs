//! Local dialer: one fresh TCP connection to the local service per request

use std::time::Duration;

use outpost_shared::{Error, Result};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct LocalDialer {
    addr: String,
    connect_timeout: Duration,
}

impl LocalDialer {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            connect_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn dial(&self) -> Result<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                Error::Relay(format!(
                    "timed out after {:?} connecting to {}",
                    self.connect_timeout, self.addr
                ))
            })?
            .map_err(|e| Error::Relay(format!("failed to connect to {}: {}", self.addr, e)))?;

        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialer = LocalDialer::new("127.0.0.1", port, Duration::from_secs(1));
        assert_eq!(dialer.addr(), format!("127.0.0.1:{}", port));
        let stream = dialer.dial().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_dial_refused_is_relay_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = LocalDialer::new("127.0.0.1", port, Duration::from_secs(1));
        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, Error::Relay(_)), "{:?}", err);
    }
}
