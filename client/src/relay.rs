//! Request relay: bridges one forward_request to a fresh local connection.
//!
//! Every request ends in exactly one terminal frame: a `forward_response`
//! with `final` set, or an `error_response`. Failures stay with the request.

use std::sync::Arc;
use std::time::Duration;

use outpost_shared::protocol::{
    ControlMessage, ErrorResponse, ForwardRequest, ForwardResponse, Protocol,
};
use outpost_shared::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::TunnelConfig;
use crate::dialer::LocalDialer;
use crate::session::SessionSender;
use crate::tunnel::Tunnel;

/// Largest chunk of local output carried by one response frame
const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Clone)]
pub struct RequestRelay {
    dialer: LocalDialer,
    protocol: Protocol,
    response_timeout: Duration,
    idle_timeout: Duration,
    tunnel: Arc<Tunnel>,
    sender: SessionSender,
}

impl RequestRelay {
    pub fn new(config: &TunnelConfig, tunnel: Arc<Tunnel>, sender: SessionSender) -> Self {
        Self {
            dialer: LocalDialer::new(&config.local_host, config.local_port, config.connect_timeout),
            protocol: config.protocol,
            response_timeout: config.response_timeout,
            idle_timeout: config.idle_timeout,
            tunnel,
            sender,
        }
    }

    /// Relay one request, reporting any failure back to the broker.
    pub async fn handle(&self, request: ForwardRequest) {
        let request_id = request.request_id.clone();
        match self.relay(request).await {
            Ok(()) => debug!("Request {} relayed", request_id),
            Err(e) => {
                warn!("Request {} failed: {}", request_id, e);
                let reply = ControlMessage::ErrorResponse(ErrorResponse {
                    request_id,
                    error: e.to_string(),
                });
                if let Err(e) = self.sender.send(&reply).await {
                    warn!("Failed to send error response: {}", e);
                }
            }
        }
    }

    async fn relay(&self, request: ForwardRequest) -> Result<()> {
        debug!(
            "Relaying {} request {} ({} bytes) to {}",
            self.protocol,
            request.request_id,
            request.data.len(),
            self.dialer.addr()
        );

        // Dropped on every return path, which closes the local connection
        let mut stream = self.dialer.dial().await?;

        stream
            .write_all(&request.data)
            .await
            .map_err(|e| Error::Relay(format!("write to local service failed: {}", e)))?;
        self.tunnel.add_recv(request.data.len());

        // Raw TCP peers see EOF; HTTP exchanges pass through untouched
        if self.protocol == Protocol::Tcp {
            stream
                .shutdown()
                .await
                .map_err(|e| Error::Relay(format!("half-close of local connection failed: {}", e)))?;
        }

        // The idle bound only applies once output has started
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut started = false;
        loop {
            let wait = if started { self.idle_timeout } else { self.response_timeout };
            let n = match timeout(wait, stream.read(&mut buf)).await {
                Ok(read) => read
                    .map_err(|e| Error::Relay(format!("read from local service failed: {}", e)))?,
                Err(_) if started => {
                    debug!("Local service idle for {:?}, ending response", self.idle_timeout);
                    break;
                }
                Err(_) => {
                    return Err(Error::Relay(format!(
                        "local service sent no response within {:?}",
                        self.response_timeout
                    )));
                }
            };
            if n == 0 {
                break;
            }

            self.respond(&request.request_id, buf[..n].to_vec(), false).await?;
            self.tunnel.add_sent(n);
            started = true;
        }

        self.respond(&request.request_id, Vec::new(), true).await
    }

    async fn respond(&self, request_id: &str, data: Vec<u8>, is_final: bool) -> Result<()> {
        self.sender
            .send(&ControlMessage::ForwardResponse(ForwardResponse {
                request_id: request_id.to_string(),
                data,
                is_final,
            }))
            .await
    }
}
