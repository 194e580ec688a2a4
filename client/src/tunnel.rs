//! The live tunnel's identity and traffic accounting

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use outpost_shared::protocol::{Protocol, TunnelAssignment};
use serde::{Deserialize, Serialize};

use crate::config::TunnelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Pending,
    Active,
    Closed,
}

impl TunnelStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelStatus::Pending,
            1 => TunnelStatus::Active,
            _ => TunnelStatus::Closed,
        }
    }
}

/// A registered tunnel.
///
/// Identity is fixed at creation. Byte counters are bumped concurrently by
/// relays; status is only written by the session manager.
#[derive(Debug)]
pub struct Tunnel {
    id: String,
    subdomain: String,
    public_url: String,
    local_host: String,
    local_port: u16,
    protocol: Protocol,
    created_at: DateTime<Utc>,
    status: AtomicU8,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
}

impl Tunnel {
    /// Build the tunnel from the broker's assignment, still `pending`.
    pub fn new(assignment: TunnelAssignment, config: &TunnelConfig) -> Self {
        Self {
            id: assignment.id,
            subdomain: config.subdomain.clone(),
            public_url: assignment.public_url,
            local_host: config.local_host.clone(),
            local_port: config.local_port,
            protocol: config.protocol,
            created_at: Utc::now(),
            status: AtomicU8::new(TunnelStatus::Pending as u8),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TunnelStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Bytes relayed local -> broker
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes relayed broker -> local
    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    pub(crate) fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_recv(&self, n: usize) {
        self.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            id: self.id.clone(),
            subdomain: self.subdomain.clone(),
            public_url: self.public_url.clone(),
            local_host: self.local_host.clone(),
            local_port: self.local_port,
            protocol: self.protocol,
            status: self.status(),
            created_at: self.created_at,
            bytes_sent: self.bytes_sent(),
            bytes_recv: self.bytes_recv(),
        }
    }
}

/// Point-in-time copy of a tunnel, safe to hand out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSnapshot {
    pub id: String,
    pub subdomain: String,
    pub public_url: String,
    pub local_host: String,
    pub local_port: u16,
    pub protocol: Protocol,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}
