//! Heartbeat keeper: application-level liveness on the control channel

use std::time::Duration;

use outpost_shared::protocol::{ControlMessage, Heartbeat};
use outpost_shared::Result;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{trace, warn};

use crate::session::SessionSender;

pub struct HeartbeatKeeper {
    sender: SessionSender,
    tunnel_id: String,
    interval: Duration,
}

impl HeartbeatKeeper {
    pub fn new(sender: SessionSender, tunnel_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            sender,
            tunnel_id: tunnel_id.into(),
            interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Send a heartbeat every interval until a send fails.
    ///
    /// Ticks sit on a fixed grid starting one interval from now, so slow
    /// sends never push later heartbeats back. A failed send is not retried.
    pub async fn run(self) -> Result<()> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let message = ControlMessage::Heartbeat(Heartbeat {
            tunnel_id: self.tunnel_id,
        });

        loop {
            ticker.tick().await;
            if let Err(e) = self.sender.send(&message).await {
                warn!("Heartbeat failed, stopping: {}", e);
                return Err(e);
            }
            trace!("Heartbeat sent");
        }
    }
}
