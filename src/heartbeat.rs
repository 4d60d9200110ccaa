// Heartbeat monitoring.
//
// The engine does not own a clock; whoever drives the connection calls
// `tick` at the monitor's interval (half the negotiated heartbeat). Each
// tick compares the framer and writer frame counters against the last
// tick's watermarks: an idle write side gets a heartbeat frame on the
// wire, an idle read side counts toward the miss limit.

use crate::connection::Connection;
use crate::error::{AmqpError, AmqpResult};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Outcome of one tick that did not fail.
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    /// Monitoring continues.
    Active,
    /// A newer monitor has replaced this one (or the connection is
    /// gone); stop calling `tick`.
    Cancelled,
}

/// Watches one connection's traffic counters. Created by
/// [`Connection::heartbeat_monitor`]; creating a new monitor supersedes
/// the previous one.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    generation: u64,
    prev_sent: Option<u64>,
    prev_recv: Option<u64>,
    missed: u32,
}

impl HeartbeatMonitor {
    pub(crate) fn new(heartbeat: u16, generation: u64) -> HeartbeatMonitor {
        HeartbeatMonitor {
            interval: Duration::from_millis(u64::from(heartbeat) * 500),
            generation,
            prev_sent: None,
            prev_recv: None,
            missed: 0,
        }
    }

    /// How often the owning task should call `tick`: half the negotiated
    /// heartbeat delay.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One monitoring step. Sends a heartbeat when nothing else went out
    /// since the last tick, and raises `HeartbeatTimeout` after two
    /// consecutive silent intervals on the read side. The error is
    /// recoverable; the caller decides whether to reconnect.
    pub async fn tick<Io>(&mut self, conn: &mut Connection<Io>) -> AmqpResult<Tick>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        if conn.heartbeat_generation() != self.generation {
            debug!("heartbeat monitor superseded, cancelling");
            return Ok(Tick::Cancelled);
        }

        if self.prev_sent == Some(conn.frames_sent()) {
            conn.send_heartbeat().await?;
        }
        if self.prev_recv == Some(conn.frames_recv()) {
            self.missed += 1;
            debug!(missed = self.missed, "no traffic from peer since last tick");
        } else {
            self.missed = 0;
        }
        self.prev_sent = Some(conn.frames_sent());
        self.prev_recv = Some(conn.frames_recv());

        if self.missed >= 2 {
            warn!("too many heartbeats missed");
            return Err(AmqpError::HeartbeatTimeout);
        }
        Ok(Tick::Active)
    }
}
