//! Transfer scheduler.
//!
//! Each tick admits and prunes connections, reads the latest line from every
//! connection, starts a session when one of them sent the trigger, and sends
//! at most one packet to the session's targets. The tick cadence is the only
//! rate control: one packet per target per tick.
//!
//! ## States
//!
//! ```text
//! Idle --trigger--> Transferring --queue drained--> Idle
//! ```
//!
//! Completion compares the bytes actually written against the payload size.
//! A target that closed mid-transfer makes the two differ; that is reported,
//! never retried.

use crate::config::Config;
use crate::payload::Payload;
use crate::runtime::{Connection, ConnectionRegistry};
use bytes::Bytes;
use clap::ValueEnum;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Handling of a trigger that arrives while a session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RetriggerPolicy {
    /// Drop the request.
    #[default]
    Ignore,
    /// Serve the requester in its own session once the current one ends.
    Queue,
}

/// Scheduler knobs, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Maximum bytes per packet.
    pub packet_size: usize,
    /// Exact line, delimiter included, that starts a session.
    pub trigger_line: String,
    pub retrigger: RetriggerPolicy,
    /// Idle time broadcast cadence.
    pub announce: Option<Duration>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            packet_size: 750,
            trigger_line: "start\n".to_string(),
            retrigger: RetriggerPolicy::Ignore,
            announce: None,
        }
    }
}

impl From<&Config> for TransferSettings {
    fn from(config: &Config) -> Self {
        Self {
            packet_size: config.packet_size,
            trigger_line: config.trigger_line(),
            retrigger: config.retrigger,
            announce: config.announce,
        }
    }
}

/// Outcome of one finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    /// Bytes written, summed over every target.
    pub bytes_sent: u64,
    pub expected_size: u64,
    pub packets: usize,
    pub targets: usize,
}

impl CompletionReport {
    pub fn is_complete(&self) -> bool {
        self.bytes_sent == self.expected_size
    }
}

/// One payload delivery, from trigger to queue exhaustion.
#[derive(Debug, Default)]
pub struct TransferSession {
    targets: Vec<Arc<Connection>>,
    queue: VecDeque<Bytes>,
    total_bytes_sent: u64,
    packets_sent: usize,
    active: bool,
}

impl TransferSession {
    /// Start delivering `packets` to `target`, resetting the byte count.
    pub fn begin(&mut self, target: Arc<Connection>, packets: Vec<Bytes>) {
        self.targets.clear();
        self.targets.push(target);
        self.queue = packets.into();
        self.total_bytes_sent = 0;
        self.packets_sent = 0;
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_target(&self, conn: &Arc<Connection>) -> bool {
        self.targets.iter().any(|t| Arc::ptr_eq(t, conn))
    }

    /// Packets still queued.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    /// Send the front packet to every target, one after another.
    ///
    /// Returns the bytes written for this packet across all targets, or
    /// `None` when the queue is empty. Closed targets contribute 0.
    pub async fn send_next(&mut self) -> Option<u64> {
        let packet = self.queue.pop_front()?;
        let mut written = 0u64;
        for target in &self.targets {
            written += target.send(&packet).await as u64;
        }
        self.total_bytes_sent += written;
        self.packets_sent += 1;
        Some(written)
    }

    /// End the session and reset it for the next trigger.
    pub fn finish(&mut self, expected_size: u64) -> CompletionReport {
        let report = CompletionReport {
            bytes_sent: self.total_bytes_sent,
            expected_size,
            packets: self.packets_sent,
            targets: self.targets.len(),
        };
        self.targets.clear();
        self.queue.clear();
        self.total_bytes_sent = 0;
        self.packets_sent = 0;
        self.active = false;
        report
    }
}

pub struct TransferScheduler {
    registry: ConnectionRegistry,
    payload: Payload,
    settings: TransferSettings,
    session: TransferSession,
    /// Requesters waiting for their own session under [`RetriggerPolicy::Queue`].
    pending: VecDeque<Arc<Connection>>,
    last_announce: Option<Instant>,
}

impl TransferScheduler {
    pub fn new(registry: ConnectionRegistry, payload: Payload, settings: TransferSettings) -> Self {
        Self {
            registry,
            payload,
            settings,
            session: TransferSession::default(),
            pending: VecDeque::new(),
            last_announce: None,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    #[cfg(test)]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Tick forever at `pacing`.
    ///
    /// A tick that overruns delays the next one instead of bursting to catch up.
    pub async fn run(mut self, pacing: Duration) {
        let mut ticker = tokio::time::interval(pacing);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(pacing_ms = pacing.as_millis() as u64, "Entering main loop");
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Run one scheduler iteration.
    ///
    /// Returns the completion report when a session finished during this tick.
    pub async fn tick(&mut self) -> Option<CompletionReport> {
        self.registry.admit();
        self.registry.prune();

        for (line, conn) in self.registry.snapshot() {
            let Some(line) = line else { continue };
            debug!(peer = %conn.peer(), line = line.trim_end(), "Last available data");
            if line == self.settings.trigger_line {
                self.on_trigger(conn);
            }
        }

        if !self.session.is_active() {
            self.start_pending();
        }

        if !self.session.is_active() {
            self.announce().await;
            return None;
        }

        if let Some(written) = self.session.send_next().await {
            trace!(
                written,
                remaining = self.session.remaining(),
                "Sent packet"
            );
        }

        if self.session.remaining() == 0 {
            Some(self.complete())
        } else {
            None
        }
    }

    fn on_trigger(&mut self, conn: Arc<Connection>) {
        if !self.session.is_active() {
            self.begin(conn);
            return;
        }

        if self.session.is_target(&conn) || self.pending.iter().any(|p| Arc::ptr_eq(p, &conn)) {
            debug!(peer = %conn.peer(), "Repeated trigger from a current requester");
            return;
        }

        match self.settings.retrigger {
            RetriggerPolicy::Ignore => {
                info!(peer = %conn.peer(), "Transfer in progress, ignoring trigger");
            }
            RetriggerPolicy::Queue => {
                info!(
                    peer = %conn.peer(),
                    position = self.pending.len() + 1,
                    "Transfer in progress, trigger queued"
                );
                self.pending.push_back(conn);
            }
        }
    }

    fn begin(&mut self, conn: Arc<Connection>) {
        let packets = self.payload.packets(self.settings.packet_size);
        info!(
            peer = %conn.peer(),
            packets = packets.len(),
            expected_size = self.payload.expected_size(),
            "Starting transfer"
        );
        self.session.begin(conn, packets);
    }

    fn start_pending(&mut self) {
        while let Some(conn) = self.pending.pop_front() {
            if conn.is_open() {
                self.begin(conn);
                return;
            }
            debug!(peer = %conn.peer(), "Queued requester closed before its turn");
        }
    }

    fn complete(&mut self) -> CompletionReport {
        let report = self.session.finish(self.payload.expected_size());
        if report.is_complete() {
            info!(
                bytes_sent = report.bytes_sent,
                expected_size = report.expected_size,
                packets = report.packets,
                "Data transferred"
            );
        } else {
            warn!(
                bytes_sent = report.bytes_sent,
                expected_size = report.expected_size,
                packets = report.packets,
                targets = report.targets,
                "Transfer incomplete"
            );
        }
        report
    }

    async fn announce(&mut self) {
        let Some(every) = self.settings.announce else {
            return;
        };
        let now = Instant::now();
        if matches!(self.last_announce, Some(last) if now.duration_since(last) < every) {
            return;
        }
        self.last_announce = Some(now);

        if self.registry.is_empty() {
            return;
        }
        let line = format!("{}\n", chrono::Local::now().to_rfc3339());
        if !self.registry.broadcast(line.as_bytes()).await {
            debug!(connections = self.registry.len(), "No requests for data received");
        }
    }
}
