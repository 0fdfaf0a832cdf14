use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::{BeamError, BeamResult};
use crate::models::RelayEvent;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What an observer holds on to. Copyable; the hub owns everything else.
pub type ConnectionHandle = ConnectionId;

/// `Connecting` covers the socket upgrade, before the hub knows the
/// connection. Only `Open` connections send or receive broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One relayed message. Text and binary framing survive the hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Close frame or end of stream from the peer.
    PeerClosed,
    /// Reading from the socket failed.
    ReceiveFailed,
    /// The outbound queue was gone when a frame was offered.
    SendFailed,
    /// The outbound queue was full when a frame was offered.
    Stalled,
    /// A socket write did not finish within the send timeout.
    WriteTimeout,
    Shutdown,
}

impl DropReason {
    /// Whether the observer failed, as opposed to leaving cleanly.
    pub fn is_fault(&self) -> bool {
        !matches!(self, DropReason::PeerClosed | DropReason::Shutdown)
    }

    pub fn fault(&self, id: ConnectionId) -> Option<BeamError> {
        self.is_fault().then(|| BeamError::ConnectionFault {
            connection: id.as_u64(),
            message: self.to_string(),
        })
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::PeerClosed => "peer_closed",
            DropReason::ReceiveFailed => "receive_failed",
            DropReason::SendFailed => "send_failed",
            DropReason::Stalled => "stalled",
            DropReason::WriteTimeout => "write_timeout",
            DropReason::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    Connected(ConnectionId),
    Disconnected {
        id: ConnectionId,
        reason: DropReason,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub outbound_buffer: usize,
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for HubConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            outbound_buffer: config.outbound_buffer.max(1),
            send_timeout: config.send_timeout(),
        }
    }
}

struct Slot {
    state: ConnectionState,
    outbound: mpsc::Sender<Frame>,
}

/// Registry of live observers and the fan-out over them.
///
/// Broadcasting snapshots the eligible targets, then offers the frame to
/// each observer's bounded queue without waiting. A socket task per
/// observer drains its queue, so a slow peer only ever fills its own queue
/// and is dropped once that is full.
#[derive(Clone)]
pub struct RelayHub {
    connections: Arc<DashMap<ConnectionId, Slot>>,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<HubEvent>,
    config: HubConfig,
}

impl RelayHub {
    pub fn new(config: HubConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connections: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            events,
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Registers an observer as `Open`. Every broadcast that starts after
    /// this returns reaches the returned queue.
    pub fn connect(&self) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, inbound) = mpsc::channel(self.config.outbound_buffer);

        self.connections.insert(
            id,
            Slot {
                state: ConnectionState::Open,
                outbound,
            },
        );

        info!(connection_id = %id, connections = self.connections.len(), "Observer connected");
        let _ = self.events.send(HubEvent::Connected(id));
        (id, inbound)
    }

    /// `Open` to `Closing`. The connection stops taking part in broadcasts
    /// but stays registered until [`disconnect`](Self::disconnect).
    pub fn mark_closing(&self, handle: ConnectionHandle) {
        if let Some(mut slot) = self.connections.get_mut(&handle) {
            if slot.state == ConnectionState::Open {
                slot.state = ConnectionState::Closing;
                debug!(connection_id = %handle, "Observer closing");
            }
        }
    }

    /// Removes the connection. Returns `true` only for the call that
    /// actually removed it; every later call is a no-op.
    pub fn disconnect(&self, handle: ConnectionHandle, reason: DropReason) -> bool {
        if self.connections.remove(&handle).is_none() {
            return false;
        }

        match reason.fault(handle) {
            Some(fault) => fault.log(),
            None => info!(connection_id = %handle, reason = %reason, "Observer disconnected"),
        }

        let _ = self.events.send(HubEvent::Disconnected { id: handle, reason });
        true
    }

    /// Offers `frame` to every open observer except `sender`. Never waits
    /// on an observer; failures only affect the observer that failed.
    /// A sender that is no longer `Open` relays nothing.
    pub fn broadcast(&self, sender: Option<ConnectionHandle>, frame: Frame) -> BroadcastReport {
        if let Some(id) = sender {
            if self.state(id) != ConnectionState::Open {
                debug!(connection_id = %id, "Dropped frame from a connection that is not open");
                return BroadcastReport::default();
            }
        }

        let targets: Vec<(ConnectionId, mpsc::Sender<Frame>)> = self
            .connections
            .iter()
            .filter(|entry| entry.state == ConnectionState::Open && Some(*entry.key()) != sender)
            .map(|entry| (*entry.key(), entry.outbound.clone()))
            .collect();

        let mut report = BroadcastReport::default();

        for (id, outbound) in targets {
            match outbound.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if self.disconnect(id, DropReason::Stalled) {
                        report.dropped.push(id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    if self.disconnect(id, DropReason::SendFailed) {
                        report.dropped.push(id);
                    }
                }
            }
        }

        debug!(
            sender = ?sender.map(|id| id.to_string()),
            bytes = frame.len(),
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "Broadcast"
        );

        report
    }

    /// Serialises an event and broadcasts it with no sender to exclude.
    pub fn publish(&self, event: &RelayEvent) -> BeamResult<BroadcastReport> {
        let text = serde_json::to_string(event)?;
        Ok(self.broadcast(None, Frame::Text(text)))
    }

    pub fn state(&self, handle: ConnectionHandle) -> ConnectionState {
        self.connections
            .get(&handle)
            .map(|slot| slot.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Drops every observer. Their socket tasks see the queue close and
    /// shut their sockets.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.disconnect(*id, DropReason::Shutdown))
            .count()
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
