//! Per-client session state.
//!
//! A [`Session`] outlives the TCP connection that created it when the client
//! connected with `clean_session = 0`. It owns the client's subscriptions,
//! the packets waiting to be written, and every QoS 1/2 exchange that has
//! not completed yet.

mod packet_ids;
mod subscriptions;

pub use packet_ids::PacketIds;
pub use subscriptions::{Subscription, Subscriptions};

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::core::error::ProtocolError;
use crate::core::packet::{Connect, ConnectReturnCode, Packet, PacketType, Publish, QoS, Will};
use crate::core::topics::TopicMatcher;

/// Unique identifier of an MQTT client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_owned())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        ClientId(s)
    }
}

impl Deref for ClientId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Conditions that end a session's current connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport failure")]
    TransportFailure,

    #[error("no packet within {0:?} of keep-alive")]
    KeepAliveExpired(Duration),

    #[error("connection refused: {0}")]
    Rejected(ConnectReturnCode),

    #[error("no handler for client-sent {0}")]
    Unimplemented(PacketType),

    #[error("first packet was {0}, not CONNECT")]
    ExpectedConnect(PacketType),

    #[error("second CONNECT on an established connection")]
    UnexpectedConnect,

    #[error("no free packet identifier")]
    PacketIdsExhausted,

    #[error("session taken over by a newer connection")]
    TakenOver,

    #[error("no CONNECT received within {0:?}")]
    ConnectTimeout(Duration),
}

impl SessionError {
    /// Whether the connection ending this way still owes its will message.
    /// A takeover hands the will to the connection that replaced it.
    pub fn publishes_will(&self) -> bool {
        !matches!(self, SessionError::TakenOver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    DisconnectedRetained,
    Terminated,
}

/// The live connection a session is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub conn_id: u64,
    pub peer: SocketAddr,
}

/// A delivery waiting for its acknowledgement.
#[derive(Debug, Clone)]
struct InFlight {
    expect: PacketType,
    packet: Packet,
    /// `None` while the packet sits in the outbound queue again.
    sent_at: Option<Instant>,
}

#[derive(Debug)]
struct SessionState {
    clean_session: bool,
    keep_alive: u16,
    will: Option<Will>,
    subscriptions: Subscriptions,
    outbound: VecDeque<Packet>,
    awaited: BTreeMap<u16, InFlight>,
    incoming_qos2: HashSet<u16>,
    packet_ids: PacketIds,
    attachment: Option<Attachment>,
    last_activity: Instant,
    status: SessionStatus,
    fault: Option<SessionError>,
    max_queued: usize,
}

#[derive(Debug)]
pub struct Session {
    client_id: ClientId,
    state: Mutex<SessionState>,
    notify: Notify,
}

impl Session {
    /// A fresh session in the `Connecting` state.
    pub fn new(client_id: ClientId, connect: &Connect, max_queued: usize) -> Self {
        Self {
            client_id,
            state: Mutex::new(SessionState {
                clean_session: connect.clean_session,
                keep_alive: connect.keep_alive,
                will: connect.will.clone(),
                subscriptions: Subscriptions::new(),
                outbound: VecDeque::new(),
                awaited: BTreeMap::new(),
                incoming_qos2: HashSet::new(),
                packet_ids: PacketIds::new(),
                attachment: None,
                last_activity: Instant::now(),
                status: SessionStatus::Connecting,
                fault: None,
                max_queued: max_queued.max(1),
            }),
            notify: Notify::new(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    // ─── Lifecycle ──────────────────────────────────────────

    /// Binds the session to a connection and adopts the flags of its
    /// CONNECT. When `resumed`, unacknowledged deliveries are queued again
    /// with the dup flag and stale control packets are dropped.
    pub fn attach(&self, connect: &Connect, attachment: Attachment, resumed: bool) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.clean_session = connect.clean_session;
        state.keep_alive = connect.keep_alive;
        state.will = connect.will.clone();
        state.attachment = Some(attachment);
        state.status = SessionStatus::Connected;
        state.last_activity = Instant::now();
        state.fault = None;

        if resumed {
            let mut rebuilt = VecDeque::with_capacity(state.outbound.len() + state.awaited.len());
            for inflight in state.awaited.values_mut() {
                let mut packet = inflight.packet.clone();
                if let Packet::Publish(publish) = &mut packet {
                    publish.dup = true;
                }
                inflight.sent_at = None;
                rebuilt.push_back(packet);
            }
            let awaited = &state.awaited;
            let queued: Vec<Packet> = state
                .outbound
                .drain(..)
                .filter(|packet| match packet {
                    Packet::Publish(p) => p.packet_id.map_or(true, |id| !awaited.contains_key(&id)),
                    _ => false,
                })
                .collect();
            rebuilt.extend(queued);
            debug!(
                client_id = %self.client_id,
                pending = rebuilt.len(),
                subscriptions = state.subscriptions.len(),
                "session resumed"
            );
            state.outbound = rebuilt;
        }
        drop(guard);
        self.notify.notify_one();
    }

    /// Unbinds `conn_id`. Returns `false` when another connection already
    /// owns the session.
    pub fn detach(&self, conn_id: u64) -> bool {
        let mut state = self.state.lock();
        if !state.attachment.is_some_and(|a| a.conn_id == conn_id) {
            return false;
        }
        state.attachment = None;
        state.status = if state.clean_session {
            SessionStatus::Terminated
        } else {
            SessionStatus::DisconnectedRetained
        };
        true
    }

    /// Cuts the current connection loose for a takeover and hands back its
    /// will, which the caller must publish.
    pub fn evict(&self) -> Option<Will> {
        let will = {
            let mut state = self.state.lock();
            state.attachment = None;
            state.will.take()
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        will
    }

    /// Ends the session for good.
    pub fn terminate(&self) {
        {
            let mut state = self.state.lock();
            state.attachment = None;
            state.status = SessionStatus::Terminated;
        }
        self.notify.notify_one();
    }

    /// Records a fatal condition for the owning connection to act on.
    pub fn fail(&self, error: SessionError) {
        self.state.lock().fault = Some(error);
        self.notify.notify_one();
    }

    pub fn take_fault(&self) -> Option<SessionError> {
        self.state.lock().fault.take()
    }

    pub fn is_attached_to(&self, conn_id: u64) -> bool {
        self.state
            .lock()
            .attachment
            .is_some_and(|a| a.conn_id == conn_id)
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.state.lock().attachment
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn clean_session(&self) -> bool {
        self.state.lock().clean_session
    }

    pub fn take_will(&self) -> Option<Will> {
        self.state.lock().will.take()
    }

    pub fn discard_will(&self) {
        self.state.lock().will = None;
    }

    // ─── Keep-alive ─────────────────────────────────────────

    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// Time since the last inbound packet, if it exceeds `grace` times the
    /// negotiated keep-alive. A keep-alive of zero never expires.
    pub fn keep_alive_expired(&self, grace: f64) -> Option<Duration> {
        let state = self.state.lock();
        if state.keep_alive == 0 {
            return None;
        }
        let limit = Duration::from_secs(u64::from(state.keep_alive)).mul_f64(grace);
        let idle = state.last_activity.elapsed();
        (idle > limit).then_some(idle)
    }

    // ─── Subscriptions ──────────────────────────────────────

    pub fn subscribe(&self, filter: &str, qos: QoS) {
        self.state.lock().subscriptions.subscribe(filter, qos);
    }

    pub fn unsubscribe(&self, filter: &str) -> bool {
        self.state.lock().subscriptions.unsubscribe(filter)
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().subscriptions.iter().cloned().collect()
    }

    /// Queues `publish` if any subscription selects its topic, at the
    /// highest granted QoS. Returns whether it was queued.
    pub fn deliver(&self, publish: &Publish, matcher: &TopicMatcher) -> Result<bool, SessionError> {
        let mut state = self.state.lock();
        let Some(qos) = state.subscriptions.granted_qos(&publish.topic, matcher) else {
            return Ok(false);
        };
        self.push_publish(&mut state, publish, qos, false)?;
        drop(state);
        self.notify.notify_one();
        Ok(true)
    }

    // ─── Outbound queue ─────────────────────────────────────

    /// Queues a copy of `publish` with its own packet identifier.
    pub fn enqueue_publish(&self, publish: &Publish, qos: QoS, retain: bool) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        self.push_publish(&mut state, publish, qos, retain)?;
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Queues a control packet (acknowledgements, PINGRESP, CONNACK).
    pub fn enqueue(&self, packet: Packet) {
        self.state.lock().outbound.push_back(packet);
        self.notify.notify_one();
    }

    fn push_publish(
        &self,
        state: &mut SessionState,
        publish: &Publish,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(
                state
                    .packet_ids
                    .allocate()
                    .ok_or(SessionError::PacketIdsExhausted)?,
            ),
        };
        state.outbound.push_back(Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: publish.topic.clone(),
            packet_id,
            payload: publish.payload.clone(),
        }));

        let queued = state
            .outbound
            .iter()
            .filter(|p| matches!(p, Packet::Publish(_)))
            .count();
        if queued > state.max_queued {
            // resends of awaited deliveries are never dropped
            let awaited = &state.awaited;
            let oldest = state.outbound.iter().position(|p| match p {
                Packet::Publish(p) => p.packet_id.map_or(true, |id| !awaited.contains_key(&id)),
                _ => false,
            });
            if let Some(pos) = oldest {
                if let Some(Packet::Publish(dropped)) = state.outbound.remove(pos) {
                    if let Some(id) = dropped.packet_id {
                        state.packet_ids.release(id);
                    }
                    warn!(
                        client_id = %self.client_id,
                        topic = %dropped.topic,
                        "outbound queue full; dropped oldest publish"
                    );
                }
            }
        }
        Ok(())
    }

    /// Takes the next packet to write on connection `conn_id`. QoS 1/2
    /// publishes and PUBREL enter the awaited table as they leave the queue.
    /// Returns `None` once the session belongs to another connection.
    pub fn next_outbound(&self, conn_id: u64) -> Option<Packet> {
        let mut state = self.state.lock();
        if !state.attachment.is_some_and(|a| a.conn_id == conn_id) {
            return None;
        }
        let packet = state.outbound.pop_front()?;
        let expect = match &packet {
            Packet::Publish(p) => match (p.qos, p.packet_id) {
                (QoS::AtLeastOnce, Some(id)) => Some((id, PacketType::PubAck)),
                (QoS::ExactlyOnce, Some(id)) => Some((id, PacketType::PubRec)),
                _ => None,
            },
            Packet::PubRel(id) => Some((*id, PacketType::PubComp)),
            _ => None,
        };
        if let Some((id, expect)) = expect {
            state.awaited.insert(
                id,
                InFlight {
                    expect,
                    packet: packet.clone(),
                    sent_at: Some(Instant::now()),
                },
            );
        }
        Some(packet)
    }

    /// Puts back a packet taken by [`Session::next_outbound`] whose write
    /// failed, so the next connection sends it first.
    pub fn requeue_front(&self, packet: Packet) {
        let mut state = self.state.lock();
        let id = match &packet {
            Packet::Publish(p) => p.packet_id,
            Packet::PubRel(id) => Some(*id),
            _ => None,
        };
        if let Some(inflight) = id.and_then(|id| state.awaited.get_mut(&id)) {
            inflight.sent_at = None;
        }
        state.outbound.push_front(packet);
    }

    pub fn queued(&self) -> usize {
        self.state.lock().outbound.len()
    }

    pub fn awaiting(&self) -> usize {
        self.state.lock().awaited.len()
    }

    /// Wakes when another task queues a packet or changes the attachment.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    // ─── Acknowledgements ───────────────────────────────────

    /// PUBACK for a QoS 1 delivery.
    pub fn on_puback(&self, id: u16) -> bool {
        self.complete(id, PacketType::PubAck)
    }

    /// PUBCOMP closing a QoS 2 delivery.
    pub fn on_pubcomp(&self, id: u16) -> bool {
        self.complete(id, PacketType::PubComp)
    }

    /// PUBREC for a QoS 2 delivery: PUBREL goes out and PUBCOMP is awaited.
    /// A repeated PUBREC resends PUBREL.
    pub fn on_pubrec(&self, id: u16) -> bool {
        let mut state = self.state.lock();
        let Some(inflight) = state.awaited.get_mut(&id) else {
            return false;
        };
        match inflight.expect {
            PacketType::PubRec | PacketType::PubComp => {
                inflight.expect = PacketType::PubComp;
                inflight.packet = Packet::PubRel(id);
                inflight.sent_at = None;
            }
            _ => return false,
        }
        state.outbound.push_back(Packet::PubRel(id));
        drop(state);
        self.notify.notify_one();
        true
    }

    fn complete(&self, id: u16, ack: PacketType) -> bool {
        let mut state = self.state.lock();
        if !state.awaited.get(&id).is_some_and(|i| i.expect == ack) {
            return false;
        }
        state.awaited.remove(&id);
        state.packet_ids.release(id);
        true
    }

    /// Remembers an inbound QoS 2 id. `false` means it was already known.
    pub fn accept_incoming_qos2(&self, id: u16) -> bool {
        self.state.lock().incoming_qos2.insert(id)
    }

    pub fn release_incoming_qos2(&self, id: u16) -> bool {
        self.state.lock().incoming_qos2.remove(&id)
    }

    /// Queues again, with dup set, every delivery unacknowledged for longer
    /// than `timeout`. Returns how many were queued.
    pub fn retransmit_expired(&self, timeout: Duration) -> usize {
        let mut state = self.state.lock();
        let mut resend = Vec::new();
        for inflight in state.awaited.values_mut() {
            if !inflight.sent_at.is_some_and(|at| at.elapsed() >= timeout) {
                continue;
            }
            if let Packet::Publish(publish) = &mut inflight.packet {
                publish.dup = true;
            }
            inflight.sent_at = None;
            resend.push(inflight.packet.clone());
        }
        let count = resend.len();
        state.outbound.extend(resend);
        drop(state);
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }
}
