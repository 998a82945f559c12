use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::broker::server::Broker;
use crate::broker::transport::Transport;
use crate::core::error::ProtocolError;
use crate::core::packet::{
    decode, encode, ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck,
    SubAckReturnCode, Subscribe, Unsubscribe, PROTOCOL_LEVEL,
};
use crate::core::session::{Attachment, Session, SessionError};

/// What the dispatcher wants the loop to do next.
enum Flow {
    Continue,
    Disconnect,
}

/// Orderly ways for a connection to end.
#[derive(Debug)]
enum Ending {
    Disconnected,
    Shutdown,
}

/// One accepted socket, from CONNECT to teardown.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    transport: Transport,
    broker: Arc<Broker>,
    // released when the connection ends
    permit: Option<OwnedSemaphorePermit>,
    shutdown: watch::Receiver<bool>,
    session: Option<Arc<Session>>,
}

impl Connection {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        stream: TcpStream,
        broker: Arc<Broker>,
        permit: Option<OwnedSemaphorePermit>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let config = broker.config();
        let transport = Transport::new(stream, &config.retry, config.server.max_packet_size);
        Self {
            id,
            peer,
            transport,
            broker,
            permit,
            shutdown,
            session: None,
        }
    }

    pub async fn run(mut self) {
        let span = tracing::info_span!(
            "connection",
            conn_id = self.id,
            peer = %self.peer,
            client_id = tracing::field::Empty
        );
        async move {
            let result = self.run_inner().await;
            self.finish(result).await;
        }
        .instrument(span)
        .await
    }

    async fn run_inner(&mut self) -> Result<Ending, SessionError> {
        let connect = self.read_connect().await?;
        let session = self.handshake(connect).await?;
        self.serve_session(&session).await
    }

    async fn read_connect(&mut self) -> Result<Connect, SessionError> {
        let wait = self.broker.config().connect_timeout();
        if !self.transport.poll_readable(wait).await {
            return Err(SessionError::ConnectTimeout(wait));
        }
        let frame = self
            .transport
            .recv()
            .await
            .ok_or(SessionError::TransportFailure)?;
        match decode(&frame)? {
            Packet::Connect(connect) => Ok(connect),
            other => Err(SessionError::ExpectedConnect(other.packet_type())),
        }
    }

    /// Validates CONNECT, attaches a session and answers with CONNACK.
    async fn handshake(&mut self, connect: Connect) -> Result<Arc<Session>, SessionError> {
        debug!(
            client_id = %connect.client_id,
            protocol_level = connect.protocol_level,
            will = connect.will.is_some(),
            "CONNECT received"
        );
        let config = self.broker.config();
        let refusal = if connect.protocol_level != PROTOCOL_LEVEL {
            Some(ConnectReturnCode::UnacceptableProtocolLevel)
        } else if self.permit.is_none() {
            Some(ConnectReturnCode::ServerUnavailable)
        } else {
            config
                .check_credentials(connect.username.as_deref(), connect.password.as_deref())
                .err()
        };
        if let Some(code) = refusal {
            return Err(self.refuse(code).await);
        }

        let attachment = Attachment {
            conn_id: self.id,
            peer: self.peer,
        };
        let attached = match self.broker.sessions().attach(&connect, attachment) {
            Ok(attached) => attached,
            Err(code) => return Err(self.refuse(code).await),
        };
        let session = attached.session;
        self.session = Some(Arc::clone(&session));
        Span::current().record("client_id", &**session.client_id());
        info!(
            clean_session = connect.clean_session,
            keep_alive = connect.keep_alive,
            session_present = attached.session_present,
            "client connected"
        );

        // the evicted connection will not publish it, whatever happens next
        if let Some(will) = attached.evicted_will {
            self.broker.publish_will(session.client_id(), will);
        }
        let connack = encode(&Packet::ConnAck(ConnAck {
            session_present: attached.session_present,
            code: ConnectReturnCode::Accepted,
        }))?;
        if !self.transport.send(&connack).await {
            return Err(SessionError::TransportFailure);
        }
        Ok(session)
    }

    async fn refuse(&mut self, code: ConnectReturnCode) -> SessionError {
        let connack = Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        });
        match encode(&connack) {
            Ok(bytes) => {
                self.transport.send(&bytes).await;
            }
            Err(e) => warn!("failed to encode CONNACK: {}", e),
        }
        SessionError::Rejected(code)
    }

    /// The per-connection loop: receive, dispatch, flush, retransmit, and
    /// enforce keep-alive.
    async fn serve_session(&mut self, session: &Arc<Session>) -> Result<Ending, SessionError> {
        let config = self.broker.config();
        let idle = config.idle_poll();
        let ack_timeout = config.ack_timeout();
        let grace = config.session.keep_alive_grace;

        loop {
            if let Some(fault) = session.take_fault() {
                return Err(fault);
            }
            if !session.is_attached_to(self.id) {
                return Err(SessionError::TakenOver);
            }
            self.flush(session).await?;

            tokio::select! {
                readable = self.transport.poll_readable(idle) => {
                    if readable {
                        let frame = self
                            .transport
                            .recv()
                            .await
                            .ok_or(SessionError::TransportFailure)?;
                        let packet = decode(&frame)?;
                        session.touch();
                        debug!(%packet, "received");
                        if let Flow::Disconnect = self.dispatch(session, packet)? {
                            self.flush(session).await?;
                            return Ok(Ending::Disconnected);
                        }
                    }
                }
                _ = session.notified() => {}
                _ = self.shutdown.changed() => return Ok(Ending::Shutdown),
            }

            let resent = session.retransmit_expired(ack_timeout);
            if resent > 0 {
                debug!(resent, "retransmitting unacknowledged packets");
            }
            if let Some(idle_for) = session.keep_alive_expired(grace) {
                return Err(SessionError::KeepAliveExpired(idle_for));
            }
        }
    }

    /// Writes queued packets while this connection still owns the session.
    async fn flush(&mut self, session: &Session) -> Result<(), SessionError> {
        while let Some(packet) = session.next_outbound(self.id) {
            let bytes = encode(&packet)?;
            trace!(%packet, "sending");
            if !self.transport.send(&bytes).await {
                session.requeue_front(packet);
                return Err(SessionError::TransportFailure);
            }
        }
        Ok(())
    }

    fn dispatch(&self, session: &Session, packet: Packet) -> Result<Flow, SessionError> {
        match packet {
            Packet::Publish(publish) => self.on_publish(session, publish)?,
            Packet::PubAck(id) => {
                if !session.on_puback(id) {
                    debug!(id, "PUBACK for unknown packet id");
                }
            }
            Packet::PubRec(id) => {
                if !session.on_pubrec(id) {
                    debug!(id, "PUBREC for unknown packet id");
                }
            }
            Packet::PubRel(id) => {
                session.release_incoming_qos2(id);
                session.enqueue(Packet::PubComp(id));
            }
            Packet::PubComp(id) => {
                if !session.on_pubcomp(id) {
                    debug!(id, "PUBCOMP for unknown packet id");
                }
            }
            Packet::Subscribe(subscribe) => self.on_subscribe(session, subscribe)?,
            Packet::Unsubscribe(unsubscribe) => self.on_unsubscribe(session, unsubscribe),
            Packet::PingReq => session.enqueue(Packet::PingResp),
            Packet::Disconnect => {
                session.discard_will();
                return Ok(Flow::Disconnect);
            }
            Packet::Connect(_) => return Err(SessionError::UnexpectedConnect),
            other => return Err(SessionError::Unimplemented(other.packet_type())),
        }
        Ok(Flow::Continue)
    }

    fn on_publish(&self, session: &Session, publish: Publish) -> Result<(), SessionError> {
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                self.broker.route(&publish);
            }
            (QoS::AtLeastOnce, Some(id)) => {
                self.broker.route(&publish);
                session.enqueue(Packet::PubAck(id));
            }
            (QoS::ExactlyOnce, Some(id)) => {
                if session.accept_incoming_qos2(id) {
                    self.broker.route(&publish);
                } else {
                    debug!(id, "duplicate QoS 2 publish; not routed again");
                }
                session.enqueue(Packet::PubRec(id));
            }
            _ => return Err(ProtocolError::ZeroPacketId.into()),
        }
        Ok(())
    }

    /// SUBACK first, then retained replay for every accepted filter.
    fn on_subscribe(&self, session: &Session, subscribe: Subscribe) -> Result<(), SessionError> {
        let matcher = self.broker.matcher();
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut accepted = Vec::new();
        for (filter, qos) in subscribe.filters {
            match matcher.validate_filter(&filter) {
                Ok(()) => {
                    session.subscribe(&filter, qos);
                    info!(%filter, qos = u8::from(qos), "subscribed");
                    return_codes.push(SubAckReturnCode::Granted(qos));
                    accepted.push((filter, qos));
                }
                Err(e) => {
                    warn!(%filter, "rejected filter: {}", e);
                    return_codes.push(SubAckReturnCode::Failure);
                }
            }
        }
        session.enqueue(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }));

        for (filter, qos) in accepted {
            for retained in self.broker.retained().matching(&filter, matcher) {
                session.enqueue_publish(&retained, qos, true)?;
            }
        }
        Ok(())
    }

    fn on_unsubscribe(&self, session: &Session, unsubscribe: Unsubscribe) {
        for filter in &unsubscribe.filters {
            if session.unsubscribe(filter) {
                info!(%filter, "unsubscribed");
            }
        }
        session.enqueue(Packet::UnsubAck(unsubscribe.packet_id));
    }

    async fn finish(&mut self, result: Result<Ending, SessionError>) {
        match &result {
            Ok(Ending::Disconnected) => info!("client disconnected"),
            Ok(Ending::Shutdown) => info!("closing for broker shutdown"),
            Err(SessionError::Rejected(code)) => info!(%code, "connection refused"),
            Err(SessionError::TakenOver) => info!("connection taken over"),
            Err(err @ SessionError::Protocol(_)) => warn!("closing: {}", err),
            Err(err) => info!("connection lost: {}", err),
        }

        if let Some(session) = self.session.take() {
            let owes_will = matches!(&result, Err(err) if err.publishes_will());
            if owes_will && session.is_attached_to(self.id) {
                if let Some(will) = session.take_will() {
                    self.broker.publish_will(session.client_id(), will);
                }
            }
            self.broker.sessions().detach(&session, self.id);
        }
        self.transport.close().await;
        self.permit.take();
    }
}
