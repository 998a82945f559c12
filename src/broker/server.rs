use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::broker::connection::Connection;
use crate::broker::registry::SessionRegistry;
use crate::config::Config;
use crate::core::packet::{Publish, Will};
use crate::core::session::{Session, SessionError};
use crate::core::topics::{RetainedStore, TopicMatcher};

/// Shared broker state: sessions, retained messages and configuration.
#[derive(Debug)]
pub struct Broker {
    config: Config,
    sessions: SessionRegistry,
    retained: RetainedStore,
    matcher: TopicMatcher,
    connections: Arc<Semaphore>,
    next_conn_id: AtomicU64,
}

impl Broker {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionRegistry::new(config.session.max_queued_packets),
            retained: RetainedStore::new(),
            matcher: TopicMatcher::new(config.wildcard_policy()),
            connections: Arc::new(Semaphore::new(config.server.max_connections)),
            next_conn_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    pub fn matcher(&self) -> &TopicMatcher {
        &self.matcher
    }

    /// Binds `bind_addr` and serves until Ctrl-C.
    pub async fn start(self: Arc<Self>, bind_addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("ctrl-c received; shutting down"),
                Err(e) => error!("failed to listen for ctrl-c: {}", e),
            }
            let _ = shutdown_tx.send(true);
        });
        self.serve(listener, shutdown_rx).await
    }

    /// Runs the accept loop on `listener` until `shutdown` flips or its
    /// sender is dropped. Each connection gets its own task.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(policy = ?self.matcher.policy(), "blipmqtt listening on {}", local_addr);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
                            }
                            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                            let permit = Arc::clone(&self.connections).try_acquire_owned().ok();
                            debug!("accepted connection {} from {}", conn_id, peer);

                            let connection = Connection::new(
                                conn_id,
                                peer,
                                stream,
                                Arc::clone(&self),
                                permit,
                                shutdown.clone(),
                            );
                            tokio::spawn(connection.run());
                        }
                        Err(err) => {
                            error!("accept error: {}", err);
                        }
                    }
                }
                result = shutdown.changed() => {
                    match result {
                        Ok(_) => info!("shutdown signal received; stopping accept loop"),
                        Err(_) => info!("shutdown sender dropped; stopping accept loop"),
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Routes an inbound publish: retained store first, then fan-out.
    pub fn route(&self, publish: &Publish) -> usize {
        if publish.retain {
            self.retained.retain(publish);
        }
        self.publish(&publish.topic, publish)
    }

    /// Publishes a will exactly as if its owner had sent it.
    pub fn publish_will(&self, client_id: &str, will: Will) -> usize {
        info!(client_id, topic = %will.topic, "publishing will");
        let publish = Publish {
            dup: false,
            qos: will.qos,
            retain: will.retain,
            topic: will.topic,
            packet_id: None,
            payload: will.payload,
        };
        self.route(&publish)
    }

    /// Queues `publish` on every session with a subscription selecting
    /// `topic`, once per session at the highest granted QoS, with retain
    /// cleared. Returns the number of sessions reached.
    pub fn publish(&self, topic: &str, publish: &Publish) -> usize {
        let mut routed = publish.clone();
        routed.topic = topic.to_string();
        let mut delivered = 0;
        for session in self.sessions.snapshot() {
            match session.deliver(&routed, &self.matcher) {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(err) => self.fail_session(&session, err),
            }
        }
        debug!(topic, delivered, "fan-out complete");
        delivered
    }

    /// Tears down a session that can no longer take deliveries.
    fn fail_session(&self, session: &Arc<Session>, err: SessionError) {
        warn!(client_id = %session.client_id(), "dropping session: {}", err);
        if session.attachment().is_some() {
            session.fail(err);
        } else {
            self.sessions.remove(session);
            session.terminate();
        }
    }

    /// Number of connections currently holding a slot.
    pub fn active_connections(&self) -> usize {
        self.config.server.max_connections - self.connections.available_permits()
    }
}

/// Serves `config` on its configured bind address until Ctrl-C.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind_addr.clone();
    Broker::new(config).start(&bind_addr).await
}
