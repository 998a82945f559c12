use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::packet::{Connect, ConnectReturnCode, Will};
use crate::core::session::{Attachment, ClientId, Session, SessionStatus};

/// Outcome of a successful connect-time attach.
#[derive(Debug)]
pub struct Attached {
    pub session: Arc<Session>,
    pub session_present: bool,
    /// Will of a connection that was taken over; the caller publishes it.
    pub evicted_will: Option<Will>,
}

/// [`SessionRegistry`] maps client identities to sessions.
///
/// Takeover and resume happen inside one critical section, so two racing
/// connects for the same identity always leave exactly one attached.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ClientId, Arc<Session>>>,
    max_queued: usize,
}

impl SessionRegistry {
    pub fn new(max_queued: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_queued,
        }
    }

    /// Resolves the identity of `connect` and binds it to `attachment`.
    ///
    /// * empty client id: a generated id when `clean_session = 1`, otherwise
    ///   [`ConnectReturnCode::IdentifierRejected`];
    /// * identity already attached: the older connection is evicted;
    /// * `clean_session = 0` on both sides: the stored session is resumed and
    ///   `session_present` is set.
    pub fn attach(
        &self,
        connect: &Connect,
        attachment: Attachment,
    ) -> Result<Attached, ConnectReturnCode> {
        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                return Err(ConnectReturnCode::IdentifierRejected);
            }
            ClientId(format!("blipmqtt-{}", Uuid::new_v4().simple()))
        } else {
            ClientId::from(connect.client_id.as_str())
        };

        let mut sessions = self.sessions.lock();
        let mut evicted_will = None;
        if let Some(existing) = sessions.get(&client_id).cloned() {
            if let Some(old) = existing.attachment() {
                info!(
                    client_id = %client_id,
                    old_conn = old.conn_id,
                    new_conn = attachment.conn_id,
                    "client id already connected; taking over"
                );
                evicted_will = existing.evict();
            }

            let resumable = !connect.clean_session
                && !existing.clean_session()
                && existing.status() != SessionStatus::Terminated;
            if resumable {
                existing.attach(connect, attachment, true);
                return Ok(Attached {
                    session: existing,
                    session_present: true,
                    evicted_will,
                });
            }
            existing.terminate();
            debug!(client_id = %client_id, "discarding previous session state");
        }

        let session = Arc::new(Session::new(client_id.clone(), connect, self.max_queued));
        session.attach(connect, attachment, false);
        sessions.insert(client_id, Arc::clone(&session));
        Ok(Attached {
            session,
            session_present: false,
            evicted_will,
        })
    }

    /// Unbinds `conn_id` from `session`; clean sessions leave the registry.
    /// Returns `false` when the connection had already been taken over.
    pub fn detach(&self, session: &Arc<Session>, conn_id: u64) -> bool {
        if !session.detach(conn_id) {
            return false;
        }
        if session.status() == SessionStatus::Terminated {
            self.remove(session);
        }
        true
    }

    /// Drops `session` if it is still the registered one for its identity.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(session.client_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.client_id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(&ClientId::from(client_id)).cloned()
    }

    /// Copy of every registered session, taken under the lock.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
