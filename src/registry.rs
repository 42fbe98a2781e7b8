//! Process-wide map of live sessions, used to route control messages from
//! outside a session's own connection (shutdown broadcasts, operators).

use crate::error::{EngineError, Result};
use crate::protocol::ControlMessage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use strum::Display;
use tokio::sync::mpsc;

const CONTROL_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    Raw,
    Telephony,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub kind: TransportKind,
    pub connected_at: DateTime<Utc>,
}

struct Entry {
    info: SessionInfo,
    control: mpsc::Sender<ControlMessage>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Entry>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        })
    }

    /// Add a session under a fresh id. The session stays registered until the
    /// returned guard is dropped.
    pub fn register(self: &Arc<Self>, kind: TransportKind) -> Result<SessionGuard> {
        let mut sessions = self.write();
        if sessions.len() >= self.max_sessions {
            return Err(EngineError::Session(format!(
                "Max sessions reached ({})",
                self.max_sessions
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (control, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let info = SessionInfo {
            id: id.clone(),
            kind,
            connected_at: Utc::now(),
        };
        sessions.insert(id.clone(), Entry { info, control });
        log::info!("Registered {} session {} ({} active)", kind, id, sessions.len());

        Ok(SessionGuard {
            id,
            registry: Arc::clone(self),
            control_rx: Some(control_rx),
        })
    }

    fn deregister(&self, id: &str) {
        let mut sessions = self.write();
        if sessions.remove(id).is_some() {
            log::info!("Deregistered session {} ({} active)", id, sessions.len());
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.read().get(id).map(|entry| entry.info.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Route a control message to one session. False if it is gone.
    pub async fn send_control(&self, id: &str, message: ControlMessage) -> bool {
        let control = match self.read().get(id) {
            Some(entry) => entry.control.clone(),
            None => return false,
        };
        control.send(message).await.is_ok()
    }

    /// Send `message` to every live session; returns how many accepted it.
    pub async fn broadcast(&self, message: ControlMessage) -> usize {
        let targets: Vec<mpsc::Sender<ControlMessage>> =
            self.read().values().map(|entry| entry.control.clone()).collect();

        let mut delivered = 0;
        for control in targets {
            if control.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registration handle held by a running session. Dropping it deregisters.
pub struct SessionGuard {
    id: String,
    registry: Arc<SessionRegistry>,
    control_rx: Option<mpsc::Receiver<ControlMessage>>,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The receiving end of this session's control channel. Only once.
    pub fn take_control(&mut self) -> Option<mpsc::Receiver<ControlMessage>> {
        self.control_rx.take()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.id);
    }
}
