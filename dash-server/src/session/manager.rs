use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use port_pool::PortPool;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// A camera's media session: one leased RTP port (RTCP on the next port).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSession {
    pub id: String,
    pub camera_id: String,
    pub rtp_port: u16,
    pub created_at: DateTime<Utc>,
    /// Per-session lifetime overriding the server-wide session limit.
    pub expires_after: Option<Duration>,
}

impl StreamSession {
    pub fn rtcp_port(&self) -> Option<u16> {
        self.rtp_port.checked_add(1)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>, default_limit: Duration) -> bool {
        self.age(now) >= self.expires_after.unwrap_or(default_limit)
    }
}

/// Active sessions keyed by camera id, leasing ports from a [`PortPool`].
pub struct SessionManager {
    sessions: DashMap<String, StreamSession>,
    ports: Arc<PortPool>,
}

impl SessionManager {
    pub fn new(ports: Arc<PortPool>) -> Self {
        Self {
            sessions: DashMap::new(),
            ports,
        }
    }

    pub fn port_pool(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Open a session for `camera_id`, or return the one already open.
    pub fn open(&self, camera_id: &str, expires_after: Option<Duration>) -> Result<StreamSession> {
        match self.sessions.entry(camera_id.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(vacant) => {
                let rtp_port = self
                    .ports
                    .take_port()
                    .ok_or_else(|| Error::PortsExhausted(camera_id.to_string()))?;

                let session = StreamSession {
                    id: Uuid::new_v4().to_string(),
                    camera_id: camera_id.to_string(),
                    rtp_port,
                    created_at: Utc::now(),
                    expires_after,
                };
                info!(
                    "Opened session {} for camera {} on port {}",
                    session.id, camera_id, rtp_port
                );
                vacant.insert(session.clone());
                Ok(session)
            }
        }
    }

    /// Close the session of `camera_id` and return its port to the pool.
    pub fn close(&self, camera_id: &str) -> Option<StreamSession> {
        let (_, session) = self.sessions.remove(camera_id)?;
        self.ports.restore_port(session.rtp_port);
        info!(
            "Closed session {} for camera {} (port {})",
            session.id, camera_id, session.rtp_port
        );
        Some(session)
    }

    /// Retire the session's port after a bind failure and lease another.
    pub fn replace_port(&self, camera_id: &str) -> Result<u16> {
        let mut session = self
            .sessions
            .get_mut(camera_id)
            .ok_or_else(|| Error::not_found("session", camera_id))?;

        let old_port = session.rtp_port;
        let new_port = self
            .ports
            .take_port()
            .ok_or_else(|| Error::PortsExhausted(camera_id.to_string()))?;
        self.ports.remove_port(old_port);
        session.rtp_port = new_port;

        warn!(
            "Retired port {} of camera {}, now on port {}",
            old_port, camera_id, new_port
        );
        Ok(new_port)
    }

    pub fn get(&self, camera_id: &str) -> Option<StreamSession> {
        self.sessions.get(camera_id).map(|s| s.clone())
    }

    pub fn contains(&self, camera_id: &str) -> bool {
        self.sessions.contains_key(camera_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Camera ids whose sessions have outlived their limit at `now`.
    pub fn expired(&self, now: DateTime<Utc>, default_limit: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(now, default_limit))
            .map(|s| s.key().clone())
            .collect();
        if !expired.is_empty() {
            debug!("{} sessions past their limit", expired.len());
        }
        expired
    }

    /// Close every session.
    pub fn close_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        ids.iter().filter(|id| self.close(id).is_some()).count()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("ports", &self.ports)
            .finish()
    }
}
