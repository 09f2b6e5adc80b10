//! # Tunnel Registry
//!
//! Process-wide keyed store of tunnel descriptors. Owns the full
//! lifecycle: create, attach, detach, delete, idle sweep. The map itself
//! is a [`DashMap`], so lookups on the proxy path never contend with each
//! other; mutation takes only the entry's shard guard, briefly. Attach is
//! the single-writer gate for session installation: token check and
//! session install happen under one `get_mut` guard, so two racing
//! attaches for the same id cannot both win.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;
use tunnel_protocol::CloseKind;
use uuid::Uuid;

use crate::config::metadata_within_bounds;
use crate::session::Session;

/// Generates a tunnel identifier: 16 lowercase hex characters (64 bits of
/// a v4 UUID), short and URL-safe.
pub fn new_tunnel_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Generates an attach token: the full 128 bits of a v4 UUID as hex.
pub fn new_auth_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Caller-supplied attributes for a new tunnel.
#[derive(Debug, Default, Clone)]
pub struct TunnelSpec {
    pub name: Option<String>,
    pub local_port: Option<u16>,
    pub metadata: HashMap<String, String>,
}

/// One tunnel descriptor. The token is validated on every attach and is
/// never exposed after create; the attached session is at most one.
struct Tunnel {
    name: Option<String>,
    local_port: Option<u16>,
    token: String,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    metadata: HashMap<String, String>,
    session: Option<Arc<Session>>,
}

/// Point-in-time copy of a descriptor, safe to hand to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub tunnel_id: String,
    pub name: Option<String>,
    pub local_port: Option<u16>,
    pub status: &'static str,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// What `create` hands back. The token appears here and nowhere else.
#[derive(Debug)]
pub struct Created {
    pub tunnel_id: String,
    pub auth_token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CreateError {
    CapacityExceeded,
    MetadataTooLarge,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AttachError {
    UnknownId,
    BadToken,
    AlreadyAttached,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RouteError {
    NotFound,
    NotConnected,
}

pub struct Registry {
    tunnels: DashMap<String, Tunnel>,

    /// Serializes creates so the capacity cap is exact. Everything else
    /// stays lock-free on the map.
    create_lock: Mutex<()>,

    next_session_seq: AtomicU64,
    max_tunnels: usize,
    idle_timeout: chrono::Duration,
}

impl Registry {
    pub fn new(max_tunnels: usize, idle_timeout: std::time::Duration) -> Self {
        Registry {
            tunnels: DashMap::new(),
            create_lock: Mutex::new(()),
            next_session_seq: AtomicU64::new(1),
            max_tunnels,
            idle_timeout: chrono::Duration::from_std(idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
        }
    }

    /// Process-unique number for a new session; used by `detach` to make
    /// sure a stale disconnect cannot remove a newer session.
    pub fn next_session_seq(&self) -> u64 {
        self.next_session_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a fresh id and token and inserts an unattached
    /// descriptor.
    pub fn create(&self, spec: TunnelSpec) -> Result<Created, CreateError> {
        if !metadata_within_bounds(&spec.metadata) {
            return Err(CreateError::MetadataTooLarge);
        }

        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.tunnels.len() >= self.max_tunnels {
            return Err(CreateError::CapacityExceeded);
        }

        let mut id = new_tunnel_id();
        while self.tunnels.contains_key(&id) {
            id = new_tunnel_id();
        }
        let token = new_auth_token();
        let now = Utc::now();
        self.tunnels.insert(
            id.clone(),
            Tunnel {
                name: spec.name,
                local_port: spec.local_port,
                token: token.clone(),
                created_at: now,
                last_active: now,
                metadata: spec.metadata,
                session: None,
            },
        );
        Ok(Created {
            tunnel_id: id,
            auth_token: token,
            created_at: now,
        })
    }

    /// Validates the token and installs the session, atomically per id.
    /// There is no silent takeover: a second session for the same id is
    /// rejected while the first is attached.
    pub fn attach(
        &self,
        id: &str,
        token: &str,
        session: Arc<Session>,
    ) -> Result<(), AttachError> {
        let mut entry = self.tunnels.get_mut(id).ok_or(AttachError::UnknownId)?;
        if entry.token != token {
            return Err(AttachError::BadToken);
        }
        if entry.session.is_some() {
            return Err(AttachError::AlreadyAttached);
        }
        entry.session = Some(session);
        entry.last_active = Utc::now();
        Ok(())
    }

    /// Removes the attached session, but only if it is still the one the
    /// caller owns. Idempotent: a detach that lost a race with delete,
    /// sweep, or a reconnect is a no-op.
    pub fn detach(&self, id: &str, session_seq: u64) {
        if let Some(mut entry) = self.tunnels.get_mut(id) {
            if entry.session.as_ref().map(|s| s.seq()) == Some(session_seq) {
                entry.session = None;
                entry.last_active = Utc::now();
            }
        }
    }

    /// Removes the descriptor. An attached session is told to terminate
    /// with cause `ADMIN_DELETE`. Returns false if the id was not present
    /// (the second of two deletes is a no-op).
    pub fn delete(&self, id: &str) -> bool {
        match self.tunnels.remove(id) {
            Some((_, tunnel)) => {
                if let Some(session) = tunnel.session {
                    session.close(CloseKind::AdminDelete);
                }
                true
            }
            None => false,
        }
    }

    /// Resolves a tunnel id to its attached session, for the proxy path.
    pub fn attached(&self, id: &str) -> Result<Arc<Session>, RouteError> {
        let entry = self.tunnels.get(id).ok_or(RouteError::NotFound)?;
        entry.session.clone().ok_or(RouteError::NotConnected)
    }

    /// Non-blocking descriptor read.
    pub fn snapshot(&self, id: &str) -> Option<TunnelSnapshot> {
        self.tunnels.get(id).map(|entry| snapshot_of(id, &entry))
    }

    /// Point-in-time copy of every descriptor, for the control plane.
    pub fn list(&self) -> Vec<TunnelSnapshot> {
        self.tunnels
            .iter()
            .map(|entry| snapshot_of(entry.key(), entry.value()))
            .collect()
    }

    /// Bumps `last_active`, keeping it non-decreasing. Called for every
    /// frame observed on an attached session.
    pub fn touch(&self, id: &str) {
        if let Some(mut entry) = self.tunnels.get_mut(id) {
            let now = Utc::now();
            if now > entry.last_active {
                entry.last_active = now;
            }
        }
    }

    /// Evicts descriptors that have no attached session and have been
    /// idle longer than the idle timeout. Attached descriptors are left
    /// alone; heartbeats police those. Returns the eviction count.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.tunnels.len();
        self.tunnels
            .retain(|_, t| t.session.is_some() || now - t.last_active <= self.idle_timeout);
        before - self.tunnels.len()
    }

    /// Tells every attached session the process is going down.
    pub fn shutdown_sessions(&self) {
        let mut closed = 0usize;
        for entry in self.tunnels.iter() {
            if let Some(session) = &entry.session {
                session.close(CloseKind::Shutdown);
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "closed attached sessions for shutdown");
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

fn snapshot_of(id: &str, tunnel: &Tunnel) -> TunnelSnapshot {
    let connected = tunnel.session.is_some();
    TunnelSnapshot {
        tunnel_id: id.to_string(),
        name: tunnel.name.clone(),
        local_port: tunnel.local_port,
        status: if connected { "connected" } else { "idle" },
        connected,
        created_at: tunnel.created_at,
        last_active: tunnel.last_active,
        metadata: tunnel.metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OUTBOUND_QUEUE_FRAMES;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tunnel_protocol::DEFAULT_MAX_FRAME_BYTES;

    fn registry() -> Registry {
        Registry::new(100, Duration::from_secs(120))
    }

    fn test_session(registry: &Registry) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_FRAMES);
        let session = Session::new(
            "unused",
            registry.next_session_seq(),
            tx,
            128,
            DEFAULT_MAX_FRAME_BYTES,
        );
        (session, rx)
    }

    #[test]
    fn ids_are_short_and_tokens_are_long() {
        let id = new_tunnel_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(new_auth_token().len(), 32);
        assert_ne!(new_tunnel_id(), new_tunnel_id());
    }

    #[test]
    fn create_enforces_the_capacity_cap() {
        let registry = Registry::new(2, Duration::from_secs(120));
        registry.create(TunnelSpec::default()).unwrap();
        registry.create(TunnelSpec::default()).unwrap();
        assert_eq!(
            registry.create(TunnelSpec::default()).unwrap_err(),
            CreateError::CapacityExceeded
        );

        // Deleting one frees a slot.
        let id = registry.list()[0].tunnel_id.clone();
        assert!(registry.delete(&id));
        registry.create(TunnelSpec::default()).unwrap();
    }

    #[test]
    fn create_rejects_oversized_metadata() {
        let registry = registry();
        let mut metadata = HashMap::new();
        metadata.insert("k".to_string(), "v".repeat(10_000));
        let err = registry
            .create(TunnelSpec {
                metadata,
                ..TunnelSpec::default()
            })
            .unwrap_err();
        assert_eq!(err, CreateError::MetadataTooLarge);
    }

    #[test]
    fn attach_validates_token_and_exclusivity() {
        let registry = registry();
        let created = registry.create(TunnelSpec::default()).unwrap();
        let id = &created.tunnel_id;

        let (bad, _rx) = test_session(&registry);
        assert_eq!(
            registry.attach(id, "wrong-token", bad).unwrap_err(),
            AttachError::BadToken
        );
        let (nowhere, _rx) = test_session(&registry);
        assert_eq!(
            registry
                .attach("0000000000000000", &created.auth_token, nowhere)
                .unwrap_err(),
            AttachError::UnknownId
        );

        let (first, _rx1) = test_session(&registry);
        registry.attach(id, &created.auth_token, first).unwrap();
        let (second, _rx2) = test_session(&registry);
        assert_eq!(
            registry
                .attach(id, &created.auth_token, second)
                .unwrap_err(),
            AttachError::AlreadyAttached
        );
        assert!(registry.snapshot(id).unwrap().connected);
    }

    #[test]
    fn detach_only_removes_the_matching_session() {
        let registry = registry();
        let created = registry.create(TunnelSpec::default()).unwrap();
        let id = &created.tunnel_id;
        let (session, _rx) = test_session(&registry);
        let seq = session.seq();
        registry.attach(id, &created.auth_token, session).unwrap();

        // A stale seq (e.g. an older connection's cleanup) is a no-op.
        registry.detach(id, seq + 1000);
        assert!(registry.snapshot(id).unwrap().connected);

        registry.detach(id, seq);
        assert!(!registry.snapshot(id).unwrap().connected);
        // Idempotent.
        registry.detach(id, seq);

        // Same id and token can reconnect after a mere detach.
        let (again, _rx) = test_session(&registry);
        registry.attach(id, &created.auth_token, again).unwrap();
    }

    #[test]
    fn delete_severs_the_attached_session_and_is_terminal() {
        let registry = registry();
        let created = registry.create(TunnelSpec::default()).unwrap();
        let id = &created.tunnel_id;
        let (session, _rx) = test_session(&registry);
        registry
            .attach(id, &created.auth_token, session.clone())
            .unwrap();

        assert!(registry.delete(id));
        assert!(session.is_closed());
        assert_eq!(session.close_cause(), Some(CloseKind::AdminDelete));
        assert!(registry.snapshot(id).is_none());

        // Second delete: same terminal state, reported as a no-op.
        assert!(!registry.delete(id));
        assert!(registry.is_empty());

        // The old token is dead with the descriptor.
        let (stale, _rx) = test_session(&registry);
        assert_eq!(
            registry.attach(id, &created.auth_token, stale).unwrap_err(),
            AttachError::UnknownId
        );
    }

    #[test]
    fn routing_distinguishes_missing_from_unattached() {
        let registry = registry();
        let created = registry.create(TunnelSpec::default()).unwrap();
        assert_eq!(
            registry.attached("no-such-id").unwrap_err(),
            RouteError::NotFound
        );
        assert_eq!(
            registry.attached(&created.tunnel_id).unwrap_err(),
            RouteError::NotConnected
        );
        let (session, _rx) = test_session(&registry);
        registry
            .attach(&created.tunnel_id, &created.auth_token, session)
            .unwrap();
        assert!(registry.attached(&created.tunnel_id).is_ok());
    }

    #[test]
    fn touch_keeps_last_active_non_decreasing() {
        let registry = registry();
        let created = registry.create(TunnelSpec::default()).unwrap();
        let before = registry.snapshot(&created.tunnel_id).unwrap().last_active;
        registry.touch(&created.tunnel_id);
        registry.touch(&created.tunnel_id);
        let after = registry.snapshot(&created.tunnel_id).unwrap().last_active;
        assert!(after >= before);
    }

    #[test]
    fn sweep_evicts_only_idle_unattached_descriptors() {
        let registry = Registry::new(100, Duration::from_secs(120));
        let idle = registry.create(TunnelSpec::default()).unwrap();
        let attached = registry.create(TunnelSpec::default()).unwrap();
        let (session, _rx) = test_session(&registry);
        registry
            .attach(&attached.tunnel_id, &attached.auth_token, session)
            .unwrap();

        // Well within the idle window: nothing to do.
        assert_eq!(registry.sweep(Utc::now()), 0);

        // Past the window: only the unattached one goes.
        let later = Utc::now() + chrono::Duration::seconds(121);
        assert_eq!(registry.sweep(later), 1);
        assert!(registry.snapshot(&idle.tunnel_id).is_none());
        assert!(registry.snapshot(&attached.tunnel_id).is_some());
    }
}
