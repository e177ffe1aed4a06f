//! Shared connection registry: the slave set, the master set, and the
//! hostname target table. All cross-task state lives here behind one lock,
//! and every mutation or broadcast goes through these methods, so a
//! broadcast always observes a consistent snapshot.
//!
//! Outbound delivery uses `try_send` into each session's bounded outbox: a
//! peer whose outbox is full is evicted from the registry instead of ever
//! blocking a broadcast to healthy peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use manifest::protocol::{HubMessage, RelayMeta};

/// Per-session outbox depth. A peer this far behind is considered stalled.
pub const OUTBOX_CAPACITY: usize = 64;

/// Hub-side handle to one live connection's outbox.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub addr: SocketAddr,
    outbox: mpsc::Sender<String>,
}

impl SessionHandle {
    pub fn new(id: Uuid, addr: SocketAddr, outbox: mpsc::Sender<String>) -> Self {
        Self { id, addr, outbox }
    }
}

struct SlaveEntry {
    handle: SessionHandle,
    hostname: Option<String>,
}

#[derive(Default)]
struct Inner {
    slaves: HashMap<Uuid, SlaveEntry>,
    masters: HashMap<Uuid, SessionHandle>,
    targets: HashMap<String, Uuid>,
}

pub struct Registry {
    image_types: Vec<String>,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(image_types: Vec<String>) -> Self {
        Self {
            image_types,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn image_types(&self) -> &[String] {
        &self.image_types
    }

    pub fn serves_image_type(&self, image_type: &str) -> bool {
        self.image_types.iter().any(|t| t == image_type)
    }

    /// Add a slave session and queue its image-type advertisement.
    pub fn register_slave(&self, handle: SessionHandle) {
        let advert = HubMessage::image_types(self.image_types.clone()).to_json();
        let mut inner = self.inner.lock().unwrap();
        let mut stale = Vec::new();
        Inner::send_to(&handle, &advert, &mut stale);
        inner.slaves.insert(
            handle.id,
            SlaveEntry {
                handle,
                hostname: None,
            },
        );
        self.evict(&mut inner, stale);
    }

    /// Add a master session; it gets the advertisement plus the current
    /// target-table snapshot.
    pub fn register_master(&self, handle: SessionHandle) {
        let advert = HubMessage::image_types(self.image_types.clone()).to_json();
        let mut inner = self.inner.lock().unwrap();
        let snapshot = HubMessage::targets(inner.target_names()).to_json();
        let mut stale = Vec::new();
        Inner::send_to(&handle, &advert, &mut stale);
        Inner::send_to(&handle, &snapshot, &mut stale);
        inner.masters.insert(handle.id, handle);
        self.evict(&mut inner, stale);
    }

    /// Remove a session from whatever sets it belongs to. A slave that held
    /// a target-table entry triggers a `targets` rebroadcast to masters.
    pub fn deregister(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if inner.remove_session(id) {
            self.broadcast_targets(&mut inner);
        }
    }

    /// Relay a slave report, enriched, to every master; a `hostname` field
    /// in the report binds the target table and rebroadcasts it on change.
    pub fn slave_report(&self, id: Uuid, origin: SocketAddr, data: serde_json::Value) {
        let hostname = data
            .get("hostname")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let relayed = HubMessage::Report {
            relay: Some(RelayMeta::stamp(&origin)),
            data,
        }
        .to_json();

        let mut inner = self.inner.lock().unwrap();
        let mut stale = Vec::new();
        inner.broadcast_masters(&relayed, &mut stale);
        if !stale.is_empty() {
            self.evict(&mut inner, stale);
        }

        if let Some(hostname) = hostname {
            if inner.bind_hostname(id, &hostname) {
                info!("Target registered: {} ({})", hostname, origin);
                self.broadcast_targets(&mut inner);
            }
        }
    }

    /// Route an operator command to the named slave. An unknown target is
    /// dropped without feedback; that is deliberate, not an oversight.
    pub fn master_command(&self, origin: SocketAddr, target: &str, data: serde_json::Value) {
        let relayed = HubMessage::Command {
            target: target.to_string(),
            relay: Some(RelayMeta::stamp(&origin)),
            data,
        }
        .to_json();

        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner
            .targets
            .get(target)
            .and_then(|id| inner.slaves.get(id))
        else {
            debug!("Dropping command for unknown target {}", target);
            return;
        };
        let mut stale = Vec::new();
        Inner::send_to(&entry.handle, &relayed, &mut stale);
        self.evict(&mut inner, stale);
    }

    /// Fan a new-manifest notification out to every connection, slave and
    /// master alike.
    pub fn broadcast_new_manifest(&self, image_type: &str) {
        let msg = HubMessage::new_manifest(image_type).to_json();
        let mut inner = self.inner.lock().unwrap();
        let mut stale = Vec::new();
        for entry in inner.slaves.values() {
            Inner::send_to(&entry.handle, &msg, &mut stale);
        }
        inner.broadcast_masters(&msg, &mut stale);
        self.evict(&mut inner, stale);
    }

    /// Current target-table snapshot, mainly for diagnostics and tests.
    pub fn targets(&self) -> Vec<String> {
        self.inner.lock().unwrap().target_names()
    }

    pub fn slave_count(&self) -> usize {
        self.inner.lock().unwrap().slaves.len()
    }

    pub fn master_count(&self) -> usize {
        self.inner.lock().unwrap().masters.len()
    }

    fn broadcast_targets(&self, inner: &mut Inner) {
        let msg = HubMessage::targets(inner.target_names()).to_json();
        let mut stale = Vec::new();
        inner.broadcast_masters(&msg, &mut stale);
        self.evict(inner, stale);
    }

    /// Drop stalled sessions. Evicting a slave can shrink the target table,
    /// which itself must be rebroadcast; iterate until stable.
    fn evict(&self, inner: &mut Inner, mut stale: Vec<Uuid>) {
        while !stale.is_empty() {
            let mut targets_changed = false;
            for id in stale.drain(..) {
                warn!("Evicting stalled session {}", id);
                targets_changed |= inner.remove_session(id);
            }
            if targets_changed {
                let msg = HubMessage::targets(inner.target_names()).to_json();
                inner.broadcast_masters(&msg, &mut stale);
            }
        }
    }
}

impl Inner {
    fn send_to(handle: &SessionHandle, msg: &str, stale: &mut Vec<Uuid>) {
        if handle.outbox.try_send(msg.to_string()).is_err() {
            stale.push(handle.id);
        }
    }

    fn broadcast_masters(&self, msg: &str, stale: &mut Vec<Uuid>) {
        for handle in self.masters.values() {
            Self::send_to(handle, msg, stale);
        }
    }

    /// Remove a session everywhere it appears. Returns whether the target
    /// table changed.
    fn remove_session(&mut self, id: Uuid) -> bool {
        self.masters.remove(&id);
        let Some(entry) = self.slaves.remove(&id) else {
            return false;
        };
        match entry.hostname {
            Some(hostname) => {
                // Only unbind if the table still points at this session; a
                // newer session may have taken the hostname over.
                if self.targets.get(&hostname) == Some(&id) {
                    self.targets.remove(&hostname);
                    return true;
                }
                false
            }
            None => false,
        }
    }

    /// Bind a hostname to a slave session. Returns whether the table changed.
    fn bind_hostname(&mut self, id: Uuid, hostname: &str) -> bool {
        let Some(entry) = self.slaves.get_mut(&id) else {
            return false;
        };
        if entry.hostname.as_deref() == Some(hostname) {
            return false;
        }
        if let Some(old) = entry.hostname.take() {
            if self.targets.get(&old) == Some(&id) {
                self.targets.remove(&old);
            }
        }
        entry.hostname = Some(hostname.to_string());
        self.targets.insert(hostname.to_string(), id);
        true
    }

    fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }
}
