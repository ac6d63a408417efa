//! Notification hub — connection-oriented pub/sub.
//!
//! Clients subscribe to groups over a persistent connection:
//!
//! - `bucket:{id}` — public
//! - `file:{id}:{path}` — public
//! - `global` — admin connections only
//!
//! Mutating handlers publish after their write commits.  Delivery is
//! best-effort per recipient: a closed receiver is dropped from its
//! groups, and a disconnected subscriber simply loses events.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::metadata::store::{BucketRecord, FileRecord};

/// The global group name, restricted to admin connections.
pub const GLOBAL_GROUP: &str = "global";

/// Group name for one bucket's events.
pub fn bucket_group(bucket_id: &str) -> String {
    format!("bucket:{bucket_id}")
}

/// Group name for one file's events.
pub fn file_group(bucket_id: &str, path: &str) -> String {
    format!("file:{bucket_id}:{path}")
}

/// A change event, serialized snake_case with null fields omitted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    FileCreated {
        bucket_id: String,
        file: FileRecord,
    },
    FileUpdated {
        bucket_id: String,
        file: FileRecord,
    },
    FileDeleted {
        bucket_id: String,
        path: String,
    },
    BucketCreated {
        bucket: BucketRecord,
    },
    BucketUpdated {
        bucket_id: String,
        changes: serde_json::Value,
    },
    BucketDeleted {
        bucket_id: String,
    },
}

impl Event {
    /// The groups this event fans out to.
    fn groups(&self) -> Vec<String> {
        match self {
            Event::FileCreated { bucket_id, file }
            | Event::FileUpdated { bucket_id, file } => vec![
                bucket_group(bucket_id),
                file_group(bucket_id, &file.path),
                GLOBAL_GROUP.to_string(),
            ],
            Event::FileDeleted { bucket_id, path } => vec![
                bucket_group(bucket_id),
                file_group(bucket_id, path),
                GLOBAL_GROUP.to_string(),
            ],
            Event::BucketCreated { .. } => vec![GLOBAL_GROUP.to_string()],
            Event::BucketUpdated { bucket_id, .. }
            | Event::BucketDeleted { bucket_id } => {
                vec![bucket_group(bucket_id), GLOBAL_GROUP.to_string()]
            }
        }
    }
}

/// Identifier of one hub connection.
pub type ConnId = u64;

struct Connection {
    sender: mpsc::UnboundedSender<String>,
    is_admin: bool,
    groups: HashSet<String>,
}

#[derive(Default)]
struct HubInner {
    next_id: ConnId,
    connections: HashMap<ConnId, Connection>,
    /// group name → member connection ids.
    groups: HashMap<String, HashSet<ConnId>>,
}

/// Pub/sub hub shared across the process.
#[derive(Default)]
pub struct NotificationHub {
    inner: Mutex<HubInner>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. `is_admin` gates the `global` group.
    pub fn register(&self, is_admin: bool) -> (ConnId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.connections.insert(
            id,
            Connection {
                sender: tx,
                is_admin,
                groups: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Add a connection to a group. Returns false when the group is
    /// restricted and the connection is not admin.
    pub fn subscribe(&self, conn: ConnId, group: &str) -> bool {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let Some(connection) = inner.connections.get_mut(&conn) else {
            return false;
        };
        if group == GLOBAL_GROUP && !connection.is_admin {
            return false;
        }
        connection.groups.insert(group.to_string());
        inner.groups.entry(group.to_string()).or_default().insert(conn);
        true
    }

    /// Remove a connection from a group.
    pub fn unsubscribe(&self, conn: ConnId, group: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if let Some(connection) = inner.connections.get_mut(&conn) {
            connection.groups.remove(group);
        }
        let emptied = match inner.groups.get_mut(group) {
            Some(members) => {
                members.remove(&conn);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.groups.remove(group);
        }
    }

    /// Drop a connection and all its memberships.
    pub fn disconnect(&self, conn: ConnId) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if let Some(connection) = inner.connections.remove(&conn) {
            for group in connection.groups {
                let emptied = match inner.groups.get_mut(&group) {
                    Some(members) => {
                        members.remove(&conn);
                        members.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    inner.groups.remove(&group);
                }
            }
        }
    }

    /// Fan an event out to every subscriber of its groups.
    ///
    /// Each connection receives the event once even when it sits in
    /// several matching groups.  Send failures mark the connection dead
    /// and it is pruned.
    pub fn publish(&self, event: &Event) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize hub event");
                return;
            }
        };

        let inner = self.inner.lock().expect("mutex poisoned");
        let mut recipients: HashSet<ConnId> = HashSet::new();
        for group in event.groups() {
            if let Some(members) = inner.groups.get(&group) {
                recipients.extend(members.iter().copied());
            }
        }

        let mut dead: Vec<ConnId> = Vec::new();
        for conn in recipients {
            if let Some(connection) = inner.connections.get(&conn) {
                if connection.sender.send(payload.clone()).is_err() {
                    dead.push(conn);
                }
            }
        }
        drop(inner);

        for conn in dead {
            self.disconnect(conn);
        }
    }
}

// -- Tests --------------------------------------------------------------------
