//! Push-channel lock updates
//!
//! The backend frames every push message as `{"channel": ..., "data": ...}`:
//! - `locks:{project}` carries `{componentId, lock}` (a `null` lock means
//!   removal) or `{bulk_update: true, affected_components: [...]}`
//! - `conflicts:{project}` carries `{conflictId, resolution, status}`
//! - `sync-response:{project}` carries a full `{locks, conflicts}` snapshot

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::types::{ComponentLock, LockConflict};
use crate::error::{Error, Result};

/// A decoded out-of-band change to one project's lock state
#[derive(Debug, Clone, PartialEq)]
pub enum LockUpdate {
    /// A lock was created or changed
    Upserted(ComponentLock),
    /// The lock on a component was cleared
    Removed { component_id: String },
    /// A bulk change touched these components; fresh state must be fetched
    BulkChanged { component_ids: Vec<String> },
    /// Another user settled a conflict
    ConflictResolved { conflict_id: String },
    /// Authoritative replacement of the whole project state
    Snapshot {
        locks: HashMap<String, ComponentLock>,
        conflicts: Vec<LockConflict>,
    },
}

/// A push message addressed to one project
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectUpdate {
    pub project_id: String,
    pub update: LockUpdate,
}

#[derive(Deserialize)]
struct Envelope {
    channel: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocksPayload {
    Bulk {
        bulk_update: bool,
        #[serde(default)]
        affected_components: Vec<String>,
    },
    Single {
        #[serde(rename = "componentId")]
        component_id: String,
        lock: Option<ComponentLock>,
    },
}

#[derive(Deserialize)]
struct ConflictPayload {
    #[serde(rename = "conflictId")]
    conflict_id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct SyncPayload {
    #[serde(default)]
    locks: HashMap<String, ComponentLock>,
    #[serde(default)]
    conflicts: Vec<LockConflict>,
}

impl ProjectUpdate {
    /// Decode a parsed push payload.
    ///
    /// Returns `Ok(None)` for well-formed messages on channels that carry no
    /// lock state (subscription acks, echoes, token refreshes...).
    pub fn from_message(message: &Value) -> Result<Option<Self>> {
        let envelope = Envelope::deserialize(message)
            .map_err(|e| Error::Parse(format!("missing channel envelope: {}", e)))?;

        let Some((prefix, project_id)) = envelope.channel.split_once(':') else {
            debug!(channel = %envelope.channel, "Ignoring push message without project scope");
            return Ok(None);
        };

        let update = match prefix {
            "locks" => match LocksPayload::deserialize(&envelope.data)
                .map_err(|e| Error::Parse(format!("bad lock update: {}", e)))?
            {
                LocksPayload::Bulk {
                    bulk_update: true,
                    affected_components,
                } => LockUpdate::BulkChanged {
                    component_ids: affected_components,
                },
                LocksPayload::Bulk { .. } => return Ok(None),
                LocksPayload::Single {
                    component_id,
                    lock: Some(lock),
                } => {
                    if lock.component_id != component_id {
                        return Err(Error::Parse(format!(
                            "lock for '{}' delivered under component '{}'",
                            lock.component_id, component_id
                        )));
                    }
                    LockUpdate::Upserted(lock)
                }
                LocksPayload::Single {
                    component_id,
                    lock: None,
                } => LockUpdate::Removed { component_id },
            },
            "conflicts" => {
                let payload = ConflictPayload::deserialize(&envelope.data)
                    .map_err(|e| Error::Parse(format!("bad conflict update: {}", e)))?;
                match payload.status.as_deref() {
                    Some("resolved") | None => LockUpdate::ConflictResolved {
                        conflict_id: payload.conflict_id,
                    },
                    Some(_) => return Ok(None),
                }
            }
            "sync-response" => {
                let payload = SyncPayload::deserialize(&envelope.data)
                    .map_err(|e| Error::Parse(format!("bad sync response: {}", e)))?;
                LockUpdate::Snapshot {
                    locks: payload.locks,
                    conflicts: payload.conflicts,
                }
            }
            _ => {
                debug!(channel = %envelope.channel, "Ignoring push message on unrelated channel");
                return Ok(None);
            }
        };

        Ok(Some(Self {
            project_id: project_id.to_string(),
            update,
        }))
    }
}
