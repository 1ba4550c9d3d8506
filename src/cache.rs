/// the local cache mutator.
///
/// each worker owns exactly one `LocalCache`; relayed commands are the
/// only thing that mutates it.  all three operations are idempotent and
/// purely in-memory, so applying a command never blocks the request
/// path and re-applying a duplicate relay is harmless.
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ClusterCommand;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalCache {
    preferences: Option<Value>,
    terminology: HashMap<String, Value>,
}

impl LocalCache {
    pub fn new() -> LocalCache {
        LocalCache::default()
    }

    /// apply one relayed command; duplicates leave the state unchanged
    pub fn apply(&mut self, cmd: &ClusterCommand) {
        match cmd {
            ClusterCommand::UpdateClusterCache(snapshot) => {
                self.preferences = Some(snapshot.clone());
            }
            ClusterCommand::UpdateCustomTerminology { group_id, files } => {
                self.terminology.insert(group_id.clone(), files.clone());
            }
            ClusterCommand::RemoveCustomTerminology { group_id } => {
                // removing an absent group is a no-op
                self.terminology.remove(group_id);
            }
        }
    }

    pub fn preferences(&self) -> Option<&Value> {
        self.preferences.as_ref()
    }

    pub fn terminology(&self, group_id: &str) -> Option<&Value> {
        self.terminology.get(group_id)
    }

    pub fn terminology_len(&self) -> usize {
        self.terminology.len()
    }
}
