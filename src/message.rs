/// the cross-worker invalidation protocol.
///
/// messages travel worker -> supervisor -> every other worker; the
/// supervisor's poller also originates broadcasts with no origin.  the
/// wire shape is `{cmd, payload, pid}` with `cmd` as the closed command
/// tag, so an unknown command fails at decode time instead of falling
/// through a string dispatch.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker::WorkerId;

/// shared-cache key holding the group-preferences watermark blob
pub const CACHE_TIMESTAMP_KEY: &str = "UpdateCacheTimestamp";

/// field inside the watermark blob carrying the preferences timestamp
pub const GROUP_PREFERENCES_FIELD: &str = "GroupPreferencesTimestamp";

/// shared-cache key holding the full preferences snapshot payload
pub const CLUSTER_CACHE_KEY: &str = "UpdateClusterCache";

/// shared-cache key holding the custom-terminology watermark blob
pub const TERMINOLOGY_TIMESTAMP_KEY: &str = "CustomTerminologyTimestamp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "payload")]
pub enum ClusterCommand {
    /// replace the full cached preferences snapshot
    UpdateClusterCache(Value),
    /// add or refresh one group's custom-terminology file set
    UpdateCustomTerminology {
        #[serde(rename = "GroupId")]
        group_id: String,
        #[serde(rename = "Files")]
        files: Value,
    },
    /// drop one group's custom-terminology entry
    RemoveCustomTerminology {
        #[serde(rename = "GroupId")]
        group_id: String,
    },
}

/// a relayed command plus its origin.  `origin: None` marks a
/// supervisor-side broadcast (the freshness poller); workers never see
/// their own messages come back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMessage {
    #[serde(flatten)]
    pub cmd: ClusterCommand,
    #[serde(rename = "pid", default)]
    pub origin: Option<WorkerId>,
}

impl ClusterMessage {
    /// a supervisor-originated broadcast, relayed to every worker
    pub fn broadcast(cmd: ClusterCommand) -> ClusterMessage {
        ClusterMessage { cmd, origin: None }
    }

    /// a worker-originated message, relayed to every other worker
    pub fn from_worker(cmd: ClusterCommand, origin: WorkerId) -> ClusterMessage {
        ClusterMessage {
            cmd,
            origin: Some(origin),
        }
    }

    /// true when this message originated at the given worker
    pub fn originated_by(&self, worker_id: &str) -> bool {
        self.origin.as_deref() == Some(worker_id)
    }
}
