/// the cache freshness poller.
///
/// runs inside the supervisor only, never in workers, so the shared
/// cache is read once per cycle for the whole cluster.  each cycle
/// evaluates the two watermark axes independently; a failure on one
/// axis is logged and skipped without touching the other, and the timer
/// keeps running no matter how many cycles fail.
use async_channel::Sender;
use log::*;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::supervisor::SupervisorEvent;
use crate::message::{
    ClusterCommand, ClusterMessage, CACHE_TIMESTAMP_KEY, CLUSTER_CACHE_KEY,
    GROUP_PREFERENCES_FIELD, TERMINOLOGY_TIMESTAMP_KEY,
};
use crate::shared_cache::SharedCache;
use crate::watermark::{Freshness, Watermark};

/// the custom-terminology watermark blob as written by the publishing
/// side: a timestamp, which command to relay, and the group it applies
/// to.  update blobs carry the group's file set so workers never fetch.
#[derive(Debug, Deserialize)]
struct TerminologyStamp {
    timestamp: u64,
    cmd: String,
    #[serde(rename = "GroupId")]
    group_id: String,
    #[serde(rename = "Files", default)]
    files: Value,
}

pub struct FreshnessPoller {
    cache: Arc<dyn SharedCache>,
    events: Sender<SupervisorEvent>,
    interval: Duration,
    preferences: Watermark,
    terminology: Watermark,
}

impl FreshnessPoller {
    /// cursors start at the current wall clock, so only updates written
    /// after startup will broadcast
    pub fn new(
        cache: Arc<dyn SharedCache>,
        events: Sender<SupervisorEvent>,
        interval: Duration,
    ) -> FreshnessPoller {
        FreshnessPoller::with_cursors(
            cache,
            events,
            interval,
            Watermark::starting_now("group-preferences"),
            Watermark::starting_now("custom-terminology"),
        )
    }

    pub fn with_cursors(
        cache: Arc<dyn SharedCache>,
        events: Sender<SupervisorEvent>,
        interval: Duration,
        preferences: Watermark,
        terminology: Watermark,
    ) -> FreshnessPoller {
        FreshnessPoller {
            cache,
            events,
            interval,
            preferences,
            terminology,
        }
    }

    /// the timer loop; runs until the supervisor goes away
    pub async fn run(mut self) {
        info!("freshness poller running every {:?}", self.interval);

        loop {
            async_std::task::sleep(self.interval).await;
            if self.events.is_closed() {
                debug!("supervisor channel closed, poller stopping");
                break;
            }
            self.poll_once().await;
        }
    }

    /// one cycle: both axes, independently
    pub async fn poll_once(&mut self) {
        self.poll_preferences().await;
        self.poll_terminology().await;
    }

    async fn poll_preferences(&mut self) {
        let blob = match self.cache.get(CACHE_TIMESTAMP_KEY).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return,
            Err(e) => {
                warn!("preferences watermark read failed: {:#}", e);
                return;
            }
        };

        let observed = match blob.get(GROUP_PREFERENCES_FIELD).and_then(Value::as_u64) {
            Some(ts) => ts,
            None => {
                warn!("malformed preferences watermark blob: {}", blob);
                return;
            }
        };

        if self.preferences.observe(observed) == Freshness::Unchanged {
            return;
        }

        debug!(
            "group-preferences watermark advanced to {}, fetching snapshot",
            observed
        );

        match self.cache.get(CLUSTER_CACHE_KEY).await {
            Ok(Some(payload)) => {
                self.broadcast(ClusterCommand::UpdateClusterCache(payload))
                    .await;
            }
            Ok(None) => warn!("preferences watermark advanced but the snapshot is missing"),
            Err(e) => warn!("preferences snapshot fetch failed: {:#}", e),
        }
    }

    async fn poll_terminology(&mut self) {
        let blob = match self.cache.get(TERMINOLOGY_TIMESTAMP_KEY).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return,
            Err(e) => {
                warn!("terminology watermark read failed: {:#}", e);
                return;
            }
        };

        let stamp: TerminologyStamp = match serde_json::from_value(blob) {
            Ok(stamp) => stamp,
            Err(e) => {
                warn!("malformed terminology watermark blob: {:?}", e);
                return;
            }
        };

        if self.terminology.observe(stamp.timestamp) == Freshness::Unchanged {
            return;
        }

        // the blob's own cmd field selects update vs remove
        let cmd = match stamp.cmd.as_str() {
            "UpdateCustomTerminology" => ClusterCommand::UpdateCustomTerminology {
                group_id: stamp.group_id,
                files: stamp.files,
            },
            "RemoveCustomTerminology" => ClusterCommand::RemoveCustomTerminology {
                group_id: stamp.group_id,
            },
            other => {
                warn!("unknown terminology command: {}", other);
                return;
            }
        };

        self.broadcast(cmd).await;
    }

    async fn broadcast(&self, cmd: ClusterCommand) {
        let msg = ClusterMessage::broadcast(cmd);
        if self
            .events
            .send(SupervisorEvent::Relay(msg))
            .await
            .is_err()
        {
            warn!("supervisor channel closed, dropping broadcast");
        }
    }
}
