use anyhow::{anyhow, Result};
use async_channel::{bounded, Receiver, Sender};
use async_std::future::timeout;
use hashbrown::HashMap;
use log::*;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::LocalCache;
use crate::cluster::worker::{RequestJob, Worker, WorkerCommand};
use crate::config::ClusterConfig;
use crate::fault::{FaultContext, RequestEnvelope, ResponseHandle};
use crate::message::ClusterMessage;
use crate::notifier::ExceptionNotifier;
use crate::poller::FreshnessPoller;
use crate::shared_cache::SharedCache;
use crate::worker::{ExitNotice, WorkerId, WorkerRecord, WorkerState, WorkerStatus};

/// everything the supervisor loop reacts to.  workers, the poller and
/// the public handle all feed this one channel, so events from a single
/// origin are processed in order.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// forward to every connected worker except the origin
    Relay(ClusterMessage),
    /// route one request job to a worker
    Dispatch(RequestJob),
    /// a worker's handler loop is up
    Listening(WorkerId),
    /// a worker unit terminated
    Exit(ExitNotice),
    /// a respawn backoff timer fired
    Respawn,
    /// collect status from the whole pool
    Status(Sender<Vec<WorkerStatus>>),
    /// ids of the live workers
    Workers(Sender<Vec<WorkerId>>),
    /// local-cache snapshots from the whole pool
    Snapshots(Sender<Vec<(WorkerId, LocalCache)>>),
    /// records of recently exited workers, newest last
    Retired(Sender<Vec<WorkerRecord>>),
    /// cooperative disconnect of one worker; it will not be respawned
    DisconnectWorker(WorkerId),
    /// drain the pool and stop
    Shutdown(Sender<()>),
}

/// handle to a running cluster.  the pool itself lives inside the
/// supervisor loop task; this handle just feeds it events.
#[derive(Debug, Clone)]
pub struct Supervisor {
    pub pool_size: usize,
    events: Sender<SupervisorEvent>,
    config: ClusterConfig,
}

impl Supervisor {
    /// spawn the pool, the freshness poller and the supervisor loop
    pub async fn start(
        config: ClusterConfig,
        shared_cache: Arc<dyn SharedCache>,
        notifier: Arc<dyn ExceptionNotifier>,
    ) -> Result<Supervisor> {
        let pool_size = config.clamped_pool_size();
        info!(
            "cluster initializing with a maximum of {} workers",
            pool_size
        );

        let (events, events_rx) = bounded(500);

        let mut pool = Pool::new(config.clone(), pool_size, events.clone(), notifier);
        for _ in 0..pool_size {
            pool.spawn_worker();
        }

        let poller = FreshnessPoller::new(shared_cache, events.clone(), config.poll_interval());
        async_std::task::spawn(poller.run());
        async_std::task::spawn(run_loop(pool, events_rx));

        Ok(Supervisor {
            pool_size,
            events,
            config,
        })
    }

    pub async fn status(&self) -> Vec<WorkerStatus> {
        let (tx, rx) = bounded(1);
        if self.events.send(SupervisorEvent::Status(tx)).await.is_err() {
            return vec![];
        }
        rx.recv().await.unwrap_or_default()
    }

    pub async fn worker_ids(&self) -> Vec<WorkerId> {
        let (tx, rx) = bounded(1);
        if self.events.send(SupervisorEvent::Workers(tx)).await.is_err() {
            return vec![];
        }
        rx.recv().await.unwrap_or_default()
    }

    pub async fn snapshots(&self) -> Vec<(WorkerId, LocalCache)> {
        let (tx, rx) = bounded(1);
        if self
            .events
            .send(SupervisorEvent::Snapshots(tx))
            .await
            .is_err()
        {
            return vec![];
        }
        rx.recv().await.unwrap_or_default()
    }

    /// records of exited workers with their final state and exit reason
    pub async fn retired(&self) -> Vec<WorkerRecord> {
        let (tx, rx) = bounded(1);
        if self.events.send(SupervisorEvent::Retired(tx)).await.is_err() {
            return vec![];
        }
        rx.recv().await.unwrap_or_default()
    }

    /// build a per-request context stamped with the configured server kind
    pub fn request_context(
        &self,
        request: RequestEnvelope,
        response: ResponseHandle,
        user_digest: Option<String>,
    ) -> FaultContext {
        FaultContext::new(request, response, self.config.server_kind, user_digest)
    }

    /// relay a message to every worker other than its origin
    pub async fn relay(&self, msg: ClusterMessage) -> Result<()> {
        self.events
            .send(SupervisorEvent::Relay(msg))
            .await
            .map_err(|_| anyhow!("supervisor loop is gone"))
    }

    /// route one request job into the pool
    pub async fn dispatch(&self, job: RequestJob) -> Result<()> {
        self.events
            .send(SupervisorEvent::Dispatch(job))
            .await
            .map_err(|_| anyhow!("supervisor loop is gone"))
    }

    /// retire one worker deliberately; no replacement is spawned
    pub async fn disconnect_worker(&self, worker_id: &str) -> Result<()> {
        self.events
            .send(SupervisorEvent::DisconnectWorker(worker_id.to_string()))
            .await
            .map_err(|_| anyhow!("supervisor loop is gone"))
    }

    /// cooperative drain-then-stop; errors if the pool does not empty
    /// within the configured grace period
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.events
            .send(SupervisorEvent::Shutdown(tx))
            .await
            .map_err(|_| anyhow!("supervisor loop is gone"))?;

        timeout(self.config.shutdown_grace(), rx.recv())
            .await
            .map_err(|_| anyhow!("shutdown grace period elapsed before the pool drained"))?
            .map_err(|_| anyhow!("supervisor loop dropped the shutdown reply"))?;

        Ok(())
    }
}

struct WorkerEntry {
    worker: Worker,
    record: WorkerRecord,
}

/// how many exit records the pool retains
const RETIRED_HISTORY: usize = 64;

struct Pool {
    config: ClusterConfig,
    pool_size: usize,
    events: Sender<SupervisorEvent>,
    notifier: Arc<dyn ExceptionNotifier>,
    workers: HashMap<WorkerId, WorkerEntry>,
    retired: Vec<WorkerRecord>,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    shutting_down: bool,
    shutdown_reply: Option<Sender<()>>,
}

impl Pool {
    fn new(
        config: ClusterConfig,
        pool_size: usize,
        events: Sender<SupervisorEvent>,
        notifier: Arc<dyn ExceptionNotifier>,
    ) -> Pool {
        Pool {
            config,
            pool_size,
            events,
            notifier,
            workers: HashMap::with_capacity(pool_size),
            retired: Vec::new(),
            consecutive_failures: 0,
            last_failure: None,
            shutting_down: false,
            shutdown_reply: None,
        }
    }

    fn spawn_worker(&mut self) {
        let worker = Worker::spawn(
            self.events.clone(),
            self.notifier.clone(),
            self.config.kill_timeout(),
        );
        let id = worker.id().to_string();
        let record = WorkerRecord::new(id.clone());
        self.workers.insert(id, WorkerEntry { worker, record });
    }

    fn mark_listening(&mut self, worker_id: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.record.state = WorkerState::Listening;
            debug!("cluster worker {} is now connected", worker_id);
        }
    }

    // fan-out never awaits a worker's command channel; a worker deep in
    // backlog loses the message with a warn rather than wedging the loop
    fn relay(&self, msg: ClusterMessage) {
        for (id, entry) in self.workers.iter() {
            if msg.originated_by(id) {
                continue;
            }
            if let Err(e) = entry
                .worker
                .command_channel()
                .try_send(WorkerCommand::Cluster(msg.clone()))
            {
                warn!("relay to worker {} failed: {}", id, e);
            }
        }
    }

    fn dispatch(&self, job: RequestJob) {
        let candidates: Vec<&WorkerEntry> = self
            .workers
            .values()
            .filter(|entry| entry.record.state != WorkerState::Disconnecting)
            .collect();

        if candidates.is_empty() {
            warn!("no workers available, dropping request");
            return;
        }

        let entry = candidates[fastrand::usize(..candidates.len())];
        if let Err(e) = entry
            .worker
            .command_channel()
            .try_send(WorkerCommand::Request(job))
        {
            warn!(
                "dispatch to worker {} failed, dropping request: {}",
                entry.worker.id(),
                e
            );
        }
    }

    async fn handle_exit(&mut self, notice: ExitNotice) {
        match self.workers.remove(&notice.worker_id) {
            Some(mut entry) => {
                entry.record.mark_exited(notice.reason.clone());
                self.retired.push(entry.record);
                if self.retired.len() > RETIRED_HISTORY {
                    self.retired.remove(0);
                }
            }
            None => debug!("exit notice for unknown worker {}", notice.worker_id),
        }

        if self.shutting_down {
            debug!(
                "cluster worker {} exited during shutdown, reason: {:?}",
                notice.worker_id, notice.reason
            );
            return;
        }

        if !notice.reason.should_respawn() {
            debug!(
                "cluster worker {} exited deliberately, not respawning",
                notice.worker_id
            );
            return;
        }

        let delay = self.next_backoff();
        warn!(
            "cluster worker {} died, reason: {:?}, respawning in {:?}",
            notice.worker_id, notice.reason, delay
        );

        let events = self.events.clone();
        async_std::task::spawn(async move {
            async_std::task::sleep(delay).await;
            let _ = events.send(SupervisorEvent::Respawn).await;
        });
    }

    fn next_backoff(&mut self) -> std::time::Duration {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) > self.config.backoff.reset_after() {
                self.consecutive_failures = 0;
            }
        }
        self.last_failure = Some(now);

        let delay = self.config.backoff.delay(self.consecutive_failures);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        delay
    }

    fn handle_respawn(&mut self) {
        if self.shutting_down {
            return;
        }
        if self.workers.len() >= self.pool_size {
            debug!("pool already at size, skipping respawn");
            return;
        }
        self.spawn_worker();
    }

    async fn collect_status(&self) -> Vec<WorkerStatus> {
        let mut out = Vec::with_capacity(self.workers.len());
        for entry in self.workers.values() {
            let (tx, rx) = bounded(1);
            if entry
                .worker
                .command_channel()
                .send(WorkerCommand::Status(tx))
                .await
                .is_ok()
            {
                if let Ok(status) = rx.recv().await {
                    out.push(status);
                }
            }
        }
        out
    }

    async fn collect_snapshots(&self) -> Vec<(WorkerId, LocalCache)> {
        let mut out = Vec::with_capacity(self.workers.len());
        for (id, entry) in self.workers.iter() {
            let (tx, rx) = bounded(1);
            if entry
                .worker
                .command_channel()
                .send(WorkerCommand::Snapshot(tx))
                .await
                .is_ok()
            {
                if let Ok(cache) = rx.recv().await {
                    out.push((id.clone(), cache));
                }
            }
        }
        out
    }

    fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }

    fn retired_records(&self) -> Vec<WorkerRecord> {
        self.retired.clone()
    }

    async fn disconnect_one(&mut self, worker_id: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.record.state = WorkerState::Disconnecting;
            let _ = entry
                .worker
                .command_channel()
                .send(WorkerCommand::Disconnect)
                .await;
        } else {
            debug!("disconnect requested for unknown worker {}", worker_id);
        }
    }

    async fn begin_shutdown(&mut self, reply: Sender<()>) {
        info!(
            "shutdown requested, draining {} workers",
            self.workers.len()
        );
        self.shutting_down = true;
        self.shutdown_reply = Some(reply);

        for entry in self.workers.values_mut() {
            entry.record.state = WorkerState::Disconnecting;
            let _ = entry
                .worker
                .command_channel()
                .send(WorkerCommand::Disconnect)
                .await;
        }
    }

    async fn finish_shutdown(&mut self) {
        info!("cluster has gracefully shut down");
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(()).await;
        }
    }

    fn drained(&self) -> bool {
        self.shutting_down && self.workers.is_empty()
    }
}


async fn run_loop(mut pool: Pool, events: Receiver<SupervisorEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            SupervisorEvent::Relay(msg) => pool.relay(msg),
            SupervisorEvent::Dispatch(job) => pool.dispatch(job),
            SupervisorEvent::Listening(id) => pool.mark_listening(&id),
            SupervisorEvent::Exit(notice) => pool.handle_exit(notice).await,
            SupervisorEvent::Respawn => pool.handle_respawn(),
            SupervisorEvent::Status(tx) => {
                let statuses = pool.collect_status().await;
                let _ = tx.send(statuses).await;
            }
            SupervisorEvent::Workers(tx) => {
                let _ = tx.send(pool.worker_ids()).await;
            }
            SupervisorEvent::Snapshots(tx) => {
                let snapshots = pool.collect_snapshots().await;
                let _ = tx.send(snapshots).await;
            }
            SupervisorEvent::Retired(tx) => {
                let _ = tx.send(pool.retired_records()).await;
            }
            SupervisorEvent::DisconnectWorker(id) => pool.disconnect_one(&id).await,
            SupervisorEvent::Shutdown(tx) => pool.begin_shutdown(tx).await,
        }

        if pool.drained() {
            pool.finish_shutdown().await;
            break;
        }
    }

    events.close();
}
