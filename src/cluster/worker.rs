use anyhow::Result;
use async_channel::{bounded, Receiver, Sender};
use async_std::future::timeout;
use domain_keys::keys::RouteKey;
use log::*;
use service_uptime::Uptime;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::LocalCache;
use crate::cluster::supervisor::SupervisorEvent;
use crate::fault::{self, FaultContext, HandlerFuture, Outcome};
use crate::message::{ClusterCommand, ClusterMessage};
use crate::notifier::ExceptionNotifier;
use crate::worker::{ExitNotice, ExitReason, WorkerId, WorkerState, WorkerStatus};

/// one request job: the fault context travels with the handler future,
/// so a fault raised in any later continuation is attributed to this
/// request and no other.
pub struct RequestJob {
    pub ctx: FaultContext,
    pub handler: HandlerFuture,
}

impl RequestJob {
    pub fn new(ctx: FaultContext, handler: HandlerFuture) -> RequestJob {
        RequestJob { ctx, handler }
    }
}

impl fmt::Debug for RequestJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestJob")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum WorkerCommand {
    /// a relayed cluster message; applied to the local cache
    Cluster(ClusterMessage),
    /// run one request inside the fault boundary
    Request(RequestJob),
    /// request the worker's status
    Status(Sender<WorkerStatus>),
    /// clone of the worker's local cache, for inspection
    Snapshot(Sender<LocalCache>),
    /// cooperative disconnect; the worker exits deliberately
    Disconnect,
}

// the handler loop
pub async fn handler(
    id: WorkerId,
    rx: Receiver<WorkerCommand>,
    events: Sender<SupervisorEvent>,
    notifier: Arc<dyn ExceptionNotifier>,
    kill_timeout: Duration,
) -> Result<ExitReason> {
    let uptime = Uptime::new();
    let mut state = WorkerState::Connected;
    let mut error_count: u16 = 0;
    let mut cache = LocalCache::new();

    debug!("worker {} state: {:?}", id, state);
    let _ = events.send(SupervisorEvent::Listening(id.clone())).await;
    state = WorkerState::Listening;

    let mut exit = ExitReason::Deliberate;
    while let Ok(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Cluster(msg) => {
                if msg.originated_by(&id) {
                    debug!("worker {} skipping its own message", id);
                    continue;
                }
                debug!("worker {} applying {:?}", id, msg.cmd);
                cache.apply(&msg.cmd);
            }
            WorkerCommand::Request(job) => {
                match fault::guard(job.ctx, job.handler, notifier.as_ref()).await {
                    Outcome::Completed => {}
                    Outcome::Retire { forced } => {
                        error_count += 1;
                        state = WorkerState::Disconnecting;
                        exit = ExitReason::Fault;
                        info!("worker {} retiring, state: {:?}", id, state);
                        if !forced {
                            retire(&id, &rx, kill_timeout).await;
                        }
                        break;
                    }
                }
            }
            WorkerCommand::Status(tx) => {
                let status = WorkerStatus::new(
                    id.to_string(),
                    state.clone(),
                    uptime.to_string(),
                    error_count,
                );

                if tx.send(status).await.is_err() {
                    error_count += 1;
                    error!("error returning status to channel: {:?}", tx);
                }
            }
            WorkerCommand::Snapshot(tx) => {
                if tx.send(cache.clone()).await.is_err() {
                    error_count += 1;
                    error!("error returning cache snapshot");
                }
            }
            WorkerCommand::Disconnect => {
                state = WorkerState::Disconnecting;
                info!("worker id: {}, state: {:?}", id, state);
                exit = ExitReason::Deliberate;
                break;
            }
        }
    }

    rx.close();

    Ok(exit)
}

/// cooperative cleanup after a fault, raced against the kill timer: the
/// worker is torn down when the timer elapses even if draining stalled
async fn retire(id: &WorkerId, rx: &Receiver<WorkerCommand>, kill_timeout: Duration) {
    let drain = async {
        rx.close();
        // flush already-queued commands; repliers see closed channels
        while let Ok(cmd) = rx.recv().await {
            debug!("worker {} dropping queued {:?} during retirement", id, cmd);
        }
    };

    if timeout(kill_timeout, drain).await.is_err() {
        warn!("worker {} kill timer elapsed before cleanup finished", id);
    }
}

/// publishes worker-originated cluster messages to the supervisor's
/// relay; handed out to request handlers that mutate shared state
#[derive(Debug, Clone)]
pub struct ClusterPublisher {
    origin: WorkerId,
    events: Sender<SupervisorEvent>,
}

impl ClusterPublisher {
    pub async fn publish(&self, cmd: ClusterCommand) -> Result<()> {
        let msg = ClusterMessage::from_worker(cmd, self.origin.clone());
        self.events
            .send(SupervisorEvent::Relay(msg))
            .await
            .map_err(|_| anyhow::anyhow!("supervisor channel closed"))
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    id: WorkerId,
    uptime: Uptime,
    command_tx: Sender<WorkerCommand>,
    events: Sender<SupervisorEvent>,
}

//
impl Worker {
    /// create and start a new worker unit.  the exit notice is posted to
    /// the supervisor's event channel when the handler loop ends.
    pub(crate) fn spawn(
        events: Sender<SupervisorEvent>,
        notifier: Arc<dyn ExceptionNotifier>,
        kill_timeout: Duration,
    ) -> Worker {
        let uptime = Uptime::new();
        let id = RouteKey::create();

        // this is for the worker struct
        let wid = id.clone();

        info!("starting up worker, id: {}", id);

        let (command_tx, command_rx) = bounded(250);

        let exit_events = events.clone();
        let loop_events = events.clone();

        // run the handler loop as a background task
        async_std::task::spawn(async move {
            let reason = match handler(id.clone(), command_rx, loop_events, notifier, kill_timeout)
                .await
            {
                Ok(reason) => {
                    info!("worker handler exit for worker id: {}", id);
                    reason
                }
                Err(e) => {
                    error!("worker {} handler failed: {:?}", id, e);
                    ExitReason::Crashed { code: 1 }
                }
            };

            let notice = ExitNotice {
                worker_id: id,
                reason,
            };
            let _ = exit_events.send(SupervisorEvent::Exit(notice)).await;
        });

        Worker {
            id: wid,
            uptime,
            command_tx,
            events,
        }
    }

    /// return the worker's id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// return the number of seconds this worker has been alive
    pub fn get_uptime(&self) -> String {
        self.uptime.to_string()
    }

    /// This is invoked to send commands to the worker
    pub fn command_channel(&self) -> Sender<WorkerCommand> {
        self.command_tx.clone()
    }

    /// a publisher stamped with this worker's id as origin
    pub fn publisher(&self) -> ClusterPublisher {
        ClusterPublisher {
            origin: self.id.clone(),
            events: self.events.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerKind;
    use crate::fault::{RequestEnvelope, ResponseHandle, GENERIC_ERROR_BODY};
    use crate::notifier::{FaultReport, LogNotifier};
    use crate::worker::OK;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        reports: Mutex<Vec<FaultReport>>,
    }

    impl RecordingNotifier {
        fn reports(&self) -> Vec<FaultReport> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl ExceptionNotifier for RecordingNotifier {
        fn notify<'a>(&'a self, report: FaultReport) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.reports.lock().unwrap().push(report);
                Ok(())
            })
        }
    }

    fn spawn_worker(
        notifier: Arc<dyn ExceptionNotifier>,
    ) -> (Worker, Receiver<SupervisorEvent>) {
        let (events_tx, events_rx) = bounded(32);
        let worker = Worker::spawn(events_tx, notifier, Duration::from_millis(100));
        (worker, events_rx)
    }

    async fn wait_for_exit(events: &Receiver<SupervisorEvent>) -> ExitNotice {
        loop {
            match events.recv().await.expect("events channel should stay open") {
                SupervisorEvent::Exit(notice) => return notice,
                _ => continue,
            }
        }
    }

    async fn snapshot(worker: &Worker) -> LocalCache {
        let (tx, rx) = bounded(1);
        worker
            .command_channel()
            .send(WorkerCommand::Snapshot(tx))
            .await
            .expect("worker should accept snapshot requests");
        rx.recv().await.expect("worker should reply")
    }

    #[test]
    fn new() {
        async_std::task::block_on(async move {
            let (worker, events) = spawn_worker(Arc::new(LogNotifier));
            assert_eq!(worker.id().len(), 16);

            let (tx, rx) = bounded(1);
            worker
                .command_channel()
                .send(WorkerCommand::Status(tx))
                .await
                .expect("status request should send");

            let status = rx.recv().await.expect("status response should arrive");
            assert_eq!(status.worker_id, worker.id());
            assert_eq!(status.status, OK);
            assert_eq!(status.error_count, 0);

            worker
                .command_channel()
                .send(WorkerCommand::Disconnect)
                .await
                .expect("disconnect should send");

            let notice = wait_for_exit(&events).await;
            assert_eq!(notice.worker_id, worker.id());
            assert_eq!(notice.reason, ExitReason::Deliberate);
        });
    }

    #[test]
    fn applies_relayed_commands_idempotently() {
        async_std::task::block_on(async move {
            let (worker, _events) = spawn_worker(Arc::new(LogNotifier));

            let msg = ClusterMessage::broadcast(ClusterCommand::UpdateClusterCache(
                json!({"locale": "en-US"}),
            ));
            worker
                .command_channel()
                .send(WorkerCommand::Cluster(msg.clone()))
                .await
                .unwrap();

            let first = snapshot(&worker).await;
            assert_eq!(first.preferences(), Some(&json!({"locale": "en-US"})));

            // duplicate relay leaves the cache unchanged
            worker
                .command_channel()
                .send(WorkerCommand::Cluster(msg))
                .await
                .unwrap();
            let second = snapshot(&worker).await;
            assert_eq!(first, second);

            let _ = worker.command_channel().send(WorkerCommand::Disconnect).await;
        });
    }

    #[test]
    fn never_applies_its_own_message() {
        async_std::task::block_on(async move {
            let (worker, _events) = spawn_worker(Arc::new(LogNotifier));

            let own = ClusterMessage::from_worker(
                ClusterCommand::UpdateClusterCache(json!({"x": 1})),
                worker.id().to_string(),
            );
            worker
                .command_channel()
                .send(WorkerCommand::Cluster(own))
                .await
                .unwrap();

            let cache = snapshot(&worker).await;
            assert!(cache.preferences().is_none());

            let _ = worker.command_channel().send(WorkerCommand::Disconnect).await;
        });
    }

    #[test]
    fn faulting_request_retires_the_worker() {
        async_std::task::block_on(async move {
            let notifier = Arc::new(RecordingNotifier::default());
            let (worker, events) = spawn_worker(notifier.clone());

            let response = ResponseHandle::new();
            let ctx = FaultContext::new(
                RequestEnvelope::with_body(json!({"Password": "hunter2", "Op": "save"})),
                response.clone(),
                ServerKind::Web,
                Some("digest-abc".to_string()),
            );
            let job = RequestJob::new(ctx, Box::pin(async move { panic!("request blew up") }));

            worker
                .command_channel()
                .send(WorkerCommand::Request(job))
                .await
                .unwrap();

            let notice = wait_for_exit(&events).await;
            assert_eq!(notice.reason, ExitReason::Fault);

            // exactly one report, scrubbed, with the caller's digest
            let reports = notifier.reports();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].payload["Password"], "");
            assert_eq!(reports[0].payload["Op"], "save");
            assert_eq!(reports[0].user_digest, "digest-abc");

            // generic terminal response since headers were unsent
            assert_eq!(response.status(), Some(500));
            assert_eq!(response.body().as_deref(), Some(GENERIC_ERROR_BODY));

            // the retired worker accepts nothing further
            assert!(worker
                .command_channel()
                .send(WorkerCommand::Disconnect)
                .await
                .is_err());
        });
    }

    #[test]
    fn fault_after_streaming_leaves_response_alone() {
        async_std::task::block_on(async move {
            let notifier = Arc::new(RecordingNotifier::default());
            let (worker, events) = spawn_worker(notifier.clone());

            let response = ResponseHandle::new();
            response.begin_streaming();

            let ctx = FaultContext::new(
                RequestEnvelope::default(),
                response.clone(),
                ServerKind::Api,
                None,
            );
            let job = RequestJob::new(ctx, Box::pin(async move { panic!("mid-stream") }));

            worker
                .command_channel()
                .send(WorkerCommand::Request(job))
                .await
                .unwrap();

            let notice = wait_for_exit(&events).await;
            assert_eq!(notice.reason, ExitReason::Fault);
            assert_eq!(notifier.reports().len(), 1);
            assert_eq!(response.status(), None);
            assert_eq!(response.body(), None);
        });
    }

    #[test]
    fn clean_requests_keep_the_worker_alive() {
        async_std::task::block_on(async move {
            let (worker, _events) = spawn_worker(Arc::new(LogNotifier));

            for n in 0..3 {
                let response = ResponseHandle::new();
                let ctx = FaultContext::new(
                    RequestEnvelope::with_body(json!({"n": n})),
                    response.clone(),
                    ServerKind::Web,
                    None,
                );
                let reply = response.clone();
                let job = RequestJob::new(
                    ctx,
                    Box::pin(async move {
                        reply.finish(200, "done");
                        Ok(())
                    }),
                );
                worker
                    .command_channel()
                    .send(WorkerCommand::Request(job))
                    .await
                    .unwrap();
            }

            // still serving
            let cache = snapshot(&worker).await;
            assert_eq!(cache.terminology_len(), 0);

            let _ = worker.command_channel().send(WorkerCommand::Disconnect).await;
        });
    }

    #[test]
    fn publisher_stamps_origin() {
        async_std::task::block_on(async move {
            let (worker, events) = spawn_worker(Arc::new(LogNotifier));

            worker
                .publisher()
                .publish(ClusterCommand::RemoveCustomTerminology {
                    group_id: "group-1".to_string(),
                })
                .await
                .unwrap();

            loop {
                match events.recv().await.unwrap() {
                    SupervisorEvent::Relay(msg) => {
                        assert!(msg.originated_by(worker.id()));
                        break;
                    }
                    _ => continue,
                }
            }

            let _ = worker.command_channel().send(WorkerCommand::Disconnect).await;
        });
    }
}
