/// worker support structs
///
use serde::{Deserialize, Serialize};

pub type WorkerId = String;

pub const OK: &str = "ok";
pub const DOWN: &str = "down";

/// lifecycle of a worker unit, as tracked by the supervisor.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    #[default]
    Starting,
    Connected,
    Listening,
    Disconnecting,
    Exited,
}

/// why a worker unit terminated.  replaces the exit-code sentinel a
/// process model would use: `Deliberate` is never respawned, everything
/// else is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// cooperative disconnect requested by the supervisor or an operator
    Deliberate,
    /// retired after an unhandled request fault
    Fault,
    /// the worker loop itself failed
    Crashed { code: i32 },
}

impl ExitReason {
    pub fn should_respawn(&self) -> bool {
        !matches!(self, ExitReason::Deliberate)
    }
}

/// sent to the supervisor when a worker unit terminates
#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub worker_id: WorkerId,
    pub reason: ExitReason,
}

/// the supervisor's bookkeeping record for one worker unit
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub state: WorkerState,
    pub last_exit: Option<ExitReason>,
}

impl WorkerRecord {
    pub fn new(id: WorkerId) -> WorkerRecord {
        WorkerRecord {
            id,
            state: WorkerState::Starting,
            last_exit: None,
        }
    }

    /// close out the record when the unit's exit notice arrives
    pub fn mark_exited(&mut self, reason: ExitReason) {
        self.state = WorkerState::Exited;
        self.last_exit = Some(reason);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub status: String,
    pub state: WorkerState,
    pub uptime: String,
    pub error_count: u16,
}

impl WorkerStatus {
    /// the status string follows the lifecycle: a unit on its way out
    /// reports down, everything earlier reports ok
    pub fn new(
        worker_id: WorkerId,
        state: WorkerState,
        uptime: String,
        error_count: u16,
    ) -> WorkerStatus {
        let status = match state {
            WorkerState::Disconnecting | WorkerState::Exited => DOWN,
            _ => OK,
        };

        WorkerStatus {
            worker_id,
            status: status.to_string(),
            state,
            uptime,
            error_count,
        }
    }
}
