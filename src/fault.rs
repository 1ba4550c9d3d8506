/// the per-request fault isolation boundary.
///
/// every request a worker handles runs inside `guard`.  a panic or an
/// error return anywhere in the handler future, including continuations
/// that resume long after the original call, is intercepted here and
/// attributed to the `FaultContext` that traveled with the job; it can
/// never crash the worker uncontrolled or bleed into another request.
///
/// after an intercepted fault the worker's internal state is presumed
/// unreliable and the boundary asks for retirement; the supervisor's
/// respawn path replaces the unit.
use anyhow::Result;
use futures::FutureExt;
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::config::ServerKind;
use crate::notifier::{ExceptionNotifier, FaultReport};

/// fixed body written to a faulting request when headers are still unsent
pub const GENERIC_ERROR_BODY: &str = "http.error.sre";

/// the name of the one field scrubbed from reported payloads
const PASSWORD_FIELD: &str = "Password";

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// the request-shaped data the boundary needs: body and query as
/// structured values.  routing and header handling live outside the core.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub body: Value,
    pub query: Value,
}

impl RequestEnvelope {
    pub fn with_body(body: Value) -> RequestEnvelope {
        RequestEnvelope {
            body,
            query: Value::Null,
        }
    }

    pub fn with_query(query: Value) -> RequestEnvelope {
        RequestEnvelope {
            body: Value::Null,
            query,
        }
    }

    /// body when present, query otherwise, with any top-level field
    /// literally named `Password` blanked before it leaves the process
    pub fn scrubbed_payload(&self) -> Value {
        let mut payload = if self.body.is_null() {
            self.query.clone()
        } else {
            self.body.clone()
        };

        if let Some(map) = payload.as_object_mut() {
            if let Some(slot) = map.get_mut(PASSWORD_FIELD) {
                *slot = Value::String(String::new());
            }
        }

        payload
    }
}

#[derive(Debug, Default)]
struct ResponseState {
    status: Option<u16>,
    body: Option<String>,
    headers_sent: bool,
    finished: bool,
}

/// handle to the terminal response action for one request, shared
/// between the handler and the boundary.  once streaming has begun the
/// boundary will not touch it again.
#[derive(Debug, Default, Clone)]
pub struct ResponseHandle {
    inner: Arc<Mutex<ResponseState>>,
}

impl ResponseHandle {
    pub fn new() -> ResponseHandle {
        ResponseHandle::default()
    }

    /// mark headers as flushed; mutation is off the table from here
    pub fn begin_streaming(&self) {
        let mut state = self.inner.lock().expect("response lock poisoned");
        state.headers_sent = true;
    }

    /// the handler's terminal action; a second call is ignored
    pub fn finish(&self, status: u16, body: &str) {
        let mut state = self.inner.lock().expect("response lock poisoned");
        if state.finished {
            return;
        }
        state.status = Some(status);
        state.body = Some(body.to_string());
        state.headers_sent = true;
        state.finished = true;
    }

    pub fn headers_sent(&self) -> bool {
        self.inner.lock().expect("response lock poisoned").headers_sent
    }

    pub fn finished(&self) -> bool {
        self.inner.lock().expect("response lock poisoned").finished
    }

    pub fn status(&self) -> Option<u16> {
        self.inner.lock().expect("response lock poisoned").status
    }

    pub fn body(&self) -> Option<String> {
        self.inner.lock().expect("response lock poisoned").body.clone()
    }

    /// 500 + generic body, but only when nothing has been sent yet;
    /// returns false when the response was already under way
    fn fail_internal(&self) -> bool {
        let mut state = self.inner.lock().expect("response lock poisoned");
        if state.headers_sent || state.finished {
            return false;
        }
        state.status = Some(500);
        state.body = Some(GENERIC_ERROR_BODY.to_string());
        state.headers_sent = true;
        state.finished = true;
        true
    }
}

/// per-request context.  created at request entry, moved into the
/// boundary with the job, dropped when the request completes or its
/// fault is reported.  ownership guarantees it is never aliased across
/// requests.
#[derive(Debug)]
pub struct FaultContext {
    pub request: RequestEnvelope,
    pub response: ResponseHandle,
    pub server_kind: ServerKind,
    /// encrypted/hashed user token digest; reported as "N/A" when absent
    pub user_digest: Option<String>,
}

impl FaultContext {
    pub fn new(
        request: RequestEnvelope,
        response: ResponseHandle,
        server_kind: ServerKind,
        user_digest: Option<String>,
    ) -> FaultContext {
        FaultContext {
            request,
            response,
            server_kind,
            user_digest,
        }
    }
}

/// what the worker should do after one guarded request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// handler ran to completion; the worker keeps serving
    Completed,
    /// a fault was intercepted; the worker retires.  `forced` marks a
    /// secondary fault (notifier delivery failed): skip cooperative
    /// cleanup and terminate immediately.
    Retire { forced: bool },
}

/// run one request handler inside the boundary.
pub async fn guard(
    ctx: FaultContext,
    handler: HandlerFuture,
    notifier: &dyn ExceptionNotifier,
) -> Outcome {
    let fault = match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(())) => return Outcome::Completed,
        Ok(Err(e)) => format!("{:#}", e),
        Err(panic) => panic_detail(panic),
    };

    warn!("unhandled fault intercepted: {}", fault);

    let report = FaultReport {
        fault,
        user_digest: ctx.user_digest.clone().unwrap_or_else(|| "N/A".to_string()),
        payload: ctx.request.scrubbed_payload(),
        server_kind: ctx.server_kind,
    };

    if let Err(e) = notifier.notify(report).await {
        // a secondary fault gets no further recovery
        error!("notifier delivery failed, forcing termination: {:#}", e);
        return Outcome::Retire { forced: true };
    }

    if !ctx.response.fail_internal() {
        info!("response already under way, leaving it untouched");
    }

    Outcome::Retire { forced: false }
}

fn panic_detail(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic: <non-string payload>".to_string()
    }
}
