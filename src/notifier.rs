/// the exception notifier collaborator.
///
use anyhow::Result;
use futures::future::BoxFuture;
use log::*;
use serde::Serialize;
use serde_json::Value;

use crate::config::ServerKind;

/// reported once per intercepted fault.  the payload has already been
/// scrubbed of any `Password` field by the boundary.
#[derive(Debug, Clone, Serialize)]
pub struct FaultReport {
    pub fault: String,
    pub user_digest: String,
    pub payload: Value,
    pub server_kind: ServerKind,
}

pub trait ExceptionNotifier: Send + Sync {
    /// deliver one report; an `Err` here is a secondary fault and makes
    /// the worker force-terminate without further recovery
    fn notify<'a>(&'a self, report: FaultReport) -> BoxFuture<'a, Result<()>>;
}

/// default sink: writes the report to the log and always succeeds.
/// production deployments swap in a real delivery channel.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl ExceptionNotifier for LogNotifier {
    fn notify<'a>(&'a self, report: FaultReport) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let detail = serde_json::to_string(&report)
                .unwrap_or_else(|e| format!("unserializable fault report: {:?}", e));
            error!("exception report: {}", detail);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn report_serializes_with_server_kind() {
        let report = FaultReport {
            fault: "boom".to_string(),
            user_digest: "N/A".to_string(),
            payload: json!({"Password": ""}),
            server_kind: ServerKind::Esb,
        };

        let js = serde_json::to_value(&report).unwrap();
        assert_eq!(js["server_kind"], "esb");
        assert_eq!(js["payload"]["Password"], "");
    }

    #[test]
    fn log_notifier_always_acks() {
        async_std::task::block_on(async move {
            let report = FaultReport {
                fault: "boom".to_string(),
                user_digest: "N/A".to_string(),
                payload: json!({}),
                server_kind: ServerKind::Web,
            };
            assert!(LogNotifier.notify(report).await.is_ok());
        });
    }
}
