//! Confirmation broker — pause a turn until any attached terminal approves
//! or denies a tool call.
//!
//! The broker is pure transport: it does not interpret decisions, it only
//! guarantees that exactly one decision from the offered set comes back.
//! The request and its resolution are both published on the agent's bus so
//! every terminal renders the same approval state, whoever answers it.

use crate::events::{Decision, EventHub, EventKind};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// What the requesting tool wants shown and how long it will wait.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub agent_id: String,
    pub request_id: String,
    pub tool_name: String,
    pub options: Vec<Decision>,
    pub cwd: Option<String>,
    pub timeout: Duration,
}

/// Broad access class of a tool, used to pick which decisions it may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAccess {
    /// Writes to files; may be granted per call, per file, or per directory.
    FileWrite,
    /// Executes within the working directory only.
    CwdExec,
    /// Arbitrary shell execution; one call at a time or nothing.
    ShellExec,
}

/// The decision set a tool of the given access class may offer.
pub fn options_for(access: ToolAccess) -> Vec<Decision> {
    match access {
        ToolAccess::FileWrite => vec![
            Decision::AllowOnce,
            Decision::AllowFile,
            Decision::AllowDir,
            Decision::Deny,
        ],
        ToolAccess::CwdExec => vec![
            Decision::AllowOnce,
            Decision::AllowExecCwd,
            Decision::Deny,
        ],
        ToolAccess::ShellExec => vec![Decision::AllowOnce, Decision::Deny],
    }
}

struct Pending {
    tx: oneshot::Sender<Decision>,
}

/// Cross-terminal approval primitive. One instance per server.
pub struct ConfirmationBroker {
    hub: Arc<EventHub>,
    pending: Mutex<HashMap<String, Pending>>,
}

impl ConfirmationBroker {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            hub,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a confirmation request and block until a decision arrives or
    /// the timeout expires.
    ///
    /// Exactly one `confirmation_resolved` is published per request, always
    /// from this method — the submit path only settles the waiter.
    pub async fn request(&self, req: ConfirmationRequest) -> Decision {
        let confirm_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();

        self.pending
            .lock()
            .insert(confirm_id.clone(), Pending { tx });

        self.hub.publish(
            &req.agent_id,
            Some(&req.request_id),
            EventKind::ConfirmationRequested {
                confirm_id: confirm_id.clone(),
                tool: req.tool_name.clone(),
                options: req.options.clone(),
                cwd: req.cwd.clone(),
                timeout_s: Some(req.timeout.as_secs()),
            },
        );

        let decision = match tokio::time::timeout(req.timeout, &mut rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => {
                // Waiter dropped without a decision; treat as a denial.
                warn!(confirm_id, "confirmation waiter dropped");
                self.pending.lock().remove(&confirm_id);
                Decision::Deny
            }
            Err(_elapsed) => {
                // A submit may have won the race with the timer; if the
                // entry is already gone, take its decision instead.
                let timed_out = self.pending.lock().remove(&confirm_id).is_some();
                if timed_out {
                    debug!(confirm_id, tool = %req.tool_name, "confirmation timed out");
                    Decision::TimeoutDeny
                } else {
                    rx.await.unwrap_or(Decision::Deny)
                }
            }
        };

        self.hub.publish(
            &req.agent_id,
            Some(&req.request_id),
            EventKind::ConfirmationResolved {
                confirm_id,
                decision,
                resolved_at: Utc::now().to_rfc3339(),
            },
        );

        decision
    }

    /// Settle a pending confirmation. First caller wins; later callers (and
    /// unknown IDs) get `false` with no side effects.
    pub fn submit(&self, confirm_id: &str, decision: Decision) -> bool {
        let entry = self.pending.lock().remove(confirm_id);
        match entry {
            Some(pending) => {
                // The waiter can only be gone if request() gave up first;
                // its timeout path then reports the denial.
                let _ = pending.tx.send(decision);
                true
            }
            None => false,
        }
    }

    /// Number of unresolved confirmations, for diagnostics.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HubConfig;

    fn broker() -> (Arc<EventHub>, Arc<ConfirmationBroker>) {
        let hub = Arc::new(EventHub::new(HubConfig::default()));
        let broker = Arc::new(ConfirmationBroker::new(Arc::clone(&hub)));
        (hub, broker)
    }

    fn req(timeout: Duration) -> ConfirmationRequest {
        ConfirmationRequest {
            agent_id: "alpha".into(),
            request_id: "r1".into(),
            tool_name: "write_file".into(),
            options: options_for(ToolAccess::FileWrite),
            cwd: Some("/work".into()),
            timeout,
        }
    }

    fn confirm_id_from(event: &crate::events::Event) -> String {
        match &event.kind {
            EventKind::ConfirmationRequested { confirm_id, .. } => confirm_id.clone(),
            other => panic!("expected confirmation_requested, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submitted_decision_resolves_the_waiter() {
        let (hub, broker) = broker();
        let mut sub = hub.subscribe("alpha");

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request(req(Duration::from_secs(5))).await })
        };

        let requested = sub.recv().await.unwrap();
        let confirm_id = confirm_id_from(&requested);
        assert!(broker.submit(&confirm_id, Decision::AllowOnce));

        assert_eq!(waiter.await.unwrap(), Decision::AllowOnce);

        let resolved = sub.recv().await.unwrap();
        match resolved.kind {
            EventKind::ConfirmationResolved {
                confirm_id: id,
                decision,
                ..
            } => {
                assert_eq!(id, confirm_id);
                assert_eq!(decision, Decision::AllowOnce);
            }
            other => panic!("expected confirmation_resolved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_submission_wins() {
        let (hub, broker) = broker();
        let mut sub = hub.subscribe("alpha");

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request(req(Duration::from_secs(5))).await })
        };

        let confirm_id = confirm_id_from(&sub.recv().await.unwrap());
        assert!(broker.submit(&confirm_id, Decision::Deny));
        assert!(!broker.submit(&confirm_id, Decision::AllowOnce));

        assert_eq!(waiter.await.unwrap(), Decision::Deny);
    }

    #[tokio::test]
    async fn unknown_confirm_id_is_not_accepted() {
        let (_hub, broker) = broker();
        assert!(!broker.submit("nope", Decision::AllowOnce));
    }

    #[tokio::test]
    async fn timeout_resolves_as_timeout_deny() {
        let (hub, broker) = broker();
        let mut sub = hub.subscribe("alpha");

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request(req(Duration::from_millis(50))).await })
        };

        let confirm_id = confirm_id_from(&sub.recv().await.unwrap());

        assert_eq!(waiter.await.unwrap(), Decision::TimeoutDeny);
        assert_eq!(broker.pending_count(), 0);

        match sub.recv().await.unwrap().kind {
            EventKind::ConfirmationResolved { decision, .. } => {
                assert_eq!(decision, Decision::TimeoutDeny);
            }
            other => panic!("expected confirmation_resolved, got {other:?}"),
        }

        // Late submission after expiry is rejected.
        assert!(!broker.submit(&confirm_id, Decision::AllowOnce));
    }

    #[tokio::test]
    async fn request_and_resolution_carry_request_id() {
        let (hub, broker) = broker();
        let mut sub = hub.subscribe("alpha");

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.request(req(Duration::from_secs(5))).await })
        };

        let requested = sub.recv().await.unwrap();
        assert_eq!(requested.request_id.as_deref(), Some("r1"));
        let confirm_id = confirm_id_from(&requested);
        broker.submit(&confirm_id, Decision::AllowDir);
        waiter.await.unwrap();

        let resolved = sub.recv().await.unwrap();
        assert_eq!(resolved.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn option_sets_match_tool_access() {
        assert_eq!(
            options_for(ToolAccess::FileWrite),
            vec![
                Decision::AllowOnce,
                Decision::AllowFile,
                Decision::AllowDir,
                Decision::Deny
            ]
        );
        assert_eq!(
            options_for(ToolAccess::CwdExec),
            vec![Decision::AllowOnce, Decision::AllowExecCwd, Decision::Deny]
        );
        assert_eq!(
            options_for(ToolAccess::ShellExec),
            vec![Decision::AllowOnce, Decision::Deny]
        );
    }

    #[test]
    fn no_option_set_contains_timeout_deny() {
        for access in [ToolAccess::FileWrite, ToolAccess::CwdExec, ToolAccess::ShellExec] {
            assert!(!options_for(access).contains(&Decision::TimeoutDeny));
        }
    }
}
