//! Approval Broker
//!
//! Routes gated decisions between the components that need them and the
//! approval surface (human or policy). Requests are announced over a
//! typed channel, resolved exactly once, and recorded in a bounded
//! history ring with running counters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{
    ApprovalDecision, ApprovalOutcome, ApprovalRecord, ApprovalRequest, ApprovalStats,
    ApprovalStatus,
};

/// Default capacity of the resolved-request history ring.
pub const DEFAULT_HISTORY_CAPACITY: usize = 64;

struct BrokerInner {
    pending: HashMap<String, oneshot::Sender<ApprovalDecision>>,
    history: VecDeque<ApprovalRecord>,
    history_capacity: usize,
    stats: ApprovalStats,
}

impl BrokerInner {
    fn record(&mut self, id: &str, capability: &str, action: &str, status: ApprovalStatus) {
        match status {
            ApprovalStatus::Approved => self.stats.approved += 1,
            ApprovalStatus::Rejected => self.stats.rejected += 1,
            ApprovalStatus::TimedOut => self.stats.timed_out += 1,
            ApprovalStatus::Pending => {}
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(ApprovalRecord {
            id: id.to_string(),
            capability: capability.to_string(),
            action: action.to_string(),
            status,
            resolved_at: Utc::now().to_rfc3339(),
        });
    }
}

/// Cheaply cloneable handle; all clones share the pending set, history
/// and stats.
#[derive(Clone)]
pub struct ApprovalBroker {
    inner: Arc<Mutex<BrokerInner>>,
    notify_tx: mpsc::UnboundedSender<ApprovalRequest>,
}

impl ApprovalBroker {
    /// Create a broker plus the receiving end of its notification
    /// channel. Whoever owns the receiver is the approval surface.
    pub fn new(history_capacity: usize) -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let broker = Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                pending: HashMap::new(),
                history: VecDeque::new(),
                history_capacity: history_capacity.max(1),
                stats: ApprovalStats::default(),
            })),
            notify_tx,
        };
        (broker, notify_rx)
    }

    /// Raise a request and block until it resolves. With `timeout_ms`
    /// set, an unanswered request auto-resolves to timed-out and its
    /// pending entry is consumed; without one, the call waits for an
    /// explicit decision indefinitely.
    pub async fn request(
        &self,
        capability: &str,
        action: &str,
        payload: Value,
        timeout_ms: Option<u64>,
    ) -> ApprovalOutcome {
        let id = Uuid::new_v4().to_string();
        let request = ApprovalRequest {
            id: id.clone(),
            capability: capability.to_string(),
            action: action.to_string(),
            payload,
            timeout_ms,
            status: ApprovalStatus::Pending,
            requested_at: Utc::now().to_rfc3339(),
        };

        let (decision_tx, decision_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().expect("approval broker lock");
            inner.pending.insert(id.clone(), decision_tx);
        }

        debug!(capability, action, id = %id, "approval requested");
        // Fire-and-forget: a missing surface just means the request sits
        // pending until its timeout.
        let _ = self.notify_tx.send(request);

        let decision = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), decision_rx).await {
                Ok(received) => received,
                Err(_) => {
                    let mut inner = self.inner.lock().expect("approval broker lock");
                    inner.pending.remove(&id);
                    inner.record(&id, capability, action, ApprovalStatus::TimedOut);
                    return ApprovalOutcome::TimedOut;
                }
            },
            None => decision_rx.await,
        };

        let mut inner = self.inner.lock().expect("approval broker lock");
        match decision {
            Ok(ApprovalDecision::Approve { data }) => {
                inner.record(&id, capability, action, ApprovalStatus::Approved);
                ApprovalOutcome::Approved(data)
            }
            Ok(ApprovalDecision::Reject { feedback }) => {
                inner.record(&id, capability, action, ApprovalStatus::Rejected);
                ApprovalOutcome::Rejected(feedback)
            }
            // Sender dropped without a decision: treat as rejection.
            Err(_) => {
                inner.pending.remove(&id);
                inner.record(&id, capability, action, ApprovalStatus::Rejected);
                ApprovalOutcome::Rejected(Some("approval channel closed".to_string()))
            }
        }
    }

    /// Deliver the decision for a pending request. Each request is
    /// consumed exactly once; resolving an unknown or already-resolved
    /// id is `NotFound`.
    pub fn resolve(&self, approval_id: &str, decision: ApprovalDecision) -> CoreResult<()> {
        let sender = {
            let mut inner = self.inner.lock().expect("approval broker lock");
            inner.pending.remove(approval_id)
        };
        let sender = sender
            .ok_or_else(|| CoreError::NotFound(format!("pending approval {approval_id}")))?;
        // Receiver gone means the requester timed out in the meantime;
        // the request has already been recorded as timed out.
        let _ = sender.send(decision);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("approval broker lock").pending.len()
    }

    pub fn stats(&self) -> ApprovalStats {
        self.inner.lock().expect("approval broker lock").stats
    }

    pub fn history(&self) -> Vec<ApprovalRecord> {
        self.inner
            .lock()
            .expect("approval broker lock")
            .history
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Drive the approval surface with a fixed decision per request.
    fn auto_respond<F>(broker: ApprovalBroker, mut rx: mpsc::UnboundedReceiver<ApprovalRequest>, f: F)
    where
        F: Fn(&ApprovalRequest) -> Option<ApprovalDecision> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Some(decision) = f(&request) {
                    let _ = broker.resolve(&request.id, decision);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_approve_flow() {
        let (broker, rx) = ApprovalBroker::new(8);
        auto_respond(broker.clone(), rx, |_| {
            Some(ApprovalDecision::Approve { data: None })
        });

        let outcome = broker
            .request("tool:rollback", "rollback", json!({}), Some(1_000))
            .await;
        assert_eq!(outcome, ApprovalOutcome::Approved(None));
        assert_eq!(broker.stats().approved, 1);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reject_carries_feedback() {
        let (broker, rx) = ApprovalBroker::new(8);
        auto_respond(broker.clone(), rx, |_| {
            Some(ApprovalDecision::Reject {
                feedback: Some("too risky".to_string()),
            })
        });

        let outcome = broker
            .request("cycle:proposal", "apply_change_set", json!({}), Some(1_000))
            .await;
        assert_eq!(
            outcome,
            ApprovalOutcome::Rejected(Some("too risky".to_string()))
        );
        assert_eq!(broker.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let (broker, rx) = ApprovalBroker::new(8);
        auto_respond(broker.clone(), rx, |_| None);

        let outcome = broker
            .request("cycle:context", "curate", json!({}), Some(50))
            .await;
        assert_eq!(outcome, ApprovalOutcome::TimedOut);
        assert_eq!(broker.stats().timed_out, 1);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_is_consumed_exactly_once() {
        let (broker, mut rx) = ApprovalBroker::new(8);

        let requester = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request("tool:delete_artifact", "delete", json!({}), Some(1_000))
                    .await
            })
        };

        let request = rx.recv().await.unwrap();
        broker
            .resolve(&request.id, ApprovalDecision::Approve { data: None })
            .unwrap();
        // Second resolution of the same id must fail.
        let second = broker.resolve(&request.id, ApprovalDecision::Reject { feedback: None });
        assert!(matches!(second, Err(CoreError::NotFound(_))));

        assert_eq!(
            requester.await.unwrap(),
            ApprovalOutcome::Approved(None)
        );
    }

    #[tokio::test]
    async fn test_history_ring_is_bounded() {
        let (broker, rx) = ApprovalBroker::new(3);
        auto_respond(broker.clone(), rx, |_| {
            Some(ApprovalDecision::Approve { data: None })
        });

        for i in 0..5 {
            broker
                .request("tool:test", &format!("action-{i}"), json!({}), Some(1_000))
                .await;
        }

        let history = broker.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].action, "action-2");
        assert_eq!(broker.stats().approved, 5);
    }
}
