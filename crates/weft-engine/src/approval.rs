use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use weft_core::event::EventBus;
use weft_core::types::{ApprovalDecision, ApprovalRequest, WorkflowEvent};

/// Manages pending node approvals with oneshot channels.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, (ApprovalRequest, oneshot::Sender<ApprovalDecision>)>>,
    event_bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Register a request, publish `approval-required`, return the receiver to await.
    pub async fn request(&self, req: ApprovalRequest) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let id = req.id.clone();

        // Insert before publishing so observers can respond straight away.
        self.pending.lock().await.insert(id, (req.clone(), tx));
        self.event_bus
            .publish(WorkflowEvent::ApprovalRequired { request: req });
        rx
    }

    /// Resolve a pending approval. Returns true if the request was found.
    pub async fn respond(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let entry = self.pending.lock().await.remove(request_id);
        if let Some((_req, tx)) = entry {
            let approved = matches!(decision, ApprovalDecision::Approved);
            self.event_bus.publish(WorkflowEvent::ApprovalResolved {
                request_id: request_id.to_string(),
                approved,
            });
            // Receiver may be gone after a timeout or stop
            let _ = tx.send(decision);
            true
        } else {
            false
        }
    }

    /// Reject every pending request of one run. Returns how many were rejected.
    pub async fn reject_instance(&self, instance_id: &str, reason: &str) -> usize {
        let ids: Vec<String> = self
            .pending
            .lock()
            .await
            .values()
            .filter(|(req, _)| req.instance_id == instance_id)
            .map(|(req, _)| req.id.clone())
            .collect();

        let mut rejected = 0;
        for id in ids {
            let decision = ApprovalDecision::Rejected {
                reason: reason.to_string(),
            };
            if self.respond(&id, decision).await {
                rejected += 1;
            }
        }
        rejected
    }

    /// Drop a request without resolving it (the waiter gave up).
    pub async fn withdraw(&self, request_id: &str) -> bool {
        self.pending.lock().await.remove(request_id).is_some()
    }

    /// List all pending approvals.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.pending
            .lock()
            .await
            .values()
            .map(|(req, _)| req.clone())
            .collect()
    }

    /// Find a pending request by prefix match on the ID.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<String> {
        let pending = self.pending.lock().await;
        for key in pending.keys() {
            if key.starts_with(prefix) {
                return Some(key.clone());
            }
        }
        None
    }

    /// Find the pending request for a node of a given run.
    pub async fn find_for_node(&self, instance_id: &str, node_id: &str) -> Option<String> {
        self.pending
            .lock()
            .await
            .values()
            .find(|(req, _)| req.instance_id == instance_id && req.node_id == node_id)
            .map(|(req, _)| req.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use weft_core::NodeType;

    fn test_request(id: &str, instance: &str) -> ApprovalRequest {
        ApprovalRequest {
            id: id.to_string(),
            instance_id: instance.to_string(),
            node_id: format!("node-{}", id),
            node_name: "Publish".to_string(),
            node_type: NodeType::HttpRequest,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn respond_approve() {
        let event_bus = Arc::new(EventBus::default());
        let mut events = event_bus.subscribe();
        let broker = ApprovalBroker::new(event_bus);

        let rx = broker.request(test_request("req-1", "run-1")).await;
        assert!(broker.respond("req-1", ApprovalDecision::Approved).await);

        assert_eq!(rx.await.unwrap(), ApprovalDecision::Approved);
        assert_eq!(events.recv().await.unwrap().kind(), "approval-required");
        assert_eq!(events.recv().await.unwrap().kind(), "approval-resolved");
    }

    #[tokio::test]
    async fn respond_reject() {
        let broker = ApprovalBroker::new(Arc::new(EventBus::default()));

        let rx = broker.request(test_request("req-2", "run-1")).await;
        let decision = ApprovalDecision::Rejected {
            reason: "not today".into(),
        };
        assert!(broker.respond("req-2", decision).await);

        match rx.await.unwrap() {
            ApprovalDecision::Rejected { reason } => assert_eq!(reason, "not today"),
            _ => panic!("expected Rejected"),
        }
    }

    #[tokio::test]
    async fn respond_unknown_id() {
        let broker = ApprovalBroker::new(Arc::new(EventBus::default()));
        assert!(!broker.respond("nonexistent", ApprovalDecision::Approved).await);
    }

    #[tokio::test]
    async fn reject_instance_only_touches_that_run() {
        let broker = ApprovalBroker::new(Arc::new(EventBus::default()));
        let rx_a = broker.request(test_request("a", "run-1")).await;
        let _rx_b = broker.request(test_request("b", "run-2")).await;

        assert_eq!(broker.reject_instance("run-1", "workflow stopped").await, 1);
        assert!(matches!(rx_a.await.unwrap(), ApprovalDecision::Rejected { .. }));

        let pending = broker.pending_requests().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].instance_id, "run-2");
    }

    #[tokio::test]
    async fn lookups() {
        let broker = ApprovalBroker::new(Arc::new(EventBus::default()));
        let _rx = broker.request(test_request("abc123", "run-1")).await;

        assert_eq!(broker.find_by_prefix("abc").await.as_deref(), Some("abc123"));
        assert_eq!(
            broker.find_for_node("run-1", "node-abc123").await.as_deref(),
            Some("abc123")
        );
        assert!(broker.find_for_node("run-2", "node-abc123").await.is_none());
        assert!(broker.withdraw("abc123").await);
        assert!(broker.pending_requests().await.is_empty());
    }
}
