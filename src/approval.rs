//! Human approval queue for escalated conflicts
//!
//! An escalation enqueues a request carrying both sides' diffs, a unit
//! visualisation and ranked suggestions, then waits for an operator
//! response up to a timeout.

use crate::models::{CycleId, StrategyKind};
use crate::utils::lock_mutex_recover;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// One side's change to the contested file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideDiff {
    pub cycle_id: CycleId,
    pub changed_units: Vec<String>,
    pub diff: String,
}

/// A ranked suggestion shown to the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub strategy: StrategyKind,
    pub confidence: f64,
    pub description: String,
    /// Proposed leader for a sequential suggestion
    pub leader: Option<CycleId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub conflict_id: String,
    pub resource_id: String,
    pub cycles: Vec<CycleId>,
    pub diffs: Vec<SideDiff>,
    pub visualization: String,
    pub suggestions: Vec<Suggestion>,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
}

/// Operator decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorResponse {
    /// Write this content as the resolved file and let every contender continue
    UseContent { content: String },
    /// Let `leader` go first; the others wait and rebase
    Sequence { leader: CycleId },
    Abandon,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    Responded(OperatorResponse),
    TimedOut,
}

#[async_trait]
pub trait ApprovalQueue: Send + Sync {
    /// Enqueue a request, returning its id
    async fn enqueue(&self, request: ApprovalRequest) -> String;

    async fn await_response(&self, request_id: &str, timeout: Duration) -> ApprovalOutcome;
}

struct PendingApproval {
    request: ApprovalRequest,
    responder: Option<oneshot::Sender<OperatorResponse>>,
    receiver: Option<oneshot::Receiver<OperatorResponse>>,
}

/// In-process queue; operators answer through [`InMemoryApprovalQueue::respond`]
pub struct InMemoryApprovalQueue {
    pending: Mutex<HashMap<String, PendingApproval>>,
    notify: broadcast::Sender<ApprovalRequest>,
}

impl InMemoryApprovalQueue {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(100);
        Self {
            pending: Mutex::new(HashMap::new()),
            notify,
        }
    }

    /// Requests still awaiting a response
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = lock_mutex_recover(&self.pending)
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Be told about new requests as they are enqueued
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.notify.subscribe()
    }

    /// Answer a pending request. Returns false if it is unknown or already answered.
    pub fn respond(&self, request_id: &str, response: OperatorResponse) -> bool {
        let mut pending = lock_mutex_recover(&self.pending);
        let Some(entry) = pending.get_mut(request_id) else {
            return false;
        };
        match entry.responder.take() {
            Some(tx) => {
                log::info!("[Approval] Operator responded to {}", request_id);
                tx.send(response).is_ok()
            }
            None => false,
        }
    }
}

impl Default for InMemoryApprovalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalQueue for InMemoryApprovalQueue {
    async fn enqueue(&self, request: ApprovalRequest) -> String {
        let (tx, rx) = oneshot::channel();
        let id = request.id.clone();
        log::info!(
            "[Approval] Enqueued {} for conflict {} on {}",
            id,
            request.conflict_id,
            request.resource_id
        );
        lock_mutex_recover(&self.pending).insert(
            id.clone(),
            PendingApproval {
                request: request.clone(),
                responder: Some(tx),
                receiver: Some(rx),
            },
        );
        let _ = self.notify.send(request);
        id
    }

    async fn await_response(&self, request_id: &str, timeout: Duration) -> ApprovalOutcome {
        let receiver = lock_mutex_recover(&self.pending)
            .get_mut(request_id)
            .and_then(|p| p.receiver.take());
        let Some(receiver) = receiver else {
            return ApprovalOutcome::TimedOut;
        };

        let outcome = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => ApprovalOutcome::Responded(response),
            Ok(Err(_)) | Err(_) => ApprovalOutcome::TimedOut,
        };
        lock_mutex_recover(&self.pending).remove(request_id);
        outcome
    }
}
