//! Approval handlers.
//!
//! The [`ApprovalHandler`](overwatch_types::traits::ApprovalHandler) contract
//! lives in `overwatch-types`; this module provides the webhook client, the
//! signature helpers, and a channel-backed handler for embedding and tests.
//! The interactive terminal reader is an external frontend that implements
//! the same trait.

pub mod signature;
pub mod webhook;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use overwatch_types::errors::OverwatchError;
use overwatch_types::records::{ApprovalRequest, ApprovalResponse};
use overwatch_types::traits::ApprovalHandler;

pub use signature::{verify, verify_detailed, VerifyFailure, VerifyOutcome};
pub use webhook::{WebhookApprovalHandler, WebhookConfig};

/// One pending approval delivered to an embedding frontend.
pub struct PendingApproval {
    pub request: ApprovalRequest,
    /// Send the decision here. Dropping it counts as an error (fail mode
    /// decides).
    pub respond: oneshot::Sender<ApprovalResponse>,
}

/// Approval handler that forwards requests over a channel to an embedding
/// frontend.
pub struct ChannelApprovalHandler {
    tx: mpsc::Sender<PendingApproval>,
    closed: Mutex<bool>,
}

impl ChannelApprovalHandler {
    /// Build the handler plus the receiver side for the frontend.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                closed: Mutex::new(false),
            },
            rx,
        )
    }
}

#[async_trait]
impl ApprovalHandler for ChannelApprovalHandler {
    async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> Result<ApprovalResponse, OverwatchError> {
        if *self.closed.lock().await {
            return Err(OverwatchError::Approval("approval channel closed".to_string()));
        }
        let (respond, decision) = oneshot::channel();
        self.tx
            .send(PendingApproval { request, respond })
            .await
            .map_err(|_| OverwatchError::Approval("approval frontend gone".to_string()))?;
        decision
            .await
            .map_err(|_| OverwatchError::Approval("approval request dropped".to_string()))
    }

    async fn close(&self) {
        *self.closed.lock().await = true;
    }
}
