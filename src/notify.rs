//! Outbound notification contract.
//!
//! The engine produces denormalized snapshots so a router can render
//! messages without querying the engine back. Routers consume decisions,
//! they never influence them; delivery is fire-and-forget and a failed
//! delivery must never roll back the workflow transition that caused it.
use crate::catalog::Item;
use crate::request::{
    ApprovalEvent, CatalogChange, LedgerEntry, LineItem, PendingRequest, RequestStatus,
    RequestType, Role,
};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Approved,
    Declined,
    Voided,
}

impl fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalOutcome::Approved => f.write_str("Approved"),
            TerminalOutcome::Declined => f.write_str("Declined"),
            TerminalOutcome::Voided => f.write_str("Voided"),
        }
    }
}

/// One approver's personalized out-of-band links.
#[derive(Debug, Clone)]
pub struct ActionLink {
    pub recipient: String,
    pub approve_token: String,
    pub decline_token: String,
}

#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    /// Absent on the auto-approval fast path, which never enters the queue.
    pub pending_id: Option<String>,
    pub link_id: String,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub stage: u32,
    pub next_role: Option<Role>,
    pub requested_by: String,
    pub items: Vec<LineItem>,
    pub total_delta: i64,
    pub reason: Option<String>,
    pub note: String,
    pub approval_history: Vec<ApprovalEvent>,
    /// One entry per active holder of `next_role`, empty once resolved.
    pub action_links: Vec<ActionLink>,
    /// Present for immediately executed catalog changes.
    pub catalog_change: Option<CatalogChange>,
}

impl RequestSnapshot {
    pub fn from_pending(pending: &PendingRequest) -> Self {
        Self {
            pending_id: Some(pending.pending_id.clone()),
            link_id: pending.link_id.clone(),
            request_type: pending.request_type,
            status: pending.status,
            stage: pending.stage,
            next_role: pending.next_role,
            requested_by: pending.requested_by.clone(),
            items: pending.payload.items().to_vec(),
            total_delta: pending.payload.total_delta(),
            reason: pending.reason.clone(),
            note: pending.note.clone(),
            approval_history: pending.approval_history.clone(),
            action_links: Vec::new(),
            catalog_change: None,
        }
    }

    pub fn from_ledger(ledger: &LedgerEntry, items: Vec<LineItem>) -> Self {
        Self {
            pending_id: None,
            link_id: ledger.link_id.clone(),
            request_type: ledger.request_type,
            status: ledger.status,
            stage: 0,
            next_role: None,
            requested_by: ledger.requested_by.clone(),
            total_delta: ledger.delta,
            items,
            reason: None,
            note: ledger.note.clone(),
            approval_history: ledger.approval_history.clone(),
            action_links: Vec::new(),
            catalog_change: None,
        }
    }
}

pub trait NotificationRouter {
    /// A request entered the queue; addressed to the first approver group
    /// and echoed to the requester.
    fn notify_submitted(&self, snapshot: &RequestSnapshot) -> anyhow::Result<()>;
    /// A non-final stage was approved; addressed to the next approver group.
    fn notify_stage_advanced(&self, snapshot: &RequestSnapshot) -> anyhow::Result<()>;
    /// The movement or catalog change took effect.
    fn notify_approved(&self, snapshot: &RequestSnapshot) -> anyhow::Result<()>;
    /// Requester-facing resolution notice.
    fn notify_terminal(
        &self,
        result: TerminalOutcome,
        snapshot: &RequestSnapshot,
    ) -> anyhow::Result<()>;
    /// Items at or below the replenishment threshold after an issue.
    fn notify_low_stock(&self, items: &[Item]) -> anyhow::Result<()>;
}

/// Default router: logs every event instead of delivering anywhere.
pub struct LogNotifier;

impl NotificationRouter for LogNotifier {
    fn notify_submitted(&self, snapshot: &RequestSnapshot) -> anyhow::Result<()> {
        tracing::info!(
            link_id = %snapshot.link_id,
            request_type = %snapshot.request_type,
            approvers = snapshot.action_links.len(),
            "request submitted for approval"
        );
        Ok(())
    }

    fn notify_stage_advanced(&self, snapshot: &RequestSnapshot) -> anyhow::Result<()> {
        tracing::info!(
            link_id = %snapshot.link_id,
            stage = snapshot.stage,
            "request advanced to next approval stage"
        );
        Ok(())
    }

    fn notify_approved(&self, snapshot: &RequestSnapshot) -> anyhow::Result<()> {
        tracing::info!(
            link_id = %snapshot.link_id,
            request_type = %snapshot.request_type,
            delta = snapshot.total_delta,
            "request approved"
        );
        Ok(())
    }

    fn notify_terminal(
        &self,
        result: TerminalOutcome,
        snapshot: &RequestSnapshot,
    ) -> anyhow::Result<()> {
        tracing::info!(
            link_id = %snapshot.link_id,
            requested_by = %snapshot.requested_by,
            result = %result,
            "request resolved"
        );
        Ok(())
    }

    fn notify_low_stock(&self, items: &[Item]) -> anyhow::Result<()> {
        for item in items {
            tracing::warn!(sku = %item.sku, on_hand = item.quantity, "item at or below low-stock threshold");
        }
        Ok(())
    }
}
