//! Pending requests, ledger entries and the fixed approval topologies.
//!
//! Approval state lives in the structured [`ApprovalEvent`] history. The
//! free-text note on each record is a display-only projection composed by
//! [`crate::note`]; it is never parsed back for state.
use crate::time::TimeStamp;
use chrono::Utc;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    #[n(0)]
    Receive,
    #[n(1)]
    Issue,
    #[n(2)]
    Request,
    #[n(3)]
    CreateSku,
    #[n(4)]
    ModifySku,
    #[n(5)]
    RetireSku,
}

impl RequestType {
    /// Inventory movements are gated by the approval topology; catalog
    /// changes execute immediately.
    pub fn is_movement(&self) -> bool {
        matches!(
            self,
            RequestType::Receive | RequestType::Issue | RequestType::Request
        )
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, RequestType::Issue | RequestType::Request)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestType::Receive => "Receive",
            RequestType::Issue => "Issue",
            RequestType::Request => "Request",
            RequestType::CreateSku => "Create SKU",
            RequestType::ModifySku => "Modify SKU",
            RequestType::RetireSku => "Retire SKU",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    #[n(0)]
    User,
    #[n(1)]
    Manager,
    #[n(2)]
    Controller,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Manager => f.write_str("manager"),
            Role::Controller => f.write_str("controller"),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Declined,
    #[n(3)]
    Voided,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => f.write_str("Pending"),
            RequestStatus::Approved => f.write_str("Approved"),
            RequestStatus::Declined => f.write_str("Declined"),
            RequestStatus::Voided => f.write_str("Voided"),
        }
    }
}

/// One approved/declined step, appended in order as the request moves
/// through its stages.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ApprovalEvent {
    #[n(0)]
    pub step: u32,
    #[n(1)]
    pub role: Role,
    #[n(2)]
    pub actor: String,
    #[n(3)]
    pub at: TimeStamp<Utc>,
    /// Approver comment, or the decline reason when `declined` is set.
    #[n(4)]
    pub comment: Option<String>,
    #[n(5)]
    pub declined: bool,
}

/// One line of an inventory movement. `delta` is signed: positive inbound,
/// negative outbound.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    #[n(0)]
    pub sku: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub unit: String,
    #[n(3)]
    pub quantity: i64,
    #[n(4)]
    pub delta: i64,
    #[n(5)]
    pub reactivate_if_retired: bool,
}

/// Free-form requester metadata carried by issue/request movements.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    #[n(0)]
    pub recipient: Option<String>,
    #[n(1)]
    pub department: Option<String>,
    #[n(2)]
    pub business_unit: Option<String>,
    #[n(3)]
    pub deployment_location: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct NewItemSpec {
    /// Minted from the SKU counter when absent.
    #[n(0)]
    pub sku: Option<String>,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub category: String,
    #[n(4)]
    pub unit: String,
    #[n(5)]
    pub location: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    #[n(0)]
    pub field: String,
    #[n(1)]
    pub from: String,
    #[n(2)]
    pub to: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum CatalogChange {
    #[n(0)]
    Create {
        #[n(0)]
        items: Vec<NewItemSpec>,
    },
    #[n(1)]
    Modify {
        #[n(0)]
        sku: String,
        #[n(1)]
        changes: Vec<FieldChange>,
    },
    #[n(2)]
    Retire {
        #[n(0)]
        sku: String,
    },
}

/// Payload shapes share one record field; the tag keeps them apart instead
/// of a dynamically-shaped blob.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    #[n(0)]
    Single(#[n(0)] LineItem),
    #[n(1)]
    Multi {
        #[n(0)]
        items: Vec<LineItem>,
        #[n(1)]
        meta: Option<RequestMeta>,
    },
    #[n(2)]
    Catalog(#[n(0)] CatalogChange),
}

impl RequestPayload {
    pub fn items(&self) -> &[LineItem] {
        match self {
            RequestPayload::Single(item) => std::slice::from_ref(item),
            RequestPayload::Multi { items, .. } => items,
            RequestPayload::Catalog(_) => &[],
        }
    }

    pub fn meta(&self) -> Option<&RequestMeta> {
        match self {
            RequestPayload::Multi { meta, .. } => meta.as_ref(),
            _ => None,
        }
    }

    pub fn total_delta(&self) -> i64 {
        self.items().iter().map(|it| it.delta).sum()
    }

    pub fn skus(&self) -> Vec<String> {
        self.items().iter().map(|it| it.sku.clone()).collect()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    #[n(0)]
    pub pending_id: String,
    #[n(1)]
    pub link_id: String,
    #[n(2)]
    pub created_at: TimeStamp<Utc>,
    #[n(3)]
    pub request_type: RequestType,
    #[n(4)]
    pub stage: u32,
    #[n(5)]
    pub next_role: Option<Role>,
    #[n(6)]
    pub status: RequestStatus,
    #[n(7)]
    pub requested_by: String,
    #[n(8)]
    pub reviewed_by: Option<String>,
    #[n(9)]
    pub reviewed_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub reason: Option<String>,
    #[n(11)]
    pub note: String,
    #[n(12)]
    pub payload: RequestPayload,
    #[n(13)]
    pub approval_history: Vec<ApprovalEvent>,
}

impl PendingRequest {
    /// A stage is final exactly when the controller holds it: controllers
    /// terminate every topology.
    pub fn is_final_stage(&self) -> bool {
        self.next_role == Some(Role::Controller)
    }
}

/// Append-only economic record, one per link id, amended in place as its
/// requests resolve.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    #[n(0)]
    pub link_id: String,
    #[n(1)]
    pub created_at: TimeStamp<Utc>,
    #[n(2)]
    pub request_type: RequestType,
    #[n(3)]
    pub skus: Vec<String>,
    #[n(4)]
    pub title: String,
    #[n(5)]
    pub delta: i64,
    #[n(6)]
    pub unit: String,
    #[n(7)]
    pub status: RequestStatus,
    #[n(8)]
    pub requested_by: String,
    #[n(9)]
    pub reviewed_by: Option<String>,
    #[n(10)]
    pub reviewed_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub note: String,
    #[n(12)]
    pub approval_history: Vec<ApprovalEvent>,
}

/// First-stage role for a movement. Receives go straight to the controller;
/// issues and requests start at the manager unless the requester already
/// holds that role. Catalog changes never enter the queue.
pub fn initial_role(request_type: RequestType, requester: Role) -> Option<Role> {
    match request_type {
        RequestType::Receive => Some(Role::Controller),
        RequestType::Issue | RequestType::Request => {
            if requester == Role::Manager {
                Some(Role::Controller)
            } else {
                Some(Role::Manager)
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_goes_straight_to_controller() {
        assert_eq!(
            initial_role(RequestType::Receive, Role::User),
            Some(Role::Controller)
        );
    }

    #[test]
    fn issue_starts_at_manager_for_plain_users() {
        assert_eq!(
            initial_role(RequestType::Issue, Role::User),
            Some(Role::Manager)
        );
        assert_eq!(
            initial_role(RequestType::Request, Role::User),
            Some(Role::Manager)
        );
    }

    #[test]
    fn manager_requester_skips_their_own_stage() {
        assert_eq!(
            initial_role(RequestType::Issue, Role::Manager),
            Some(Role::Controller)
        );
    }

    #[test]
    fn catalog_changes_have_no_approval_stage() {
        assert_eq!(initial_role(RequestType::CreateSku, Role::User), None);
        assert_eq!(initial_role(RequestType::RetireSku, Role::Controller), None);
    }

    #[test]
    fn payload_roundtrips_through_cbor() {
        let payload = RequestPayload::Multi {
            items: vec![LineItem {
                sku: "SKU-0001".into(),
                name: "Patch cable".into(),
                unit: "pc".into(),
                quantity: 5,
                delta: -5,
                reactivate_if_retired: false,
            }],
            meta: Some(RequestMeta {
                recipient: Some("F. Silva".into()),
                department: Some("IT".into()),
                ..Default::default()
            }),
        };

        let bytes = minicbor::to_vec(&payload).unwrap();
        let decoded: RequestPayload = minicbor::decode(&bytes).unwrap();

        assert_eq!(payload, decoded);
        assert_eq!(decoded.total_delta(), -5);
    }
}
