//! End-to-end workflow scenarios against a real sled-backed store.

use anyhow::Context;
use procurement_approval::{
    catalog::Item,
    error::WorkflowError,
    notify::LogNotifier,
    request::{LedgerEntry, NewItemSpec, PendingRequest, RequestStatus, RequestType, Role},
    service::{ActionForm, Actor, ApprovalService, MovementLine, MovementRequest},
    store::{RecordStore, TABLE_ITEMS, TABLE_LEDGER, TABLE_PENDING},
    token::{TokenAction, TokenSigner},
    users::{UserDirectory, UserStatus},
};
use tempfile::tempdir;

// Each test gets its own database under a tempdir. Sled holds a file lock
// per path, and isolated stores keep the scenarios independent.
fn open_service(dir: &tempfile::TempDir, name: &str) -> ApprovalService<LogNotifier> {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
    let store = RecordStore::open(dir.path().join(name)).unwrap();
    ApprovalService::new(
        store,
        LogNotifier,
        TokenSigner::new(TokenSigner::generate_secret()),
    )
}

/// Create a SKU and receive opening stock through the controller fast path.
fn seed_item(service: &ApprovalService<LogNotifier>, name: &str, on_hand: i64) -> String {
    let controller = Actor::new("controller@corp", Role::Controller);
    let (_, items) = service
        .create_skus(
            &controller,
            vec![NewItemSpec {
                sku: None,
                name: name.into(),
                description: String::new(),
                category: "General".into(),
                unit: "pc".into(),
                location: "Main WH".into(),
            }],
            None,
        )
        .unwrap();
    let sku = items[0].sku.clone();

    if on_hand > 0 {
        service
            .submit_movement(
                &controller,
                MovementRequest {
                    request_type: RequestType::Receive,
                    items: vec![MovementLine::new(sku.clone(), on_hand)],
                    reason: None,
                    remarks: None,
                    meta: None,
                },
            )
            .unwrap();
    }
    sku
}

fn issue_request(sku: &str, qty: i64, reason: &str) -> MovementRequest {
    MovementRequest {
        request_type: RequestType::Issue,
        items: vec![MovementLine::new(sku, qty)],
        reason: Some(reason.into()),
        remarks: None,
        meta: None,
    }
}

fn on_hand(service: &ApprovalService<LogNotifier>, sku: &str) -> i64 {
    let item: Item = service
        .store()
        .find_record_by_key(TABLE_ITEMS, sku)
        .unwrap()
        .unwrap();
    item.quantity
}

#[test]
fn two_stage_issue_runs_manager_then_controller() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "two_stage.db");
    let sku = seed_item(&service, "RJ45 Cat6 Cable 1m", 10);

    let requester = Actor::new("user@corp", Role::User);
    let outcome = service
        .submit_movement(&requester, issue_request(&sku, 5, "floor restock"))
        .context("Issue failed on submit: ")?;
    let pending_id = outcome.pending_id.clone().expect("request should queue");
    assert!(!outcome.auto_approved);

    // Stage 1 is gated on the manager.
    let pending: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &pending_id)?
        .unwrap();
    assert_eq!(pending.stage, 1);
    assert_eq!(pending.next_role, Some(Role::Manager));

    // Manager approval advances the stage without touching stock.
    let manager = Actor::new("manager@corp", Role::Manager);
    let step = service.approve(&pending_id, &manager, Some("ok by me"))?;
    assert!(!step.finalized);
    assert_eq!(step.next_stage, Some(2));
    assert_eq!(on_hand(&service, &sku), 10);

    let pending: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &pending_id)?
        .unwrap();
    assert_eq!(pending.next_role, Some(Role::Controller));
    assert_eq!(pending.approval_history.len(), 1);
    assert_eq!(pending.approval_history[0].role, Role::Manager);

    // Controller approval commits the delta and settles both records.
    let controller = Actor::new("boss@corp", Role::Controller);
    let fin = service.approve(&pending_id, &controller, None)?;
    assert!(fin.finalized);
    assert_eq!(on_hand(&service, &sku), 5);

    let pending: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &pending_id)?
        .unwrap();
    assert_eq!(pending.status, RequestStatus::Approved);
    assert_eq!(pending.approval_history.len(), 2);

    let ledger: LedgerEntry = service
        .store()
        .find_record_by_key(TABLE_LEDGER, &outcome.link_id)?
        .unwrap();
    assert_eq!(ledger.status, RequestStatus::Approved);
    assert_eq!(ledger.delta, -5);

    Ok(())
}

#[test]
fn controller_receive_takes_the_fast_path() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "fast_path.db");
    let sku = seed_item(&service, "A4 Copy Paper", 0);

    let controller = Actor::new("controller@corp", Role::Controller);
    let outcome = service.submit_movement(
        &controller,
        MovementRequest {
            request_type: RequestType::Receive,
            items: vec![MovementLine::new(sku.clone(), 20)],
            reason: None,
            remarks: Some("quarterly restock".into()),
            meta: None,
        },
    )?;

    assert!(outcome.auto_approved);
    assert!(outcome.pending_id.is_none());
    assert_eq!(on_hand(&service, &sku), 20);
    assert!(service.pending_requests()?.is_empty());

    let ledger: LedgerEntry = service
        .store()
        .find_record_by_key(TABLE_LEDGER, &outcome.link_id)?
        .unwrap();
    assert_eq!(ledger.status, RequestStatus::Approved);
    assert_eq!(ledger.delta, 20);
    assert!(ledger.note.contains("fully approved by requester"));

    Ok(())
}

#[test]
fn manager_cannot_take_a_controller_gated_stage() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "wrong_role.db");
    let sku = seed_item(&service, "USB Mouse", 10);

    // A receive by a plain user goes straight to the controller gate.
    let requester = Actor::new("user@corp", Role::User);
    let outcome = service.submit_movement(
        &requester,
        MovementRequest {
            request_type: RequestType::Receive,
            items: vec![MovementLine::new(sku.clone(), 4)],
            reason: None,
            remarks: None,
            meta: None,
        },
    )?;
    let pending_id = outcome.pending_id.unwrap();

    let manager = Actor::new("manager@corp", Role::Manager);
    let err = service.approve(&pending_id, &manager, None).unwrap_err();
    assert!(matches!(err, WorkflowError::Authorization(_)));

    assert_eq!(on_hand(&service, &sku), 10);
    let pending: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &pending_id)?
        .unwrap();
    assert_eq!(pending.status, RequestStatus::Pending);

    Ok(())
}

#[test]
fn edit_voids_original_and_resubmits_under_derived_id() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "edit.db");
    let sku = seed_item(&service, "HDMI Cable", 10);

    let requester = Actor::new("user@corp", Role::User);
    let outcome = service.submit_movement(&requester, issue_request(&sku, 5, "demo rig"))?;
    let original_id = outcome.pending_id.unwrap();

    let edited = service.edit(
        &original_id,
        &requester,
        vec![MovementLine::new(sku.clone(), 3)],
        Some("demo rig — fewer units"),
        None,
    )?;

    let new_id = edited.pending_id.unwrap();
    assert_eq!(new_id, format!("{}-P(1)", outcome.link_id));
    assert_eq!(edited.link_id, outcome.link_id);

    let original: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &original_id)?
        .unwrap();
    assert_eq!(original.status, RequestStatus::Voided);
    assert!(original.note.contains("edited & resubmitted"));

    let replacement: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &new_id)?
        .unwrap();
    assert_eq!(replacement.stage, 1);
    assert_eq!(replacement.next_role, Some(Role::Manager));
    assert_eq!(replacement.payload.items()[0].quantity, 3);
    assert!(replacement.approval_history.is_empty());

    let ledger: LedgerEntry = service
        .store()
        .find_record_by_key(TABLE_LEDGER, &outcome.link_id)?
        .unwrap();
    assert!(ledger.note.contains("Edited #1"));
    assert_eq!(ledger.delta, -3);

    Ok(())
}

#[test]
fn decline_needs_a_reason_and_settles_both_records() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "decline.db");
    let sku = seed_item(&service, "Label Printer", 6);

    let requester = Actor::new("user@corp", Role::User);
    let outcome = service.submit_movement(&requester, issue_request(&sku, 2, "new desk"))?;
    let pending_id = outcome.pending_id.unwrap();

    let manager = Actor::new("manager@corp", Role::Manager);
    let err = service.decline(&pending_id, &manager, "   ").unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    service.decline(&pending_id, &manager, "not budgeted")?;

    let pending: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &pending_id)?
        .unwrap();
    assert_eq!(pending.status, RequestStatus::Declined);
    assert!(pending.note.contains("Reason: not budgeted"));
    assert!(pending.approval_history.last().unwrap().declined);
    assert_eq!(on_hand(&service, &sku), 6);

    // A second decision on a settled request is a no-op report.
    let controller = Actor::new("boss@corp", Role::Controller);
    let err = service.approve(&pending_id, &controller, None).unwrap_err();
    assert!(err.is_already_processed());
    assert_eq!(on_hand(&service, &sku), 6);

    Ok(())
}

#[test]
fn self_approval_is_forbidden_regardless_of_role() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "self_approve.db");
    let sku = seed_item(&service, "Webcam", 8);

    let requester = Actor::new("user@corp", Role::User);
    let outcome = service.submit_movement(&requester, issue_request(&sku, 1, "remote kit"))?;
    let pending_id = outcome.pending_id.unwrap();

    // Same identity, now holding the gating role.
    let self_as_manager = Actor::new("user@corp", Role::Manager);
    let err = service
        .approve(&pending_id, &self_as_manager, None)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Authorization(_)));

    let err = service
        .decline(&pending_id, &self_as_manager, "changed my mind")
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Authorization(_)));

    Ok(())
}

#[test]
fn manager_requester_skips_straight_to_controller() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "manager_skip.db");
    let sku = seed_item(&service, "Server Rails", 4);

    let manager = Actor::new("manager@corp", Role::Manager);
    let outcome = service.submit_movement(&manager, issue_request(&sku, 2, "rack build"))?;
    let pending_id = outcome.pending_id.unwrap();

    let pending: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &pending_id)?
        .unwrap();
    assert_eq!(pending.stage, 1);
    assert_eq!(pending.next_role, Some(Role::Controller));

    // One controller approval is final for this topology.
    let controller = Actor::new("boss@corp", Role::Controller);
    let fin = service.approve(&pending_id, &controller, None)?;
    assert!(fin.finalized);
    assert_eq!(on_hand(&service, &sku), 2);

    Ok(())
}

#[test]
fn stock_is_revalidated_at_final_approval() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "final_recheck.db");
    let sku = seed_item(&service, "Toner Cartridge", 10);

    let requester = Actor::new("user@corp", Role::User);
    let outcome = service.submit_movement(&requester, issue_request(&sku, 8, "print room"))?;
    let pending_id = outcome.pending_id.unwrap();

    let manager = Actor::new("manager@corp", Role::Manager);
    service.approve(&pending_id, &manager, None)?;

    // Stock moves between submission and final approval: the controller
    // issues 5 through the fast path.
    let controller = Actor::new("boss@corp", Role::Controller);
    service.submit_movement(&controller, issue_request(&sku, 5, "urgent pull"))?;
    assert_eq!(on_hand(&service, &sku), 5);

    let err = service.approve(&pending_id, &controller, None).unwrap_err();
    assert!(matches!(err, WorkflowError::StockInsufficient { .. }));

    // The failed approval leaves the request Pending and stock untouched.
    let pending: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &pending_id)?
        .unwrap();
    assert_eq!(pending.status, RequestStatus::Pending);
    assert_eq!(on_hand(&service, &sku), 5);

    Ok(())
}

#[test]
fn void_and_cancel_terminate_without_inventory_effect() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "void_cancel.db");
    let sku = seed_item(&service, "Patch Panel", 9);

    let requester = Actor::new("user@corp", Role::User);

    // Approver-side void at stage 1.
    let first = service.submit_movement(&requester, issue_request(&sku, 3, "closet a"))?;
    let first_id = first.pending_id.unwrap();
    let controller = Actor::new("boss@corp", Role::Controller);
    service.void(&first_id, &controller, "duplicate of an earlier request")?;

    let voided: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &first_id)?
        .unwrap();
    assert_eq!(voided.status, RequestStatus::Voided);

    // Requester-side cancel; a stranger may not.
    let second = service.submit_movement(&requester, issue_request(&sku, 3, "closet b"))?;
    let second_id = second.pending_id.unwrap();

    let err = service
        .cancel(&second_id, "other@corp", "not mine")
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Authorization(_)));

    service.cancel(&second_id, "user@corp", "ordered the wrong part")?;
    let cancelled: PendingRequest = service
        .store()
        .find_record_by_key(TABLE_PENDING, &second_id)?
        .unwrap();
    assert_eq!(cancelled.status, RequestStatus::Voided);
    assert!(cancelled.note.contains("[Cancelled by user@corp"));

    assert_eq!(on_hand(&service, &sku), 9);

    Ok(())
}

#[test]
fn action_tokens_drive_the_out_of_band_path() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let service = open_service(&dir, "tokens.db");
    let sku = seed_item(&service, "SSD 1TB", 10);

    // Register an active controller so submissions carry personalized links.
    {
        let directory = UserDirectory::new(service.store());
        let boss = directory.register("boss@corp", "Boss", "Finance", Role::Controller)?;
        directory.set_role_status(&boss.user_id, Role::Controller, UserStatus::Active)?;
    }

    let requester = Actor::new("user@corp", Role::User);
    let outcome = service.submit_movement(
        &requester,
        MovementRequest {
            request_type: RequestType::Receive,
            items: vec![MovementLine::new(sku.clone(), 5)],
            reason: None,
            remarks: None,
            meta: None,
        },
    )?;
    let pending_id = outcome.pending_id.unwrap();

    // The engine mints the same tokens it hands to the router; reproduce
    // one against the shared signer to exercise the endpoint.
    let signer = TokenSigner::new("test-secret");
    let service = {
        // Re-open against the same database with a known secret.
        drop(service);
        let store = RecordStore::open(dir.path().join("tokens.db"))?;
        ApprovalService::new(store, LogNotifier, TokenSigner::new("test-secret"))
    };

    let token = signer.issue(
        TokenAction::Approve,
        &pending_id,
        Some("boss@corp"),
        TokenSigner::default_ttl(),
    )?;

    // Wrong recipient is an authorization failure, not a token failure.
    let err = service
        .open_action(&token, "someone-else@corp", Role::Controller)
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Authorization(_)));

    let form = service.open_action(&token, "boss@corp", Role::Controller)?;
    assert_eq!(
        form,
        ActionForm::Approve {
            pending_id: pending_id.clone()
        }
    );

    // The confirmation submit goes through the ordinary approve gate.
    let controller = Actor::new("boss@corp", Role::Controller);
    let fin = service.approve(&pending_id, &controller, Some("approved from email"))?;
    assert!(fin.finalized);
    assert_eq!(on_hand(&service, &sku), 15);

    // Replaying the link after resolution reports already-processed.
    let err = service
        .open_action(&token, "boss@corp", Role::Controller)
        .unwrap_err();
    assert!(err.is_already_processed());

    Ok(())
}
