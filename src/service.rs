//! Service layer API for the approval workflow engine.
//!
//! Every operation is a short synchronous unit of work: load the records,
//! check the gates, mutate, notify. The store offers no locking, so the
//! only race defense is read-then-check-then-write ordering with the
//! Pending precondition re-checked on a fresh read immediately before the
//! commit section. Notification dispatch never rolls a transition back.
use crate::catalog::{self, Item, ItemPatch};
use crate::error::WorkflowError;
use crate::note;
use crate::notify::{ActionLink, NotificationRouter, RequestSnapshot, TerminalOutcome};
use crate::request::{
    ApprovalEvent, CatalogChange, FieldChange, LedgerEntry, LineItem, NewItemSpec, PendingRequest,
    RequestMeta, RequestPayload, RequestStatus, RequestType, Role, initial_role,
};
use crate::store::{RecordStore, TABLE_ITEMS, TABLE_LEDGER, TABLE_PENDING};
use crate::time::TimeStamp;
use crate::token::{TokenAction, TokenSigner};
use crate::users::UserDirectory;

pub struct ServiceConfig {
    pub token_ttl: chrono::Duration,
    pub low_stock_threshold: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            token_ttl: TokenSigner::default_ttl(),
            low_stock_threshold: 5,
        }
    }
}

/// The acting identity and the role it holds. Roles are resolved by the
/// session layer in front of the engine; the engine checks them against
/// the request's current gate.
#[derive(Debug, Clone)]
pub struct Actor {
    pub identity: String,
    pub role: Role,
}

impl Actor {
    pub fn new(identity: impl Into<String>, role: Role) -> Self {
        Self {
            identity: identity.into(),
            role,
        }
    }
}

/// An inventory movement as the requester states it: positive quantities,
/// the engine derives the delta sign from the type.
#[derive(Debug, Clone)]
pub struct MovementRequest {
    pub request_type: RequestType,
    pub items: Vec<MovementLine>,
    pub reason: Option<String>,
    pub remarks: Option<String>,
    pub meta: Option<RequestMeta>,
}

#[derive(Debug, Clone)]
pub struct MovementLine {
    pub sku: String,
    pub quantity: i64,
    pub reactivate_if_retired: bool,
}

impl MovementLine {
    pub fn new(sku: impl Into<String>, quantity: i64) -> Self {
        Self {
            sku: sku.into(),
            quantity,
            reactivate_if_retired: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Absent when the auto-approval fast path bypassed the queue.
    pub pending_id: Option<String>,
    pub link_id: String,
    pub auto_approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApproveOutcome {
    pub finalized: bool,
    pub next_stage: Option<u32>,
}

/// Which confirmation form the action endpoint should render after a token
/// checks out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionForm {
    /// Comment is optional on approve.
    Approve { pending_id: String },
    /// Reason is mandatory on decline.
    Decline { pending_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counts {
    pub active_skus: usize,
    pub on_hand: i64,
    pub pending: usize,
    pub ledger: usize,
}

pub struct ApprovalService<N> {
    store: RecordStore,
    router: N,
    signer: TokenSigner,
    config: ServiceConfig,
}

impl<N: NotificationRouter> ApprovalService<N> {
    pub fn new(store: RecordStore, router: N, signer: TokenSigner) -> Self {
        Self::with_config(store, router, signer, ServiceConfig::default())
    }

    pub fn with_config(
        store: RecordStore,
        router: N,
        signer: TokenSigner,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            router,
            signer,
            config,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Submit a RECEIVE/ISSUE/REQUEST movement. Validates quantities and
    /// stock before anything persists; controllers take the auto-approval
    /// fast path and never enter the queue.
    pub fn submit_movement(
        &self,
        requester: &Actor,
        request: MovementRequest,
    ) -> Result<SubmitOutcome, WorkflowError> {
        if !request.request_type.is_movement() {
            return Err(WorkflowError::Validation(format!(
                "{} is a catalog change, not an inventory movement",
                request.request_type
            )));
        }
        let lines = self.validate_movement(&request)?;
        let now = TimeStamp::now();

        // Controllers are the terminal approver of every topology; their own
        // submissions skip the queue entirely.
        if requester.role == Role::Controller {
            return self.auto_approve(requester, &request, lines, &now);
        }

        let next_role = initial_role(request.request_type, requester.role);
        let link_id = self.store.next_trx_id()?;
        let pending_id = format!("{link_id}-P");

        let payload = build_payload(&lines, request.meta.clone());
        let submitted_note = self.compose_submission_note(&request, &lines, &requester.identity, &now);

        let ledger = LedgerEntry {
            link_id: link_id.clone(),
            created_at: now.clone(),
            request_type: request.request_type,
            skus: payload.skus(),
            title: movement_title(request.request_type, &lines),
            delta: payload.total_delta(),
            unit: shared_unit(&lines),
            status: RequestStatus::Pending,
            requested_by: requester.identity.clone(),
            reviewed_by: None,
            reviewed_at: None,
            note: submitted_note.clone(),
            approval_history: Vec::new(),
        };
        let pending = PendingRequest {
            pending_id: pending_id.clone(),
            link_id: link_id.clone(),
            created_at: now,
            request_type: request.request_type,
            stage: 1,
            next_role,
            status: RequestStatus::Pending,
            requested_by: requester.identity.clone(),
            reviewed_by: None,
            reviewed_at: None,
            reason: request.reason.clone(),
            note: submitted_note,
            payload,
            approval_history: Vec::new(),
        };

        self.store.append_record(TABLE_LEDGER, &link_id, &ledger)?;
        self.store
            .append_record(TABLE_PENDING, &pending_id, &pending)?;

        let mut snapshot = RequestSnapshot::from_pending(&pending);
        if let Some(role) = next_role {
            snapshot.action_links = self.action_links(&pending_id, role)?;
        }
        self.dispatch(self.router.notify_submitted(&snapshot));
        tracing::debug!(%pending_id, %link_id, "movement queued for approval");

        Ok(SubmitOutcome {
            pending_id: Some(pending_id),
            link_id,
            auto_approved: false,
        })
    }

    /// Approve the current stage. Advances to the controller stage, or on
    /// the final stage commits the deltas and settles both records.
    pub fn approve(
        &self,
        pending_id: &str,
        actor: &Actor,
        comment: Option<&str>,
    ) -> Result<ApproveOutcome, WorkflowError> {
        let pending = self.load_pending(pending_id)?;
        ensure_pending(&pending)?;
        ensure_not_requester(&pending, &actor.identity, "approve their own request")?;
        ensure_role_matches(&pending, actor.role)?;

        let now = TimeStamp::now();
        let comment = comment.map(str::trim).filter(|c| !c.is_empty());
        let event = ApprovalEvent {
            step: pending.stage,
            role: actor.role,
            actor: actor.identity.clone(),
            at: now.clone(),
            comment: comment.map(String::from),
            declined: false,
        };
        let tail = comment
            .map(|c| format!(" Comment: {c}"))
            .unwrap_or_default();
        let approval_stamp = note::stamp("Approved", &actor.identity, &now, &tail);

        if !pending.is_final_stage() {
            // Intermediate stage: record the event and hand the request to
            // the controller group. No inventory effect yet.
            let next_stage = pending.stage + 1;
            self.store
                .update_record_by_key(TABLE_PENDING, pending_id, |p: &mut PendingRequest| {
                    p.stage = next_stage;
                    p.next_role = Some(Role::Controller);
                    p.approval_history.push(event.clone());
                    p.note = note::append_line(&p.note, &approval_stamp);
                })?;
            self.store.update_record_by_key(
                TABLE_LEDGER,
                &pending.link_id,
                |l: &mut LedgerEntry| {
                    l.approval_history.push(event.clone());
                    l.note = note::append_line(&l.note, &approval_stamp);
                },
            )?;

            let advanced = self.load_pending(pending_id)?;
            let mut snapshot = RequestSnapshot::from_pending(&advanced);
            snapshot.action_links = self.action_links(pending_id, Role::Controller)?;
            self.dispatch(self.router.notify_stage_advanced(&snapshot));
            tracing::debug!(%pending_id, stage = next_stage, "stage advanced");

            return Ok(ApproveOutcome {
                finalized: false,
                next_stage: Some(next_stage),
            });
        }

        // Final stage. Re-read immediately before the commit section so a
        // concurrent approver who already settled this request fails here
        // instead of applying the deltas twice. Best effort only: the store
        // has no compare-and-swap.
        let fresh = self.load_pending(pending_id)?;
        ensure_pending(&fresh)?;

        let touched = catalog::apply_movement(&self.store, fresh.payload.items(), &now)?;

        self.store
            .update_record_by_key(TABLE_PENDING, pending_id, |p: &mut PendingRequest| {
                p.status = RequestStatus::Approved;
                p.reviewed_by = Some(actor.identity.clone());
                p.reviewed_at = Some(now.clone());
                p.approval_history.push(event.clone());
                p.note = note::append_line(&p.note, &approval_stamp);
            })?;
        self.store
            .update_record_by_key(TABLE_LEDGER, &fresh.link_id, |l: &mut LedgerEntry| {
                l.status = RequestStatus::Approved;
                l.reviewed_by = Some(actor.identity.clone());
                l.reviewed_at = Some(now.clone());
                l.approval_history.push(event.clone());
                l.note = note::append_line(&l.note, &approval_stamp);
            })?;

        if fresh.request_type.is_outbound() {
            self.report_low_stock(&touched);
        }

        let settled = self.load_pending(pending_id)?;
        let snapshot = RequestSnapshot::from_pending(&settled);
        self.dispatch(self.router.notify_approved(&snapshot));
        self.dispatch(
            self.router
                .notify_terminal(TerminalOutcome::Approved, &snapshot),
        );
        tracing::debug!(%pending_id, "request finalized");

        Ok(ApproveOutcome {
            finalized: true,
            next_stage: None,
        })
    }

    /// Decline at any stage. Legal only while Pending, so no delta has been
    /// committed and there is nothing to compensate.
    pub fn decline(
        &self,
        pending_id: &str,
        actor: &Actor,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        let reason = required_reason(reason, "decline")?;
        let pending = self.load_pending(pending_id)?;
        ensure_pending(&pending)?;
        ensure_not_requester(&pending, &actor.identity, "decline their own request")?;
        ensure_role_matches(&pending, actor.role)?;

        let now = TimeStamp::now();
        let event = ApprovalEvent {
            step: pending.stage,
            role: actor.role,
            actor: actor.identity.clone(),
            at: now.clone(),
            comment: Some(reason.clone()),
            declined: true,
        };
        let stamp = note::stamp(
            "Declined",
            &actor.identity,
            &now,
            &format!(" — Reason: {reason}"),
        );

        self.settle_records(&pending, RequestStatus::Declined, actor, &now, &stamp, Some(event), Some(&reason))?;

        let settled = self.load_pending(pending_id)?;
        self.dispatch(self.router.notify_terminal(
            TerminalOutcome::Declined,
            &RequestSnapshot::from_pending(&settled),
        ));
        Ok(())
    }

    /// Approver-side termination, usable at any stage.
    pub fn void(&self, pending_id: &str, actor: &Actor, reason: &str) -> Result<(), WorkflowError> {
        let reason = required_reason(reason, "void")?;
        if !matches!(actor.role, Role::Manager | Role::Controller) {
            return Err(WorkflowError::Authorization(
                "only managers or controllers can void".into(),
            ));
        }
        let pending = self.load_pending(pending_id)?;
        ensure_pending(&pending)?;

        let now = TimeStamp::now();
        let stamp = note::stamp(
            "Voided",
            &actor.identity,
            &now,
            &format!(" — Reason: {reason}"),
        );
        self.settle_records(&pending, RequestStatus::Voided, actor, &now, &stamp, None, Some(&reason))?;

        let settled = self.load_pending(pending_id)?;
        self.dispatch(self.router.notify_terminal(
            TerminalOutcome::Voided,
            &RequestSnapshot::from_pending(&settled),
        ));
        Ok(())
    }

    /// Requester-side withdrawal of their own Pending request.
    pub fn cancel(
        &self,
        pending_id: &str,
        requester_identity: &str,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        let reason = required_reason(reason, "cancel")?;
        let pending = self.load_pending(pending_id)?;
        ensure_pending(&pending)?;
        if !pending
            .requested_by
            .eq_ignore_ascii_case(requester_identity.trim())
        {
            return Err(WorkflowError::Authorization(
                "only the original requester can cancel this request".into(),
            ));
        }

        let now = TimeStamp::now();
        let actor = Actor::new(requester_identity.trim(), Role::User);
        let stamp = note::stamp(
            "Cancelled",
            requester_identity,
            &now,
            &format!(" — Reason: {reason}"),
        );
        self.settle_records(&pending, RequestStatus::Voided, &actor, &now, &stamp, None, Some(&reason))?;

        let settled = self.load_pending(pending_id)?;
        self.dispatch(self.router.notify_terminal(
            TerminalOutcome::Voided,
            &RequestSnapshot::from_pending(&settled),
        ));
        Ok(())
    }

    /// Replace a Pending request with corrected content: the original is
    /// voided, the shared ledger entry gains an `Edited #N` marker, and a
    /// fresh request re-enters at stage 1 under a derived id. The first
    /// stage role is recomputed from the requester's current role, not
    /// copied from the voided request.
    pub fn edit(
        &self,
        pending_id: &str,
        requester: &Actor,
        new_items: Vec<MovementLine>,
        new_reason: Option<&str>,
        new_remarks: Option<&str>,
    ) -> Result<SubmitOutcome, WorkflowError> {
        let pending = self.load_pending(pending_id)?;
        ensure_pending(&pending)?;
        if !pending
            .requested_by
            .eq_ignore_ascii_case(requester.identity.trim())
        {
            return Err(WorkflowError::Authorization(
                "only the original requester can edit this request".into(),
            ));
        }

        let request = MovementRequest {
            request_type: pending.request_type,
            items: new_items,
            reason: new_reason.map(str::to_string),
            remarks: new_remarks.map(str::to_string),
            meta: pending.payload.meta().cloned(),
        };
        let lines = self.validate_movement(&request)?;

        let now = TimeStamp::now();
        let void_stamp = note::stamp(
            "Voided",
            &requester.identity,
            &now,
            " — edited & resubmitted",
        );
        self.store
            .update_record_by_key(TABLE_PENDING, pending_id, |p: &mut PendingRequest| {
                p.status = RequestStatus::Voided;
                p.reviewed_by = Some(requester.identity.clone());
                p.reviewed_at = Some(now.clone());
                p.note = note::append_line(&p.note, &void_stamp);
            })?;

        // N = submissions already sharing this link, the voided original
        // included.
        let link_id = pending.link_id.clone();
        let siblings: Vec<PendingRequest> = self.store.read_all_records(TABLE_PENDING)?;
        let edit_seq = siblings.iter().filter(|p| p.link_id == link_id).count();
        let new_pending_id = format!("{link_id}-P({edit_seq})");

        let payload = build_payload(&lines, request.meta.clone());
        let submitted_note =
            self.compose_submission_note(&request, &lines, &requester.identity, &now);
        let next_role = initial_role(request.request_type, requester.role);

        let replacement = PendingRequest {
            pending_id: new_pending_id.clone(),
            link_id: link_id.clone(),
            created_at: now.clone(),
            request_type: request.request_type,
            stage: 1,
            next_role,
            status: RequestStatus::Pending,
            requested_by: pending.requested_by.clone(),
            reviewed_by: None,
            reviewed_at: None,
            reason: request.reason.clone(),
            note: submitted_note,
            payload: payload.clone(),
            approval_history: Vec::new(),
        };
        self.store
            .append_record(TABLE_PENDING, &new_pending_id, &replacement)?;

        let edited_marker = format!("Edited #{edit_seq}");
        self.store
            .update_record_by_key(TABLE_LEDGER, &link_id, |l: &mut LedgerEntry| {
                l.skus = payload.skus();
                l.delta = payload.total_delta();
                l.unit = shared_unit(&lines);
                l.title = movement_title(request.request_type, &lines);
                l.note = note::append_line(&l.note, &edited_marker);
            })?;

        let mut snapshot = RequestSnapshot::from_pending(&replacement);
        if let Some(role) = next_role {
            snapshot.action_links = self.action_links(&new_pending_id, role)?;
        }
        self.dispatch(self.router.notify_submitted(&snapshot));
        tracing::debug!(original = %pending_id, replacement = %new_pending_id, "request edited and resubmitted");

        Ok(SubmitOutcome {
            pending_id: Some(new_pending_id),
            link_id,
            auto_approved: false,
        })
    }

    /// Token-gated entry point for email links. A good token yields the
    /// confirmation form to render; the eventual submit goes through
    /// [`Self::approve`]/[`Self::decline`] and their ordinary gates.
    pub fn open_action(
        &self,
        token: &str,
        identity: &str,
        role: Role,
    ) -> Result<ActionForm, WorkflowError> {
        let token = self.signer.verify(token)?;
        if !token.permits(identity) {
            return Err(WorkflowError::Authorization(
                "this action link was issued to a different recipient".into(),
            ));
        }
        if !matches!(role, Role::Manager | Role::Controller) {
            return Err(WorkflowError::Authorization(
                "only managers or controllers can act on approval links".into(),
            ));
        }
        let pending = self.load_pending(&token.pending_id)?;
        ensure_pending(&pending)?;

        Ok(match token.action {
            TokenAction::Approve => ActionForm::Approve {
                pending_id: token.pending_id,
            },
            TokenAction::Decline => ActionForm::Decline {
                pending_id: token.pending_id,
            },
        })
    }

    /// Create catalog rows immediately, stamped fully approved. SKUs are
    /// minted from the counter when the spec leaves them blank.
    pub fn create_skus(
        &self,
        actor: &Actor,
        specs: Vec<NewItemSpec>,
        remarks: Option<&str>,
    ) -> Result<(String, Vec<Item>), WorkflowError> {
        if specs.is_empty() {
            return Err(WorkflowError::Validation("no items to create".into()));
        }
        if specs.iter().any(|s| s.name.trim().is_empty()) {
            return Err(WorkflowError::Validation(
                "item name is required for all rows".into(),
            ));
        }

        let now = TimeStamp::now();
        let mut created = Vec::with_capacity(specs.len());
        let mut resolved = Vec::with_capacity(specs.len());
        for spec in &specs {
            let sku = match spec.sku.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(sku) => sku.to_string(),
                None => self.store.next_sku_id()?,
            };
            created.push(catalog::create_item(&self.store, &sku, spec, &now)?);
            resolved.push(NewItemSpec {
                sku: Some(sku),
                ..spec.clone()
            });
        }

        let list = created
            .iter()
            .enumerate()
            .map(|(idx, it)| format!("{}. {} — {}", idx + 1, it.name, it.sku))
            .collect::<Vec<_>>()
            .join("\n");
        let link_id = self.record_catalog_ledger(
            actor,
            RequestType::CreateSku,
            created.iter().map(|it| it.sku.clone()).collect(),
            format!("Create SKU — {} item(s)", created.len()),
            CatalogChange::Create { items: resolved },
            &list,
            remarks,
            &now,
        )?;
        Ok((link_id, created))
    }

    /// Apply descriptive changes to one SKU immediately, recording the
    /// field-level diff in the audit note.
    pub fn modify_sku(
        &self,
        actor: &Actor,
        sku: &str,
        patch: ItemPatch,
        remarks: Option<&str>,
    ) -> Result<(String, Vec<FieldChange>), WorkflowError> {
        let now = TimeStamp::now();
        let (item, changes) = catalog::modify_item(&self.store, sku, &patch, &now)?;

        let summary = if changes.is_empty() {
            "No visible field changes".to_string()
        } else {
            changes
                .iter()
                .map(|c| {
                    format!(
                        "{}: “{}” → “{}”",
                        c.field,
                        dash_when_empty(&c.from),
                        dash_when_empty(&c.to)
                    )
                })
                .collect::<Vec<_>>()
                .join("; ")
        };
        let summary = truncate_summary(&summary, 180);

        let link_id = self.record_catalog_ledger(
            actor,
            RequestType::ModifySku,
            vec![item.sku.clone()],
            format!("Modify {} — {}", item.sku, summary),
            CatalogChange::Modify {
                sku: item.sku.clone(),
                changes: changes.clone(),
            },
            &format!("Modify {} — {summary}", item.sku),
            remarks,
            &now,
        )?;
        Ok((link_id, changes))
    }

    /// Retire a zero-stock SKU immediately.
    pub fn retire_sku(
        &self,
        actor: &Actor,
        sku: &str,
        remarks: Option<&str>,
    ) -> Result<String, WorkflowError> {
        let now = TimeStamp::now();
        let item = catalog::retire_item(&self.store, sku, &now)?;
        self.record_catalog_ledger(
            actor,
            RequestType::RetireSku,
            vec![item.sku.clone()],
            format!("Retire {}", item.sku),
            CatalogChange::Retire {
                sku: item.sku.clone(),
            },
            &format!("Retire {} — {}", item.sku, item.name),
            remarks,
            &now,
        )
    }

    /// Requests still waiting on a decision.
    pub fn pending_requests(&self) -> Result<Vec<PendingRequest>, WorkflowError> {
        let all: Vec<PendingRequest> = self.store.read_all_records(TABLE_PENDING)?;
        Ok(all
            .into_iter()
            .filter(|p| p.status == RequestStatus::Pending)
            .collect())
    }

    pub fn ledger(&self, limit: Option<usize>) -> Result<Vec<LedgerEntry>, WorkflowError> {
        let all: Vec<LedgerEntry> = self.store.read_all_records(TABLE_LEDGER)?;
        match limit {
            Some(n) if all.len() > n => Ok(all[all.len() - n..].to_vec()),
            _ => Ok(all),
        }
    }

    pub fn items(&self) -> Result<Vec<Item>, WorkflowError> {
        Ok(self.store.read_all_records(TABLE_ITEMS)?)
    }

    pub fn counts(&self) -> Result<Counts, WorkflowError> {
        let items = self.items()?;
        let live: Vec<_> = items
            .iter()
            .filter(|it| it.status != catalog::ItemStatus::Retired)
            .collect();
        let pending = self.pending_requests()?.len();
        let ledger: Vec<LedgerEntry> = self.store.read_all_records(TABLE_LEDGER)?;
        Ok(Counts {
            active_skus: live.len(),
            on_hand: live.iter().map(|it| it.quantity).sum(),
            pending,
            ledger: ledger.len(),
        })
    }

    /// On-demand sweep of the whole catalog for replenishment alerts.
    pub fn scan_low_stock(&self) -> Result<Vec<Item>, WorkflowError> {
        let items = self.items()?;
        let low = catalog::low_stock(&items, self.config.low_stock_threshold);
        if !low.is_empty() {
            self.dispatch(self.router.notify_low_stock(&low));
        }
        Ok(low)
    }

    // --- internals ---

    fn load_pending(&self, pending_id: &str) -> Result<PendingRequest, WorkflowError> {
        self.store
            .find_record_by_key(TABLE_PENDING, pending_id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("pending request {pending_id}")))
    }

    /// Resolve lines against the catalog: quantities must be positive, the
    /// SKU must exist, and outbound lines must fit inside Active on-hand.
    fn validate_movement(
        &self,
        request: &MovementRequest,
    ) -> Result<Vec<LineItem>, WorkflowError> {
        if request.items.is_empty() {
            return Err(WorkflowError::Validation("no items supplied".into()));
        }
        let outbound = request.request_type.is_outbound();
        let mut lines = Vec::with_capacity(request.items.len());
        for line in &request.items {
            if line.quantity <= 0 {
                return Err(WorkflowError::Validation(format!(
                    "invalid quantity {} for {}",
                    line.quantity, line.sku
                )));
            }
            let item: Item = self
                .store
                .find_record_by_key(TABLE_ITEMS, &line.sku)?
                .ok_or_else(|| WorkflowError::NotFound(format!("SKU {}", line.sku)))?;
            if outbound {
                if item.status != catalog::ItemStatus::Active {
                    return Err(WorkflowError::Validation(format!(
                        "item {} must be Active to issue (status: {})",
                        item.sku, item.status
                    )));
                }
                if line.quantity > item.quantity {
                    return Err(WorkflowError::StockInsufficient {
                        sku: item.sku.clone(),
                        requested: line.quantity,
                        on_hand: item.quantity,
                    });
                }
            }
            let delta = if outbound {
                -line.quantity
            } else {
                line.quantity
            };
            lines.push(LineItem {
                sku: item.sku,
                name: item.name,
                unit: item.unit,
                quantity: line.quantity,
                delta,
                reactivate_if_retired: line.reactivate_if_retired,
            });
        }
        Ok(lines)
    }

    /// Controller self-service: apply the deltas now, record a fully
    /// approved ledger entry, skip the queue.
    fn auto_approve(
        &self,
        requester: &Actor,
        request: &MovementRequest,
        lines: Vec<LineItem>,
        now: &TimeStamp<chrono::Utc>,
    ) -> Result<SubmitOutcome, WorkflowError> {
        let touched = catalog::apply_movement(&self.store, &lines, now)?;
        let link_id = self.store.next_trx_id()?;

        let mut note_text = self.compose_submission_note(request, &lines, &requester.identity, now);
        let approval_stamp = note::stamp(
            "Approved",
            &requester.identity,
            now,
            " — fully approved by requester",
        );
        note_text = note::append_line(&note_text, &approval_stamp);

        let payload = build_payload(&lines, request.meta.clone());
        let ledger = LedgerEntry {
            link_id: link_id.clone(),
            created_at: now.clone(),
            request_type: request.request_type,
            skus: payload.skus(),
            title: movement_title(request.request_type, &lines),
            delta: payload.total_delta(),
            unit: shared_unit(&lines),
            status: RequestStatus::Approved,
            requested_by: requester.identity.clone(),
            reviewed_by: Some(requester.identity.clone()),
            reviewed_at: Some(now.clone()),
            note: note_text,
            approval_history: vec![ApprovalEvent {
                step: 1,
                role: Role::Controller,
                actor: requester.identity.clone(),
                at: now.clone(),
                comment: None,
                declined: false,
            }],
        };
        self.store.append_record(TABLE_LEDGER, &link_id, &ledger)?;

        if request.request_type.is_outbound() {
            self.report_low_stock(&touched);
        }
        let snapshot = RequestSnapshot::from_ledger(&ledger, lines);
        self.dispatch(self.router.notify_approved(&snapshot));
        self.dispatch(
            self.router
                .notify_terminal(TerminalOutcome::Approved, &snapshot),
        );
        tracing::debug!(%link_id, "movement auto-approved by controller requester");

        Ok(SubmitOutcome {
            pending_id: None,
            link_id,
            auto_approved: true,
        })
    }

    /// Terminal write shared by decline/void/cancel: flip both records,
    /// stamp both notes, record the event when the topology produced one.
    #[allow(clippy::too_many_arguments)]
    fn settle_records(
        &self,
        pending: &PendingRequest,
        status: RequestStatus,
        actor: &Actor,
        now: &TimeStamp<chrono::Utc>,
        stamp: &str,
        event: Option<ApprovalEvent>,
        reason: Option<&str>,
    ) -> Result<(), WorkflowError> {
        self.store.update_record_by_key(
            TABLE_PENDING,
            &pending.pending_id,
            |p: &mut PendingRequest| {
                p.status = status;
                p.reviewed_by = Some(actor.identity.clone());
                p.reviewed_at = Some(now.clone());
                if let Some(reason) = reason {
                    p.reason = Some(reason.to_string());
                }
                if let Some(event) = event.clone() {
                    p.approval_history.push(event);
                }
                p.note = note::append_line(&p.note, stamp);
            },
        )?;
        self.store
            .update_record_by_key(TABLE_LEDGER, &pending.link_id, |l: &mut LedgerEntry| {
                l.status = status;
                l.reviewed_by = Some(actor.identity.clone());
                l.reviewed_at = Some(now.clone());
                if let Some(event) = event.clone() {
                    l.approval_history.push(event);
                }
                l.note = note::append_line(&l.note, stamp);
            })?;
        Ok(())
    }

    /// Ledger-only record for an immediately executed catalog change.
    #[allow(clippy::too_many_arguments)]
    fn record_catalog_ledger(
        &self,
        actor: &Actor,
        request_type: RequestType,
        skus: Vec<String>,
        title: String,
        change: CatalogChange,
        content_line: &str,
        remarks: Option<&str>,
        now: &TimeStamp<chrono::Utc>,
    ) -> Result<String, WorkflowError> {
        let link_id = self.store.next_trx_id()?;

        let mut lines = vec![content_line.to_string()];
        if let Some(line) = remarks.and_then(note::remarks_line) {
            lines.push(line);
        }
        lines.push(note::stamp("Submitted", &actor.identity, now, ""));
        lines.push(note::stamp(
            "Approved",
            &actor.identity,
            now,
            " — fully approved",
        ));
        let note_text = note::append_unique("", &lines);

        let ledger = LedgerEntry {
            link_id: link_id.clone(),
            created_at: now.clone(),
            request_type,
            skus,
            title,
            delta: 0,
            unit: String::new(),
            status: RequestStatus::Approved,
            requested_by: actor.identity.clone(),
            reviewed_by: Some(actor.identity.clone()),
            reviewed_at: Some(now.clone()),
            note: note_text,
            approval_history: vec![ApprovalEvent {
                step: 1,
                role: actor.role,
                actor: actor.identity.clone(),
                at: now.clone(),
                comment: None,
                declined: false,
            }],
        };
        self.store.append_record(TABLE_LEDGER, &link_id, &ledger)?;

        let mut snapshot = RequestSnapshot::from_ledger(&ledger, Vec::new());
        snapshot.catalog_change = Some(change);
        self.dispatch(self.router.notify_approved(&snapshot));
        self.dispatch(
            self.router
                .notify_terminal(TerminalOutcome::Approved, &snapshot),
        );
        Ok(link_id)
    }

    fn compose_submission_note(
        &self,
        request: &MovementRequest,
        lines: &[LineItem],
        requested_by: &str,
        now: &TimeStamp<chrono::Utc>,
    ) -> String {
        let mut parts = Vec::new();
        let (_, list) = note::summarize_items(request.request_type, lines);
        parts.push(list);
        if let Some(meta) = &request.meta {
            parts.extend(note::meta_lines(meta));
        }
        if let Some(line) = request.reason.as_deref().and_then(note::reason_line) {
            parts.push(line);
        }
        if let Some(line) = request.remarks.as_deref().and_then(note::remarks_line) {
            parts.push(line);
        }
        parts.push(note::stamp("Submitted", requested_by, now, ""));
        note::append_unique("", &parts)
    }

    /// Personalized approve/decline tokens for every active holder of the
    /// stage's role.
    fn action_links(&self, pending_id: &str, role: Role) -> Result<Vec<ActionLink>, WorkflowError> {
        let directory = UserDirectory::new(&self.store);
        let mut links = Vec::new();
        for user in directory.active_in_role(role)? {
            let approve = self.signer.issue(
                TokenAction::Approve,
                pending_id,
                Some(&user.email),
                self.config.token_ttl,
            )?;
            let decline = self.signer.issue(
                TokenAction::Decline,
                pending_id,
                Some(&user.email),
                self.config.token_ttl,
            )?;
            links.push(ActionLink {
                recipient: user.email,
                approve_token: approve,
                decline_token: decline,
            });
        }
        Ok(links)
    }

    fn report_low_stock(&self, touched: &[Item]) {
        let low = catalog::low_stock(touched, self.config.low_stock_threshold);
        if !low.is_empty() {
            self.dispatch(self.router.notify_low_stock(&low));
        }
    }

    /// Delivery failures are logged and swallowed; they never abort the
    /// transition that triggered them.
    fn dispatch(&self, result: anyhow::Result<()>) {
        if let Err(err) = result {
            tracing::warn!(error = %err, "notification delivery failed");
        }
    }
}

fn ensure_pending(pending: &PendingRequest) -> Result<(), WorkflowError> {
    if pending.status != RequestStatus::Pending {
        return Err(WorkflowError::AlreadyProcessed {
            status: pending.status,
        });
    }
    Ok(())
}

fn ensure_not_requester(
    pending: &PendingRequest,
    identity: &str,
    action: &str,
) -> Result<(), WorkflowError> {
    if pending.requested_by.eq_ignore_ascii_case(identity.trim()) {
        return Err(WorkflowError::Authorization(format!(
            "requesters cannot {action}"
        )));
    }
    Ok(())
}

fn ensure_role_matches(pending: &PendingRequest, role: Role) -> Result<(), WorkflowError> {
    if pending.next_role != Some(role) {
        let expected = pending
            .next_role
            .map(|r| r.to_string())
            .unwrap_or_else(|| "none".into());
        return Err(WorkflowError::Authorization(format!(
            "this stage is gated on role {expected}, not {role}"
        )));
    }
    Ok(())
}

fn required_reason(reason: &str, action: &str) -> Result<String, WorkflowError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(WorkflowError::Validation(format!(
            "a reason is required to {action}"
        )));
    }
    Ok(reason.to_string())
}

fn build_payload(lines: &[LineItem], meta: Option<RequestMeta>) -> RequestPayload {
    if lines.len() == 1 && meta.is_none() {
        RequestPayload::Single(lines[0].clone())
    } else {
        RequestPayload::Multi {
            items: lines.to_vec(),
            meta,
        }
    }
}

fn movement_title(request_type: RequestType, lines: &[LineItem]) -> String {
    if lines.len() == 1 {
        lines[0].name.clone()
    } else {
        note::summarize_items(request_type, lines).0
    }
}

fn shared_unit(lines: &[LineItem]) -> String {
    let mut units: Vec<&str> = lines.iter().map(|l| l.unit.as_str()).collect();
    units.sort_unstable();
    units.dedup();
    match units.as_slice() {
        [only] => only.to_string(),
        _ => "mixed".to_string(),
    }
}

fn dash_when_empty(s: &str) -> &str {
    if s.is_empty() { "—" } else { s }
}

fn truncate_summary(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
