//! Catalog items and the inventory delta applier.
//!
//! Deltas commit in two phases: every line is validated against a fresh read
//! before any quantity is written, so a failing line leaves the whole batch
//! untouched and the enclosing approval can abort cleanly.
use crate::error::WorkflowError;
use crate::request::{FieldChange, LineItem, NewItemSpec};
use crate::store::{RecordStore, TABLE_ITEMS};
use crate::time::TimeStamp;
use chrono::Utc;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    #[n(0)]
    Active,
    #[n(1)]
    OnHold,
    #[n(2)]
    Retired,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Active => f.write_str("Active"),
            ItemStatus::OnHold => f.write_str("On Hold"),
            ItemStatus::Retired => f.write_str("Retired"),
        }
    }
}

/// One stock-keeping unit. Quantity never goes negative; the applier
/// re-validates that on every commit.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Item {
    #[n(0)]
    pub sku: String,
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
    #[n(6)]
    pub quantity: i64,
    #[n(7)]
    pub status: ItemStatus,
    /// Price in minor units, when tracked.
    #[n(8)]
    pub unit_price: Option<u64>,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub updated_at: TimeStamp<Utc>,
}

/// Descriptive fields a modify operation may change. `None` keeps the
/// current value; status accepts Active/OnHold only.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub unit: Option<String>,
    pub location: Option<String>,
    pub unit_price: Option<u64>,
    pub status: Option<ItemStatus>,
}

fn find_item(store: &RecordStore, sku: &str) -> Result<Item, WorkflowError> {
    store
        .find_record_by_key(TABLE_ITEMS, sku)?
        .ok_or_else(|| WorkflowError::NotFound(format!("SKU {sku}")))
}

/// Compute the post-delta state of one item without touching the store.
fn plan_delta(
    item: &Item,
    delta: i64,
    unit_override: Option<&str>,
    reactivate_if_retired: bool,
    at: &TimeStamp<Utc>,
) -> Result<Item, WorkflowError> {
    if delta < 0 && item.status != ItemStatus::Active {
        return Err(WorkflowError::Validation(format!(
            "item {} must be Active to issue (status: {})",
            item.sku, item.status
        )));
    }

    let new_qty = item.quantity + delta;
    if new_qty < 0 {
        return Err(WorkflowError::StockInsufficient {
            sku: item.sku.clone(),
            requested: delta.abs(),
            on_hand: item.quantity,
        });
    }

    let mut next = item.clone();
    next.quantity = new_qty;
    if item.status == ItemStatus::Retired && new_qty > 0 && reactivate_if_retired {
        next.status = ItemStatus::Active;
    }
    if let Some(unit) = unit_override {
        next.unit = unit.to_string();
    }
    next.updated_at = at.clone();
    Ok(next)
}

/// Commit one signed delta. Fails without writing when the result would go
/// negative or the status precondition does not hold.
pub fn apply_delta(
    store: &RecordStore,
    sku: &str,
    delta: i64,
    unit_override: Option<&str>,
    reactivate_if_retired: bool,
    at: &TimeStamp<Utc>,
) -> Result<Item, WorkflowError> {
    let item = find_item(store, sku)?;
    let next = plan_delta(&item, delta, unit_override, reactivate_if_retired, at)?;
    store.append_record(TABLE_ITEMS, &next.sku, &next)?;
    Ok(next)
}

/// Commit a whole movement. Validates every line against current on-hand
/// before mutating any, so a mid-batch failure cannot leave partial state.
/// Repeated SKUs within one batch plan against the running result, not the
/// stored quantity.
pub fn apply_movement(
    store: &RecordStore,
    lines: &[LineItem],
    at: &TimeStamp<Utc>,
) -> Result<Vec<Item>, WorkflowError> {
    let mut planned: Vec<Item> = Vec::with_capacity(lines.len());
    for line in lines {
        let idx = planned.iter().position(|it| it.sku == line.sku);
        let current = match idx {
            Some(i) => planned[i].clone(),
            None => find_item(store, &line.sku)?,
        };
        let next = plan_delta(&current, line.delta, None, line.reactivate_if_retired, at)?;
        match idx {
            Some(i) => planned[i] = next,
            None => planned.push(next),
        }
    }
    for item in &planned {
        store.append_record(TABLE_ITEMS, &item.sku, item)?;
    }
    Ok(planned)
}

/// Insert a catalog row at quantity zero. Re-creating an existing SKU is
/// idempotent: descriptive fields refresh, quantity and status survive.
pub fn create_item(
    store: &RecordStore,
    sku: &str,
    spec: &NewItemSpec,
    at: &TimeStamp<Utc>,
) -> Result<Item, WorkflowError> {
    let item = match store.find_record_by_key::<Item>(TABLE_ITEMS, sku)? {
        Some(existing) => Item {
            name: spec.name.clone(),
            description: spec.description.clone(),
            category: spec.category.clone(),
            unit: spec.unit.clone(),
            location: spec.location.clone(),
            updated_at: at.clone(),
            ..existing
        },
        None => Item {
            sku: sku.to_string(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            category: spec.category.clone(),
            unit: spec.unit.clone(),
            location: spec.location.clone(),
            quantity: 0,
            status: ItemStatus::Active,
            unit_price: None,
            created_at: at.clone(),
            updated_at: at.clone(),
        },
    };
    store.append_record(TABLE_ITEMS, sku, &item)?;
    Ok(item)
}

/// Apply descriptive changes, returning the field-level diff for the audit
/// note. Retired items must be received back into stock before changes, and
/// retiring itself goes through [`retire_item`].
pub fn modify_item(
    store: &RecordStore,
    sku: &str,
    patch: &ItemPatch,
    at: &TimeStamp<Utc>,
) -> Result<(Item, Vec<FieldChange>), WorkflowError> {
    let item = find_item(store, sku)?;
    if item.status == ItemStatus::Retired {
        return Err(WorkflowError::Validation(format!(
            "cannot modify retired item {sku}; receive stock (reactivate) before changes"
        )));
    }
    if patch.status == Some(ItemStatus::Retired) {
        return Err(WorkflowError::Validation(
            "use the Retire SKU action to retire an item".into(),
        ));
    }

    let mut next = item.clone();
    if let Some(name) = &patch.name {
        next.name = name.clone();
    }
    if let Some(description) = &patch.description {
        next.description = description.clone();
    }
    if let Some(category) = &patch.category {
        next.category = category.clone();
    }
    if let Some(unit) = &patch.unit {
        next.unit = unit.clone();
    }
    if let Some(location) = &patch.location {
        next.location = location.clone();
    }
    if let Some(price) = patch.unit_price {
        next.unit_price = Some(price);
    }
    if let Some(status) = patch.status {
        next.status = status;
    }

    let changes = diff_items(&item, &next);
    if !changes.is_empty() {
        next.updated_at = at.clone();
        store.append_record(TABLE_ITEMS, sku, &next)?;
    }
    Ok((next, changes))
}

/// Retire a SKU. Stock must be exactly zero at this instant.
pub fn retire_item(
    store: &RecordStore,
    sku: &str,
    at: &TimeStamp<Utc>,
) -> Result<Item, WorkflowError> {
    let mut item = find_item(store, sku)?;
    if item.quantity != 0 {
        return Err(WorkflowError::Validation(format!(
            "cannot retire {sku}: stock must be exactly 0 (on hand: {})",
            item.quantity
        )));
    }
    item.status = ItemStatus::Retired;
    item.updated_at = at.clone();
    store.append_record(TABLE_ITEMS, sku, &item)?;
    Ok(item)
}

fn diff_items(before: &Item, after: &Item) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    let mut push = |field: &str, from: &str, to: &str| {
        if from != to {
            changes.push(FieldChange {
                field: field.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    };
    push("Name", &before.name, &after.name);
    push("Description", &before.description, &after.description);
    push("Category", &before.category, &after.category);
    push("UoM", &before.unit, &after.unit);
    push("Location", &before.location, &after.location);
    push(
        "Status",
        &before.status.to_string(),
        &after.status.to_string(),
    );
    if before.unit_price != after.unit_price {
        let fmt_price = |p: Option<u64>| p.map(|v| v.to_string()).unwrap_or_default();
        changes.push(FieldChange {
            field: "UnitPrice".into(),
            from: fmt_price(before.unit_price),
            to: fmt_price(after.unit_price),
        });
    }
    changes
}

/// Active items at or below the threshold, for replenishment alerts.
pub fn low_stock(items: &[Item], threshold: i64) -> Vec<Item> {
    items
        .iter()
        .filter(|it| it.status == ItemStatus::Active && it.quantity <= threshold)
        .cloned()
        .collect()
}
