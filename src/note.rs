//! Audit note composition.
//!
//! A request and its ledger entry share one free-text note, grown by
//! appending lines. A candidate line is dropped when its trimmed,
//! case-folded text already appears somewhere in the note, which keeps
//! stamps and metadata from piling up when an operation is replayed.
//! Content lines go in first, the action stamp always last.
use crate::request::{LineItem, RequestMeta, RequestType};
use crate::time::TimeStamp;
use chrono::Utc;

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Append one line unless its normalized form is already present.
pub fn append_line(existing: &str, addition: &str) -> String {
    let base = existing.trim();
    let add = addition.trim();
    if add.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return add.to_string();
    }
    if normalize(base).contains(&normalize(add)) {
        return base.to_string();
    }
    format!("{base}\n{add}")
}

/// Fold a batch of candidate lines into the note, deduplicating each
/// against everything accumulated so far.
pub fn append_unique(existing: &str, candidates: &[String]) -> String {
    candidates
        .iter()
        .fold(existing.trim().to_string(), |note, line| {
            append_line(&note, line)
        })
}

/// Short review/request stamp, e.g. `[Approved by a@b @ 2025-07-01 15:04:05] Comment: ok`.
pub fn stamp(verb: &str, actor: &str, at: &TimeStamp<Utc>, tail: &str) -> String {
    let actor = if actor.is_empty() { "—" } else { actor };
    format!("[{verb} by {actor} @ {}]{tail}", at.to_local_string())
}

pub fn reason_line(reason: &str) -> Option<String> {
    let reason = reason.trim();
    (!reason.is_empty()).then(|| format!("Reason: {reason}"))
}

pub fn remarks_line(remarks: &str) -> Option<String> {
    let remarks = remarks.trim();
    (!remarks.is_empty()).then(|| format!("Remarks: {remarks}"))
}

/// Structured metadata lines: recipient, business unit, deployment.
pub fn meta_lines(meta: &RequestMeta) -> Vec<String> {
    let mut lines = Vec::new();
    if meta.recipient.is_some() || meta.department.is_some() {
        let recipient = meta.recipient.as_deref().unwrap_or("—");
        let department = meta.department.as_deref().unwrap_or("—");
        lines.push(format!("Issued To: {recipient} ({department})"));
    }
    if let Some(bu) = meta.business_unit.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("Business Unit: {bu}"));
    }
    if let Some(loc) = meta
        .deployment_location
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        lines.push(format!("Deployment: {loc}"));
    }
    lines
}

/// Title and numbered list for a movement, e.g.
/// `Issue — 2 item(s)` over `1. 5 pc — Patch cable (SKU-0001)`.
pub fn summarize_items(request_type: RequestType, items: &[LineItem]) -> (String, String) {
    let title = format!("{} — {} item(s)", request_type.label(), items.len());
    let list = items
        .iter()
        .enumerate()
        .map(|(idx, it)| {
            format!(
                "{}. {} {} — {} ({})",
                idx + 1,
                it.quantity,
                it.unit,
                it.name,
                it.sku
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    (title, list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_line_is_dropped() {
        let note = append_line("", "Reason: restock");
        let again = append_line(&note, "Reason: restock");
        assert_eq!(note, again);
    }

    #[test]
    fn dedup_is_case_and_whitespace_insensitive() {
        let note = append_line("Reason: Restock", "  reason: restock  ");
        assert_eq!(note, "Reason: Restock");
    }

    #[test]
    fn empty_candidate_leaves_note_unchanged() {
        assert_eq!(append_line("line one", "   "), "line one");
    }

    #[test]
    fn batch_append_dedupes_within_the_batch() {
        let note = append_unique(
            "",
            &[
                "Reason: restock".to_string(),
                "Reason: restock".to_string(),
                "Remarks: urgent".to_string(),
            ],
        );
        assert_eq!(note, "Reason: restock\nRemarks: urgent");
    }

    #[test]
    fn stamp_includes_verb_actor_and_tail() {
        let s = stamp(
            "Declined",
            "boss@corp",
            &TimeStamp::now(),
            " — Reason: broken",
        );
        assert!(s.starts_with("[Declined by boss@corp @ "));
        assert!(s.ends_with("] — Reason: broken"));
    }

    #[test]
    fn stamp_substitutes_dash_for_unknown_actor() {
        let s = stamp("Submitted", "", &TimeStamp::now(), "");
        assert!(s.starts_with("[Submitted by — @ "));
    }

    #[test]
    fn summary_numbers_lines() {
        let items = vec![
            LineItem {
                sku: "SKU-0001".into(),
                name: "Patch cable".into(),
                unit: "pc".into(),
                quantity: 5,
                delta: -5,
                reactivate_if_retired: false,
            },
            LineItem {
                sku: "SKU-0002".into(),
                name: "Copy paper".into(),
                unit: "ream".into(),
                quantity: 2,
                delta: -2,
                reactivate_if_retired: false,
            },
        ];
        let (title, list) = summarize_items(RequestType::Issue, &items);
        assert_eq!(title, "Issue — 2 item(s)");
        assert_eq!(
            list,
            "1. 5 pc — Patch cable (SKU-0001)\n2. 2 ream — Copy paper (SKU-0002)"
        );
    }
}
