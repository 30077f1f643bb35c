//! Text normalization.
//!
//! Adjacent simple text nodes with the same format and style are merged, and
//! empty simple text nodes are removed unless an input method is composing
//! into them. Runs on dirty leaves before their transforms.

use strata_model::{NodeKey, PointKind, Selection, TextData};

use crate::transaction::Transaction;
use crate::CoreResult;

/// Returns the text data of `key` if it is simple text.
fn simple_text(txn: &Transaction, key: NodeKey) -> Option<&TextData> {
    txn.state()
        .get(key)
        .and_then(|node| node.as_text())
        .filter(|data| data.is_simple())
}

fn can_merge(a: &TextData, b: &TextData) -> bool {
    a.format == b.format && a.style == b.style
}

/// Normalizes one dirty text node against its siblings.
pub fn normalize_text_node(txn: &mut Transaction, key: NodeKey) -> CoreResult<()> {
    if !txn.is_attached(key) {
        return Ok(());
    }
    let Some(data) = simple_text(txn, key) else {
        return Ok(());
    };
    if data.is_empty() {
        if txn.composition_key() != Some(key) {
            txn.remove(key)?;
        }
        return Ok(());
    }

    let mut node = key;

    // Backward: merge into the previous sibling
    while let Some(prev) = txn.get_latest(node)?.prev {
        let Some(prev_data) = simple_text(txn, prev) else {
            break;
        };
        if prev_data.is_empty() {
            if txn.composition_key() == Some(prev) {
                break;
            }
            txn.remove(prev)?;
            continue;
        }
        let current = simple_text(txn, node);
        if current.is_some_and(|current| can_merge(prev_data, current)) {
            merge_with_next(txn, prev)?;
            node = prev;
        }
        break;
    }

    // Forward: absorb the next sibling
    while let Some(next) = txn.get_latest(node)?.next {
        let Some(next_data) = simple_text(txn, next) else {
            break;
        };
        if next_data.is_empty() {
            if txn.composition_key() == Some(next) {
                break;
            }
            txn.remove(next)?;
            continue;
        }
        let current = simple_text(txn, node);
        if current.is_some_and(|current| can_merge(current, next_data)) {
            merge_with_next(txn, node)?;
        }
        break;
    }
    Ok(())
}

/// Appends the next sibling's text to `key` and removes the sibling.
///
/// Text points on the sibling move onto `key`, shifted by its old length; the
/// composition key follows the text.
pub(crate) fn merge_with_next(txn: &mut Transaction, key: NodeKey) -> CoreResult<()> {
    let Some(next) = txn.get_latest(key)?.next else {
        return Ok(());
    };
    let Some(head) = simple_text(txn, key).map(|d| d.text.clone()) else {
        return Ok(());
    };
    let Some(tail) = simple_text(txn, next).map(|d| d.text.clone()) else {
        return Ok(());
    };
    let head_len = head.chars().count();

    if txn.composition_key() == Some(next) {
        txn.set_composition_key(Some(key));
    }

    let moves_points = matches!(
        txn.selection(),
        Some(Selection::Range(range))
            if (range.anchor.key == next && range.anchor.kind == PointKind::Text)
                || (range.focus.key == next && range.focus.kind == PointKind::Text)
    );
    if moves_points {
        if let Some(Selection::Range(range)) = txn.selection_slot()? {
            for point in [&mut range.anchor, &mut range.focus] {
                if point.key == next && point.kind == PointKind::Text {
                    point.key = key;
                    point.offset += head_len;
                }
            }
        }
    }

    txn.set_text(key, head + &tail)?;
    txn.remove(next)
}
