//! Transform fixpoint engine.
//!
//! ## Design
//!
//! Transforms are per-type rules that run on dirty nodes after the update
//! callback. A rule may mutate the tree, which dirties more nodes, so the
//! engine loops until nothing new is dirty:
//!
//! ```text
//!   ┌──▶ (a) leaves: normalize text, run rules ──new leaves?──┐
//!   │                     │ no                                 │
//!   │                     ▼                                    │
//!   └── new leaves ── (b) elements: run rules on intentional ◀─┘ (repeat a)
//!                         │ nothing new
//!                         ▼
//!                       done
//! ```
//!
//! Elements that are only dirty because a descendant changed are kept for
//! the reconciler but never handed to element rules. The root is always
//! eligible. Passes are bounded; exceeding the bound is reported as
//! [`CoreError::TransformLoop`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use strata_model::NodeKey;

use crate::normalize::normalize_text_node;
use crate::transaction::{DirtyCause, Transaction};
use crate::{CoreError, CoreResult};

/// A transform rule.
pub type TransformFn = Rc<dyn Fn(&mut Transaction, NodeKey) -> CoreResult<()>>;

/// Handle returned by [`TransformRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformId(u64);

/// Ordered transform rules per node type name.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    rules: HashMap<String, Vec<(TransformId, TransformFn)>>,
    next_id: u64,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for `type_name`; rules run in registration order.
    pub fn register<F>(&mut self, type_name: impl Into<String>, rule: F) -> TransformId
    where
        F: Fn(&mut Transaction, NodeKey) -> CoreResult<()> + 'static,
    {
        let id = TransformId(self.next_id);
        self.next_id += 1;
        self.rules
            .entry(type_name.into())
            .or_default()
            .push((id, Rc::new(rule)));
        id
    }

    /// Removes a rule. Returns false if it was not registered.
    pub fn unregister(&mut self, id: TransformId) -> bool {
        for rules in self.rules.values_mut() {
            if let Some(pos) = rules.iter().position(|(rule_id, _)| *rule_id == id) {
                rules.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn rules_for(&self, type_name: &str) -> Vec<TransformFn> {
        self.rules
            .get(type_name)
            .map(|rules| rules.iter().map(|(_, rule)| Rc::clone(rule)).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.values().all(Vec::is_empty)
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .rules
            .iter()
            .map(|(name, rules)| (name.as_str(), rules.len()))
            .collect();
        f.debug_struct("TransformRegistry").field("rules", &counts).finish()
    }
}

/// Runs normalization and transforms until no node is newly dirtied.
///
/// Returns the number of passes taken. On return the transaction's dirty
/// sets hold every node dirtied before or during the run.
pub fn apply_all_transforms(
    txn: &mut Transaction,
    registry: &TransformRegistry,
    max_passes: usize,
    normalize: bool,
) -> CoreResult<usize> {
    let mut all_leaves = std::mem::take(&mut txn.dirty_leaves);
    let mut all_elements = std::mem::take(&mut txn.dirty_elements);
    let mut pending_leaves: BTreeSet<NodeKey> = all_leaves.clone();
    let mut pending_elements: BTreeMap<NodeKey, DirtyCause> = all_elements.clone();
    let mut passes = 0;

    while !pending_leaves.is_empty() || !pending_elements.is_empty() {
        if !pending_leaves.is_empty() {
            for key in &pending_leaves {
                if normalize {
                    normalize_text_node(txn, *key)?;
                }
                apply_rules(txn, registry, *key)?;
            }
            all_leaves.extend(pending_leaves.iter().copied());
            pending_leaves = std::mem::take(&mut txn.dirty_leaves);

            if !pending_leaves.is_empty() {
                passes += 1;
                check_bound(passes, max_passes)?;
                continue;
            }
        }

        for (key, cause) in std::mem::take(&mut txn.dirty_elements) {
            merge_cause(&mut pending_elements, key, cause);
        }
        for (key, cause) in &pending_elements {
            merge_cause(&mut all_elements, *key, *cause);
            if key.is_root() || *cause == DirtyCause::Intentional {
                apply_rules(txn, registry, *key)?;
            }
        }

        pending_leaves = std::mem::take(&mut txn.dirty_leaves);
        pending_elements = std::mem::take(&mut txn.dirty_elements);
        passes += 1;
        check_bound(passes, max_passes)?;
    }

    txn.dirty_leaves = all_leaves;
    txn.dirty_elements = all_elements;
    Ok(passes)
}

fn check_bound(passes: usize, max_passes: usize) -> CoreResult<()> {
    if passes > max_passes {
        tracing::warn!("Transforms still dirtying nodes after {} passes", passes);
        return Err(CoreError::TransformLoop { passes });
    }
    Ok(())
}

/// Intentional wins over transitive.
fn merge_cause(map: &mut BTreeMap<NodeKey, DirtyCause>, key: NodeKey, cause: DirtyCause) {
    let entry = map.entry(key).or_insert(cause);
    if cause > *entry {
        *entry = cause;
    }
}

/// Runs the rules of a node's type while it stays attached.
fn apply_rules(txn: &mut Transaction, registry: &TransformRegistry, key: NodeKey) -> CoreResult<()> {
    if txn.composition_key() == Some(key) || !txn.is_attached(key) {
        return Ok(());
    }
    let Some(node) = txn.state().get(key) else {
        return Ok(());
    };
    let rules = registry.rules_for(node.type_name());
    for rule in rules {
        rule(txn, key)?;
        if !txn.is_attached(key) {
            tracing::trace!("Node {} detached by transform", key);
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn with_text(text: &str) -> (Transaction, NodeKey, NodeKey) {
        let mut txn = Transaction::for_test();
        let para = txn.create_paragraph().unwrap();
        txn.append(NodeKey::ROOT, para).unwrap();
        let t = txn.create_text(text).unwrap();
        txn.append(para, t).unwrap();
        (txn, para, t)
    }

    #[test]
    fn test_single_rewrite_converges_in_two_passes() {
        let (mut txn, _, t) = with_text("hello");
        let mut registry = TransformRegistry::new();
        registry.register("text", |txn, key| {
            let text = txn.text_content(key)?;
            if text != text.to_uppercase() {
                txn.set_text(key, text.to_uppercase())?;
            }
            Ok(())
        });

        let passes = apply_all_transforms(&mut txn, &registry, 100, true).unwrap();
        assert_eq!(passes, 2);
        assert_eq!(txn.text_content(t).unwrap(), "HELLO");
    }

    #[test]
    fn test_no_rules_takes_one_pass() {
        let (mut txn, _, _) = with_text("x");
        let passes = apply_all_transforms(&mut txn, &TransformRegistry::new(), 100, true).unwrap();
        assert_eq!(passes, 1);
    }

    #[test]
    fn test_mutual_dirtying_hits_the_bound() {
        let (mut txn, _, _) = with_text("x");
        let mut registry = TransformRegistry::new();
        registry.register("text", |txn, key| txn.mark_dirty(key));

        let err = apply_all_transforms(&mut txn, &registry, 10, true).unwrap_err();
        assert!(matches!(err, CoreError::TransformLoop { passes: 11 }));
    }

    #[test]
    fn test_transitive_elements_are_not_transformed() {
        let (mut txn, para, t) = with_text("x");
        txn.dirty_elements.clear();
        txn.dirty_leaves.clear();
        txn.mark_dirty(t).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut registry = TransformRegistry::new();
        let log = Rc::clone(&seen);
        registry.register("paragraph", move |_, key| {
            log.borrow_mut().push(key);
            Ok(())
        });
        let log = Rc::clone(&seen);
        registry.register("root", move |_, key| {
            log.borrow_mut().push(key);
            Ok(())
        });

        apply_all_transforms(&mut txn, &registry, 100, true).unwrap();
        assert_eq!(*seen.borrow(), vec![NodeKey::ROOT]);
        assert_eq!(txn.dirty_elements()[&para], DirtyCause::Transitive);

        seen.borrow_mut().clear();
        txn.mark_dirty(para).unwrap();
        apply_all_transforms(&mut txn, &registry, 100, true).unwrap();
        assert!(seen.borrow().contains(&para));
        assert_eq!(txn.dirty_elements()[&para], DirtyCause::Intentional);
    }

    #[test]
    fn test_composing_node_is_skipped() {
        let (mut txn, _, t) = with_text("x");
        txn.set_composition_key(Some(t));

        let mut registry = TransformRegistry::new();
        registry.register("text", |txn, key| txn.set_text(key, "changed"));
        apply_all_transforms(&mut txn, &registry, 100, true).unwrap();
        assert_eq!(txn.text_content(t).unwrap(), "x");
    }

    #[test]
    fn test_rules_stop_once_node_detaches() {
        let (mut txn, _, t) = with_text("drop me");
        let calls = Rc::new(RefCell::new(0));
        let mut registry = TransformRegistry::new();
        registry.register("text", |txn, key| txn.remove(key));
        let counter = Rc::clone(&calls);
        registry.register("text", move |_, _| {
            *counter.borrow_mut() += 1;
            Ok(())
        });

        apply_all_transforms(&mut txn, &registry, 100, true).unwrap();
        assert!(!txn.is_attached(t));
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn test_leaf_dirt_from_element_rule_returns_to_leaf_phase() {
        let (mut txn, para, _) = with_text("a");
        let mut registry = TransformRegistry::new();
        registry.register("paragraph", |txn, key| {
            if txn.children(key)?.len() < 2 {
                let extra = txn.create_text("b")?;
                txn.set_text_format(extra, strata_model::TextFormat::BOLD)?;
                txn.append(key, extra)?;
            }
            Ok(())
        });
        txn.mark_dirty(para).unwrap();

        apply_all_transforms(&mut txn, &registry, 100, true).unwrap();
        assert_eq!(txn.children(para).unwrap().len(), 2);
    }

    #[test]
    fn test_unregister() {
        let mut registry = TransformRegistry::new();
        let id = registry.register("text", |_, _| Ok(()));
        assert!(!registry.is_empty());
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }
}
