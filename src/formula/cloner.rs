//! Guarded rewriting of formula trees with structural sharing.
//!
//! [`rewrite`] walks a tree depth-first and offers every node to a guard.
//! When the guard produces a replacement, that subtree is swapped out and not
//! descended into; otherwise the children are rewritten recursively and the
//! node is copied only when at least one child actually changed. An untouched
//! subtree keeps its [`NodeId`], so callers can detect "nothing to do" with a
//! plain identity comparison; returning a fresh node for an unchanged
//! subtree would be a correctness bug, not just a wasted allocation, because
//! splice policies use that comparison to decide whether a wrapping formula
//! must be synthesized at all.

use smallvec::SmallVec;

use super::{FormulaArena, NodeId};

/// Rewrites the tree under `root`, returning the id of the resulting tree.
///
/// Returns `root` itself iff neither `root` nor any descendant was replaced.
pub fn rewrite<F>(arena: &mut FormulaArena, root: NodeId, replace: &mut F) -> NodeId
where F: FnMut(&mut FormulaArena, NodeId) -> Option<NodeId> {
    if let Some(replacement) = replace(arena, root) {
        return replacement;
    }
    let children: SmallVec<[NodeId; 4]> = arena.children(root).iter().copied().collect();
    let mut new_children: SmallVec<[NodeId; 4]> = SmallVec::with_capacity(children.len());
    let mut changed = false;
    for &child in &children {
        let new_child = rewrite(arena, child, replace);
        changed |= new_child != child;
        new_children.push(new_child);
    }
    if changed {
        arena.clone_with_children(root, new_children)
    } else {
        root
    }
}

#[cfg(test)]
mod tests {
    use super::rewrite;
    use crate::bitmap::from_ids;
    use crate::formula::{FormulaArena, FormulaKind};

    #[test]
    fn test_rewrite_returns_same_id_when_nothing_matches() {
        let mut arena = FormulaArena::new();
        let a = arena.constant(from_ids(&[1]));
        let b = arena.constant(from_ids(&[2]));
        let root = arena.and([a, b]);
        let result = rewrite(&mut arena, root, &mut |_, _| None);
        assert_eq!(result, root);
    }

    #[test]
    fn test_rewrite_copies_only_the_changed_path() {
        let mut arena = FormulaArena::new();
        let a = arena.constant(from_ids(&[1, 2]));
        let b = arena.constant(from_ids(&[3]));
        let left = arena.or([a, b]);
        let c = arena.constant(from_ids(&[4]));
        let d = arena.constant(from_ids(&[5]));
        let right = arena.or([c, d]);
        let root = arena.and([left, right]);

        // replace `b` with an empty formula
        let result = rewrite(&mut arena, root, &mut |arena, id| {
            if id == b {
                Some(arena.empty())
            } else {
                None
            }
        });
        assert_ne!(result, root);
        // the untouched right branch is shared verbatim
        assert_eq!(arena.children(result)[1], right);
        assert_ne!(arena.children(result)[0], left);
        assert_eq!(*arena.compute(result), from_ids(&[1, 2]) & from_ids(&[4, 5]));
    }

    #[test]
    fn test_rewrite_does_not_descend_into_replacements() {
        let mut arena = FormulaArena::new();
        let a = arena.constant(from_ids(&[1]));
        let b = arena.constant(from_ids(&[2]));
        let inner = arena.or([a, b]);
        let root = arena.and([inner]);
        // `and` of a single child normalizes to the child itself
        assert_eq!(root, inner);

        let mut visited_constants = 0;
        rewrite(&mut arena, root, &mut |arena, id| {
            if matches!(arena.kind(id), FormulaKind::Constant(_)) {
                visited_constants += 1;
            }
            if matches!(arena.kind(id), FormulaKind::Or) {
                Some(arena.empty())
            } else {
                None
            }
        });
        assert_eq!(visited_constants, 0);
    }
}
