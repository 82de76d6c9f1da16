//! Deliberately mutable indirection node.
//!
//! Computing facet statistics evaluates thousands of trees per request that
//! differ only in a single facet leaf. Instead of re-deriving and re-walking
//! the tree once per facet, the derived tree carries exactly one
//! [`MutableSlot`] leaf whose content is swapped between evaluations. The
//! [`MutableReplacer`] records the root-to-slot path when the tree is first
//! derived and clears the memoized result of every node on that path on each
//! swap; missing one ancestor would let a stale memo short-circuit the next
//! evaluation, which is the correctness-critical part of this optimization.
//!
//! Not thread-safe by design. A replacer must never be retained across two
//! different base formulas; everything here is instantiated per query.

use std::fmt;
use std::hash::{Hash, Hasher};

use super::{FacetGroupFormula, FormulaArena, FormulaKind, NodeId};
use crate::bitmap::Bitmap;
use crate::{FaceteerError, Result};

/// Swappable content of the single mutable node of a derived formula tree.
///
/// `pivot` is a constraint that was already present in the original tree and
/// must keep being honored; `delegate` is the per-facet hypothetical
/// constraint exchanged between evaluations.
#[derive(Debug, Clone)]
pub struct MutableSlot {
    pivot: Option<FacetGroupFormula>,
    delegate: FacetGroupFormula,
    pivot_suppressed: bool,
}

impl MutableSlot {
    pub fn new(delegate: FacetGroupFormula) -> MutableSlot {
        MutableSlot {
            pivot: None,
            delegate,
            pivot_suppressed: false,
        }
    }

    /// Creates a slot that honors both the pre-existing `pivot` constraint
    /// and the swappable `delegate`.
    pub fn with_pivot(delegate: FacetGroupFormula, pivot: FacetGroupFormula) -> Result<MutableSlot> {
        if !pivot.is_mergeable_with(&delegate) {
            return Err(FaceteerError::InternalError(format!(
                "pivot is incompatible with the delegate: {pivot} vs {delegate}"
            )));
        }
        Ok(MutableSlot {
            pivot: Some(pivot),
            delegate,
            pivot_suppressed: false,
        })
    }

    pub fn delegate(&self) -> &FacetGroupFormula {
        &self.delegate
    }

    pub fn pivot(&self) -> Option<&FacetGroupFormula> {
        self.pivot.as_ref()
    }

    /// `pivot ∪-merged delegate` when a pivot is set and not suppressed,
    /// otherwise the delegate alone.
    pub(crate) fn compute(&self) -> Bitmap {
        match &self.pivot {
            Some(pivot) if !self.pivot_suppressed => pivot
                .merge_with(&self.delegate)
                .expect("pivot compatibility is validated when the pivot is installed")
                .compute(),
            _ => self.delegate.compute(),
        }
    }

    pub(crate) fn hash_identity<H: Hasher>(&self, state: &mut H) {
        self.delegate.hash_identity(state);
        self.pivot_suppressed.hash(state);
        if let Some(pivot) = &self.pivot {
            pivot.hash_identity(state);
        }
    }

    pub(crate) fn estimated_cardinality(&self) -> u64 {
        self.delegate.estimated_cardinality()
            + self
                .pivot
                .as_ref()
                .map(FacetGroupFormula::estimated_cardinality)
                .unwrap_or(0)
    }
}

impl fmt::Display for MutableSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pivot {
            Some(pivot) => write!(f, "{pivot} + {}", self.delegate),
            None => write!(f, "{}", self.delegate),
        }
    }
}

/// Handle to the unique mutable node of a derived tree.
///
/// Holds the precomputed parent chain from the tree root down to the slot so
/// invalidation never has to re-walk the tree.
pub struct MutableReplacer {
    root: NodeId,
    mutable: NodeId,
    /// `root ..= mutable`, in root-first order.
    path: Vec<NodeId>,
}

impl MutableReplacer {
    /// Walks the tree under `root` and locates its mutable node.
    ///
    /// Returns `Ok(None)` when the tree contains no mutable node at all (a
    /// collapsed negation branch may have dropped it); such a tree cannot be
    /// reused by swapping. More than one occurrence is a tree-construction
    /// bug.
    pub fn locate(arena: &FormulaArena, root: NodeId) -> Result<Option<MutableReplacer>> {
        let mut paths: Vec<Vec<NodeId>> = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        collect_mutable_paths(arena, root, &mut stack, &mut paths);
        match paths.len() {
            0 => Ok(None),
            1 => {
                let path = paths.pop().expect("one path");
                Ok(Some(MutableReplacer {
                    root,
                    mutable: *path.last().expect("path ends at the mutable node"),
                    path,
                }))
            }
            n => Err(FaceteerError::invariant_violation(
                &format!("expected exactly one mutable formula in the tree, found {n}"),
                &arena.display(root),
            )),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn mutable_node(&self) -> NodeId {
        self.mutable
    }

    /// Exchanges the delegate and invalidates the memoized results of every
    /// formula on the root-to-slot path. Resets pivot suppression.
    pub fn swap_delegate(
        &self,
        arena: &mut FormulaArena,
        delegate: FacetGroupFormula,
    ) -> Result<()> {
        {
            let slot = self.slot_mut(arena)?;
            if let Some(pivot) = &slot.pivot {
                if !pivot.is_mergeable_with(&delegate) {
                    return Err(FaceteerError::InternalError(format!(
                        "swapped delegate is incompatible with the installed pivot: \
                         {pivot} vs {delegate}"
                    )));
                }
            }
            slot.delegate = delegate;
            slot.pivot_suppressed = false;
        }
        self.invalidate(arena);
        Ok(())
    }

    /// Installs (or clears) the pivot constraint and invalidates the path.
    pub fn set_pivot(
        &self,
        arena: &mut FormulaArena,
        pivot: Option<FacetGroupFormula>,
    ) -> Result<()> {
        {
            let slot = self.slot_mut(arena)?;
            if let Some(pivot) = &pivot {
                if !pivot.is_mergeable_with(&slot.delegate) {
                    return Err(FaceteerError::InternalError(format!(
                        "pivot is incompatible with the current delegate: \
                         {pivot} vs {}",
                        slot.delegate
                    )));
                }
            }
            slot.pivot = pivot;
        }
        self.invalidate(arena);
        Ok(())
    }

    /// Temporarily excludes the pivot contribution from evaluation, so the
    /// tree computes as if the delegate facet were the only one selected in
    /// its group. Callers must restore the flag afterwards.
    pub fn suppress_pivot(&self, arena: &mut FormulaArena, suppressed: bool) -> Result<()> {
        self.slot_mut(arena)?.pivot_suppressed = suppressed;
        self.invalidate(arena);
        Ok(())
    }

    pub fn delegate<'a>(&self, arena: &'a FormulaArena) -> Result<&'a FacetGroupFormula> {
        match arena.kind(self.mutable) {
            FormulaKind::Mutable(slot) => Ok(&slot.delegate),
            _ => Err(self.not_a_mutable_error(arena)),
        }
    }

    pub fn pivot<'a>(&self, arena: &'a FormulaArena) -> Result<Option<&'a FacetGroupFormula>> {
        match arena.kind(self.mutable) {
            FormulaKind::Mutable(slot) => Ok(slot.pivot.as_ref()),
            _ => Err(self.not_a_mutable_error(arena)),
        }
    }

    fn slot_mut<'a>(&self, arena: &'a mut FormulaArena) -> Result<&'a mut MutableSlot> {
        let err = match arena.kind(self.mutable) {
            FormulaKind::Mutable(_) => None,
            _ => Some(self.not_a_mutable_error(arena)),
        };
        if let Some(err) = err {
            return Err(err);
        }
        match arena.kind_mut(self.mutable) {
            FormulaKind::Mutable(slot) => Ok(slot),
            _ => unreachable!("checked above"),
        }
    }

    fn not_a_mutable_error(&self, arena: &FormulaArena) -> FaceteerError {
        FaceteerError::invariant_violation(
            "replacer no longer points at a mutable formula",
            &arena.display(self.root),
        )
    }

    fn invalidate(&self, arena: &mut FormulaArena) {
        for &id in &self.path {
            arena.clear_memo(id);
        }
        arena.refresh_identity(self.mutable);
    }
}

fn collect_mutable_paths(
    arena: &FormulaArena,
    id: NodeId,
    stack: &mut Vec<NodeId>,
    paths: &mut Vec<Vec<NodeId>>,
) {
    stack.push(id);
    if matches!(arena.kind(id), FormulaKind::Mutable(_)) {
        paths.push(stack.clone());
    }
    for &child in arena.children(id) {
        collect_mutable_paths(arena, child, stack, paths);
    }
    stack.pop();
}
