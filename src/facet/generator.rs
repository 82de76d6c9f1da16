//! Splicing of one facet constraint into an existing filter tree.
//!
//! Given the base filter of the current query and a single
//! (facet, facet group) pair, [`generate_formula`] derives a new tree that is
//! equivalent to "base filter, adjusted for this extra facet constraint".
//! The constraint has to be injected at the user-filter boundary, never
//! deeper, and the way it combines with the constraints already present is
//! governed by the group's [`FacetRelationType`].
//!
//! The walk tracks two scopes (inside NOT, inside user filter). A mutation
//! whose injection point lies inside a NOT container cannot be applied while
//! that container's children are still being visited; it is parked as a
//! [`PendingEdit`] and applied exactly once when the NOT scope is exited.

use smallvec::SmallVec;

use crate::facet::FacetRelationType;
use crate::formula::{
    rewrite, FacetGroupFormula, FormulaArena, FormulaKind, MutableSlot, NodeId,
};
use crate::{FaceteerError, Result};

/// What the derived tree is meant to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GeneratorMode {
    /// How many entities of the current result carry this facet.
    Count,
    /// How many entities would match if this facet were selected as well.
    /// Intercepts an existing formula of the same group inside the user
    /// filter and keeps honoring it as the pivot of the swappable leaf.
    Impact,
}

/// Result of one derivation.
pub(crate) struct GeneratedFormula {
    pub root: NodeId,
    /// Set when an existing same-group formula inside the user filter was
    /// merged in place rather than a new constraint being spliced in.
    pub merged_existing_group: bool,
}

/// Edit parked while inside a NOT scope, applied on scope exit.
enum PendingEdit {
    /// The facet is itself negated: the new constraint conjoined with the
    /// base (sans user filter) replaces the subtracted baseline. Collapses
    /// the whole branch when that conjunction is empty.
    SubtractNegated { leaf: NodeId },
    /// The facet joins the superset side of the NOT container, and the
    /// original superset is re-applied around it.
    ExtendSuperset { leaf: NodeId },
}

/// Derives a formula for `new_facet` spliced into `base` according to
/// `splice_relation`. `base_without_user_filter` supplies the baseline for
/// negated facets.
pub(crate) fn generate_formula(
    arena: &mut FormulaArena,
    mode: GeneratorMode,
    base: NodeId,
    base_without_user_filter: NodeId,
    splice_relation: FacetRelationType,
    new_facet: FacetGroupFormula,
) -> Result<GeneratedFormula> {
    let mut run = Run {
        arena,
        mode,
        base_without_user_filter,
        splice_relation,
        new_facet,
        new_leaf: None,
        pending: None,
        inside_not: 0,
        inside_user_filter: 0,
        merged_existing_group: false,
    };
    let root = run.visit(base)?;
    if run.pending.is_some() {
        return Err(FaceteerError::invariant_violation(
            "pending NOT-scope edit was never applied",
            &run.arena.display(base),
        ));
    }
    let merged_existing_group = run.merged_existing_group;
    let root = if root == base && !merged_existing_group {
        // no user filter boundary in the tree: the facet constraint simply
        // conjoins with the whole base filter
        let leaf = run.leaf();
        run.arena.and([base, leaf])
    } else {
        root
    };
    Ok(GeneratedFormula {
        root,
        merged_existing_group,
    })
}

struct Run<'a> {
    arena: &'a mut FormulaArena,
    mode: GeneratorMode,
    base_without_user_filter: NodeId,
    splice_relation: FacetRelationType,
    new_facet: FacetGroupFormula,
    new_leaf: Option<NodeId>,
    pending: Option<PendingEdit>,
    inside_not: u32,
    inside_user_filter: u32,
    merged_existing_group: bool,
}

impl Run<'_> {
    /// The single swappable leaf of the derived tree, allocated on demand.
    fn leaf(&mut self) -> NodeId {
        match self.new_leaf {
            Some(leaf) => leaf,
            None => {
                let leaf = self
                    .arena
                    .mutable(MutableSlot::new(self.new_facet.clone()));
                self.new_leaf = Some(leaf);
                leaf
            }
        }
    }

    fn visit(&mut self, id: NodeId) -> Result<NodeId> {
        let is_user_filter = matches!(self.arena.kind(id), FormulaKind::UserFilter);
        let is_not = matches!(self.arena.kind(id), FormulaKind::Not);
        if is_user_filter {
            self.inside_user_filter += 1;
        }
        if is_not {
            self.inside_not += 1;
        }

        let children: SmallVec<[NodeId; 4]> =
            self.arena.children(id).iter().copied().collect();
        let mut new_children: SmallVec<[NodeId; 4]> = SmallVec::with_capacity(children.len());
        for &child in &children {
            new_children.push(self.visit(child)?);
        }

        if is_user_filter {
            self.inside_user_filter -= 1;
        }
        if is_not {
            self.inside_not -= 1;
        }

        if let Some(replacement) = self.handle_facet_group(id)? {
            return Ok(replacement);
        }

        if is_user_filter && !self.merged_existing_group {
            if let Some(result) = self.handle_user_filter(id, &new_children) {
                return Ok(result);
            }
            // a pending edit was parked for the enclosing NOT scope; the user
            // filter node itself stays as it is
        }

        if is_not {
            if let Some(pending) = self.pending.take() {
                return self.apply_pending(pending, id, &new_children);
            }
        }

        if new_children != children {
            Ok(self.arena.clone_with_children(id, new_children))
        } else {
            Ok(id)
        }
    }

    /// Impact mode: an existing formula of the *same* group inside the user
    /// filter becomes the pivot of the swappable leaf, so the derived tree
    /// honors both the pre-existing selection and the hypothetical one.
    fn handle_facet_group(&mut self, id: NodeId) -> Result<Option<NodeId>> {
        if self.mode != GeneratorMode::Impact
            || self.inside_user_filter == 0
            || self.merged_existing_group
            || self.splice_relation == FacetRelationType::Exclusivity
        {
            return Ok(None);
        }
        let FormulaKind::FacetGroup(existing) = self.arena.kind(id) else {
            return Ok(None);
        };
        if existing.reference_name() != self.new_facet.reference_name()
            || existing.group_id() != self.new_facet.group_id()
        {
            return Ok(None);
        }
        let slot = MutableSlot::with_pivot(self.new_facet.clone(), existing.clone())?;
        let leaf = self.arena.mutable(slot);
        self.new_leaf = Some(leaf);
        self.merged_existing_group = true;
        Ok(Some(leaf))
    }

    /// Reacts to leaving the user-filter scope. Returns the replacement for
    /// the user filter node, or `None` when the edit had to be parked for the
    /// enclosing NOT scope.
    fn handle_user_filter(&mut self, id: NodeId, children: &[NodeId]) -> Option<NodeId> {
        let leaf = self.leaf();
        if self.inside_not > 0 {
            self.pending = Some(if self.splice_relation == FacetRelationType::Negation {
                PendingEdit::SubtractNegated { leaf }
            } else {
                PendingEdit::ExtendSuperset { leaf }
            });
            return None;
        }
        let altered = self.alter_children(leaf, children);
        Some(self.arena.clone_with_children(id, altered))
    }

    /// Combination policies: merges the new constraint into the user
    /// filter's children per the group's relation type, preserving the
    /// semantics of every constraint already matched.
    fn alter_children(
        &mut self,
        leaf: NodeId,
        children: &[NodeId],
    ) -> SmallVec<[NodeId; 4]> {
        match self.splice_relation {
            FacetRelationType::Conjunction => {
                match self.extend_first_match(leaf, children, /* disjunction: */ false) {
                    Some(extended) => extended,
                    None => {
                        // the user filter is an implicit AND, appending is
                        // conjunction enough
                        let mut extended: SmallVec<[NodeId; 4]> =
                            children.iter().copied().collect();
                        extended.push(leaf);
                        extended
                    }
                }
            }
            FacetRelationType::Disjunction => {
                match self.extend_first_match(leaf, children, /* disjunction: */ true) {
                    Some(extended) => extended,
                    None => {
                        // no OR container anywhere: synthesize one above the
                        // conjunction of the original children
                        let and = self.arena.and(children.iter().copied());
                        let or = self.arena.or([and, leaf]);
                        [or].into_iter().collect()
                    }
                }
            }
            FacetRelationType::Negation => {
                // with no other user constraint the baseline to subtract from
                // is the filter without the user part
                let baseline = if children.is_empty() {
                    self.base_without_user_filter
                } else {
                    self.arena.and(children.iter().copied())
                };
                let not = self.arena.not(leaf, baseline);
                [not].into_iter().collect()
            }
            FacetRelationType::Exclusivity => [leaf].into_iter().collect(),
        }
    }

    /// Inserts `leaf` as an extra operand of the first AND/OR (or the
    /// matching side of a combined facet formula) found among `children`,
    /// rebuilding only the path to the insertion point. `None` when no such
    /// container exists.
    fn extend_first_match(
        &mut self,
        leaf: NodeId,
        children: &[NodeId],
        disjunction: bool,
    ) -> Option<SmallVec<[NodeId; 4]>> {
        let mut result: SmallVec<[NodeId; 4]> = SmallVec::with_capacity(children.len());
        let mut changed = false;
        for &child in children {
            if changed {
                result.push(child);
                continue;
            }
            let mut done = false;
            let rewritten = rewrite(self.arena, child, &mut |arena, node| {
                if done {
                    return None;
                }
                let matches_plain = if disjunction {
                    matches!(arena.kind(node), FormulaKind::Or)
                } else {
                    matches!(arena.kind(node), FormulaKind::And)
                };
                let matches_combined = matches!(arena.kind(node), FormulaKind::CombinedFacet);
                if matches_plain {
                    done = true;
                    let mut operands: SmallVec<[NodeId; 4]> =
                        arena.children(node).iter().copied().collect();
                    operands.push(leaf);
                    Some(arena.clone_with_children(node, operands))
                } else if matches_combined {
                    done = true;
                    let and_part = arena.children(node)[0];
                    let or_part = arena.children(node)[1];
                    let replaced = if disjunction {
                        let extended = arena.or([or_part, leaf]);
                        arena.clone_with_children(node, [and_part, extended])
                    } else {
                        let extended = arena.and([and_part, leaf]);
                        arena.clone_with_children(node, [extended, or_part])
                    };
                    Some(replaced)
                } else {
                    None
                }
            });
            changed |= rewritten != child;
            result.push(rewritten);
        }
        changed.then_some(result)
    }

    /// Applies a parked edit while leaving the NOT scope that owns it.
    /// `children` are `[subtracted, superset]` of the NOT container.
    fn apply_pending(
        &mut self,
        pending: PendingEdit,
        not_id: NodeId,
        children: &[NodeId],
    ) -> Result<NodeId> {
        match pending {
            PendingEdit::SubtractNegated { leaf } => {
                let conjunction = self.arena.and([leaf, self.base_without_user_filter]);
                // Intentional evaluation during construction: whether the
                // negated branch survives at all is only decidable by
                // computing the conjunction eagerly. Deferring this check
                // would break the NOT-splice contract.
                if self.arena.compute(conjunction).is_empty() {
                    // no entity matches the negation of this facet
                    return Ok(self.arena.empty());
                }
                let superset = self.arena.not(conjunction, self.base_without_user_filter);
                Ok(self
                    .arena
                    .clone_with_children(not_id, [children[0], superset]))
            }
            PendingEdit::ExtendSuperset { leaf } => {
                let replaced_not = self.arena.clone_with_children(not_id, [children[0], leaf]);
                Ok(self.arena.and([children[1], replaced_not]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{generate_formula, GeneratorMode};
    use crate::bitmap::from_ids;
    use crate::facet::FacetRelationType;
    use crate::formula::{
        FacetCombinator, FacetGroupFormula, FormulaArena, FormulaKind, MutableReplacer, NodeId,
    };

    fn facet(
        group_id: Option<i32>,
        facet_id: u32,
        entity_ids: &[u32],
    ) -> FacetGroupFormula {
        FacetGroupFormula::new(
            "brand",
            group_id,
            FacetCombinator::AnyOf,
            facet_id,
            [&from_ids(entity_ids)],
        )
    }

    /// base = AND(CONST(all), USER_FILTER(existing...))
    fn base_with_user_filter(
        arena: &mut FormulaArena,
        all: &[u32],
        user_filter_children: Vec<NodeId>,
    ) -> (NodeId, NodeId) {
        let without_user_filter = arena.constant(from_ids(all));
        let user_filter = arena.user_filter(user_filter_children);
        let base = arena.and([without_user_filter, user_filter]);
        (base, without_user_filter)
    }

    #[test]
    fn test_conjunction_appends_to_implicit_and() {
        let mut arena = FormulaArena::new();
        let existing = facet(Some(1), 10, &[1, 2, 3]);
        let existing_node = arena.facet_group(existing);
        let (base, base_wo) =
            base_with_user_filter(&mut arena, &[1, 2, 3, 4, 5], vec![existing_node]);

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            base_wo,
            FacetRelationType::Conjunction,
            facet(Some(2), 20, &[2, 3, 4]),
        )
        .unwrap();
        assert_eq!(*arena.compute(generated.root), from_ids(&[2, 3]));
        assert!(!generated.merged_existing_group);
    }

    #[test]
    fn test_disjunction_extends_existing_or() {
        let mut arena = FormulaArena::new();
        let c = arena.facet_group(facet(Some(1), 30, &[5]));
        let other = arena.facet_group(facet(Some(2), 40, &[1, 2, 3, 4, 5]));
        let or = arena.or([c, other]);
        let (base, base_wo) = base_with_user_filter(&mut arena, &[1, 2, 3, 4, 5], vec![or]);

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            base_wo,
            FacetRelationType::Disjunction,
            facet(Some(1), 31, &[4]),
        )
        .unwrap();
        // the OR gained a third disjunct
        assert_eq!(
            *arena.compute(generated.root),
            from_ids(&[1, 2, 3, 4, 5])
        );
        // shape check: USER_FILTER(OR(.., .., leaf))
        let rendered = arena.display(generated.root).to_string();
        assert!(rendered.contains("OR("), "{rendered}");
        assert!(rendered.contains("MUTABLE"), "{rendered}");
    }

    #[test]
    fn test_disjunction_synthesizes_or_when_none_exists() {
        let mut arena = FormulaArena::new();
        let existing = arena.facet_group(facet(Some(1), 30, &[5]));
        let (base, base_wo) = base_with_user_filter(&mut arena, &[1, 2, 3, 4, 5], vec![existing]);

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            base_wo,
            FacetRelationType::Disjunction,
            facet(Some(2), 31, &[4]),
        )
        .unwrap();
        // OR(AND(existing), leaf) => {5} ∪ {4}, intersected with base
        assert_eq!(*arena.compute(generated.root), from_ids(&[4, 5]));
    }

    #[test]
    fn test_negation_subtracts_from_baseline() {
        let mut arena = FormulaArena::new();
        let existing = arena.facet_group(facet(Some(1), 30, &[1, 2, 3, 4]));
        let (base, base_wo) = base_with_user_filter(&mut arena, &[1, 2, 3, 4, 5], vec![existing]);

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            base_wo,
            FacetRelationType::Negation,
            facet(Some(2), 31, &[1, 2]),
        )
        .unwrap();
        // baseline {1,2,3,4} minus carriers {1,2}
        assert_eq!(*arena.compute(generated.root), from_ids(&[3, 4]));
    }

    #[test]
    fn test_negation_on_empty_user_filter_subtracts_from_base() {
        let mut arena = FormulaArena::new();
        let (base, base_wo) = base_with_user_filter(&mut arena, &[1, 2, 3, 4, 5], Vec::new());

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            base_wo,
            FacetRelationType::Negation,
            facet(Some(2), 31, &[1, 2]),
        )
        .unwrap();
        assert_eq!(*arena.compute(generated.root), from_ids(&[3, 4, 5]));
    }

    #[test]
    fn test_exclusivity_replaces_user_filter_contents() {
        let mut arena = FormulaArena::new();
        let existing = arena.facet_group(facet(Some(1), 30, &[5]));
        let (base, base_wo) = base_with_user_filter(&mut arena, &[1, 2, 3, 4, 5], vec![existing]);

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            base_wo,
            FacetRelationType::Exclusivity,
            facet(Some(1), 31, &[1, 2]),
        )
        .unwrap();
        assert_eq!(*arena.compute(generated.root), from_ids(&[1, 2]));
    }

    #[test]
    fn test_splice_descends_through_wrapper() {
        let mut arena = FormulaArena::new();
        // AND(CONST(all), WRAP(USER_FILTER(existing)))
        let existing = arena.facet_group(facet(Some(1), 30, &[1, 2, 3]));
        let user_filter = arena.user_filter([existing]);
        let wrapped = arena.wrapper(user_filter);
        let base_wo = arena.constant(from_ids(&[1, 2, 3, 4, 5]));
        let base = arena.and([base_wo, wrapped]);

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            base_wo,
            FacetRelationType::Conjunction,
            facet(Some(2), 31, &[2, 3, 4]),
        )
        .unwrap();
        assert_eq!(*arena.compute(generated.root), from_ids(&[2, 3]));
        // the pass-through marker survives the path copy
        let rendered = arena.display(generated.root).to_string();
        assert!(rendered.contains("WRAP("), "{rendered}");
        assert!(rendered.contains("MUTABLE"), "{rendered}");
    }

    #[test]
    fn test_no_user_filter_conjoins_with_base() {
        let mut arena = FormulaArena::new();
        let base = arena.constant(from_ids(&[1, 2, 3]));
        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            base,
            FacetRelationType::Conjunction,
            facet(Some(1), 10, &[2, 3, 4]),
        )
        .unwrap();
        assert_eq!(*arena.compute(generated.root), from_ids(&[2, 3]));
    }

    #[test]
    fn test_impact_merges_existing_group_as_pivot() {
        let mut arena = FormulaArena::new();
        let existing = arena.facet_group(facet(Some(1), 30, &[5]));
        let (base, base_wo) = base_with_user_filter(&mut arena, &[1, 2, 3, 4, 5], vec![existing]);

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Impact,
            base,
            base_wo,
            FacetRelationType::Disjunction,
            facet(Some(1), 31, &[4]),
        )
        .unwrap();
        assert!(generated.merged_existing_group);
        // the pivot keeps honoring facet 30 while the delegate adds 31
        assert_eq!(*arena.compute(generated.root), from_ids(&[4, 5]));

        let replacer = MutableReplacer::locate(&arena, generated.root)
            .unwrap()
            .expect("merged tree carries the mutable leaf");
        assert!(replacer.pivot(&arena).unwrap().is_some());
    }

    #[test]
    fn test_user_filter_inside_not_defers_to_scope_exit() {
        let mut arena = FormulaArena::new();
        // NOT(USER_FILTER(existing), superset)
        let existing = arena.facet_group(facet(Some(1), 30, &[1, 2]));
        let user_filter = arena.user_filter([existing]);
        let superset = arena.constant(from_ids(&[1, 2, 3, 4, 5]));
        let base = arena.not(user_filter, superset);
        let base_wo = superset;

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            base_wo,
            FacetRelationType::Conjunction,
            facet(Some(2), 31, &[3, 4]),
        )
        .unwrap();
        // superset side replaced by the facet leaf, then conjoined with the
        // original superset: ({3,4} \ {1,2}) ∩ {1..5}
        assert_eq!(*arena.compute(generated.root), from_ids(&[3, 4]));
        assert!(
            matches!(arena.kind(generated.root), FormulaKind::And),
            "{}",
            arena.display(generated.root)
        );
    }

    #[test]
    fn test_negated_facet_inside_not_collapses_when_empty() {
        let mut arena = FormulaArena::new();
        let existing = arena.facet_group(facet(Some(1), 30, &[1, 2]));
        let user_filter = arena.user_filter([existing]);
        let superset = arena.constant(from_ids(&[1, 2, 3]));
        let base = arena.not(user_filter, superset);

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            superset,
            FacetRelationType::Negation,
            // carriers disjoint from the base: the branch must collapse
            facet(Some(2), 31, &[100, 101]),
        )
        .unwrap();
        assert!(matches!(
            arena.kind(generated.root),
            FormulaKind::Empty
        ));
    }

    #[test]
    fn test_negated_facet_inside_not_subtracts_conjunction() {
        let mut arena = FormulaArena::new();
        let existing = arena.facet_group(facet(Some(1), 30, &[1, 2]));
        let user_filter = arena.user_filter([existing]);
        let superset = arena.constant(from_ids(&[1, 2, 3, 4]));
        let base = arena.not(user_filter, superset);

        let generated = generate_formula(
            &mut arena,
            GeneratorMode::Count,
            base,
            superset,
            FacetRelationType::Negation,
            facet(Some(2), 31, &[3]),
        )
        .unwrap();
        // subtracted: user filter {1,2}; superset becomes {1,2,3,4} \ ({3} ∩ {1,2,3,4})
        // = {1,2,4}; result = {1,2,4} \ {1,2} = {4}
        assert_eq!(*arena.compute(generated.root), from_ids(&[4]));
    }
}
