//! Memoizing facade over the count/impact formula generators.
//!
//! Derived trees for facets of the same relation type are structurally
//! identical except for the one swappable leaf, so the calculator derives
//! each distinct tree *shape* once, caches it under its [`CacheKey`] and
//! afterwards only exchanges the leaf's delegate. This turns O(facets) tree
//! derivations into O(distinct shapes) derivations plus O(facets) cheap
//! swaps.
//!
//! Not safe for concurrent use: the swap mutates the shared tree in place.
//! One calculator is constructed per query and never shared across requests.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use super::generator::{generate_formula, GeneratorMode};
use super::{FacetRelationType, ReferenceSchema, RelationLevel, RelationResolver};
use crate::bitmap::{union_all, Bitmap};
use crate::formula::{
    FacetCombinator, FacetGroupFormula, FormulaArena, FormulaKind, MutableReplacer, NodeId,
};
use crate::Result;

/// Effect of hypothetically selecting one more facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestImpact {
    /// Change of the result-set size, `hypothetical_count - base_count`.
    pub delta: i64,
    /// Result-set size with the facet selected in addition.
    pub hypothetical_count: u64,
    /// Whether offering the facet to the user makes sense: selecting it
    /// yields a non-empty result and actually changes something.
    pub requestable: bool,
}

/// Identity of a derived tree shape. Two facets are cache-compatible, in the
/// sense that the derived tree is identical modulo the swappable leaf, iff
/// they share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    /// Only set for impact trees that merged an existing group in place;
    /// such trees are reusable solely within that (reference, group).
    reference_name: Option<String>,
    relation: FacetRelationType,
    group_id: Option<i32>,
}

struct CachedTree {
    root: NodeId,
    replacer: MutableReplacer,
}

/// Per-query calculator of facet counts and selection impacts.
pub struct MemoizingFacetCalculator<'a> {
    arena: FormulaArena,
    base: NodeId,
    base_without_user_filter: NodeId,
    resolver: &'a dyn RelationResolver,
    cache: FxHashMap<CacheKey, CachedTree>,
    /// (reference, group) pairs whose formula already occurs inside the user
    /// filter of the base tree. Built on first use.
    user_filter_groups: Option<FxHashSet<(String, Option<i32>)>>,
    base_count: Option<u64>,
}

impl<'a> MemoizingFacetCalculator<'a> {
    /// Takes over the arena holding the planner-built base trees.
    ///
    /// `base` matches everything the current query returns;
    /// `base_without_user_filter` is the same filter stripped of the
    /// user-defined subtree.
    pub fn new(
        arena: FormulaArena,
        base: NodeId,
        base_without_user_filter: NodeId,
        resolver: &'a dyn RelationResolver,
    ) -> MemoizingFacetCalculator<'a> {
        MemoizingFacetCalculator {
            arena,
            base,
            base_without_user_filter,
            resolver,
            cache: FxHashMap::default(),
            user_filter_groups: None,
            base_count: None,
        }
    }

    /// Number of entities the unmodified query returns.
    pub fn base_count(&mut self) -> u64 {
        match self.base_count {
            Some(count) => count,
            None => {
                let count = self.arena.compute(self.base).len();
                self.base_count = Some(count);
                count
            }
        }
    }

    /// Evaluates a previously derived formula.
    pub fn compute(&mut self, root: NodeId) -> &Bitmap {
        self.arena.compute(root)
    }

    /// Derives (or reuses) the formula counting entities of the current
    /// result that carry `facet_id`. `sources` are the facet's entity
    /// bitmaps, one per contributing source index.
    pub fn count_formula(
        &mut self,
        reference: &ReferenceSchema,
        group_id: Option<i32>,
        facet_id: u32,
        sources: &[&Bitmap],
    ) -> Result<NodeId> {
        let relation = self.splice_relation(reference, group_id);
        let facet = self.new_facet_formula(reference, group_id, facet_id, sources);
        // the shape never depends on which facet or group is asked for, only
        // on the relation type
        let key = CacheKey {
            reference_name: None,
            relation,
            group_id: None,
        };
        self.cached_or_generate(key, GeneratorMode::Count, relation, facet)
    }

    /// Formula counting entities of the current result that carry *any*
    /// facet of a group; `sources` are the entity bitmaps of all its facets.
    pub fn group_count_formula<'b>(
        &mut self,
        sources: impl IntoIterator<Item = &'b Bitmap>,
    ) -> NodeId {
        let union = self.arena.constant(union_all(sources));
        self.arena.and([self.base, union])
    }

    /// Computes the [`RequestImpact`] of additionally selecting `facet_id`.
    pub fn impact(
        &mut self,
        reference: &ReferenceSchema,
        group_id: Option<i32>,
        facet_id: u32,
        sources: &[&Bitmap],
    ) -> Result<RequestImpact> {
        let relation = self.splice_relation(reference, group_id);
        let facet = self.new_facet_formula(reference, group_id, facet_id, sources);
        let merges_existing = relation != FacetRelationType::Exclusivity
            && self
                .user_filter_groups()
                .contains(&(reference.name().to_string(), group_id));
        // an in-place merge embeds the pre-existing group selection as the
        // pivot, so the tree is only valid for this very group
        let key = if merges_existing {
            CacheKey {
                reference_name: Some(reference.name().to_string()),
                relation,
                group_id,
            }
        } else {
            CacheKey {
                reference_name: None,
                relation,
                group_id: None,
            }
        };
        let root = self.cached_or_generate(key.clone(), GeneratorMode::Impact, relation, facet)?;
        let hypothetical_count = self.arena.compute(root).len();
        let base_count = self.base_count();
        let delta = hypothetical_count as i64 - base_count as i64;
        let has_sense_alone = hypothetical_count > 0 && self.alone_count(&key, root)? > 0;
        Ok(RequestImpact {
            delta,
            hypothetical_count,
            requestable: hypothetical_count > 0 && (delta != 0 || has_sense_alone),
        })
    }

    fn splice_relation(
        &self,
        reference: &ReferenceSchema,
        group_id: Option<i32>,
    ) -> FacetRelationType {
        self.resolver
            .relation_type(reference, group_id, RelationLevel::WithDifferentGroups)
    }

    fn new_facet_formula(
        &self,
        reference: &ReferenceSchema,
        group_id: Option<i32>,
        facet_id: u32,
        sources: &[&Bitmap],
    ) -> FacetGroupFormula {
        let combinator = match self.resolver.relation_type(
            reference,
            group_id,
            RelationLevel::WithDifferentFacetsInGroup,
        ) {
            FacetRelationType::Conjunction => FacetCombinator::AllOf,
            _ => FacetCombinator::AnyOf,
        };
        FacetGroupFormula::new(
            reference.name(),
            group_id,
            combinator,
            facet_id,
            sources.iter().copied(),
        )
    }

    fn cached_or_generate(
        &mut self,
        key: CacheKey,
        mode: GeneratorMode,
        relation: FacetRelationType,
        facet: FacetGroupFormula,
    ) -> Result<NodeId> {
        if let Some(cached) = self.cache.get(&key) {
            cached.replacer.swap_delegate(&mut self.arena, facet)?;
            return Ok(cached.root);
        }
        let generated = generate_formula(
            &mut self.arena,
            mode,
            self.base,
            self.base_without_user_filter,
            relation,
            facet,
        )?;
        // a collapsed negation branch may have dropped the swappable leaf;
        // such a tree answers only this one facet and must not be cached
        if let Some(replacer) = MutableReplacer::locate(&self.arena, generated.root)? {
            self.cache.insert(
                key,
                CachedTree {
                    root: generated.root,
                    replacer,
                },
            );
        }
        Ok(generated.root)
    }

    /// Result size as if the delegate facet were the only one selected in
    /// its group: evaluates with the pivot contribution suppressed.
    fn alone_count(&mut self, key: &CacheKey, root: NodeId) -> Result<u64> {
        let Some(cached) = self.cache.get(key) else {
            // no reusable tree means no pivot either
            return Ok(self.arena.compute(root).len());
        };
        if cached.replacer.pivot(&self.arena)?.is_none() {
            return Ok(self.arena.compute(root).len());
        }
        cached.replacer.suppress_pivot(&mut self.arena, true)?;
        let alone = self.arena.compute(root).len();
        self.cache
            .get(key)
            .expect("entry checked above")
            .replacer
            .suppress_pivot(&mut self.arena, false)?;
        Ok(alone)
    }

    fn user_filter_groups(&mut self) -> &FxHashSet<(String, Option<i32>)> {
        if self.user_filter_groups.is_none() {
            let mut groups = FxHashSet::default();
            collect_user_filter_groups(&self.arena, self.base, false, &mut groups);
            self.user_filter_groups = Some(groups);
        }
        self.user_filter_groups
            .as_ref()
            .expect("filled right above")
    }
}

fn collect_user_filter_groups(
    arena: &FormulaArena,
    id: NodeId,
    inside_user_filter: bool,
    groups: &mut FxHashSet<(String, Option<i32>)>,
) {
    let inside = inside_user_filter || matches!(arena.kind(id), FormulaKind::UserFilter);
    if inside {
        if let FormulaKind::FacetGroup(facet) = arena.kind(id) {
            groups.insert((facet.reference_name().to_string(), facet.group_id()));
        }
    }
    for &child in arena.children(id) {
        collect_user_filter_groups(arena, child, inside, groups);
    }
}
