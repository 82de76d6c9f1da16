//! Boolean formula algebra over entity-id bitmaps.
//!
//! A query filter is a tree of composable set operations ("formulas"). The
//! tree is evaluated lazily through [`FormulaArena::compute`] and every node
//! memoizes its result, so repeated evaluation of a shared subtree is free.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. The arena owns all
//! nodes for the lifetime of one query and never frees them, which makes
//! structural sharing trivial: a rewritten tree reuses the `NodeId`s of every
//! unchanged subtree verbatim (path copy on write, see [`cloner`]). Node
//! identity *is* the arena index, so "did this child change" checks are plain
//! integer comparisons.

mod cloner;
mod facet;
mod mutable;

use std::fmt;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use smallvec::SmallVec;

pub use self::cloner::rewrite;
pub use self::facet::{FacetCombinator, FacetGroupFormula};
pub use self::mutable::{MutableReplacer, MutableSlot};
use crate::bitmap::{intersect_all, union_all, Bitmap};

/// Index of a formula node inside its [`FormulaArena`].
pub type NodeId = u32;

type Children = SmallVec<[NodeId; 4]>;

/// The operation a formula node performs on its children.
#[derive(Debug, Clone)]
pub enum FormulaKind {
    /// Matches nothing.
    Empty,
    /// Matches exactly the wrapped bitmap.
    Constant(Bitmap),
    /// Intersection of all children.
    And,
    /// Union of all children.
    Or,
    /// Children are `[subtracted, superset]`; matches `superset \ subtracted`.
    Not,
    /// Container for the user-defined part of the filter. Semantically an
    /// implicit AND; structurally the boundary at which facet constraints are
    /// spliced in.
    UserFilter,
    /// Leaf selecting entities by the facets of one facet group.
    FacetGroup(FacetGroupFormula),
    /// Children are `[and_part, or_part]`, combined by intersection. Keeps
    /// conjunctive and disjunctive facet relations of one user filter side by
    /// side so either side can be extended independently.
    CombinedFacet,
    /// Transparent pass-through around a single child, computing exactly the
    /// child's result. Planning layers wrap a subtree to mark it (cache
    /// boundary, deferred source) without changing what it matches; every
    /// walk over the tree descends through it like any other composite.
    Wrapper,
    /// Swappable indirection leaf, see [`mutable`].
    Mutable(MutableSlot),
}

impl FormulaKind {
    fn tag(&self) -> u8 {
        match self {
            FormulaKind::Empty => 0,
            FormulaKind::Constant(_) => 1,
            FormulaKind::And => 2,
            FormulaKind::Or => 3,
            FormulaKind::Not => 4,
            FormulaKind::UserFilter => 5,
            FormulaKind::FacetGroup(_) => 6,
            FormulaKind::CombinedFacet => 7,
            FormulaKind::Mutable(_) => 8,
            FormulaKind::Wrapper => 9,
        }
    }
}

struct FormulaNode {
    kind: FormulaKind,
    children: Children,
    /// Memoized evaluation result. Cleared explicitly; callers invalidating a
    /// subtree must propagate themselves (the replacer does, along its path).
    memo: Option<Bitmap>,
    /// Stable hash over kind + children identities, usable as a cache key.
    hash: u64,
    /// Rough cost estimate for planning layers.
    cost: u64,
}

/// Owner of all formula nodes of one query.
///
/// One arena per query: the memoization and the mutable-slot optimization are
/// deliberately not thread-safe (see [`MutableReplacer`]).
#[derive(Default)]
pub struct FormulaArena {
    nodes: Vec<FormulaNode>,
}

impl FormulaArena {
    pub fn new() -> FormulaArena {
        FormulaArena::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, id: NodeId) -> &FormulaNode {
        &self.nodes[id as usize]
    }

    fn alloc(&mut self, kind: FormulaKind, children: Children) -> NodeId {
        let hash = self.hash_node(&kind, &children);
        let cost = self.cost_node(&kind, &children);
        let id = self.nodes.len() as NodeId;
        self.nodes.push(FormulaNode {
            kind,
            children,
            memo: None,
            hash,
            cost,
        });
        id
    }

    fn hash_node(&self, kind: &FormulaKind, children: &[NodeId]) -> u64 {
        let mut hasher = FxHasher::default();
        kind.tag().hash(&mut hasher);
        match kind {
            FormulaKind::Constant(bitmap) => {
                bitmap.len().hash(&mut hasher);
                bitmap.min().hash(&mut hasher);
                bitmap.max().hash(&mut hasher);
            }
            FormulaKind::FacetGroup(facet) => facet.hash_identity(&mut hasher),
            FormulaKind::Mutable(slot) => slot.hash_identity(&mut hasher),
            _ => {}
        }
        for &child in children {
            self.node(child).hash.hash(&mut hasher);
        }
        hasher.finish()
    }

    fn cost_node(&self, kind: &FormulaKind, children: &[NodeId]) -> u64 {
        let children_cost: u64 = children.iter().map(|&c| self.node(c).cost).sum();
        let own = match kind {
            FormulaKind::Empty => 0,
            FormulaKind::Constant(bitmap) => bitmap.len(),
            FormulaKind::FacetGroup(facet) => facet.estimated_cardinality(),
            FormulaKind::Mutable(slot) => slot.estimated_cardinality(),
            FormulaKind::Wrapper => 0,
            // set operations pay roughly once per input id
            _ => children_cost,
        };
        children_cost + own
    }

    // -- node constructors ---------------------------------------------------
    //
    // `and`/`or` normalize the trivial shapes: no children collapse to the
    // empty formula, a single child passes through unwrapped.

    pub fn empty(&mut self) -> NodeId {
        self.alloc(FormulaKind::Empty, Children::new())
    }

    pub fn constant(&mut self, bitmap: Bitmap) -> NodeId {
        if bitmap.is_empty() {
            return self.empty();
        }
        self.alloc(FormulaKind::Constant(bitmap), Children::new())
    }

    pub fn and(&mut self, children: impl IntoIterator<Item = NodeId>) -> NodeId {
        let mut children: Children = children.into_iter().collect();
        match children.len() {
            0 => self.empty(),
            1 => children.pop().expect("one child"),
            _ => self.alloc(FormulaKind::And, children),
        }
    }

    pub fn or(&mut self, children: impl IntoIterator<Item = NodeId>) -> NodeId {
        let mut children: Children = children.into_iter().collect();
        match children.len() {
            0 => self.empty(),
            1 => children.pop().expect("one child"),
            _ => self.alloc(FormulaKind::Or, children),
        }
    }

    pub fn not(&mut self, subtracted: NodeId, superset: NodeId) -> NodeId {
        self.alloc(FormulaKind::Not, [subtracted, superset].into_iter().collect())
    }

    pub fn user_filter(&mut self, children: impl IntoIterator<Item = NodeId>) -> NodeId {
        self.alloc(FormulaKind::UserFilter, children.into_iter().collect())
    }

    pub fn facet_group(&mut self, formula: FacetGroupFormula) -> NodeId {
        self.alloc(FormulaKind::FacetGroup(formula), Children::new())
    }

    pub fn combined_facet(&mut self, and_part: NodeId, or_part: NodeId) -> NodeId {
        self.alloc(
            FormulaKind::CombinedFacet,
            [and_part, or_part].into_iter().collect(),
        )
    }

    pub fn mutable(&mut self, slot: MutableSlot) -> NodeId {
        self.alloc(FormulaKind::Mutable(slot), Children::new())
    }

    pub fn wrapper(&mut self, child: NodeId) -> NodeId {
        self.alloc(FormulaKind::Wrapper, [child].into_iter().collect())
    }

    /// Allocates a copy of `id` with the same kind but different children.
    /// The building block of every guarded rewrite.
    pub fn clone_with_children(
        &mut self,
        id: NodeId,
        children: impl IntoIterator<Item = NodeId>,
    ) -> NodeId {
        let kind = self.node(id).kind.clone();
        self.alloc(kind, children.into_iter().collect())
    }

    // -- accessors -----------------------------------------------------------

    pub fn kind(&self, id: NodeId) -> &FormulaKind {
        &self.node(id).kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    /// Structural hash usable for "is this the same computation" checks.
    ///
    /// Stable for the immutable kinds; a [`FormulaKind::Mutable`] node is
    /// rehashed on every delegate swap while its ancestors keep their
    /// construction-time hash (the tree *shape* they identify is unchanged).
    pub fn structural_hash(&self, id: NodeId) -> u64 {
        self.node(id).hash
    }

    pub fn estimated_cost(&self, id: NodeId) -> u64 {
        self.node(id).cost
    }

    pub(crate) fn refresh_identity(&mut self, id: NodeId) {
        let node = self.node(id);
        let hash = self.hash_node(&node.kind, &node.children);
        let cost = self.cost_node(&node.kind, &node.children);
        let node = &mut self.nodes[id as usize];
        node.hash = hash;
        node.cost = cost;
    }

    pub(crate) fn kind_mut(&mut self, id: NodeId) -> &mut FormulaKind {
        &mut self.nodes[id as usize].kind
    }

    /// Clears the memoized result of this node only.
    pub fn clear_memo(&mut self, id: NodeId) {
        self.nodes[id as usize].memo = None;
    }

    // -- evaluation ----------------------------------------------------------

    /// Evaluates the formula rooted at `id` into its entity-id bitmap.
    ///
    /// Recursive descent with memoization: evaluating an unmutated node twice
    /// returns a bit-identical result without recomputation. Referentially
    /// transparent for every kind except [`FormulaKind::Mutable`], whose
    /// result changes when its slot is swapped (and whose memo is invalidated
    /// by the [`MutableReplacer`] when that happens).
    pub fn compute(&mut self, id: NodeId) -> &Bitmap {
        self.materialize(id);
        self.nodes[id as usize]
            .memo
            .as_ref()
            .expect("memo is set by materialize")
    }

    /// A childless user filter places no constraint at all, wrapped or not.
    fn is_neutral(&self, id: NodeId) -> bool {
        match &self.node(id).kind {
            FormulaKind::UserFilter => self.node(id).children.is_empty(),
            FormulaKind::Wrapper => self.is_neutral(self.node(id).children[0]),
            _ => false,
        }
    }

    fn materialize(&mut self, id: NodeId) {
        if self.node(id).memo.is_some() {
            return;
        }
        let children: Children = self.node(id).children.clone();
        for &child in &children {
            self.materialize(child);
        }
        fn child_memo(arena: &FormulaArena, child: NodeId) -> &Bitmap {
            arena
                .node(child)
                .memo
                .as_ref()
                .expect("children materialized above")
        }
        let result = match &self.node(id).kind {
            FormulaKind::Empty => Bitmap::new(),
            FormulaKind::Constant(bitmap) => bitmap.clone(),
            FormulaKind::And | FormulaKind::UserFilter | FormulaKind::CombinedFacet => {
                // a user filter holding no user constraint restricts nothing
                // and must not annihilate the surrounding conjunction
                intersect_all(
                    children
                        .iter()
                        .filter(|&&c| !self.is_neutral(c))
                        .map(|&c| child_memo(self, c)),
                )
            }
            FormulaKind::Or => union_all(children.iter().map(|&c| child_memo(self, c))),
            FormulaKind::Not => {
                child_memo(self, children[1]) - child_memo(self, children[0])
            }
            FormulaKind::FacetGroup(facet) => facet.compute(),
            FormulaKind::Mutable(slot) => slot.compute(),
            FormulaKind::Wrapper => child_memo(self, children[0]).clone(),
        };
        self.nodes[id as usize].memo = Some(result);
    }

    /// Renders the tree rooted at `id` for diagnostics.
    pub fn display(&self, id: NodeId) -> DisplayFormula<'_> {
        DisplayFormula { arena: self, id }
    }
}

/// One-line rendering of a formula tree, used in invariant-violation logs.
pub struct DisplayFormula<'a> {
    arena: &'a FormulaArena,
    id: NodeId,
}

impl fmt::Display for DisplayFormula<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.arena.node(self.id);
        match &node.kind {
            FormulaKind::Empty => write!(f, "EMPTY"),
            FormulaKind::Constant(bitmap) => write!(f, "CONST[{}]", bitmap.len()),
            FormulaKind::FacetGroup(facet) => write!(f, "[{facet}]"),
            FormulaKind::Mutable(slot) => write!(f, "MUTABLE[{slot}]"),
            composite => {
                let name = match composite {
                    FormulaKind::And => "AND",
                    FormulaKind::Or => "OR",
                    FormulaKind::Not => "NOT",
                    FormulaKind::UserFilter => "USER_FILTER",
                    FormulaKind::CombinedFacet => "COMBINED",
                    FormulaKind::Wrapper => "WRAP",
                    _ => unreachable!("leaves handled above"),
                };
                write!(f, "{name}(")?;
                for (i, &child) in node.children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", self.arena.display(child))?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FacetCombinator, FacetGroupFormula, FormulaArena};
    use crate::bitmap::from_ids;

    #[test]
    fn test_compute_basic_algebra() {
        let mut arena = FormulaArena::new();
        let a = arena.constant(from_ids(&[1, 2, 3, 4]));
        let b = arena.constant(from_ids(&[3, 4, 5]));
        let and = arena.and([a, b]);
        let or = arena.or([a, b]);
        let not = arena.not(b, a);
        assert_eq!(*arena.compute(and), from_ids(&[3, 4]));
        assert_eq!(*arena.compute(or), from_ids(&[1, 2, 3, 4, 5]));
        assert_eq!(*arena.compute(not), from_ids(&[1, 2]));
    }

    #[test]
    fn test_compute_is_idempotent() {
        let mut arena = FormulaArena::new();
        let a = arena.constant(from_ids(&[1, 2, 3]));
        let b = arena.constant(from_ids(&[2, 3]));
        let and = arena.and([a, b]);
        let first = arena.compute(and).clone();
        let second = arena.compute(and).clone();
        assert_eq!(first, second);
    }

    #[test]
    fn test_normalization_of_trivial_shapes() {
        let mut arena = FormulaArena::new();
        let a = arena.constant(from_ids(&[1]));
        assert_eq!(arena.and([a]), a);
        assert_eq!(arena.or([a]), a);
        let empty = arena.and([]);
        assert!(arena.compute(empty).is_empty());
    }

    #[test]
    fn test_structural_hash_distinguishes_shape() {
        let mut arena = FormulaArena::new();
        let a = arena.constant(from_ids(&[1, 2]));
        let b = arena.constant(from_ids(&[3, 4, 5]));
        let and_ab = arena.and([a, b]);
        let and_ab_again = arena.and([a, b]);
        let or_ab = arena.or([a, b]);
        assert_eq!(
            arena.structural_hash(and_ab),
            arena.structural_hash(and_ab_again)
        );
        assert_ne!(arena.structural_hash(and_ab), arena.structural_hash(or_ab));
    }

    #[test]
    fn test_combined_facet_intersects_both_sides() {
        let mut arena = FormulaArena::new();
        let and_side = arena.constant(from_ids(&[1, 2, 3]));
        let or_side = arena.constant(from_ids(&[2, 3, 4]));
        let combined = arena.combined_facet(and_side, or_side);
        assert_eq!(*arena.compute(combined), from_ids(&[2, 3]));
    }

    #[test]
    fn test_empty_user_filter_restricts_nothing() {
        let mut arena = FormulaArena::new();
        let base = arena.constant(from_ids(&[1, 2, 3]));
        let user_filter = arena.user_filter([]);
        let root = arena.and([base, user_filter]);
        assert_eq!(*arena.compute(root), from_ids(&[1, 2, 3]));
    }

    #[test]
    fn test_wrapper_is_transparent() {
        let mut arena = FormulaArena::new();
        let a = arena.constant(from_ids(&[1, 2, 3]));
        let b = arena.constant(from_ids(&[2, 3, 4]));
        let and = arena.and([a, b]);
        let wrapped = arena.wrapper(and);
        assert_eq!(*arena.compute(wrapped), from_ids(&[2, 3]));
        // a wrapped empty user filter still restricts nothing
        let user_filter = arena.user_filter([]);
        let marked = arena.wrapper(user_filter);
        let root = arena.and([a, marked]);
        assert_eq!(*arena.compute(root), from_ids(&[1, 2, 3]));
    }

    #[test]
    fn test_user_filter_is_implicit_and() {
        let mut arena = FormulaArena::new();
        let facet = arena.facet_group(FacetGroupFormula::new(
            "brand",
            Some(1),
            FacetCombinator::AnyOf,
            10,
            [&from_ids(&[1, 2, 5])],
        ));
        let base = arena.constant(from_ids(&[1, 2, 3]));
        let user_filter = arena.user_filter([base, facet]);
        assert_eq!(*arena.compute(user_filter), from_ids(&[1, 2]));
    }
}
