//! Facet-group leaf of the formula algebra.
//!
//! A [`FacetGroupFormula`] represents "entities that carry any/all of a set
//! of facet ids belonging to group `G` of reference `R`". It keeps one entity
//! bitmap per facet id so that the conjunctive variant can intersect across
//! facets while contributions of multiple source indexes to the *same* facet
//! still union together.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::bitmap::{intersect_all, union_all, Bitmap};
use crate::{FaceteerError, Result};

/// How the per-facet entity bitmaps of one group formula combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacetCombinator {
    /// An entity matches when it carries at least one of the facets (OR).
    AnyOf,
    /// An entity matches only when it carries all of the facets (AND).
    AllOf,
}

#[derive(Debug, Clone, PartialEq)]
struct FacetEntry {
    facet_id: u32,
    entity_ids: Bitmap,
}

/// Leaf formula matching entities by the facets of a single facet group.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetGroupFormula {
    reference_name: String,
    group_id: Option<i32>,
    combinator: FacetCombinator,
    /// Sorted by facet id, one entry per distinct facet.
    entries: Vec<FacetEntry>,
}

impl FacetGroupFormula {
    /// Creates a group formula for a single facet.
    ///
    /// `sources` are the entity bitmaps of the facet taken from each
    /// contributing source index; they always union together, regardless of
    /// the combinator (the combinator only governs relations *between*
    /// facets).
    pub fn new<'a>(
        reference_name: impl Into<String>,
        group_id: Option<i32>,
        combinator: FacetCombinator,
        facet_id: u32,
        sources: impl IntoIterator<Item = &'a Bitmap>,
    ) -> FacetGroupFormula {
        FacetGroupFormula {
            reference_name: reference_name.into(),
            group_id,
            combinator,
            entries: vec![FacetEntry {
                facet_id,
                entity_ids: union_all(sources),
            }],
        }
    }

    pub fn reference_name(&self) -> &str {
        &self.reference_name
    }

    pub fn group_id(&self) -> Option<i32> {
        self.group_id
    }

    pub fn combinator(&self) -> FacetCombinator {
        self.combinator
    }

    /// Ids of all facets this formula selects by.
    pub fn facet_ids(&self) -> Bitmap {
        self.entries.iter().map(|entry| entry.facet_id).collect()
    }

    /// Returns true when the two formulas describe the same
    /// (reference, group, combinator) and may therefore be merged.
    pub fn is_mergeable_with(&self, other: &FacetGroupFormula) -> bool {
        self.reference_name == other.reference_name
            && self.group_id == other.group_id
            && self.combinator == other.combinator
    }

    /// Combines two group formulas of the same (reference, group) by unioning
    /// their facet ids and the entity bitmaps of facets present in both.
    pub fn merge_with(&self, other: &FacetGroupFormula) -> Result<FacetGroupFormula> {
        if !self.is_mergeable_with(other) {
            return Err(FaceteerError::InternalError(format!(
                "cannot merge facet group formulas of different identity: {self} vs {other}"
            )));
        }
        let mut entries = self.entries.clone();
        for entry in &other.entries {
            match entries.binary_search_by_key(&entry.facet_id, |e| e.facet_id) {
                Ok(pos) => entries[pos].entity_ids |= &entry.entity_ids,
                Err(pos) => entries.insert(pos, entry.clone()),
            }
        }
        Ok(FacetGroupFormula {
            reference_name: self.reference_name.clone(),
            group_id: self.group_id,
            combinator: self.combinator,
            entries,
        })
    }

    /// Evaluates the leaf into the set of matching entity ids.
    pub fn compute(&self) -> Bitmap {
        let bitmaps = self.entries.iter().map(|entry| &entry.entity_ids);
        match self.combinator {
            FacetCombinator::AnyOf => union_all(bitmaps),
            FacetCombinator::AllOf => intersect_all(bitmaps),
        }
    }

    /// Feeds the identity of this leaf into a structural hash.
    ///
    /// Entity bitmaps are folded in through their cardinality and bounds;
    /// this is an identity approximation that is stable for the read-only
    /// source bitmaps handed over by the index layer.
    pub(crate) fn hash_identity<H: Hasher>(&self, state: &mut H) {
        self.reference_name.hash(state);
        self.group_id.hash(state);
        self.combinator.hash(state);
        for entry in &self.entries {
            entry.facet_id.hash(state);
            entry.entity_ids.len().hash(state);
            entry.entity_ids.min().hash(state);
            entry.entity_ids.max().hash(state);
        }
    }

    /// Upper-bound estimate of the result cardinality, used for costing.
    pub(crate) fn estimated_cardinality(&self) -> u64 {
        match self.combinator {
            FacetCombinator::AnyOf => self.entries.iter().map(|e| e.entity_ids.len()).sum(),
            FacetCombinator::AllOf => self
                .entries
                .iter()
                .map(|e| e.entity_ids.len())
                .min()
                .unwrap_or(0),
        }
    }
}

impl fmt::Display for FacetGroupFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.combinator {
            FacetCombinator::AnyOf => "ANY",
            FacetCombinator::AllOf => "ALL",
        };
        write!(
            f,
            "FACET {} {}/{:?} {:?}",
            op,
            self.reference_name,
            self.group_id,
            self.entries.iter().map(|e| e.facet_id).collect::<Vec<_>>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{FacetCombinator, FacetGroupFormula};
    use crate::bitmap::from_ids;

    #[test]
    fn test_multiple_sources_union_regardless_of_combinator() {
        let a = from_ids(&[1, 2]);
        let b = from_ids(&[2, 3]);
        let formula =
            FacetGroupFormula::new("brand", Some(1), FacetCombinator::AllOf, 10, [&a, &b]);
        assert_eq!(formula.compute(), from_ids(&[1, 2, 3]));
    }

    #[test]
    fn test_merge_is_commutative_on_entity_ids() {
        let a = FacetGroupFormula::new(
            "brand",
            Some(1),
            FacetCombinator::AnyOf,
            10,
            [&from_ids(&[1, 2])],
        );
        let b = FacetGroupFormula::new(
            "brand",
            Some(1),
            FacetCombinator::AnyOf,
            11,
            [&from_ids(&[3])],
        );
        let ab = a.merge_with(&b).unwrap();
        let ba = b.merge_with(&a).unwrap();
        assert_eq!(ab.compute(), ba.compute());
        assert_eq!(ab.facet_ids(), from_ids(&[10, 11]));
    }

    #[test]
    fn test_merge_intersects_across_facets_for_all_of() {
        let a = FacetGroupFormula::new(
            "brand",
            Some(1),
            FacetCombinator::AllOf,
            10,
            [&from_ids(&[1, 2, 3])],
        );
        let b = FacetGroupFormula::new(
            "brand",
            Some(1),
            FacetCombinator::AllOf,
            11,
            [&from_ids(&[2, 3, 4])],
        );
        assert_eq!(a.merge_with(&b).unwrap().compute(), from_ids(&[2, 3]));
    }

    #[test]
    fn test_merge_rejects_different_groups() {
        let a = FacetGroupFormula::new(
            "brand",
            Some(1),
            FacetCombinator::AnyOf,
            10,
            [&from_ids(&[1])],
        );
        let b = FacetGroupFormula::new(
            "brand",
            Some(2),
            FacetCombinator::AnyOf,
            11,
            [&from_ids(&[2])],
        );
        assert!(a.merge_with(&b).is_err());
    }

    #[test]
    fn test_merge_unions_same_facet_from_two_sources() {
        let a = FacetGroupFormula::new(
            "brand",
            Some(1),
            FacetCombinator::AnyOf,
            10,
            [&from_ids(&[1])],
        );
        let b = FacetGroupFormula::new(
            "brand",
            Some(1),
            FacetCombinator::AnyOf,
            10,
            [&from_ids(&[5])],
        );
        let merged = a.merge_with(&b).unwrap();
        assert_eq!(merged.facet_ids(), from_ids(&[10]));
        assert_eq!(merged.compute(), from_ids(&[1, 5]));
    }
}
