//! Facet summary and impact statistics built on top of the formula algebra.
//!
//! The submodules follow the processing order of one request: the read-only
//! facet [`index`] views are handed in by the storage layer, the generator
//! splices one facet constraint into the base filter tree, the
//! [`calculator`] memoizes and swaps the derived trees across thousands of
//! facets, and the [`summary`] producer aggregates, sorts and fetches the
//! final statistics.

pub mod calculator;
pub(crate) mod generator;
pub mod index;
pub mod summary;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;

/// How a facet constraint of a given group combines with the rest of the
/// filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacetRelationType {
    /// The facet further restricts the result (AND).
    Conjunction,
    /// The facet widens the result (OR).
    Disjunction,
    /// The facet subtracts from the result (NOT).
    Negation,
    /// At most one facet of the group may be active at a time; a new facet
    /// replaces the previous selection.
    Exclusivity,
}

/// The scope a relation-type lookup applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationLevel {
    /// How facets of the *same* group combine with each other.
    WithDifferentFacetsInGroup,
    /// How the group's constraint combines with other groups and the rest of
    /// the user filter.
    WithDifferentGroups,
}

/// Configuration lookup resolving the relation type per (reference, group).
///
/// Opaque to this crate; the query configuration layer supplies it.
pub trait RelationResolver {
    fn relation_type(
        &self,
        reference: &ReferenceSchema,
        group_id: Option<i32>,
        level: RelationLevel,
    ) -> FacetRelationType;
}

/// [`RelationResolver`] backed by explicit per-group settings.
///
/// Unconfigured groups use the conventional defaults: facets of the same
/// group combine with OR, a group combines with other groups with AND.
#[derive(Debug, Default)]
pub struct StaticRelationResolver {
    group_relations: FxHashMap<(String, Option<i32>), FacetRelationType>,
    facet_relations: FxHashMap<(String, Option<i32>), FacetRelationType>,
}

impl StaticRelationResolver {
    pub fn new() -> StaticRelationResolver {
        StaticRelationResolver::default()
    }

    /// Sets how `group_id` of `reference_name` relates to other groups.
    pub fn with_group_relation(
        mut self,
        reference_name: impl Into<String>,
        group_id: Option<i32>,
        relation: FacetRelationType,
    ) -> StaticRelationResolver {
        self.group_relations
            .insert((reference_name.into(), group_id), relation);
        self
    }

    /// Sets how facets inside `group_id` of `reference_name` relate to each
    /// other.
    pub fn with_facet_relation(
        mut self,
        reference_name: impl Into<String>,
        group_id: Option<i32>,
        relation: FacetRelationType,
    ) -> StaticRelationResolver {
        self.facet_relations
            .insert((reference_name.into(), group_id), relation);
        self
    }
}

impl RelationResolver for StaticRelationResolver {
    fn relation_type(
        &self,
        reference: &ReferenceSchema,
        group_id: Option<i32>,
        level: RelationLevel,
    ) -> FacetRelationType {
        let key = (reference.name().to_string(), group_id);
        match level {
            RelationLevel::WithDifferentFacetsInGroup => self
                .facet_relations
                .get(&key)
                .copied()
                .unwrap_or(FacetRelationType::Disjunction),
            RelationLevel::WithDifferentGroups => self
                .group_relations
                .get(&key)
                .copied()
                .unwrap_or(FacetRelationType::Conjunction),
        }
    }
}

/// Narrow view of a reference schema: the part of the schema model the facet
/// engine needs to resolve entity types and fetch behavior.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceSchema {
    name: String,
    referenced_entity_type: String,
    entity_type_managed: bool,
    referenced_group_type: Option<String>,
    group_type_managed: bool,
}

impl ReferenceSchema {
    pub fn new(
        name: impl Into<String>,
        referenced_entity_type: impl Into<String>,
        entity_type_managed: bool,
        referenced_group_type: Option<String>,
        group_type_managed: bool,
    ) -> ReferenceSchema {
        ReferenceSchema {
            name: name.into(),
            referenced_entity_type: referenced_entity_type.into(),
            entity_type_managed,
            referenced_group_type,
            group_type_managed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn referenced_entity_type(&self) -> &str {
        &self.referenced_entity_type
    }

    pub fn is_entity_type_managed(&self) -> bool {
        self.entity_type_managed
    }

    pub fn referenced_group_type(&self) -> Option<&str> {
        self.referenced_group_type.as_deref()
    }

    pub fn is_group_type_managed(&self) -> bool {
        self.group_type_managed
    }
}

/// Identification of an entity: its type and primary key. Fetchers may attach
/// richer bodies elsewhere; this crate only ever needs the classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityClassifier {
    pub entity_type: String,
    pub primary_key: u32,
}

impl EntityClassifier {
    pub fn new(entity_type: impl Into<String>, primary_key: u32) -> EntityClassifier {
        EntityClassifier {
            entity_type: entity_type.into(),
            primary_key,
        }
    }
}

/// Fetches entity bodies for the final summary. Falls back to bare
/// [`EntityClassifier`] references when the caller supplies none.
pub type EntityFetcher<'a> = Box<dyn Fn(&str, &[u32]) -> Vec<EntityClassifier> + 'a>;

/// Orders a set of entity ids for presentation.
pub trait Sorter {
    fn sort(&self, ids: &Bitmap) -> Vec<u32>;
}

impl<F> Sorter for F
where F: Fn(&Bitmap) -> Vec<u32>
{
    fn sort(&self, ids: &Bitmap) -> Vec<u32> {
        self(ids)
    }
}
