//! Read-only, query-time view of the facet indexes.
//!
//! The storage layer maintains, per reference name, which entity ids carry
//! which facet. One [`FacetReferenceIndex`] per reference holds a
//! [`FacetGroupIndex`] per facet group (plus one bucket for facets assigned
//! to no group at all), each mapping facet ids to the bitmap of entities
//! carrying that facet. A query may touch several source indexes at once;
//! contributions for the same facet are unioned when the summary is built.

use std::collections::BTreeMap;

use crate::bitmap::Bitmap;

/// Entity ids carrying one facet.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetIdIndex {
    facet_id: u32,
    entity_ids: Bitmap,
}

impl FacetIdIndex {
    pub fn new(facet_id: u32, entity_ids: Bitmap) -> FacetIdIndex {
        FacetIdIndex {
            facet_id,
            entity_ids,
        }
    }

    pub fn facet_id(&self) -> u32 {
        self.facet_id
    }

    pub fn entity_ids(&self) -> &Bitmap {
        &self.entity_ids
    }
}

/// All facets of one facet group.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetGroupIndex {
    group_id: Option<i32>,
    facets: BTreeMap<u32, FacetIdIndex>,
}

impl FacetGroupIndex {
    pub fn new(group_id: Option<i32>) -> FacetGroupIndex {
        FacetGroupIndex {
            group_id,
            facets: BTreeMap::new(),
        }
    }

    pub fn group_id(&self) -> Option<i32> {
        self.group_id
    }

    /// Records entities carrying `facet_id`; repeated registration unions.
    pub fn register(&mut self, facet_id: u32, entity_ids: Bitmap) {
        self.facets
            .entry(facet_id)
            .and_modify(|existing| existing.entity_ids |= &entity_ids)
            .or_insert_with(|| FacetIdIndex::new(facet_id, entity_ids));
    }

    pub fn facet(&self, facet_id: u32) -> Option<&FacetIdIndex> {
        self.facets.get(&facet_id)
    }

    /// Facets in ascending facet-id order.
    pub fn facets(&self) -> impl Iterator<Item = &FacetIdIndex> {
        self.facets.values()
    }

    pub fn is_empty(&self) -> bool {
        self.facets.is_empty()
    }
}

/// Facet data of one reference, organized into groups.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetReferenceIndex {
    reference_name: String,
    grouped: BTreeMap<i32, FacetGroupIndex>,
    not_grouped: Option<FacetGroupIndex>,
}

impl FacetReferenceIndex {
    pub fn new(reference_name: impl Into<String>) -> FacetReferenceIndex {
        FacetReferenceIndex {
            reference_name: reference_name.into(),
            grouped: BTreeMap::new(),
            not_grouped: None,
        }
    }

    pub fn reference_name(&self) -> &str {
        &self.reference_name
    }

    /// Records entities carrying `facet_id` within `group_id`.
    pub fn register(&mut self, group_id: Option<i32>, facet_id: u32, entity_ids: Bitmap) {
        let group = match group_id {
            Some(gid) => self
                .grouped
                .entry(gid)
                .or_insert_with(|| FacetGroupIndex::new(Some(gid))),
            None => self
                .not_grouped
                .get_or_insert_with(|| FacetGroupIndex::new(None)),
        };
        group.register(facet_id, entity_ids);
    }

    /// Group indexes in ascending group-id order, the no-group bucket last.
    pub fn group_indexes(&self) -> impl Iterator<Item = &FacetGroupIndex> {
        self.grouped.values().chain(self.not_grouped.iter())
    }

    pub fn group(&self, group_id: Option<i32>) -> Option<&FacetGroupIndex> {
        match group_id {
            Some(gid) => self.grouped.get(&gid),
            None => self.not_grouped.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.grouped.values().all(FacetGroupIndex::is_empty)
            && self.not_grouped.as_ref().map_or(true, FacetGroupIndex::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::FacetReferenceIndex;
    use crate::bitmap::from_ids;

    #[test]
    fn test_register_unions_repeated_facets() {
        let mut index = FacetReferenceIndex::new("brand");
        index.register(Some(1), 10, from_ids(&[1, 2]));
        index.register(Some(1), 10, from_ids(&[2, 3]));
        let group = index.group(Some(1)).unwrap();
        assert_eq!(*group.facet(10).unwrap().entity_ids(), from_ids(&[1, 2, 3]));
    }

    #[test]
    fn test_no_group_bucket_comes_last() {
        let mut index = FacetReferenceIndex::new("brand");
        index.register(None, 30, from_ids(&[1]));
        index.register(Some(2), 20, from_ids(&[2]));
        index.register(Some(1), 10, from_ids(&[3]));
        let order: Vec<Option<i32>> = index.group_indexes().map(|g| g.group_id()).collect();
        assert_eq!(order, vec![Some(1), Some(2), None]);
    }
}
