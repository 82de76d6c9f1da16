//! Aggregation of facet statistics into the final summary.
//!
//! The producer runs a fixed pipeline over the facet indexes touched by the
//! query: flatten the per-source indexes, group them by reference and facet
//! group, merge duplicate facets across sources, evaluate one count (and
//! optionally one impact) formula per facet, prune empty entries, sort, fetch
//! entity bodies and assemble the DTOs. The formula evaluation in the middle
//! is the expensive part; everything around it is plain bookkeeping.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::calculator::{MemoizingFacetCalculator, RequestImpact};
use super::index::FacetReferenceIndex;
use super::{EntityClassifier, EntityFetcher, ReferenceSchema, Sorter};
use crate::bitmap::Bitmap;
use crate::{FaceteerError, Result};

/// How much statistics the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacetStatisticsDepth {
    /// Plain counts only.
    #[default]
    Counts,
    /// Counts plus the hypothetical impact of selecting each facet.
    Impact,
}

/// Per-reference (or default) settings of one summary computation.
///
/// All fields are optional; unset fields fall back to the producer's default
/// request, and ultimately to counts-only statistics with natural ordering
/// and bare entity references.
#[derive(Default)]
pub struct FacetSummaryRequest<'a> {
    depth: Option<FacetStatisticsDepth>,
    group_predicate: Option<Box<dyn Fn(Option<i32>) -> bool + 'a>>,
    facet_predicate: Option<Box<dyn Fn(Option<i32>, u32) -> bool + 'a>>,
    facet_sorter: Option<Box<dyn Sorter + 'a>>,
    group_sorter: Option<Box<dyn Fn(Option<i32>, Option<i32>) -> Ordering + 'a>>,
    facet_fetcher: Option<EntityFetcher<'a>>,
    group_fetcher: Option<EntityFetcher<'a>>,
}

impl<'a> FacetSummaryRequest<'a> {
    pub fn new() -> FacetSummaryRequest<'a> {
        FacetSummaryRequest::default()
    }

    pub fn with_depth(mut self, depth: FacetStatisticsDepth) -> FacetSummaryRequest<'a> {
        self.depth = Some(depth);
        self
    }

    /// Restricts which facet groups are considered at all.
    pub fn filter_groups(
        mut self,
        predicate: impl Fn(Option<i32>) -> bool + 'a,
    ) -> FacetSummaryRequest<'a> {
        self.group_predicate = Some(Box::new(predicate));
        self
    }

    /// Restricts which facets are considered, by `(group_id, facet_id)`.
    pub fn filter_facets(
        mut self,
        predicate: impl Fn(Option<i32>, u32) -> bool + 'a,
    ) -> FacetSummaryRequest<'a> {
        self.facet_predicate = Some(Box::new(predicate));
        self
    }

    /// Orders facets within each group; unordered facets keep ascending
    /// facet-id order at the end.
    pub fn sort_facets_with(mut self, sorter: impl Sorter + 'a) -> FacetSummaryRequest<'a> {
        self.facet_sorter = Some(Box::new(sorter));
        self
    }

    /// Orders the groups of one reference by their group ids; natural
    /// ascending order (no-group bucket last) otherwise.
    pub fn sort_groups_by(
        mut self,
        comparator: impl Fn(Option<i32>, Option<i32>) -> Ordering + 'a,
    ) -> FacetSummaryRequest<'a> {
        self.group_sorter = Some(Box::new(comparator));
        self
    }

    /// Fetches facet entity bodies; without it facets are reported as bare
    /// type + primary key references.
    pub fn fetch_facets_with(mut self, fetcher: EntityFetcher<'a>) -> FacetSummaryRequest<'a> {
        self.facet_fetcher = Some(fetcher);
        self
    }

    /// Fetches group entity bodies; same fallback as facet fetching.
    pub fn fetch_groups_with(mut self, fetcher: EntityFetcher<'a>) -> FacetSummaryRequest<'a> {
        self.group_fetcher = Some(fetcher);
        self
    }
}

/// Statistics of a single facet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetStatistics {
    pub facet_entity: EntityClassifier,
    pub requested: bool,
    pub count: u64,
    pub impact: Option<RequestImpact>,
}

/// Statistics of one facet group of one reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetGroupStatistics {
    pub reference_name: String,
    pub group_entity: Option<EntityClassifier>,
    /// Entities of the current result carrying any facet of this group.
    pub total_count: u64,
    pub facets: Vec<FacetStatistics>,
}

/// The produced summary: groups ordered by reference appearance, then by
/// ascending group id with the no-group bucket last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FacetSummary {
    pub groups: Vec<FacetGroupStatistics>,
}

/// One facet merged across all contributing source indexes.
struct FacetAccumulator<'a> {
    facet_id: u32,
    sources: Vec<&'a Bitmap>,
}

impl<'a> FacetAccumulator<'a> {
    fn combine(&mut self, mut other: FacetAccumulator<'a>) {
        self.sources.append(&mut other.sources);
    }
}

/// One facet group merged across all contributing source indexes.
struct GroupAccumulator<'a> {
    group_id: Option<i32>,
    facets: BTreeMap<u32, FacetAccumulator<'a>>,
}

impl<'a> GroupAccumulator<'a> {
    fn new(group_id: Option<i32>) -> GroupAccumulator<'a> {
        GroupAccumulator {
            group_id,
            facets: BTreeMap::new(),
        }
    }

    fn register(&mut self, facet: FacetAccumulator<'a>) {
        match self.facets.get_mut(&facet.facet_id) {
            Some(existing) => existing.combine(facet),
            None => {
                self.facets.insert(facet.facet_id, facet);
            }
        }
    }
}

/// Computes the [`FacetSummary`] of one query.
///
/// Holds the per-query calculator, so it inherits its not-thread-safe nature;
/// construct one producer per request.
pub struct FacetSummaryProducer<'a> {
    calculator: MemoizingFacetCalculator<'a>,
    /// Facet ids already selected by the user, per reference name.
    requested_facets: FxHashMap<String, Bitmap>,
    default_request: FacetSummaryRequest<'a>,
    reference_requests: FxHashMap<String, FacetSummaryRequest<'a>>,
}

impl<'a> FacetSummaryProducer<'a> {
    pub fn new(
        calculator: MemoizingFacetCalculator<'a>,
        requested_facets: FxHashMap<String, Bitmap>,
    ) -> FacetSummaryProducer<'a> {
        FacetSummaryProducer {
            calculator,
            requested_facets,
            default_request: FacetSummaryRequest::default(),
            reference_requests: FxHashMap::default(),
        }
    }

    /// Settings applied to every reference that has no specific request.
    pub fn with_default_request(
        mut self,
        request: FacetSummaryRequest<'a>,
    ) -> FacetSummaryProducer<'a> {
        self.default_request = request;
        self
    }

    /// Settings applied to one reference; unset fields fall back to the
    /// default request.
    pub fn with_reference_request(
        mut self,
        reference_name: impl Into<String>,
        request: FacetSummaryRequest<'a>,
    ) -> FacetSummaryProducer<'a> {
        self.reference_requests.insert(reference_name.into(), request);
        self
    }

    /// Runs the whole pipeline over the facet indexes touched by the query.
    ///
    /// `indexes` carries one entry per contributing source index; several
    /// entries may describe the same reference and are merged. Every index
    /// must have a schema in `schemas`.
    pub fn fabricate(
        &mut self,
        schemas: &[ReferenceSchema],
        indexes: &[&FacetReferenceIndex],
    ) -> Result<FacetSummary> {
        let mut groups = Vec::new();
        for (reference_name, reference_indexes) in group_by_reference(indexes) {
            let schema = schemas
                .iter()
                .find(|schema| schema.name() == reference_name)
                .ok_or_else(|| {
                    FaceteerError::InvalidArgument(format!(
                        "no schema supplied for reference `{reference_name}`"
                    ))
                })?;
            let accumulators = self.accumulate(schema, &reference_indexes);
            let mut reference_groups: Vec<(Option<i32>, FacetGroupStatistics)> = Vec::new();
            for accumulator in accumulators {
                let group_id = accumulator.group_id;
                if let Some(statistics) = self.fabricate_group(schema, accumulator)? {
                    reference_groups.push((group_id, statistics));
                }
            }
            if let Some(comparator) = self
                .reference_requests
                .get(schema.name())
                .and_then(|request| request.group_sorter.as_ref())
                .or(self.default_request.group_sorter.as_ref())
            {
                reference_groups.sort_by(|(a, _), (b, _)| comparator(*a, *b));
            }
            groups.extend(reference_groups.into_iter().map(|(_, statistics)| statistics));
        }
        debug!(
            "facet summary fabricated: {} groups, base count {}",
            groups.len(),
            self.calculator.base_count()
        );
        Ok(FacetSummary { groups })
    }

    /// Steps 3 and 4: group and merge the reference's indexes, applying the
    /// group and facet predicates.
    fn accumulate<'b>(
        &self,
        schema: &ReferenceSchema,
        indexes: &[&'b FacetReferenceIndex],
    ) -> Vec<GroupAccumulator<'b>> {
        let mut grouped: BTreeMap<i32, GroupAccumulator<'b>> = BTreeMap::new();
        let mut not_grouped: Option<GroupAccumulator<'b>> = None;
        for index in indexes {
            for group_index in index.group_indexes() {
                let group_id = group_index.group_id();
                if !self.group_allowed(schema, group_id) {
                    continue;
                }
                let accumulator = match group_id {
                    Some(gid) => grouped
                        .entry(gid)
                        .or_insert_with(|| GroupAccumulator::new(Some(gid))),
                    None => not_grouped.get_or_insert_with(|| GroupAccumulator::new(None)),
                };
                for facet in group_index.facets() {
                    if !self.facet_allowed(schema, group_id, facet.facet_id()) {
                        continue;
                    }
                    accumulator.register(FacetAccumulator {
                        facet_id: facet.facet_id(),
                        sources: vec![facet.entity_ids()],
                    });
                }
            }
        }
        grouped
            .into_values()
            .chain(not_grouped)
            .filter(|accumulator| !accumulator.facets.is_empty())
            .collect()
    }

    /// Steps 5 through 9 for one group: counts, impacts, total, pruning,
    /// ordering and entity fetching.
    fn fabricate_group(
        &mut self,
        schema: &ReferenceSchema,
        accumulator: GroupAccumulator<'_>,
    ) -> Result<Option<FacetGroupStatistics>> {
        let group_id = accumulator.group_id;
        let depth = self.depth(schema.name());
        let requested = self.requested_facets.get(schema.name()).cloned();

        let mut survivors: Vec<(u32, u64, Option<RequestImpact>)> = Vec::new();
        for facet in accumulator.facets.values() {
            let root = self.calculator.count_formula(
                schema,
                group_id,
                facet.facet_id,
                &facet.sources,
            )?;
            let count = self.calculator.compute(root).len();
            if count == 0 {
                continue;
            }
            let impact = match depth {
                FacetStatisticsDepth::Counts => None,
                FacetStatisticsDepth::Impact => Some(self.calculator.impact(
                    schema,
                    group_id,
                    facet.facet_id,
                    &facet.sources,
                )?),
            };
            survivors.push((facet.facet_id, count, impact));
        }
        if survivors.is_empty() {
            return Ok(None);
        }

        let all_sources = accumulator
            .facets
            .values()
            .flat_map(|facet| facet.sources.iter().copied());
        let total_root = self.calculator.group_count_formula(all_sources);
        let total_count = self.calculator.compute(total_root).len();
        if total_count == 0 {
            return Ok(None);
        }

        self.order_facets(schema.name(), &mut survivors);

        let facet_entities = self.fetch_facet_entities(
            schema,
            &survivors.iter().map(|(id, _, _)| *id).collect::<Vec<_>>(),
        );
        let facets = survivors
            .into_iter()
            .map(|(facet_id, count, impact)| FacetStatistics {
                facet_entity: facet_entities
                    .get(&facet_id)
                    .cloned()
                    .unwrap_or_else(|| bare_facet_entity(schema, facet_id)),
                requested: requested
                    .as_ref()
                    .map_or(false, |bitmap| bitmap.contains(facet_id)),
                count,
                impact,
            })
            .collect();

        Ok(Some(FacetGroupStatistics {
            reference_name: schema.name().to_string(),
            group_entity: self.fetch_group_entity(schema, group_id)?,
            total_count,
            facets,
        }))
    }

    /// Applies the configured facet sorter; sorter-omitted facets keep their
    /// ascending-id order at the end.
    fn order_facets(&self, reference_name: &str, facets: &mut Vec<(u32, u64, Option<RequestImpact>)>) {
        let sorter = self
            .reference_requests
            .get(reference_name)
            .and_then(|request| request.facet_sorter.as_deref())
            .or(self.default_request.facet_sorter.as_deref());
        let Some(sorter) = sorter else {
            return;
        };
        let ids: Bitmap = facets.iter().map(|(id, _, _)| *id).collect();
        let order: FxHashMap<u32, usize> = sorter
            .sort(&ids)
            .into_iter()
            .enumerate()
            .map(|(position, id)| (id, position))
            .collect();
        facets.sort_by_key(|(id, _, _)| (order.get(id).copied().unwrap_or(usize::MAX), *id));
    }

    fn fetch_facet_entities(
        &self,
        schema: &ReferenceSchema,
        facet_ids: &[u32],
    ) -> FxHashMap<u32, EntityClassifier> {
        let fetcher = self
            .reference_requests
            .get(schema.name())
            .and_then(|request| request.facet_fetcher.as_ref())
            .or(self.default_request.facet_fetcher.as_ref());
        match fetcher {
            Some(fetcher) if schema.is_entity_type_managed() => {
                fetcher(schema.referenced_entity_type(), facet_ids)
                    .into_iter()
                    .map(|entity| (entity.primary_key, entity))
                    .collect()
            }
            _ => FxHashMap::default(),
        }
    }

    fn fetch_group_entity(
        &self,
        schema: &ReferenceSchema,
        group_id: Option<i32>,
    ) -> Result<Option<EntityClassifier>> {
        let Some(group_id) = group_id else {
            return Ok(None);
        };
        let Some(group_type) = schema.referenced_group_type() else {
            return Ok(None);
        };
        // group ids double as entity primary keys, which are unsigned
        let primary_key = u32::try_from(group_id).map_err(|_| {
            FaceteerError::InvalidArgument(format!(
                "group id {group_id} of reference `{}` is not a valid primary key",
                schema.name()
            ))
        })?;
        let fetcher = self
            .reference_requests
            .get(schema.name())
            .and_then(|request| request.group_fetcher.as_ref())
            .or(self.default_request.group_fetcher.as_ref());
        Ok(match fetcher {
            Some(fetcher) if schema.is_group_type_managed() => {
                fetcher(group_type, &[primary_key]).into_iter().next()
            }
            _ => Some(EntityClassifier::new(group_type, primary_key)),
        })
    }

    fn depth(&self, reference_name: &str) -> FacetStatisticsDepth {
        self.reference_requests
            .get(reference_name)
            .and_then(|request| request.depth)
            .or(self.default_request.depth)
            .unwrap_or_default()
    }

    fn group_allowed(&self, schema: &ReferenceSchema, group_id: Option<i32>) -> bool {
        let predicate = self
            .reference_requests
            .get(schema.name())
            .and_then(|request| request.group_predicate.as_ref())
            .or(self.default_request.group_predicate.as_ref());
        predicate.map_or(true, |predicate| predicate(group_id))
    }

    fn facet_allowed(&self, schema: &ReferenceSchema, group_id: Option<i32>, facet_id: u32) -> bool {
        let predicate = self
            .reference_requests
            .get(schema.name())
            .and_then(|request| request.facet_predicate.as_ref())
            .or(self.default_request.facet_predicate.as_ref());
        predicate.map_or(true, |predicate| predicate(group_id, facet_id))
    }
}

/// Groups the source indexes by reference name, preserving the order of
/// first appearance.
fn group_by_reference<'a, 'b>(
    indexes: &'b [&'a FacetReferenceIndex],
) -> Vec<(&'a str, Vec<&'a FacetReferenceIndex>)> {
    let mut order: Vec<&'a str> = Vec::new();
    let mut by_name: FxHashMap<&'a str, Vec<&'a FacetReferenceIndex>> = FxHashMap::default();
    for &index in indexes {
        if !by_name.contains_key(index.reference_name()) {
            order.push(index.reference_name());
        }
        by_name
            .entry(index.reference_name())
            .or_default()
            .push(index);
    }
    order
        .into_iter()
        .map(|name| {
            let indexes = by_name.remove(name).expect("inserted above");
            (name, indexes)
        })
        .collect_vec()
}

fn bare_facet_entity(schema: &ReferenceSchema, facet_id: u32) -> EntityClassifier {
    EntityClassifier::new(schema.referenced_entity_type(), facet_id)
}
