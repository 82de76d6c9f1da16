//! # faceteer
//!
//! Query-time facet statistics over entity-id bitmaps.
//!
//! The crate implements the read side of faceted search for a document
//! database: given a pre-built Boolean filter tree (the "base formula") and
//! per-facet entity bitmaps from the index layer, it derives hypothetical
//! filter trees per facet, evaluates them and aggregates the results into a
//! facet summary with counts and selection impacts.
//!
//! The three layers, bottom up:
//!
//! - [`formula`] is a memoizing Boolean algebra over [`bitmap::Bitmap`]s,
//!   arena-allocated with structural sharing between derived trees;
//! - [`facet::calculator`] derives one count/impact tree per distinct tree
//!   shape and re-evaluates it per facet by swapping a single mutable leaf;
//! - [`facet::summary`] orchestrates the per-request pipeline producing the
//!   final [`facet::summary::FacetSummary`].
//!
//! Everything is per-query and single-threaded; concurrent queries each get
//! their own arena, calculator and producer.
//!
//! ```
//! use faceteer::bitmap::from_ids;
//! use faceteer::facet::calculator::MemoizingFacetCalculator;
//! use faceteer::facet::index::FacetReferenceIndex;
//! use faceteer::facet::summary::FacetSummaryProducer;
//! use faceteer::facet::{ReferenceSchema, StaticRelationResolver};
//! use faceteer::formula::FormulaArena;
//!
//! // the planner hands over the base filter tree; here: five entities, no
//! // user selection yet
//! let mut arena = FormulaArena::new();
//! let mandatory = arena.constant(from_ids(&[1, 2, 3, 4, 5]));
//! let user_filter = arena.user_filter([]);
//! let base = arena.and([mandatory, user_filter]);
//!
//! // the index layer hands over the per-facet bitmaps
//! let mut index = FacetReferenceIndex::new("brand");
//! index.register(Some(1), 10, from_ids(&[1, 2, 3]));
//!
//! let resolver = StaticRelationResolver::new();
//! let calculator = MemoizingFacetCalculator::new(arena, base, mandatory, &resolver);
//! let mut producer = FacetSummaryProducer::new(calculator, Default::default());
//!
//! let schemas = [ReferenceSchema::new("brand", "Brand", true, None, false)];
//! let summary = producer.fabricate(&schemas, &[&index])?;
//! assert_eq!(summary.groups[0].facets[0].count, 3);
//! # Ok::<(), faceteer::FaceteerError>(())
//! ```

pub mod bitmap;
mod error;
pub mod facet;
pub mod formula;

pub use crate::error::FaceteerError;

/// The library's failable result type.
pub type Result<T> = std::result::Result<T, FaceteerError>;
