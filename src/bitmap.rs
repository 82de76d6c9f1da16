//! Thin layer over the compressed bitmap primitive used by the whole algebra.
//!
//! The bitmap itself is an external collaborator: a [`RoaringBitmap`] is a
//! sorted set of `u32` entity ids with cheap cardinality and fast set
//! operations. This module only adds the n-ary combinators the formula
//! evaluation needs. The ordering and set semantics of the primitive are
//! load-bearing for everything built on top of it.

pub use roaring::RoaringBitmap as Bitmap;

/// Unions all bitmaps of the iterator into a single owned bitmap.
///
/// An empty iterator yields the empty set.
pub fn union_all<'a, I>(bitmaps: I) -> Bitmap
where I: IntoIterator<Item = &'a Bitmap> {
    let mut result = Bitmap::new();
    for bitmap in bitmaps {
        result |= bitmap;
    }
    result
}

/// Intersects all bitmaps of the iterator into a single owned bitmap.
///
/// An empty iterator yields the empty set: there is no universe to start
/// from, and every caller in this crate treats "nothing to intersect" as an
/// empty contribution.
pub fn intersect_all<'a, I>(bitmaps: I) -> Bitmap
where I: IntoIterator<Item = &'a Bitmap> {
    let mut iter = bitmaps.into_iter();
    let Some(first) = iter.next() else {
        return Bitmap::new();
    };
    let mut result = first.clone();
    for bitmap in iter {
        if result.is_empty() {
            break;
        }
        result &= bitmap;
    }
    result
}

/// Builds a bitmap from a slice of entity ids. Duplicates collapse.
pub fn from_ids(ids: &[u32]) -> Bitmap {
    ids.iter().copied().collect()
}
