// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A disk-resident X-Tree for d-dimensional point data.
//!
//! Algorithms described by Berchtold, S.; Keim, D. A.; Kriegel, H. P. (1996).
//! "The X-tree: An Index Structure for High-Dimensional Data".
//!
//! The index keeps a hierarchy of minimum bounding rectangles over the
//! inserted points in a paged file. Directory nodes carry the history of
//! split axes used below them; when no split with acceptable overlap exists,
//! a node becomes a variable-size supernode instead of splitting.

pub mod config;
pub mod error;
pub mod geometry;
mod store;
pub mod tree;

use num::{Bounded, Float, FromPrimitive, Signed, ToPrimitive};
use std::fmt::Debug;
use std::ops::{AddAssign, MulAssign};

pub use crate::config::{Limits, OverlapKind, XTreeOptions};
pub use crate::error::{Error, Result};
pub use crate::geometry::{MbrGeometry, Point, Rect};
pub use crate::tree::query::RectQuery;
pub use crate::tree::XTree;

/// The scalar bounds every coordinate type must satisfy
pub trait FP:
    Float
    + Signed
    + Bounded
    + MulAssign
    + AddAssign
    + ToPrimitive
    + FromPrimitive
    + Copy
    + Debug
    + Default
{
}

impl<T> FP for T where
    T: Float
        + Signed
        + Bounded
        + MulAssign
        + AddAssign
        + ToPrimitive
        + FromPrimitive
        + Copy
        + Debug
        + Default
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xtree_integration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.xt");
        let mut tree: XTree<f64, 3> = XTree::create(&path, XTreeOptions::new()).unwrap();
        for i in 0..64 {
            let i_f64 = i as f64;
            tree.insert(Point::new([i_f64, i_f64, i_f64]), i).unwrap();
        }
        assert_eq!(64, tree.len());
        let found = tree
            .search(&RectQuery::ContainedBy(Rect::from_corners(
                [0.0f64, 0.0, 0.0],
                [9.0f64, 9.0, 9.0],
            )))
            .unwrap();
        assert_eq!(10, found.len());
        tree.commit().unwrap();

        let reopened: XTree<f64, 3> = XTree::open(&path, XTreeOptions::new()).unwrap();
        assert_eq!(64, reopened.len());
        let found = reopened
            .search(&RectQuery::Overlaps(Rect::from_corners(
                [10.0f64, 10.0, 10.0],
                [19.0f64, 19.0, 19.0],
            )))
            .unwrap();
        assert_eq!(10, found.len());
    }
}
