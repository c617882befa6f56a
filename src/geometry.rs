// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Points, minimum bounding rectangles, and the geometry every tree entry
//! must expose

use crate::error::{Error, Result};
use crate::FP;
use itertools::izip;
use num::{pow, Bounded, FromPrimitive, One, Zero};
use std::convert::{AsMut, AsRef};
use std::ops::{Deref, DerefMut};

/// Guard against coordinates and derived measures leaving the finite range
pub fn finite<P: FP>(value: P) -> Result<P> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::NumericOverflow)
    }
}

/// An n-dimensional point
#[derive(Debug, Clone, PartialEq)]
pub struct Point<P, const DIM: usize> {
    pub coords: [P; DIM],
}

impl<P: FP, const DIM: usize> Point<P, DIM> {
    /// New Point from an array
    pub fn new(coords: [P; DIM]) -> Point<P, DIM> {
        for coord in coords.iter() {
            assert!(coord.is_finite(), "{:?} should be finite", coord);
        }
        Point { coords }
    }

    /// New Point from a slice
    pub fn from_slice(slice: &[P]) -> Point<P, DIM> {
        let mut coords = [P::default(); DIM];
        coords.copy_from_slice(slice);
        Point::new(coords)
    }

    /// The degenerate mbr with `lo = hi = coords`
    pub fn to_mbr(&self) -> Rect<P, DIM> {
        let mut edges = [(P::default(), P::default()); DIM];
        for (edge, &coord) in izip!(edges.iter_mut(), self.deref()) {
            *edge = (coord, coord);
        }
        Rect { edges }
    }
}

impl<P, const DIM: usize> Deref for Point<P, DIM> {
    type Target = [P];

    fn deref(&self) -> &[P] {
        &self.coords
    }
}

impl<P, const DIM: usize> DerefMut for Point<P, DIM> {
    fn deref_mut(&mut self) -> &mut [P] {
        &mut self.coords
    }
}

impl<P, const DIM: usize> AsRef<[P]> for Point<P, DIM> {
    fn as_ref(&self) -> &[P] {
        self.deref()
    }
}

impl<P, const DIM: usize> AsMut<[P]> for Point<P, DIM> {
    fn as_mut(&mut self) -> &mut [P] {
        self.deref_mut()
    }
}

/// An n-dimensional rectangle.
///
/// The edge for a dimension is the `(lo, hi)` expanse of the rectangle in
/// that dimension. Equality is componentwise float equality, no epsilon.
#[derive(Debug, Clone, PartialEq)]
pub struct Rect<P, const DIM: usize> {
    pub edges: [(P, P); DIM],
}

impl<P: FP, const DIM: usize> Rect<P, DIM> {
    /// New Rect from an edge array
    pub fn new(mut edges: [(P, P); DIM]) -> Rect<P, DIM> {
        // ensure that the edge coordinates are valid and ordered correctly
        for &mut (ref mut x, ref mut y) in edges.iter_mut() {
            assert!(x.is_finite(), "{:?} should be finite", x);
            assert!(y.is_finite(), "{:?} should be finite", y);
            *x = x.min(*y);
            *y = x.max(*y);
        }
        Rect { edges }
    }

    /// New Rect from corners
    pub fn from_corners(x: [P; DIM], y: [P; DIM]) -> Rect<P, DIM> {
        let mut edges = Rect::max_inverted();
        Point::new(x).expand_mbr_to_fit(&mut edges);
        Point::new(y).expand_mbr_to_fit(&mut edges);
        edges
    }

    /// An inverted Rect where every dimension's (lo, hi) coordinates are
    /// (MAX, MIN). Simplifies finding boundaries.
    pub fn max_inverted() -> Rect<P, DIM> {
        let mut edges = [(P::default(), P::default()); DIM];
        for &mut (ref mut x, ref mut y) in edges.as_mut() {
            *x = Bounded::max_value();
            *y = Bounded::min_value();
        }
        Rect { edges }
    }

    /// The largest possible rect
    pub fn max() -> Rect<P, DIM> {
        let mut edges = [(P::default(), P::default()); DIM];
        for &mut (ref mut x, ref mut y) in edges.as_mut() {
            *x = Bounded::min_value();
            *y = Bounded::max_value();
        }
        Rect { edges }
    }

    /// The tight mbr around a set of entries, `max_inverted` when empty
    pub fn union_of<'a, G, I>(entries: I) -> Rect<P, DIM>
    where
        G: MbrGeometry<P, DIM> + 'a,
        I: IntoIterator<Item = &'a G>,
    {
        let mut mbr = Rect::max_inverted();
        for entry in entries {
            entry.expand_mbr_to_fit(&mut mbr);
        }
        mbr
    }

    /// The region shared with `other`, None when the rectangles are disjoint
    /// in some dimension
    pub fn intersection(&self, other: &Rect<P, DIM>) -> Option<Rect<P, DIM>> {
        let mut edges = [(P::default(), P::default()); DIM];
        for (edge, &(x1, y1), &(x2, y2)) in izip!(edges.iter_mut(), self.deref(), other.deref()) {
            let lo = x1.max(x2);
            let hi = y1.min(y2);
            if hi < lo {
                return None;
            }
            *edge = (lo, hi);
        }
        Some(Rect { edges })
    }

    /// `volume`, guarded against leaving the finite range
    pub fn finite_volume(&self) -> Result<P> {
        finite(self.volume())
    }
}

impl<P, const DIM: usize> Deref for Rect<P, DIM> {
    type Target = [(P, P)];

    fn deref(&self) -> &[(P, P)] {
        &self.edges
    }
}

impl<P, const DIM: usize> DerefMut for Rect<P, DIM> {
    fn deref_mut(&mut self) -> &mut [(P, P)] {
        &mut self.edges
    }
}

impl<P, const DIM: usize> AsRef<[(P, P)]> for Rect<P, DIM> {
    fn as_ref(&self) -> &[(P, P)] {
        self.deref()
    }
}

impl<P, const DIM: usize> AsMut<[(P, P)]> for Rect<P, DIM> {
    fn as_mut(&mut self) -> &mut [(P, P)] {
        self.deref_mut()
    }
}

/// The minimum functionality required of anything stored under an mbr tree
/// node: points, rectangles, and the entries wrapping them.
///
/// All operations assume `self.dim() == mbr.dim()`.
pub trait MbrGeometry<P, const DIM: usize> {
    /// The geometry's dimension count
    fn dim(&self) -> usize;

    /// The volume of the geometry, `∏ (hi - lo)` over every dimension
    fn volume(&self) -> P;

    /// The minimum extent for a given axis
    fn min_for_axis(&self, axis: usize) -> P;

    /// The maximum extent for a given axis
    fn max_for_axis(&self, axis: usize) -> P;

    /// Expand the mbr to minimally fit the geometry
    fn expand_mbr_to_fit(&self, mbr: &mut Rect<P, DIM>);

    /// The L2 distance from the mbr's center
    fn distance_from_mbr_center(&self, mbr: &Rect<P, DIM>) -> P;

    /// Is the geometry completely contained in the mbr?
    fn contained_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool;

    /// Does the geometry overlap the mbr? Closed intervals, so touching
    /// boundaries and degenerate rectangles count.
    fn overlapped_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool;

    /// The volume shared with the mbr, `∏ max(0, min(hi) - max(lo))`
    fn volume_overlapped_with_mbr(&self, mbr: &Rect<P, DIM>) -> P;
}

impl<P: FP, const DIM: usize> MbrGeometry<P, DIM> for Point<P, DIM> {
    fn dim(&self) -> usize {
        self.coords.len()
    }

    fn volume(&self) -> P {
        Zero::zero()
    }

    fn min_for_axis(&self, axis: usize) -> P {
        self.coords[axis]
    }

    fn max_for_axis(&self, axis: usize) -> P {
        self.coords[axis]
    }

    fn expand_mbr_to_fit(&self, mbr: &mut Rect<P, DIM>) {
        for (&mut (ref mut x, ref mut y), &z) in izip!(mbr.deref_mut(), self.deref()) {
            *x = x.min(z);
            *y = y.max(z);
        }
    }

    fn distance_from_mbr_center(&self, mbr: &Rect<P, DIM>) -> P {
        let two = FromPrimitive::from_usize(2).unwrap();
        let dist: P =
            izip!(mbr.deref(), self.deref()).fold(Zero::zero(), |distance, (&(x, y), &z)| {
                distance + pow((x + y) / two - z, 2)
            });
        dist.sqrt()
    }

    fn contained_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool {
        self.overlapped_by_mbr(mbr)
    }

    fn overlapped_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool {
        for (&(x, y), &z) in izip!(mbr.deref(), self.deref()) {
            if z < x || y < z {
                return false;
            }
        }
        true
    }

    fn volume_overlapped_with_mbr(&self, _mbr: &Rect<P, DIM>) -> P {
        Zero::zero()
    }
}

impl<P: FP, const DIM: usize> MbrGeometry<P, DIM> for Rect<P, DIM> {
    fn dim(&self) -> usize {
        self.edges.len()
    }

    fn volume(&self) -> P {
        self.deref()
            .iter()
            .fold(One::one(), |volume, &(x, y)| volume * (y - x))
    }

    fn min_for_axis(&self, axis: usize) -> P {
        self.edges[axis].0
    }

    fn max_for_axis(&self, axis: usize) -> P {
        self.edges[axis].1
    }

    fn expand_mbr_to_fit(&self, mbr: &mut Rect<P, DIM>) {
        for (&mut (ref mut x1, ref mut y1), &(x2, y2)) in izip!(mbr.deref_mut(), self.deref()) {
            *x1 = x1.min(x2);
            *y1 = y1.max(y2);
        }
    }

    fn distance_from_mbr_center(&self, mbr: &Rect<P, DIM>) -> P {
        let two = FromPrimitive::from_usize(2).unwrap();
        let dist: P = izip!(mbr.deref(), self.deref()).fold(
            Zero::zero(),
            |distance, (&(x1, y1), &(x2, y2))| {
                distance + pow((x1 + y1) / two - (x2 + y2) / two, 2)
            },
        );
        dist.sqrt()
    }

    fn contained_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool {
        for (&(x1, y1), &(x2, y2)) in izip!(mbr.deref(), self.deref()) {
            if x2 < x1 || y1 < y2 {
                return false;
            }
        }
        true
    }

    fn overlapped_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool {
        for (&(x1, y1), &(x2, y2)) in izip!(mbr.deref(), self.deref()) {
            if y2 < x1 || y1 < x2 {
                return false;
            }
        }
        true
    }

    fn volume_overlapped_with_mbr(&self, mbr: &Rect<P, DIM>) -> P {
        izip!(mbr.deref(), self.deref()).fold(One::one(), |volume, (&(x1, y1), &(x2, y2))| {
            volume * (y1.min(y2) - x1.max(x2)).max(Zero::zero())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ONE: [f64; 3] = [1.0f64, 1.0f64, 1.0f64];
    const ZERO: [f64; 3] = [0.0f64, 0.0f64, 0.0f64];
    const NEG_ONE: [f64; 3] = [-1.0f64, -1.0f64, -1.0f64];
    const NEG_TWO: [f64; 3] = [-2.0f64, -2.0f64, -2.0f64];

    // distance of [0.5, 0.5, 0.5]
    const EXPECTED_DISTANCE: f64 = 0.86602540378f64;

    #[test]
    fn point() {
        let zero: Point<f64, 3> = Point::from_slice(&ZERO);
        let one: Point<f64, 3> = Point::from_slice(&ONE);
        let neg_one: Point<f64, 3> = Point::from_slice(&NEG_ONE);

        assert_eq!(ZERO.len(), zero.dim());
        assert_relative_eq!(0.0f64, zero.volume());
        for (i, item) in ZERO.iter().enumerate() {
            assert_relative_eq!(*item, zero.min_for_axis(i));
            assert_relative_eq!(*item, zero.max_for_axis(i));
        }

        let mut bounding = Rect::max_inverted();
        zero.expand_mbr_to_fit(&mut bounding);
        one.expand_mbr_to_fit(&mut bounding);
        for (i, (x, y)) in izip!(&ZERO, &ONE).enumerate() {
            assert_relative_eq!(*x, bounding.min_for_axis(i));
            assert_relative_eq!(*y, bounding.max_for_axis(i));
        }

        assert_relative_eq!(
            EXPECTED_DISTANCE,
            zero.distance_from_mbr_center(&bounding),
            max_relative = 0.00000001
        );

        assert!(zero.contained_by_mbr(&bounding));
        assert!(one.contained_by_mbr(&bounding));
        assert!(!neg_one.contained_by_mbr(&bounding));

        assert_relative_eq!(0.0f64, zero.volume_overlapped_with_mbr(&bounding));
    }

    #[test]
    fn rect() {
        // contained
        let zero_one = Rect::from_corners(ZERO, ONE);
        // overlapped
        let neg_one_one = Rect::from_corners(NEG_ONE, ONE);
        // outside
        let neg_two_neg_one = Rect::from_corners(NEG_TWO, NEG_ONE);

        assert_eq!(ZERO.len(), zero_one.dim());
        assert_relative_eq!(1.0f64, zero_one.volume());

        for (i, (x, y)) in izip!(&ZERO, &ONE).enumerate() {
            assert_relative_eq!(*x, zero_one.min_for_axis(i));
            assert_relative_eq!(*y, zero_one.max_for_axis(i));
        }

        let mut bounding = Rect::max_inverted();
        zero_one.expand_mbr_to_fit(&mut bounding);
        for (i, (x, y)) in izip!(&ZERO, &ONE).enumerate() {
            assert_relative_eq!(*x, bounding.min_for_axis(i));
            assert_relative_eq!(*y, bounding.max_for_axis(i));
        }

        assert_relative_eq!(
            EXPECTED_DISTANCE,
            neg_one_one.distance_from_mbr_center(&bounding),
            max_relative = 0.00000001
        );

        assert!(zero_one.contained_by_mbr(&bounding));
        assert!(!neg_one_one.contained_by_mbr(&bounding));
        assert!(!neg_two_neg_one.contained_by_mbr(&bounding));

        assert!(zero_one.overlapped_by_mbr(&bounding));
        assert!(neg_one_one.overlapped_by_mbr(&bounding));
        assert!(!neg_two_neg_one.overlapped_by_mbr(&bounding));

        assert_relative_eq!(1.0f64, zero_one.volume_overlapped_with_mbr(&bounding));
        assert_relative_eq!(1.0f64, neg_one_one.volume_overlapped_with_mbr(&bounding));
    }

    #[test]
    fn touching_rects_overlap_with_zero_volume() {
        let left: Rect<f64, 2> = Rect::from_corners([0.0, 0.0], [1.0, 1.0]);
        let right: Rect<f64, 2> = Rect::from_corners([1.0, 0.0], [2.0, 1.0]);
        assert!(left.overlapped_by_mbr(&right));
        assert_relative_eq!(0.0f64, left.volume_overlapped_with_mbr(&right));

        let meeting = left.intersection(&right).unwrap();
        assert_relative_eq!(1.0f64, meeting.min_for_axis(0));
        assert_relative_eq!(1.0f64, meeting.max_for_axis(0));

        let apart: Rect<f64, 2> = Rect::from_corners([3.0, 0.0], [4.0, 1.0]);
        assert!(left.intersection(&apart).is_none());
    }

    #[test]
    fn degenerate_point_rect_query() {
        let p: Point<f64, 2> = Point::new([0.5, 0.5]);
        let exact = p.to_mbr();
        assert!(p.overlapped_by_mbr(&exact));
        assert!(exact.overlapped_by_mbr(&exact));
        assert_relative_eq!(0.0f64, exact.volume());
    }

    #[test]
    fn union_of_entries() {
        let rects: Vec<Rect<f64, 2>> = vec![
            Rect::from_corners([0.0, 0.0], [1.0, 1.0]),
            Rect::from_corners([2.0, -1.0], [3.0, 0.5]),
        ];
        let union = Rect::union_of(rects.iter());
        assert_relative_eq!(0.0f64, union.min_for_axis(0));
        assert_relative_eq!(3.0f64, union.max_for_axis(0));
        assert_relative_eq!(-1.0f64, union.min_for_axis(1));
        assert_relative_eq!(1.0f64, union.max_for_axis(1));
    }

    #[test]
    fn finite_guard() {
        assert!(finite(1.0f64).is_ok());
        assert!(finite(f64::INFINITY).is_err());
        assert!(finite(f64::NAN).is_err());
    }
}
