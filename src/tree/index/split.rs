// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The X-tree splitter: topological split candidate enumeration constrained
//! by split histories, the minimum-overlap fallback, and the supernode
//! escape hatch

use crate::config::{Limits, OverlapKind};
use crate::error::{Error, Result};
use crate::geometry::{finite, MbrGeometry, Rect};
use crate::tree::history::SplitHistory;
use crate::tree::index::not_nan;
use crate::tree::node::{DirEntry, LeafEntry};
use crate::FP;
use num::Zero;
use ordered_float::{NotNan, OrderedFloat};
use tracing::debug;

/// The sum of all of the mbr's edge lengths
pub trait Margin<P> {
    fn margin(&self) -> P;
}

impl<P: FP, const DIM: usize> Margin<P> for Rect<P, DIM> {
    fn margin(&self) -> P {
        self.edges
            .iter()
            .fold(Zero::zero(), |margin, &(x, y)| margin + y - x)
    }
}

/// Total sort key for one entry edge along an axis
fn axis_key<P: FP, const DIM: usize, E: MbrGeometry<P, DIM>>(
    entry: &E,
    axis: usize,
    edge: usize,
) -> OrderedFloat<f64> {
    let value = if edge == 0 {
        entry.min_for_axis(axis)
    } else {
        entry.max_for_axis(axis)
    };
    OrderedFloat(value.to_f64().unwrap_or(f64::NAN))
}

/// An entry the splitter can partition
pub(crate) trait SplitEntry<P: FP, const DIM: usize>: MbrGeometry<P, DIM> + Clone {
    /// The split history constraining directory partitions; leaves carry
    /// none
    fn split_history(&self) -> Option<&SplitHistory>;
}

impl<P: FP, const DIM: usize> SplitEntry<P, DIM> for LeafEntry<P, DIM> {
    fn split_history(&self) -> Option<&SplitHistory> {
        None
    }
}

impl<P: FP, const DIM: usize> SplitEntry<P, DIM> for DirEntry<P, DIM> {
    fn split_history(&self) -> Option<&SplitHistory> {
        Some(&self.history)
    }
}

/// Count of data points among `entries` lying inside `region`; only
/// consulted for [`OverlapKind::Data`]
pub(crate) type PointCounter<'c, P, const DIM: usize, E> =
    &'c mut dyn FnMut(&[E], &Rect<P, DIM>) -> Result<u64>;

/// A valid partition of an overflowing node's entries
#[derive(Debug)]
pub(crate) struct SplitResult<P: FP, const DIM: usize, E> {
    pub axis: usize,
    pub left: Vec<E>,
    pub left_mbr: Rect<P, DIM>,
    pub right: Vec<E>,
    pub right_mbr: Rect<P, DIM>,
}

/// What the splitter decided for a directory node
#[derive(Debug)]
pub(crate) enum SplitOutcome<P: FP, const DIM: usize, E> {
    Split(SplitResult<P, DIM, E>),
    /// No candidate stayed under the overlap threshold; the node must grow
    /// into a supernode instead. Carries the entries back unpartitioned.
    Supernode(Vec<E>),
}

/// One enumerated candidate: sort by `edge` along `axis`, put the first
/// `index` entries left
#[derive(Debug, Clone, Copy)]
struct Candidate {
    axis: usize,
    edge: usize,
    index: usize,
}

pub(crate) struct XSplitter<'a, P> {
    limits: &'a Limits,
    overlap_kind: OverlapKind,
    max_overlap: P,
}

impl<'a, P: FP> XSplitter<'a, P> {
    pub fn new(limits: &'a Limits, overlap_kind: OverlapKind, max_overlap: f32) -> XSplitter<'a, P> {
        let max_overlap = P::from_f32(max_overlap).unwrap_or_else(P::zero);
        XSplitter {
            limits,
            overlap_kind,
            max_overlap,
        }
    }

    /// Split an overflowing leaf. The history constraint is vacuous and the
    /// overlap threshold does not apply, so this always partitions; a leaf
    /// that cannot be partitioned is a broken invariant.
    pub fn split_leaves<const DIM: usize>(
        &self,
        entries: Vec<LeafEntry<P, DIM>>,
    ) -> Result<SplitResult<P, DIM, LeafEntry<P, DIM>>> {
        let min = self.limits.leaf_min;
        assert!(
            entries.len() >= 2 * min,
            "leaf with {} entries cannot split into halves of {}",
            entries.len(),
            min
        );
        let mut counter = |entries: &[LeafEntry<P, DIM>], region: &Rect<P, DIM>| -> Result<u64> {
            Ok(entries.iter().filter(|e| e.contained_by_mbr(region)).count() as u64)
        };
        let mut entries = entries;
        let axis = self
            .best_topological_axis(&mut entries, min, false)?
            .expect("leaves constrain no axis");
        let (candidate, _overlap) =
            self.best_candidate_on_axis(axis, &mut entries, min, &mut counter)?;
        Ok(self.carve(candidate, entries))
    }

    /// Split an overflowing directory node, or decide that no acceptable
    /// split exists and the node has to become a supernode
    pub fn split_directory<const DIM: usize>(
        &self,
        mut entries: Vec<DirEntry<P, DIM>>,
        counter: PointCounter<'_, P, DIM, DirEntry<P, DIM>>,
    ) -> Result<SplitOutcome<P, DIM, DirEntry<P, DIM>>> {
        // topological phase, bounded by the directory minimum
        if let Some(axis) = self.best_topological_axis(&mut entries, self.limits.dir_min, true)? {
            let (candidate, overlap) =
                self.best_candidate_on_axis(axis, &mut entries, self.limits.dir_min, counter)?;
            if overlap <= self.max_overlap {
                return Ok(SplitOutcome::Split(self.carve(candidate, entries)));
            }
            debug!(axis, overlap = ?overlap, "topological split rejected by overlap threshold");
        }

        // minimum-overlap fallback: every axis and order, history ignored,
        // only the min-fanout bound kept
        let min = self.limits.min_fanout;
        let mut best: Option<(Candidate, NotNan<f64>, NotNan<f64>)> = None;
        for axis in 0..DIM {
            for edge in 0..2 {
                entries.sort_by_key(|e| axis_key(e, axis, edge));
                for index in min..=(entries.len() - min) {
                    let (left_mbr, right_mbr) = self.group_mbrs(&entries, index);
                    let overlap = not_nan(self.overlap_of(
                        &entries[..index],
                        &left_mbr,
                        &entries[index..],
                        &right_mbr,
                        counter,
                    )?)?;
                    let volume =
                        not_nan(finite(left_mbr.volume() + right_mbr.volume())?)?;
                    let candidate = Candidate { axis, edge, index };
                    if best
                        .map(|(_, o, v)| (overlap, volume) < (o, v))
                        .unwrap_or(true)
                    {
                        best = Some((candidate, overlap, volume));
                    }
                }
            }
        }
        let (candidate, overlap, _) = best.expect("min_fanout leaves at least one candidate");
        if P::from_f64(overlap.into_inner()).map(|o| o <= self.max_overlap) == Some(true) {
            debug!(axis = candidate.axis, "minimum-overlap split accepted");
            return Ok(SplitOutcome::Split(self.carve(candidate, entries)));
        }
        debug!(overlap = overlap.into_inner(), "no split under overlap threshold");
        Ok(SplitOutcome::Supernode(entries))
    }

    /// The axis whose candidates have the smallest summed margin, skipping
    /// axes the split histories disagree on when `constrained`
    fn best_topological_axis<const DIM: usize, E: SplitEntry<P, DIM>>(
        &self,
        entries: &mut Vec<E>,
        min: usize,
        constrained: bool,
    ) -> Result<Option<usize>> {
        let mut best: Option<(usize, NotNan<f64>)> = None;
        for axis in 0..DIM {
            if constrained && !Self::histories_agree(entries, axis) {
                continue;
            }
            let mut score = P::zero();
            for edge in 0..2 {
                entries.sort_by_key(|e| axis_key(e, axis, edge));
                for index in min..=(entries.len() - min) {
                    let (left_mbr, right_mbr) = self.group_mbrs(entries, index);
                    score += left_mbr.margin() + right_mbr.margin();
                }
            }
            let score = not_nan(score)?;
            if best.map(|(_, s)| score < s).unwrap_or(true) {
                best = Some((axis, score));
            }
        }
        Ok(best.map(|(axis, _)| axis))
    }

    /// A clean partition needs the axis bit set in all histories or in none
    fn histories_agree<const DIM: usize, E: SplitEntry<P, DIM>>(
        entries: &[E],
        axis: usize,
    ) -> bool {
        let mut used = 0usize;
        for entry in entries {
            if let Some(history) = entry.split_history() {
                if history.contains(axis) {
                    used += 1;
                }
            }
        }
        used == 0 || used == entries.len()
    }

    /// Minimum-overlap candidate along one axis, ties broken by total
    /// volume, then enumeration order
    fn best_candidate_on_axis<const DIM: usize, E: SplitEntry<P, DIM>>(
        &self,
        axis: usize,
        entries: &mut Vec<E>,
        min: usize,
        counter: PointCounter<'_, P, DIM, E>,
    ) -> Result<(Candidate, P)> {
        let mut best: Option<(Candidate, NotNan<f64>, NotNan<f64>)> = None;
        for edge in 0..2 {
            entries.sort_by_key(|e| axis_key(e, axis, edge));
            for index in min..=(entries.len() - min) {
                let (left_mbr, right_mbr) = self.group_mbrs(entries, index);
                let overlap = not_nan(self.overlap_of(
                    &entries[..index],
                    &left_mbr,
                    &entries[index..],
                    &right_mbr,
                    counter,
                )?)?;
                let volume = not_nan(finite(left_mbr.volume() + right_mbr.volume())?)?;
                let candidate = Candidate { axis, edge, index };
                if best
                    .map(|(_, o, v)| (overlap, volume) < (o, v))
                    .unwrap_or(true)
                {
                    best = Some((candidate, overlap, volume));
                }
            }
        }
        let (candidate, overlap, _) = best.expect("candidate range validated at construction");
        let overlap = P::from_f64(overlap.into_inner()).ok_or(Error::NumericOverflow)?;
        Ok((candidate, overlap))
    }

    fn group_mbrs<const DIM: usize, E: MbrGeometry<P, DIM>>(
        &self,
        entries: &[E],
        index: usize,
    ) -> (Rect<P, DIM>, Rect<P, DIM>) {
        (
            Rect::union_of(entries[..index].iter()),
            Rect::union_of(entries[index..].iter()),
        )
    }

    /// The configured overlap measure for one candidate partition
    fn overlap_of<const DIM: usize, E: SplitEntry<P, DIM>>(
        &self,
        left: &[E],
        left_mbr: &Rect<P, DIM>,
        right: &[E],
        right_mbr: &Rect<P, DIM>,
        counter: PointCounter<'_, P, DIM, E>,
    ) -> Result<P> {
        match self.overlap_kind {
            OverlapKind::Volume => {
                let shared = finite(left_mbr.volume_overlapped_with_mbr(right_mbr))?;
                let total = finite(left_mbr.volume() + right_mbr.volume())?;
                if total == P::zero() {
                    return Ok(P::zero());
                }
                finite(shared / total)
            }
            OverlapKind::Data => {
                let region = match left_mbr.intersection(right_mbr) {
                    Some(region) => region,
                    None => return Ok(P::zero()),
                };
                let shared = counter(left, &region)? + counter(right, &region)?;
                let total = counter(left, left_mbr)? + counter(right, right_mbr)?;
                if total == 0 {
                    return Ok(P::zero());
                }
                let shared = P::from_u64(shared).ok_or(Error::NumericOverflow)?;
                let total = P::from_u64(total).ok_or(Error::NumericOverflow)?;
                finite(shared / total)
            }
        }
    }

    fn carve<const DIM: usize, E: SplitEntry<P, DIM>>(
        &self,
        candidate: Candidate,
        mut entries: Vec<E>,
    ) -> SplitResult<P, DIM, E> {
        entries.sort_by_key(|e| axis_key(e, candidate.axis, candidate.edge));
        let right = entries.split_off(candidate.index);
        let left_mbr = Rect::union_of(entries.iter());
        let right_mbr = Rect::union_of(right.iter());
        SplitResult {
            axis: candidate.axis,
            left: entries,
            left_mbr,
            right,
            right_mbr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::XTreeOptions;
    use crate::geometry::Point;

    fn limits() -> Limits {
        XTreeOptions::new()
            .with_page_size(256)
            .with_capacities(4, 4)
            .limits(2)
            .unwrap()
    }

    fn leaf(id: u64, x: f64, y: f64) -> LeafEntry<f64, 2> {
        LeafEntry {
            id,
            point: Point::new([x, y]),
        }
    }

    fn dir(child: u32, lo: [f64; 2], hi: [f64; 2], history: SplitHistory) -> DirEntry<f64, 2> {
        DirEntry {
            child,
            mbr: Rect::from_corners(lo, hi),
            history,
        }
    }

    fn no_count(
    ) -> impl FnMut(&[DirEntry<f64, 2>], &Rect<f64, 2>) -> Result<u64> {
        |_, _| unreachable!("volume overlap never counts points")
    }

    #[test]
    fn leaf_split_is_balanced_and_disjoint() {
        let limits = limits();
        let splitter: XSplitter<f64> = XSplitter::new(&limits, OverlapKind::Volume, 0.2);
        let entries = vec![
            leaf(1, 0.0, 0.0),
            leaf(2, 1.0, 0.0),
            leaf(3, 0.0, 1.0),
            leaf(4, 1.0, 1.0),
            leaf(5, 0.5, 0.5),
        ];
        let result = splitter.split_leaves(entries).unwrap();
        assert!(result.left.len() >= limits.leaf_min);
        assert!(result.right.len() >= limits.leaf_min);
        assert_eq!(5, result.left.len() + result.right.len());
        assert_eq!(
            0.0,
            result.left_mbr.volume_overlapped_with_mbr(&result.right_mbr)
        );
    }

    #[test]
    fn collinear_points_split_along_their_spread() {
        let limits = limits();
        let splitter: XSplitter<f64> = XSplitter::new(&limits, OverlapKind::Volume, 0.2);
        let entries = (0..5).map(|i| leaf(i, 0.0, i as f64)).collect();
        let result = splitter.split_leaves(entries).unwrap();
        assert_eq!(1, result.axis);
    }

    #[test]
    fn history_restricts_candidate_axes() {
        let limits = limits();
        let splitter: XSplitter<f64> = XSplitter::new(&limits, OverlapKind::Volume, 0.2);
        let mut split_on_x = SplitHistory::new();
        split_on_x.set(0);
        // histories disagree on axis 0 but agree (all clear) on axis 1;
        // geometry alone would prefer axis 0
        let entries = vec![
            dir(1, [0.0, 0.0], [1.0, 1.0], split_on_x),
            dir(2, [10.0, 0.2], [11.0, 1.2], SplitHistory::new()),
            dir(3, [20.0, 0.4], [21.0, 1.4], split_on_x),
            dir(4, [30.0, 0.6], [31.0, 1.6], SplitHistory::new()),
            dir(5, [40.0, 0.8], [41.0, 1.8], SplitHistory::new()),
        ];
        match splitter.split_directory(entries, &mut no_count()).unwrap() {
            SplitOutcome::Split(result) => assert_eq!(1, result.axis),
            SplitOutcome::Supernode(_) => panic!("expected a split"),
        }
    }

    #[test]
    fn identical_mbrs_become_a_supernode() {
        let limits = limits();
        let splitter: XSplitter<f64> = XSplitter::new(&limits, OverlapKind::Volume, 0.2);
        let entries: Vec<_> = (0..5)
            .map(|i| dir(i, [0.0, 0.0], [1.0, 1.0], SplitHistory::new()))
            .collect();
        match splitter.split_directory(entries, &mut no_count()).unwrap() {
            SplitOutcome::Supernode(entries) => assert_eq!(5, entries.len()),
            SplitOutcome::Split(_) => panic!("identical rectangles admit no clean split"),
        }
    }

    #[test]
    fn fallback_ignores_history_when_no_axis_agrees() {
        let limits = limits();
        let splitter: XSplitter<f64> = XSplitter::new(&limits, OverlapKind::Volume, 0.2);
        let mut split_on_x = SplitHistory::new();
        split_on_x.set(0);
        let mut split_on_y = SplitHistory::new();
        split_on_y.set(1);
        let mut both = split_on_x;
        both.set(1);
        // every axis has a mixed history, yet the rectangles separate
        // cleanly along x, so the fallback still finds a split
        let entries = vec![
            dir(1, [0.0, 0.0], [1.0, 1.0], split_on_x),
            dir(2, [2.0, 0.0], [3.0, 1.0], split_on_y),
            dir(3, [4.0, 0.0], [5.0, 1.0], both),
            dir(4, [6.0, 0.0], [7.0, 1.0], split_on_y),
            dir(5, [8.0, 0.0], [9.0, 1.0], split_on_x),
        ];
        match splitter.split_directory(entries, &mut no_count()).unwrap() {
            SplitOutcome::Split(result) => {
                assert_eq!(0, result.axis);
                assert!(result.left.len() >= limits.min_fanout);
                assert!(result.right.len() >= limits.min_fanout);
            }
            SplitOutcome::Supernode(_) => panic!("expected the fallback to split"),
        }
    }

    #[test]
    fn data_overlap_counts_points_in_the_intersection() {
        let limits = limits();
        let splitter: XSplitter<f64> = XSplitter::new(&limits, OverlapKind::Data, 0.5);
        // four points pull apart, the fifth sits between the groups
        let entries = vec![
            leaf(1, 0.0, 0.0),
            leaf(2, 0.0, 1.0),
            leaf(3, 5.0, 0.5),
            leaf(4, 5.0, 1.5),
            leaf(5, 2.5, 0.75),
        ];
        let result = splitter.split_leaves(entries).unwrap();
        let left_ids: Vec<u64> = result.left.iter().map(|e| e.id).collect();
        assert!(left_ids.contains(&1) && left_ids.contains(&2));
    }

    #[test]
    fn margin_sums_edges() {
        let rect: Rect<f64, 3> = Rect::from_corners([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        approx::assert_relative_eq!(3.0f64, rect.margin());
    }
}
