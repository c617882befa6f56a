// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Choose-subtree descent and the insertion driver: overflow treatment,
//! forced reinsertion, split installation, root growth

use crate::error::Result;
use crate::geometry::{finite, MbrGeometry, Point, Rect};
use crate::tree::history::SplitHistory;
use crate::tree::index::split::{SplitOutcome, SplitResult, XSplitter};
use crate::tree::index::{not_nan, InsertionPath, PathStep, ReinsertedLevels};
use crate::tree::node::{DirEntry, LeafEntry, PageId, XTreeNode, ROOT_PAGE_ID};
use crate::tree::XTree;
use crate::FP;
use ordered_float::NotNan;
use tracing::{debug, trace};

/// Insertion level of leaf entries; directory levels count up from here
const LEAF_LEVEL: usize = 1;

impl<P: FP, const DIM: usize> XTree<P, DIM> {
    /// Insert one point under an external identifier.
    ///
    /// The point descends to a leaf along the minimum-overlap path; on the
    /// way back up overflows are treated with forced reinsertion first,
    /// then an X-split, and at worst a supernode conversion.
    pub fn insert(&mut self, point: Point<P, DIM>, id: u64) -> Result<()> {
        for &coord in point.coords.iter() {
            finite(coord)?;
        }
        let mut reinserted = ReinsertedLevels::new();
        self.insert_leaf_entry(LeafEntry { id, point }, &mut reinserted)?;
        self.num_elements += 1;
        trace!(id, num_elements = self.num_elements, "inserted point");
        Ok(())
    }

    fn insert_leaf_entry(
        &mut self,
        entry: LeafEntry<P, DIM>,
        reinserted: &mut ReinsertedLevels,
    ) -> Result<()> {
        let target = entry.point.to_mbr();
        let path = self.choose_subtree(&target, LEAF_LEVEL)?;
        let step = path[path.len() - 1];
        let mut leaf = self.read_node(step.page_id)?;
        let grown = leaf.is_empty() || !target.contained_by_mbr(&leaf.mbr());
        leaf.push_leaf(entry);
        self.write_node(&leaf)?;
        if leaf.len() <= leaf.capacity(&self.limits) && (path.len() == 1 || !grown) {
            return Ok(());
        }
        self.adjust_tree(path, reinserted)
    }

    fn insert_dir_entry(
        &mut self,
        entry: DirEntry<P, DIM>,
        level: usize,
        reinserted: &mut ReinsertedLevels,
    ) -> Result<()> {
        let target = entry.mbr.clone();
        let path = self.choose_subtree(&target, level)?;
        let step = path[path.len() - 1];
        let mut node = self.read_node(step.page_id)?;
        let grown = node.is_empty() || !target.contained_by_mbr(&node.mbr());
        node.push_dir(entry);
        self.write_node(&node)?;
        if node.len() <= node.capacity(&self.limits) && (path.len() == 1 || !grown) {
            return Ok(());
        }
        self.adjust_tree(path, reinserted)
    }

    /// Descend from the root to a node at `target_level`, minimizing
    /// overlap enlargement, then volume enlargement, then volume
    fn choose_subtree(&self, target: &Rect<P, DIM>, target_level: usize) -> Result<InsertionPath> {
        let mut path = Vec::with_capacity(self.height);
        let mut page_id = ROOT_PAGE_ID;
        let mut level = self.height;
        loop {
            if level == target_level {
                path.push(PathStep { page_id, branch: 0 });
                return Ok(path);
            }
            let node = self.read_node(page_id)?;
            let branch = self.pick_child(&node, target, level)?;
            page_id = node.dir_children()[branch].child;
            path.push(PathStep { page_id: node.page_id(), branch });
            level -= 1;
        }
    }

    fn pick_child(
        &self,
        node: &XTreeNode<P, DIM>,
        target: &Rect<P, DIM>,
        level: usize,
    ) -> Result<usize> {
        let children = node.dir_children();

        // any child already covering the target wins by volume
        let mut covering: Option<(usize, NotNan<f64>)> = None;
        for (i, child) in children.iter().enumerate() {
            if target.contained_by_mbr(&child.mbr) {
                let volume = not_nan(child.mbr.volume())?;
                if covering.map(|(_, v)| volume < v).unwrap_or(true) {
                    covering = Some((i, volume));
                }
            }
        }
        if let Some((branch, _)) = covering {
            return Ok(branch);
        }

        // overlap enlargement only matters above leaves, and supernodes
        // skip it unless the optimization was turned off
        let children_are_leaves = level == LEAF_LEVEL + 1;
        let consider_overlap = children_are_leaves
            && (!node.is_super() || !self.options.omit_overlap_for_supernodes);

        let mut best: Option<(usize, (NotNan<f64>, NotNan<f64>, NotNan<f64>))> = None;
        for (i, child) in children.iter().enumerate() {
            let mut test = child.mbr.clone();
            target.expand_mbr_to_fit(&mut test);
            let overlap_delta = if consider_overlap {
                overlap_increase(children, i, &test)?
            } else {
                P::zero()
            };
            let volume = finite(child.mbr.volume())?;
            let enlargement = finite(test.volume())? - volume;
            let key = (not_nan(overlap_delta)?, not_nan(enlargement)?, not_nan(volume)?);
            if best.map(|(_, k)| key < k).unwrap_or(true) {
                best = Some((i, key));
            }
        }
        Ok(best.expect("directory node holds at least one child").0)
    }

    /// Walk from the insertion target back to the root, treating overflows
    /// and keeping parent mbrs tight
    fn adjust_tree(
        &mut self,
        mut path: InsertionPath,
        reinserted: &mut ReinsertedLevels,
    ) -> Result<()> {
        loop {
            let depth = path.len();
            let page_id = path[depth - 1].page_id;
            let level = self.height + 1 - depth;
            let mut node = self.read_node(page_id)?;

            if node.len() > node.capacity(&self.limits) {
                if node.is_super() {
                    let capacity = node.grow_super(self.limits.dir_cap);
                    debug!(page_id, capacity, "supernode grown");
                    self.write_node(&node)?;
                } else if depth > 1 && !reinserted.contains(level) {
                    reinserted.mark(level);
                    return self.reinsert(node, path, level, reinserted);
                } else {
                    let splitter: XSplitter<P> = XSplitter::new(
                        &self.limits,
                        self.options.overlap_kind,
                        self.options.max_overlap,
                    );
                    node = match node {
                        XTreeNode::Leaves { page_id, children } => {
                            let result = splitter.split_leaves(children)?;
                            if self.install_split(&mut path, page_id, result, XTreeNode::leaves_from)? {
                                return Ok(());
                            }
                            continue;
                        }
                        XTreeNode::Level { page_id, children } => {
                            let outcome = {
                                let mut counter =
                                    |entries: &[DirEntry<P, DIM>], region: &Rect<P, DIM>| {
                                        self.count_points_within(entries, region)
                                    };
                                splitter.split_directory(children, &mut counter)?
                            };
                            match outcome {
                                SplitOutcome::Split(result) => {
                                    if self.install_split(
                                        &mut path,
                                        page_id,
                                        result,
                                        XTreeNode::level_from,
                                    )? {
                                        return Ok(());
                                    }
                                    continue;
                                }
                                SplitOutcome::Supernode(children) => {
                                    let mut node = XTreeNode::Level { page_id, children };
                                    node.make_super(self.limits.dir_cap);
                                    debug!(page_id, "no acceptable split, node became a supernode");
                                    self.write_node(&node)?;
                                    node
                                }
                            }
                        }
                        XTreeNode::Super { .. } => unreachable!("supernodes grow instead of split"),
                    };
                }
            }

            // tighten the parent entry; propagation stops with the first
            // unchanged mbr
            if depth == 1 {
                return Ok(());
            }
            let parent_step = path[depth - 2];
            let mut parent = self.read_node(parent_step.page_id)?;
            let mbr = node.mbr();
            if parent.dir_children()[parent_step.branch].mbr == mbr {
                return Ok(());
            }
            parent.dir_children_mut()[parent_step.branch].mbr = mbr;
            self.write_node(&parent)?;
            path.pop();
        }
    }

    /// Write both halves of a split and hook the new sibling into the
    /// parent, or grow a new root. Returns true when the walk is finished.
    fn install_split<E>(
        &mut self,
        path: &mut InsertionPath,
        page_id: PageId,
        result: SplitResult<P, DIM, E>,
        build: fn(PageId, Vec<E>) -> XTreeNode<P, DIM>,
    ) -> Result<bool> {
        let depth = path.len();
        if depth == 1 {
            // the root keeps its well-known page; both halves move to
            // freshly allocated pages
            let left_id = self.store.alloc();
            let right_id = self.store.alloc();
            self.write_node(&build(left_id, result.left))?;
            self.write_node(&build(right_id, result.right))?;
            let mut history = SplitHistory::new();
            history.set(result.axis);
            let root = XTreeNode::Level {
                page_id: ROOT_PAGE_ID,
                children: vec![
                    DirEntry {
                        child: left_id,
                        mbr: result.left_mbr,
                        history,
                    },
                    DirEntry {
                        child: right_id,
                        mbr: result.right_mbr,
                        history,
                    },
                ],
            };
            self.write_node(&root)?;
            self.height += 1;
            debug!(height = self.height, axis = result.axis, "root split");
            return Ok(true);
        }

        let right_id = self.store.alloc();
        self.write_node(&build(page_id, result.left))?;
        self.write_node(&build(right_id, result.right))?;

        let parent_step = path[depth - 2];
        let mut parent = self.read_node(parent_step.page_id)?;
        {
            let entries = parent.dir_children_mut();
            // both halves share the old entry's history plus the new axis
            let mut history = entries[parent_step.branch].history;
            history.set(result.axis);
            entries[parent_step.branch] = DirEntry {
                child: page_id,
                mbr: result.left_mbr,
                history,
            };
            entries.push(DirEntry {
                child: right_id,
                mbr: result.right_mbr,
                history,
            });
        }
        self.write_node(&parent)?;
        debug!(page_id, sibling = right_id, axis = result.axis, "node split");
        path.pop();
        Ok(false)
    }

    /// R*-style forced reinsertion: drop the entries farthest from the
    /// node's center and route them back in from the root at the same level
    fn reinsert(
        &mut self,
        mut node: XTreeNode<P, DIM>,
        path: InsertionPath,
        level: usize,
        reinserted: &mut ReinsertedLevels,
    ) -> Result<()> {
        // the configuration guarantees the removal leaves the node at or
        // above its minimum
        let count = self.options.reinsert_count(node.capacity(&self.limits));
        debug_assert!(count >= 1 && node.len() >= count + node.minimum(&self.limits));
        let center_mbr = node.mbr();
        debug!(page_id = node.page_id(), count, level, "forced reinsertion");

        match node {
            XTreeNode::Leaves {
                ref mut children, ..
            } => {
                children.sort_by_key(|e| {
                    not_nan(e.distance_from_mbr_center(&center_mbr)).unwrap_or_else(|_| {
                        NotNan::new(f64::MAX).unwrap()
                    })
                });
                let keep = children.len() - count;
                let removed = children.split_off(keep);
                self.write_node(&node)?;
                self.propagate_mbr(&path)?;
                for entry in removed {
                    self.insert_leaf_entry(entry, reinserted)?;
                }
            }
            XTreeNode::Level {
                ref mut children, ..
            }
            | XTreeNode::Super {
                ref mut children, ..
            } => {
                children.sort_by_key(|e| {
                    not_nan(e.distance_from_mbr_center(&center_mbr)).unwrap_or_else(|_| {
                        NotNan::new(f64::MAX).unwrap()
                    })
                });
                let keep = children.len() - count;
                let removed = children.split_off(keep);
                if node.is_super() {
                    self.shrink_receded_supernode(&mut node);
                }
                self.write_node(&node)?;
                self.propagate_mbr(&path)?;
                for entry in removed {
                    self.insert_dir_entry(entry, level, reinserted)?;
                }
            }
        }
        Ok(())
    }

    /// Update ancestor entry mbrs along `path` after the deepest node
    /// shrank or grew; stops at the first unchanged entry
    pub(crate) fn propagate_mbr(&mut self, path: &[PathStep]) -> Result<()> {
        for depth in (1..path.len()).rev() {
            let node = self.read_node(path[depth].page_id)?;
            let parent_step = path[depth - 1];
            let mut parent = self.read_node(parent_step.page_id)?;
            let mbr = node.mbr();
            if parent.dir_children()[parent_step.branch].mbr == mbr {
                return Ok(());
            }
            parent.dir_children_mut()[parent_step.branch].mbr = mbr;
            self.write_node(&parent)?;
        }
        Ok(())
    }

    /// Data points under `entries` falling inside `region`; drives the
    /// [`OverlapKind::Data`](crate::OverlapKind) split measure
    fn count_points_within(
        &self,
        entries: &[DirEntry<P, DIM>],
        region: &Rect<P, DIM>,
    ) -> Result<u64> {
        let mut count = 0u64;
        let mut stack: Vec<PageId> = entries
            .iter()
            .filter(|e| e.mbr.overlapped_by_mbr(region))
            .map(|e| e.child)
            .collect();
        while let Some(page_id) = stack.pop() {
            match self.read_node(page_id)? {
                XTreeNode::Leaves { children, .. } => {
                    count += children
                        .iter()
                        .filter(|e| e.point.contained_by_mbr(region))
                        .count() as u64;
                }
                XTreeNode::Level { children, .. } | XTreeNode::Super { children, .. } => {
                    stack.extend(
                        children
                            .iter()
                            .filter(|e| e.mbr.overlapped_by_mbr(region))
                            .map(|e| e.child),
                    );
                }
            }
        }
        Ok(count)
    }
}

/// Incremental change in summed sibling intersection when entry `i`'s mbr
/// is replaced by `test`. Only dimensions where `test` differs from the old
/// mbr can change a product; a dimension where neither rectangle meets the
/// sibling zeroes both products out.
fn overlap_increase<P: FP, const DIM: usize>(
    children: &[DirEntry<P, DIM>],
    i: usize,
    test: &Rect<P, DIM>,
) -> Result<P> {
    let old = &children[i].mbr;
    let mut sum = P::zero();
    'sibling: for (j, sibling) in children.iter().enumerate() {
        if j == i {
            continue;
        }
        let mut common = num::one::<P>();
        let mut old_part = num::one::<P>();
        let mut new_part = num::one::<P>();
        for d in 0..DIM {
            let (s_lo, s_hi) = sibling.mbr.edges[d];
            let (t_lo, t_hi) = test.edges[d];
            let (o_lo, o_hi) = old.edges[d];
            let new_len = t_hi.min(s_hi) - t_lo.max(s_lo);
            if t_lo == o_lo && t_hi == o_hi {
                if new_len <= P::zero() {
                    continue 'sibling;
                }
                common = common * new_len;
            } else {
                new_part = new_part * new_len.max(P::zero());
                old_part = old_part * (o_hi.min(s_hi) - o_lo.max(s_lo)).max(P::zero());
            }
        }
        sum += common * (new_part - old_part);
    }
    finite(sum)
}

impl<P: FP, const DIM: usize> XTreeNode<P, DIM> {
    fn leaves_from(page_id: PageId, children: Vec<LeafEntry<P, DIM>>) -> XTreeNode<P, DIM> {
        XTreeNode::Leaves { page_id, children }
    }

    fn level_from(page_id: PageId, children: Vec<DirEntry<P, DIM>>) -> XTreeNode<P, DIM> {
        XTreeNode::Level { page_id, children }
    }
}
