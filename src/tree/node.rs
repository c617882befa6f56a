// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Paged tree nodes and their entries

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::geometry::{MbrGeometry, Point, Rect};
use crate::store::{get_f64, get_u32, get_u64, get_u8, put_f64, put_u32, put_u64, put_u8};
use crate::tree::history::SplitHistory;
use crate::FP;
use std::mem;

pub type PageId = u32;

/// The root always lives on this page, surviving root splits
pub const ROOT_PAGE_ID: PageId = 0;

/// `page_id: u32, is_leaf: u8, is_super: u8, num_entries: u32, capacity: u32`
pub(crate) const NODE_PRELUDE_BYTES: usize = 14;

/// Serialized size of one leaf entry: id plus one f64 per coordinate
pub(crate) fn leaf_entry_disk_bytes(dim: usize) -> usize {
    8 + 8 * dim
}

/// Serialized size of one directory entry: child page id, two f64 per
/// dimension, split history bits
pub(crate) fn dir_entry_disk_bytes(dim: usize) -> usize {
    4 + 16 * dim + 8
}

/// A point plus its external identifier
#[derive(Debug, Clone, PartialEq)]
pub struct LeafEntry<P, const DIM: usize> {
    pub id: u64,
    pub point: Point<P, DIM>,
}

impl<P: FP, const DIM: usize> MbrGeometry<P, DIM> for LeafEntry<P, DIM> {
    fn dim(&self) -> usize {
        self.point.dim()
    }

    fn volume(&self) -> P {
        self.point.volume()
    }

    fn min_for_axis(&self, axis: usize) -> P {
        self.point.min_for_axis(axis)
    }

    fn max_for_axis(&self, axis: usize) -> P {
        self.point.max_for_axis(axis)
    }

    fn expand_mbr_to_fit(&self, mbr: &mut Rect<P, DIM>) {
        self.point.expand_mbr_to_fit(mbr)
    }

    fn distance_from_mbr_center(&self, mbr: &Rect<P, DIM>) -> P {
        self.point.distance_from_mbr_center(mbr)
    }

    fn contained_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool {
        self.point.contained_by_mbr(mbr)
    }

    fn overlapped_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool {
        self.point.overlapped_by_mbr(mbr)
    }

    fn volume_overlapped_with_mbr(&self, mbr: &Rect<P, DIM>) -> P {
        self.point.volume_overlapped_with_mbr(mbr)
    }
}

/// A child page reference with its bounding rectangle and split history
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry<P, const DIM: usize> {
    pub child: PageId,
    pub mbr: Rect<P, DIM>,
    pub history: SplitHistory,
}

impl<P: FP, const DIM: usize> MbrGeometry<P, DIM> for DirEntry<P, DIM> {
    fn dim(&self) -> usize {
        self.mbr.dim()
    }

    fn volume(&self) -> P {
        self.mbr.volume()
    }

    fn min_for_axis(&self, axis: usize) -> P {
        self.mbr.min_for_axis(axis)
    }

    fn max_for_axis(&self, axis: usize) -> P {
        self.mbr.max_for_axis(axis)
    }

    fn expand_mbr_to_fit(&self, mbr: &mut Rect<P, DIM>) {
        self.mbr.expand_mbr_to_fit(mbr)
    }

    fn distance_from_mbr_center(&self, mbr: &Rect<P, DIM>) -> P {
        self.mbr.distance_from_mbr_center(mbr)
    }

    fn contained_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool {
        self.mbr.contained_by_mbr(mbr)
    }

    fn overlapped_by_mbr(&self, mbr: &Rect<P, DIM>) -> bool {
        self.mbr.overlapped_by_mbr(mbr)
    }

    fn volume_overlapped_with_mbr(&self, mbr: &Rect<P, DIM>) -> P {
        self.mbr.volume_overlapped_with_mbr(mbr)
    }
}

/// One page of the tree. Either holds leaf entries, directory entries at
/// regular capacity, or directory entries in a grown supernode.
#[derive(Debug, Clone)]
pub enum XTreeNode<P: FP, const DIM: usize> {
    /// Contains only points
    Leaves {
        page_id: PageId,
        children: Vec<LeafEntry<P, DIM>>,
    },
    /// Contains only child references
    Level {
        page_id: PageId,
        children: Vec<DirEntry<P, DIM>>,
    },
    /// A directory node grown past `dir_cap`; never splits, lives in memory
    /// and is appended behind the paged region on commit
    Super {
        page_id: PageId,
        capacity: usize,
        children: Vec<DirEntry<P, DIM>>,
    },
}

impl<P: FP, const DIM: usize> XTreeNode<P, DIM> {
    /// Create an empty leaf page
    pub fn new_leaves(page_id: PageId) -> XTreeNode<P, DIM> {
        XTreeNode::Leaves {
            page_id,
            children: Vec::new(),
        }
    }

    pub fn page_id(&self) -> PageId {
        match *self {
            XTreeNode::Leaves { page_id, .. }
            | XTreeNode::Level { page_id, .. }
            | XTreeNode::Super { page_id, .. } => page_id,
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            XTreeNode::Leaves { ref children, .. } => children.len(),
            XTreeNode::Level { ref children, .. } | XTreeNode::Super { ref children, .. } => {
                children.len()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_leaves(&self) -> bool {
        matches!(*self, XTreeNode::Leaves { .. })
    }

    pub fn is_super(&self) -> bool {
        matches!(*self, XTreeNode::Super { .. })
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match *self {
            XTreeNode::Leaves { .. } => "leaf",
            XTreeNode::Level { .. } => "directory",
            XTreeNode::Super { .. } => "super",
        }
    }

    /// Entries this node may hold at rest; one more fits transiently while
    /// overflow treatment runs
    pub fn capacity(&self, limits: &Limits) -> usize {
        match *self {
            XTreeNode::Leaves { .. } => limits.leaf_cap,
            XTreeNode::Level { .. } => limits.dir_cap,
            XTreeNode::Super { capacity, .. } => capacity,
        }
    }

    /// Fewest entries allowed at rest for a non-root node
    pub fn minimum(&self, limits: &Limits) -> usize {
        match *self {
            XTreeNode::Leaves { .. } => limits.leaf_min,
            XTreeNode::Level { .. } => limits.dir_min,
            // supernodes carry no lower bound
            XTreeNode::Super { .. } => 0,
        }
    }

    /// The tight bounding rectangle over the node's entries
    pub fn mbr(&self) -> Rect<P, DIM> {
        match *self {
            XTreeNode::Leaves { ref children, .. } => Rect::union_of(children.iter()),
            XTreeNode::Level { ref children, .. } | XTreeNode::Super { ref children, .. } => {
                Rect::union_of(children.iter())
            }
        }
    }

    pub fn leaf_children(&self) -> &[LeafEntry<P, DIM>] {
        match *self {
            XTreeNode::Leaves { ref children, .. } => children,
            _ => unreachable!("directory node treated as leaf"),
        }
    }

    pub fn dir_children(&self) -> &[DirEntry<P, DIM>] {
        match *self {
            XTreeNode::Level { ref children, .. } | XTreeNode::Super { ref children, .. } => {
                children
            }
            _ => unreachable!("leaf node treated as directory"),
        }
    }

    pub fn dir_children_mut(&mut self) -> &mut Vec<DirEntry<P, DIM>> {
        match *self {
            XTreeNode::Level {
                ref mut children, ..
            }
            | XTreeNode::Super {
                ref mut children, ..
            } => children,
            _ => unreachable!("leaf node treated as directory"),
        }
    }

    pub fn push_leaf(&mut self, entry: LeafEntry<P, DIM>) {
        match *self {
            XTreeNode::Leaves {
                ref mut children, ..
            } => children.push(entry),
            _ => unreachable!("directory node treated as leaf"),
        }
    }

    pub fn push_dir(&mut self, entry: DirEntry<P, DIM>) {
        self.dir_children_mut().push(entry)
    }

    /// Reclassify an overfull directory node as a supernode with one growth
    /// step of headroom
    pub fn make_super(&mut self, dir_cap: usize) {
        let page_id = self.page_id();
        match *self {
            XTreeNode::Level {
                ref mut children, ..
            } => {
                let children = mem::take(children);
                *self = XTreeNode::Super {
                    page_id,
                    capacity: 2 * dir_cap,
                    children,
                };
            }
            _ => unreachable!("only directory nodes become supernodes"),
        }
    }

    /// Add one growth step of capacity, returning the new capacity
    pub fn grow_super(&mut self, dir_cap: usize) -> usize {
        match *self {
            XTreeNode::Super {
                ref mut capacity, ..
            } => {
                *capacity += dir_cap;
                *capacity
            }
            _ => unreachable!("only supernodes grow"),
        }
    }

    /// Remove one growth step of capacity. At exactly `dir_cap` the node
    /// reverts to a normal directory node. Returns the new capacity.
    pub fn shrink_super(&mut self, dir_cap: usize) -> usize {
        let page_id = self.page_id();
        match *self {
            XTreeNode::Super {
                ref mut capacity,
                ref mut children,
                ..
            } => {
                assert!(*capacity > dir_cap, "supernode shrunk below one page");
                *capacity -= dir_cap;
                let new_capacity = *capacity;
                debug_assert!(children.len() <= new_capacity);
                if new_capacity == dir_cap {
                    let children = mem::take(children);
                    *self = XTreeNode::Level { page_id, children };
                }
                new_capacity
            }
            _ => unreachable!("only supernodes shrink"),
        }
    }

    /// Contiguous page slots this node occupies on disk
    pub fn page_span(&self, limits: &Limits) -> usize {
        match *self {
            XTreeNode::Super { capacity, .. } => {
                (capacity + limits.dir_cap - 1) / limits.dir_cap
            }
            _ => 1,
        }
    }

    /// Prelude plus entries, little-endian. The caller pads to the page (or
    /// supernode) budget.
    pub fn serialize(&self, limits: &Limits) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(NODE_PRELUDE_BYTES);
        put_u32(&mut buf, self.page_id());
        put_u8(&mut buf, self.has_leaves() as u8);
        put_u8(&mut buf, self.is_super() as u8);
        put_u32(&mut buf, self.len() as u32);
        put_u32(&mut buf, self.capacity(limits) as u32);
        match *self {
            XTreeNode::Leaves { ref children, .. } => {
                for entry in children {
                    put_u64(&mut buf, entry.id);
                    for coord in entry.point.coords.iter() {
                        put_f64(&mut buf, coord.to_f64().ok_or(Error::NumericOverflow)?);
                    }
                }
            }
            XTreeNode::Level { ref children, .. } | XTreeNode::Super { ref children, .. } => {
                for entry in children {
                    put_u32(&mut buf, entry.child);
                    for &(lo, hi) in entry.mbr.edges.iter() {
                        put_f64(&mut buf, lo.to_f64().ok_or(Error::NumericOverflow)?);
                        put_f64(&mut buf, hi.to_f64().ok_or(Error::NumericOverflow)?);
                    }
                    put_u64(&mut buf, entry.history.bits());
                }
            }
        }
        Ok(buf)
    }

    /// Rebuild a node from its page bytes
    pub fn deserialize(bytes: &[u8], limits: &Limits) -> Result<XTreeNode<P, DIM>> {
        let mut pos = 0;
        let page_id = get_u32(bytes, &mut pos)?;
        let is_leaf = get_u8(bytes, &mut pos)? != 0;
        let is_super = get_u8(bytes, &mut pos)? != 0;
        let num_entries = get_u32(bytes, &mut pos)? as usize;
        let capacity = get_u32(bytes, &mut pos)? as usize;

        if is_leaf && is_super {
            return Err(Error::CorruptFile(format!(
                "page {} flagged both leaf and super",
                page_id
            )));
        }
        let declared = if is_leaf {
            limits.leaf_cap
        } else if is_super {
            capacity
        } else {
            limits.dir_cap
        };
        if capacity != declared || num_entries > capacity + 1 {
            return Err(Error::CorruptFile(format!(
                "page {} declares {} entries in capacity {}",
                page_id, num_entries, capacity
            )));
        }
        if is_super && (capacity <= limits.dir_cap || capacity % limits.dir_cap != 0) {
            return Err(Error::CorruptFile(format!(
                "page {} declares supernode capacity {} not a multiple of {}",
                page_id, capacity, limits.dir_cap
            )));
        }

        if is_leaf {
            let mut children = Vec::with_capacity(num_entries);
            for _ in 0..num_entries {
                let id = get_u64(bytes, &mut pos)?;
                let mut coords = [P::default(); DIM];
                for coord in coords.iter_mut() {
                    let raw = get_f64(bytes, &mut pos)?;
                    *coord = P::from_f64(raw).filter(|c| c.is_finite()).ok_or_else(|| {
                        Error::CorruptFile(format!("page {} holds coordinate {}", page_id, raw))
                    })?;
                }
                children.push(LeafEntry {
                    id,
                    point: Point { coords },
                });
            }
            return Ok(XTreeNode::Leaves { page_id, children });
        }

        let mut children = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            let child = get_u32(bytes, &mut pos)?;
            let mut edges = [(P::default(), P::default()); DIM];
            for edge in edges.iter_mut() {
                let lo = get_f64(bytes, &mut pos)?;
                let hi = get_f64(bytes, &mut pos)?;
                if !lo.is_finite() || !hi.is_finite() || hi < lo {
                    return Err(Error::CorruptFile(format!(
                        "page {} holds bad edge ({}, {})",
                        page_id, lo, hi
                    )));
                }
                let lo = P::from_f64(lo).ok_or_else(|| {
                    Error::CorruptFile(format!("page {} holds coordinate {}", page_id, lo))
                })?;
                let hi = P::from_f64(hi).ok_or_else(|| {
                    Error::CorruptFile(format!("page {} holds coordinate {}", page_id, hi))
                })?;
                *edge = (lo, hi);
            }
            let history = SplitHistory::from_bits(get_u64(bytes, &mut pos)?);
            children.push(DirEntry {
                child,
                mbr: Rect { edges },
                history,
            });
        }
        if is_super {
            Ok(XTreeNode::Super {
                page_id,
                capacity,
                children,
            })
        } else {
            Ok(XTreeNode::Level { page_id, children })
        }
    }
}
