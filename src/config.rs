// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Index construction options and the node capacities derived from them

use crate::error::{Error, Result};
use crate::tree::history::SplitHistory;
use crate::tree::node::{dir_entry_disk_bytes, leaf_entry_disk_bytes, NODE_PRELUDE_BYTES};
use std::cmp;

const D_PAGE_SIZE: usize = 4096;
const D_MAX_OVERLAP: f32 = 0.2f32;
const D_REL_MIN_ENTRIES: f32 = 0.4f32;
const D_REL_MIN_FANOUT: f32 = 0.3f32;
const D_REINSERT_P: f32 = 0.3f32;

/// How sibling overlap is measured when judging a split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapKind {
    /// Intersection volume over summed volumes
    #[default]
    Volume,
    /// Fraction of data points falling into the intersection
    Data,
}

/// Construction options for an [`XTree`](crate::XTree)
#[derive(Debug, Clone)]
pub struct XTreeOptions {
    /// Bytes per page; determines the node capacities
    pub page_size: usize,
    /// Overlap measure used by the splitter
    pub overlap_kind: OverlapKind,
    /// Overlap in [0, 1] above which a topological split is rejected
    pub max_overlap: f32,
    /// Ratio turning capacities into leaf/directory minimums
    pub rel_min_entries: f32,
    /// Ratio turning the directory capacity into the split min-fanout
    pub rel_min_fanout: f32,
    /// Fraction of entries removed on the first overflow per level
    pub reinsert_fraction: f32,
    /// Skip the overlap-increase term when descending into a supernode
    pub omit_overlap_for_supernodes: bool,
    /// Pin `(leaf_cap, dir_cap)` instead of deriving them from `page_size`
    pub capacities: Option<(usize, usize)>,
}

impl Default for XTreeOptions {
    fn default() -> XTreeOptions {
        XTreeOptions {
            page_size: D_PAGE_SIZE,
            overlap_kind: OverlapKind::Volume,
            max_overlap: D_MAX_OVERLAP,
            rel_min_entries: D_REL_MIN_ENTRIES,
            rel_min_fanout: D_REL_MIN_FANOUT,
            reinsert_fraction: D_REINSERT_P,
            omit_overlap_for_supernodes: true,
            capacities: None,
        }
    }
}

impl XTreeOptions {
    pub fn new() -> XTreeOptions {
        XTreeOptions::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> XTreeOptions {
        self.page_size = page_size;
        self
    }

    pub fn with_overlap(mut self, kind: OverlapKind, max_overlap: f32) -> XTreeOptions {
        self.overlap_kind = kind;
        self.max_overlap = max_overlap;
        self
    }

    pub fn with_min_ratios(mut self, rel_min_entries: f32, rel_min_fanout: f32) -> XTreeOptions {
        self.rel_min_entries = rel_min_entries;
        self.rel_min_fanout = rel_min_fanout;
        self
    }

    pub fn with_reinsert_fraction(mut self, reinsert_fraction: f32) -> XTreeOptions {
        self.reinsert_fraction = reinsert_fraction;
        self
    }

    /// Pin the capacities instead of deriving them from the page size.
    /// Intended for tests and tuning; the pinned values still have to fit
    /// their page.
    pub fn with_capacities(mut self, leaf_cap: usize, dir_cap: usize) -> XTreeOptions {
        self.capacities = Some((leaf_cap, dir_cap));
        self
    }

    /// Derive and validate the capacities for dimensionality `dim`
    pub fn limits(&self, dim: usize) -> Result<Limits> {
        if dim == 0 || dim > SplitHistory::MAX_DIM {
            return Err(Error::ConfigInvalid(format!(
                "dimensionality {} outside 1..={}",
                dim,
                SplitHistory::MAX_DIM
            )));
        }
        if !(0.0..=1.0).contains(&self.max_overlap) {
            return Err(Error::ConfigInvalid(format!(
                "max_overlap {} outside [0, 1]",
                self.max_overlap
            )));
        }
        for (name, ratio) in [
            ("rel_min_entries", self.rel_min_entries),
            ("rel_min_fanout", self.rel_min_fanout),
            ("reinsert_fraction", self.reinsert_fraction),
        ] {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(Error::ConfigInvalid(format!(
                    "{} {} outside (0, 1)",
                    name, ratio
                )));
            }
        }

        let leaf_bytes = leaf_entry_disk_bytes(dim);
        let dir_bytes = dir_entry_disk_bytes(dim);
        let avail = self.page_size.saturating_sub(NODE_PRELUDE_BYTES);
        // each page keeps one slot free for the transient overflow entry
        let (leaf_cap, dir_cap) = match self.capacities {
            Some((leaf_cap, dir_cap)) => {
                for (name, cap, bytes) in
                    [("leaf_cap", leaf_cap, leaf_bytes), ("dir_cap", dir_cap, dir_bytes)]
                {
                    if avail / bytes < cap + 1 {
                        return Err(Error::ConfigInvalid(format!(
                            "pinned {} {} does not fit a {}-byte page",
                            name, cap, self.page_size
                        )));
                    }
                }
                (leaf_cap, dir_cap)
            }
            None => (
                (avail / leaf_bytes).saturating_sub(1),
                (avail / dir_bytes).saturating_sub(1),
            ),
        };
        if dir_cap <= 1 || leaf_cap <= 1 {
            return Err(Error::ConfigInvalid(format!(
                "page_size {} too small: leaf_cap {}, dir_cap {}",
                self.page_size, leaf_cap, dir_cap
            )));
        }

        let leaf_min = cmp::max(2, ((leaf_cap - 1) as f32 * self.rel_min_entries).round() as usize);
        let dir_min = cmp::max(2, ((dir_cap - 1) as f32 * self.rel_min_entries).round() as usize);
        let min_fanout =
            cmp::max(2, ((dir_cap - 1) as f32 * self.rel_min_fanout).round() as usize);
        for (name, min, cap) in [
            ("leaf_min", leaf_min, leaf_cap),
            ("dir_min", dir_min, dir_cap),
            ("min_fanout", min_fanout, dir_cap),
        ] {
            if 2 * min > cap + 1 {
                return Err(Error::ConfigInvalid(format!(
                    "{} {} leaves no legal split of {} + 1 entries",
                    name, min, cap
                )));
            }
        }
        // forced reinsertion removes exactly ceil(cap * fraction) entries
        // from an overflowing node of cap + 1; that may not drop it below
        // its minimum
        for (name, cap, min) in [("leaf", leaf_cap, leaf_min), ("directory", dir_cap, dir_min)] {
            if self.reinsert_count(cap) + min > cap + 1 {
                return Err(Error::ConfigInvalid(format!(
                    "reinsert_fraction {} would drop a {} node of {} entries below its minimum {}",
                    self.reinsert_fraction,
                    name,
                    cap + 1,
                    min
                )));
            }
        }

        Ok(Limits {
            page_size: self.page_size,
            leaf_cap,
            dir_cap,
            leaf_min,
            dir_min,
            min_fanout,
        })
    }

    /// Entries removed by one forced reinsertion from a node of capacity
    /// `cap`
    pub(crate) fn reinsert_count(&self, cap: usize) -> usize {
        cmp::max(1, (cap as f32 * self.reinsert_fraction).ceil() as usize)
    }
}

/// Capacities and minimums in force for one tree, derived at build time and
/// persisted in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub page_size: usize,
    pub leaf_cap: usize,
    pub dir_cap: usize,
    pub leaf_min: usize,
    pub dir_min: usize,
    pub min_fanout: usize,
}
