// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Inserting entries into the paged tree

pub(crate) mod insert;
pub(crate) mod split;

use crate::error::{Error, Result};
use crate::geometry::finite;
use crate::tree::node::PageId;
use crate::FP;
use ordered_float::NotNan;

/// Totally ordered objective value; non-finite values surface as
/// `NumericOverflow` before any comparison
pub(crate) fn not_nan<P: FP>(value: P) -> Result<NotNan<f64>> {
    finite(value)?;
    value
        .to_f64()
        .and_then(|v| NotNan::new(v).ok())
        .ok_or(Error::NumericOverflow)
}

/// One visited node on the way from the root to an insertion target.
/// `branch` is the child index taken out of this node; it is meaningless on
/// the final step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PathStep {
    pub page_id: PageId,
    pub branch: usize,
}

/// Root-first descent path. Parents hold no pointer to their children's
/// nodes, so every upward adjustment walks this instead.
pub(crate) type InsertionPath = Vec<PathStep>;

/// Levels already rescued by forced reinsertion during the current
/// insertion, indexed from the leaf level at bit 0
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ReinsertedLevels(u64);

impl ReinsertedLevels {
    pub fn new() -> ReinsertedLevels {
        ReinsertedLevels(0)
    }

    pub fn contains(&self, level: usize) -> bool {
        debug_assert!(level >= 1 && level <= 64);
        self.0 & (1 << (level - 1)) != 0
    }

    pub fn mark(&mut self, level: usize) {
        debug_assert!(level >= 1 && level <= 64);
        self.0 |= 1 << (level - 1);
    }
}
