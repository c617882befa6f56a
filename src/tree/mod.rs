// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The disk-resident X-tree

pub mod history;
pub(crate) mod index;
pub mod node;
pub mod query;

use crate::config::{Limits, XTreeOptions};
use crate::error::{Error, Result};
use crate::geometry::Point;
use crate::store::{get_u32, get_u8, PageStore, TreeHeader};
use crate::tree::node::{PageId, XTreeNode, ROOT_PAGE_ID};
use crate::tree::query::RectQuery;
use crate::FP;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Tallest tree the loader will accept before assuming a page cycle
const MAX_HEIGHT: usize = 64;

/// A paged X-tree over `DIM`-dimensional points with scalar type `P`.
///
/// Single writer: mutation takes `&mut self`; lookups serialize their file
/// access behind the store's lock and only need `&self`. Supernodes stay in
/// memory and reach the file when [`commit`](XTree::commit) appends them
/// behind the paged region.
pub struct XTree<P: FP, const DIM: usize> {
    pub(crate) store: PageStore,
    pub(crate) supernodes: BTreeMap<PageId, XTreeNode<P, DIM>>,
    pub(crate) options: XTreeOptions,
    pub(crate) limits: Limits,
    pub(crate) height: usize,
    pub(crate) num_elements: u64,
}

impl<P: FP, const DIM: usize> XTree<P, DIM> {
    /// Create a new index file at `path`, truncating any previous one
    pub fn create(path: impl AsRef<Path>, options: XTreeOptions) -> Result<XTree<P, DIM>> {
        let limits = options.limits(DIM)?;
        let header = Self::header_for(&limits, &options, DIM, 0, 0);
        let mut store = PageStore::create(path.as_ref(), &header)?;
        let root = store.alloc();
        debug_assert_eq!(ROOT_PAGE_ID, root);
        let mut tree = XTree {
            store,
            supernodes: BTreeMap::new(),
            options,
            limits,
            height: 1,
            num_elements: 0,
        };
        tree.write_node(&XTreeNode::new_leaves(ROOT_PAGE_ID))?;
        info!(
            path = %path.as_ref().display(),
            page_size = limits.page_size,
            leaf_cap = limits.leaf_cap,
            dir_cap = limits.dir_cap,
            "created xtree"
        );
        Ok(tree)
    }

    /// Open a committed index file. Geometry parameters come from the
    /// header; `options` only contributes the runtime knobs (overlap kind,
    /// reinsertion, supernode descent optimization).
    pub fn open(path: impl AsRef<Path>, options: XTreeOptions) -> Result<XTree<P, DIM>> {
        let (mut store, header) = PageStore::open(path.as_ref())?;
        if header.dimensionality as usize != DIM {
            return Err(Error::CorruptFile(format!(
                "file indexes {}-dimensional points, tree type wants {}",
                header.dimensionality, DIM
            )));
        }
        let limits = Limits {
            page_size: header.page_size as usize,
            leaf_cap: header.leaf_capacity as usize,
            dir_cap: header.dir_capacity as usize,
            leaf_min: header.leaf_minimum as usize,
            dir_min: header.dir_minimum as usize,
            min_fanout: header.min_fanout as usize,
        };
        let mut options = options;
        options.page_size = limits.page_size;
        options.max_overlap = header.max_overlap;

        let page_size = limits.page_size as u64;
        let next = if header.supernode_offset != 0 {
            (header.supernode_offset / page_size) as PageId
        } else {
            // never committed: every page behind the header is a tree page
            let len = store.file_len()?;
            len.div_ceil(page_size).saturating_sub(1) as PageId
        };
        store.set_next_page_id(next);

        let mut tree = XTree {
            store,
            supernodes: BTreeMap::new(),
            options,
            limits,
            height: 1,
            num_elements: header.num_elements,
        };
        if header.supernode_offset != 0 {
            tree.load_supernodes()?;
        }
        tree.height = tree.measure_height()?;
        info!(
            path = %path.as_ref().display(),
            num_elements = tree.num_elements,
            height = tree.height,
            supernodes = tree.supernodes.len(),
            "opened xtree"
        );
        Ok(tree)
    }

    /// Number of indexed points
    pub fn len(&self) -> u64 {
        self.num_elements
    }

    pub fn is_empty(&self) -> bool {
        self.num_elements == 0
    }

    /// Levels between the root and the leaves, inclusive
    pub fn height(&self) -> usize {
        self.height
    }

    /// The capacities in force for this tree
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Supernodes currently held in memory
    pub fn supernode_count(&self) -> usize {
        self.supernodes.len()
    }

    /// Fixed-size pages allocated so far
    pub fn page_count(&self) -> u32 {
        self.store.next_page_id()
    }

    /// Collect every point matching the window query
    pub fn search(&self, query: &RectQuery<P, DIM>) -> Result<Vec<(u64, Point<P, DIM>)>> {
        let mut found = Vec::new();
        let mut stack = vec![ROOT_PAGE_ID];
        while let Some(page_id) = stack.pop() {
            match self.read_node(page_id)? {
                XTreeNode::Leaves { children, .. } => {
                    for entry in children {
                        if query.accept_point(&entry.point) {
                            found.push((entry.id, entry.point));
                        }
                    }
                }
                XTreeNode::Level { children, .. } | XTreeNode::Super { children, .. } => {
                    stack.extend(
                        children
                            .iter()
                            .filter(|e| query.accept_mbr(&e.mbr))
                            .map(|e| e.child),
                    );
                }
            }
        }
        Ok(found)
    }

    /// Persist the header and the supernode trailer. Pages were already
    /// written when their nodes changed, so after this the file is a
    /// complete image of the tree.
    pub fn commit(&mut self) -> Result<()> {
        let page_size = self.limits.page_size;
        let supernode_offset = self.store.next_page_id() as u64 * page_size as u64;
        let header = Self::header_for(
            &self.limits,
            &self.options,
            DIM,
            self.num_elements,
            supernode_offset,
        );
        self.store.write_header(&header)?;

        let start = self.store.supernode_region_start();
        self.store.truncate(start)?;
        let mut pos = start;
        for (&page_id, node) in &self.supernodes {
            let budget = node.page_span(&self.limits) * page_size;
            let bytes = node.serialize(&self.limits)?;
            if bytes.len() > budget {
                return Err(Error::CapacityExceeded {
                    page_id,
                    needed: bytes.len(),
                    budget,
                });
            }
            let mut padded = vec![0u8; budget];
            padded[..bytes.len()].copy_from_slice(&bytes);
            self.store.write_at(pos, &padded)?;
            pos += budget as u64;
        }
        info!(
            num_elements = self.num_elements,
            supernodes = self.supernodes.len(),
            "committed xtree"
        );
        Ok(())
    }

    /// Bulk loading is advertised by the format but not implemented
    pub fn bulk_load<I>(&mut self, _points: I) -> Result<()>
    where
        I: IntoIterator<Item = (Point<P, DIM>, u64)>,
    {
        Err(Error::NotSupported("bulk load"))
    }

    /// Deletion is not implemented
    pub fn remove(&mut self, _query: &RectQuery<P, DIM>) -> Result<Vec<(u64, Point<P, DIM>)>> {
        Err(Error::NotSupported("delete"))
    }

    /// Walk every page and verify the structural invariants: fill bounds,
    /// tight parent mbrs, uniform leaf depth, and the leaf count against
    /// the element count
    pub fn check_consistency(&self) -> Result<()> {
        let mut leaf_entries = 0u64;
        let mut stack = vec![(ROOT_PAGE_ID, self.height, None)];
        while let Some((page_id, level, expected_mbr)) = stack.pop() {
            let node = self.read_node(page_id)?;
            if (level == 1) != node.has_leaves() {
                return Err(Error::CorruptFile(format!(
                    "{} node at level {}",
                    node.kind_name(),
                    level
                )));
            }
            let len = node.len();
            if len > node.capacity(&self.limits) {
                return Err(Error::CorruptFile(format!(
                    "page {} overflows at rest: {} entries",
                    page_id, len
                )));
            }
            if page_id != ROOT_PAGE_ID {
                if node.is_super() {
                    if len <= self.limits.dir_cap {
                        return Err(Error::CorruptFile(format!(
                            "supernode {} at regular fill {}",
                            page_id, len
                        )));
                    }
                } else if len < node.minimum(&self.limits) {
                    return Err(Error::CorruptFile(format!(
                        "page {} underfull: {} entries",
                        page_id, len
                    )));
                }
            }
            if let Some(expected) = expected_mbr {
                if node.mbr() != expected {
                    return Err(Error::CorruptFile(format!(
                        "stale parent mbr over page {}",
                        page_id
                    )));
                }
            }
            match node {
                XTreeNode::Leaves { children, .. } => leaf_entries += children.len() as u64,
                XTreeNode::Level { children, .. } | XTreeNode::Super { children, .. } => {
                    for entry in children {
                        stack.push((entry.child, level - 1, Some(entry.mbr)));
                    }
                }
            }
        }
        if leaf_entries != self.num_elements {
            return Err(Error::CorruptFile(format!(
                "{} leaf entries for {} elements",
                leaf_entries, self.num_elements
            )));
        }
        Ok(())
    }

    /// Resolve a page, answering supernode ids from memory
    pub(crate) fn read_node(&self, page_id: PageId) -> Result<XTreeNode<P, DIM>> {
        if let Some(node) = self.supernodes.get(&page_id) {
            return Ok(node.clone());
        }
        let bytes = self.store.read_page(page_id)?;
        XTreeNode::deserialize(&bytes, &self.limits)
    }

    /// Persist a node. Supernodes only touch the in-memory map until the
    /// next commit; writing a page over a former supernode id retires the
    /// map entry.
    pub(crate) fn write_node(&mut self, node: &XTreeNode<P, DIM>) -> Result<()> {
        let page_id = node.page_id();
        if node.is_super() {
            self.supernodes.insert(page_id, node.clone());
            return Ok(());
        }
        if self.supernodes.remove(&page_id).is_some() {
            debug!(page_id, "supernode demoted to directory node");
        }
        let bytes = node.serialize(&self.limits)?;
        self.store.write_page(page_id, &bytes)
    }

    /// Give back growth steps a supernode no longer fills; at `dir_cap`
    /// the node reverts to a plain directory node
    pub(crate) fn shrink_receded_supernode(&mut self, node: &mut XTreeNode<P, DIM>) {
        while node.is_super() && node.len() + self.limits.dir_cap <= node.capacity(&self.limits) {
            let capacity = node.shrink_super(self.limits.dir_cap);
            debug!(page_id = node.page_id(), capacity, "supernode shrunk");
        }
    }

    fn header_for(
        limits: &Limits,
        options: &XTreeOptions,
        dim: usize,
        num_elements: u64,
        supernode_offset: u64,
    ) -> TreeHeader {
        TreeHeader {
            page_size: limits.page_size as u32,
            dir_capacity: limits.dir_cap as u32,
            leaf_capacity: limits.leaf_cap as u32,
            dir_minimum: limits.dir_min as u32,
            leaf_minimum: limits.leaf_min as u32,
            min_fanout: limits.min_fanout as u32,
            num_elements,
            dimensionality: dim as u32,
            max_overlap: options.max_overlap,
            supernode_offset,
        }
    }

    /// Rebuild the supernode map from the trailer behind the paged region
    fn load_supernodes(&mut self) -> Result<()> {
        let page_size = self.limits.page_size;
        let len = self.store.file_len()?;
        let mut pos = self.store.supernode_region_start();
        while pos + page_size as u64 <= len {
            let mut first = vec![0u8; page_size];
            self.store.read_at(pos, &mut first)?;
            let mut cursor = 0;
            let page_id = get_u32(&first, &mut cursor)?;
            let is_leaf = get_u8(&first, &mut cursor)? != 0;
            let is_super = get_u8(&first, &mut cursor)? != 0;
            let num_entries = get_u32(&first, &mut cursor)? as usize;
            let capacity = get_u32(&first, &mut cursor)? as usize;
            if is_leaf || !is_super {
                return Err(Error::CorruptFile(format!(
                    "page {} in the supernode region is not a supernode",
                    page_id
                )));
            }
            let span = (capacity + self.limits.dir_cap - 1) / self.limits.dir_cap;
            let mut bytes = vec![0u8; span * page_size];
            self.store.read_at(pos, &mut bytes)?;
            let node: XTreeNode<P, DIM> = XTreeNode::deserialize(&bytes, &self.limits)?;
            if node.page_id() != page_id
                || node.len() != num_entries
                || node.capacity(&self.limits) != capacity
                || !node.is_super()
            {
                return Err(Error::CorruptFile(format!(
                    "supernode {} does not match its prelude",
                    page_id
                )));
            }
            debug!(page_id, capacity, "loaded supernode");
            self.supernodes.insert(page_id, node);
            pos += (span * page_size) as u64;
        }
        Ok(())
    }

    /// Height recomputed by walking leftmost children from the root
    fn measure_height(&self) -> Result<usize> {
        let mut height = 1;
        let mut node = self.read_node(ROOT_PAGE_ID)?;
        while !node.has_leaves() {
            let child = node
                .dir_children()
                .first()
                .map(|entry| entry.child)
                .ok_or_else(|| Error::CorruptFile("empty directory node".into()))?;
            node = self.read_node(child)?;
            height += 1;
            if height > MAX_HEIGHT {
                return Err(Error::CorruptFile("cyclic page references".into()));
            }
        }
        Ok(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    fn scratch() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.xt");
        (dir, path)
    }

    fn small_options() -> XTreeOptions {
        XTreeOptions::new()
            .with_page_size(256)
            .with_capacities(4, 4)
    }

    #[test]
    fn empty_tree_round_trip() {
        let (_dir, path) = scratch();
        let mut tree: XTree<f64, 2> = XTree::create(&path, small_options()).unwrap();
        assert!(tree.is_empty());
        assert_eq!(1, tree.height());
        tree.commit().unwrap();

        let tree: XTree<f64, 2> = XTree::open(&path, small_options()).unwrap();
        assert!(tree.is_empty());
        assert_eq!(1, tree.height());
        tree.check_consistency().unwrap();
    }

    #[test]
    fn open_rejects_wrong_dimensionality() {
        let (_dir, path) = scratch();
        let tree: XTree<f64, 2> = XTree::create(&path, small_options()).unwrap();
        drop(tree);
        let result: Result<XTree<f64, 3>> = XTree::open(&path, XTreeOptions::new());
        assert!(matches!(result, Err(Error::CorruptFile(_))));
    }

    #[test]
    fn unsupported_operations_have_no_side_effects() {
        let (_dir, path) = scratch();
        let mut tree: XTree<f64, 2> = XTree::create(&path, small_options()).unwrap();
        tree.insert(Point::new([0.5, 0.5]), 1).unwrap();

        assert!(matches!(
            tree.bulk_load(vec![(Point::new([1.0, 1.0]), 2)]),
            Err(Error::NotSupported(_))
        ));
        let query = RectQuery::Overlaps(Rect::max());
        assert!(matches!(tree.remove(&query), Err(Error::NotSupported(_))));

        assert_eq!(1, tree.len());
        assert_eq!(
            1,
            tree.search(&RectQuery::Overlaps(Rect::max())).unwrap().len()
        );
        tree.check_consistency().unwrap();
    }

    #[test]
    fn open_without_commit_recovers_page_count() {
        let (_dir, path) = scratch();
        let mut tree: XTree<f64, 2> = XTree::create(&path, small_options()).unwrap();
        for i in 0..10 {
            tree.insert(Point::new([i as f64, 0.5]), i).unwrap();
        }
        let pages = tree.page_count();
        // header still has supernode_offset = 0; reopening must rediscover
        // the paged region from the file length
        drop(tree);
        let tree: XTree<f64, 2> = XTree::open(&path, small_options()).unwrap();
        assert_eq!(pages, tree.page_count());
    }
}
