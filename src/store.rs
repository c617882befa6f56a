// Copyright 2024 xtree-rs Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The paged index file: a reserved header page, fixed-size pages, and the
//! variable-size supernode region appended behind them at commit time

use crate::error::{Error, Result};
use crate::tree::node::PageId;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

const MAGIC: u32 = 0x5854_5245; // "XTRE"
const FORMAT_VERSION: u32 = 1;

/// Serialized header length; the rest of the reserved page is zero
pub(crate) const HEADER_BYTES: usize = 56;

pub(crate) fn get_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let bytes = get_bytes(buf, pos, 1)?;
    Ok(bytes[0])
}

pub(crate) fn get_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes = get_bytes(buf, pos, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn get_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let bytes = get_bytes(buf, pos, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn get_f32(buf: &[u8], pos: &mut usize) -> Result<f32> {
    let bytes = get_bytes(buf, pos, 4)?;
    Ok(f32::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn get_f64(buf: &[u8], pos: &mut usize) -> Result<f64> {
    let bytes = get_bytes(buf, pos, 8)?;
    Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
}

fn get_bytes<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *pos + len;
    if end > buf.len() {
        return Err(Error::CorruptFile(format!(
            "buffer of {} bytes ends inside a field at {}",
            buf.len(),
            *pos
        )));
    }
    let bytes = &buf[*pos..end];
    *pos = end;
    Ok(bytes)
}

pub(crate) fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_f32(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_f64(buf: &mut Vec<u8>, value: f64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// The persisted tree parameters, written into the reserved page at the
/// front of the file
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TreeHeader {
    pub page_size: u32,
    pub dir_capacity: u32,
    pub leaf_capacity: u32,
    pub dir_minimum: u32,
    pub leaf_minimum: u32,
    pub min_fanout: u32,
    pub num_elements: u64,
    pub dimensionality: u32,
    pub max_overlap: f32,
    /// Byte offset of the supernode region, relative to the end of the
    /// header page; 0 until the first commit
    pub supernode_offset: u64,
}

impl TreeHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_BYTES);
        put_u32(&mut buf, MAGIC);
        put_u32(&mut buf, FORMAT_VERSION);
        put_u32(&mut buf, self.page_size);
        put_u32(&mut buf, self.dir_capacity);
        put_u32(&mut buf, self.leaf_capacity);
        put_u32(&mut buf, self.dir_minimum);
        put_u32(&mut buf, self.leaf_minimum);
        put_u32(&mut buf, self.min_fanout);
        put_u64(&mut buf, self.num_elements);
        put_u32(&mut buf, self.dimensionality);
        put_f32(&mut buf, self.max_overlap);
        put_u64(&mut buf, self.supernode_offset);
        debug_assert_eq!(HEADER_BYTES, buf.len());
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<TreeHeader> {
        let mut pos = 0;
        let magic = get_u32(bytes, &mut pos)?;
        if magic != MAGIC {
            return Err(Error::CorruptFile(format!(
                "bad magic {:#010x}, not an xtree page file",
                magic
            )));
        }
        let version = get_u32(bytes, &mut pos)?;
        if version != FORMAT_VERSION {
            return Err(Error::CorruptFile(format!(
                "format version {} not readable by this build",
                version
            )));
        }
        Ok(TreeHeader {
            page_size: get_u32(bytes, &mut pos)?,
            dir_capacity: get_u32(bytes, &mut pos)?,
            leaf_capacity: get_u32(bytes, &mut pos)?,
            dir_minimum: get_u32(bytes, &mut pos)?,
            leaf_minimum: get_u32(bytes, &mut pos)?,
            min_fanout: get_u32(bytes, &mut pos)?,
            num_elements: get_u64(bytes, &mut pos)?,
            dimensionality: get_u32(bytes, &mut pos)?,
            max_overlap: get_f32(bytes, &mut pos)?,
            supernode_offset: get_u64(bytes, &mut pos)?,
        })
    }
}

/// Fixed-size page I/O over one file. All offsets shift by one page for the
/// header. The handle sits behind a mutex so lookups only need `&self`.
pub(crate) struct PageStore {
    file: Mutex<std::fs::File>,
    page_size: usize,
    next_page_id: PageId,
}

impl PageStore {
    /// Create a fresh page file, truncating anything already at `path`
    pub fn create(path: &Path, header: &TreeHeader) -> Result<PageStore> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let store = PageStore {
            file: Mutex::new(file),
            page_size: header.page_size as usize,
            next_page_id: 0,
        };
        store.write_header(header)?;
        Ok(store)
    }

    /// Open an existing page file and read its header. `next_page_id` is
    /// left at 0 for the tree to restore from the header.
    pub fn open(path: &Path) -> Result<(PageStore, TreeHeader)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut store = PageStore {
            file: Mutex::new(file),
            page_size: 0,
            next_page_id: 0,
        };
        let mut buf = vec![0u8; HEADER_BYTES];
        store.read_at(0, &mut buf)?;
        let header = TreeHeader::deserialize(&buf)?;
        store.page_size = header.page_size as usize;
        Ok((store, header))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Hand out the next free page id
    pub fn alloc(&mut self) -> PageId {
        let page_id = self.next_page_id;
        self.next_page_id += 1;
        page_id
    }

    pub fn next_page_id(&self) -> PageId {
        self.next_page_id
    }

    pub fn set_next_page_id(&mut self, next_page_id: PageId) {
        self.next_page_id = next_page_id;
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        (1 + page_id as u64) * self.page_size as u64
    }

    /// First byte of the supernode trailer
    pub fn supernode_region_start(&self) -> u64 {
        self.page_offset(self.next_page_id)
    }

    pub fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        if page_id >= self.next_page_id {
            return Err(Error::CorruptFile(format!(
                "page {} referenced but only {} allocated",
                page_id, self.next_page_id
            )));
        }
        let mut buf = vec![0u8; self.page_size];
        self.read_at(self.page_offset(page_id), &mut buf)?;
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.page_size {
            return Err(Error::CapacityExceeded {
                page_id,
                needed: bytes.len(),
                budget: self.page_size,
            });
        }
        let mut padded = vec![0u8; self.page_size];
        padded[..bytes.len()].copy_from_slice(bytes);
        self.write_at(self.page_offset(page_id), &padded)
    }

    pub fn write_header(&self, header: &TreeHeader) -> Result<()> {
        debug!(
            num_elements = header.num_elements,
            supernode_offset = header.supernode_offset,
            "writing header"
        );
        self.write_at(0, &header.serialize())
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::CorruptFile(format!(
                    "file ends inside a {}-byte read at offset {}",
                    buf.len(),
                    offset
                ))
            } else {
                Error::Io(e)
            }
        })
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Cut the file at `len`, dropping any stale supernode region
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.lock().set_len(len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TreeHeader {
        TreeHeader {
            page_size: 256,
            dir_capacity: 4,
            leaf_capacity: 4,
            dir_minimum: 2,
            leaf_minimum: 2,
            min_fanout: 2,
            num_elements: 17,
            dimensionality: 2,
            max_overlap: 0.2,
            supernode_offset: 0,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = header();
        let bytes = header.serialize();
        assert_eq!(HEADER_BYTES, bytes.len());
        assert_eq!(header, TreeHeader::deserialize(&bytes).unwrap());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = header().serialize();
        bytes[0] ^= 0xff;
        assert!(matches!(
            TreeHeader::deserialize(&bytes),
            Err(Error::CorruptFile(_))
        ));
    }

    #[test]
    fn pages_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.xt");
        let mut store = PageStore::create(&path, &header()).unwrap();

        assert_eq!(0, store.alloc());
        assert_eq!(1, store.alloc());
        store.write_page(0, b"zero").unwrap();
        store.write_page(1, b"one").unwrap();

        let page = store.read_page(0).unwrap();
        assert_eq!(b"zero", &page[..4]);
        assert_eq!(256, page.len());
        assert!(store.read_page(2).is_err());

        let (reopened, reread) = PageStore::open(&path).unwrap();
        assert_eq!(header(), reread);
        assert_eq!(256, reopened.page_size());
    }

    #[test]
    fn oversized_page_write_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.xt");
        let mut store = PageStore::create(&path, &header()).unwrap();
        let page_id = store.alloc();
        let result = store.write_page(page_id, &vec![0u8; 300]);
        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));
    }
}
