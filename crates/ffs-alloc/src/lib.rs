#![forbid(unsafe_code)]
//! Block, fragment and inode allocation.
//!
//! Operates on one cylinder-group block at a time. The layout follows UFS:
//! a header at the front, the inode-used map (`1` = in use) at `iusedoff`
//! and the fragment free map (`1` = free) at `freeoff`. The header's
//! summary counters are kept in step with the maps on every change.
//!
//! ## Design
//!
//! 1. **Bitmap**: raw bit manipulation shared by both maps.
//! 2. **CylinderGroup**: a typed view over a cylinder-group block that
//!    allocates and releases blocks, fragment runs and inodes.
//!
//! Callers own the block buffer and decide when it reaches the disk; the
//! dependency engine hooks in right after each allocation.

use ffs_error::{FfsError, Result};
use ffs_types::{
    BlockNumber, CG_HEADER_SIZE, CgHeader, CsSummary, FsGeometry, GroupNumber, InodeNumber,
};
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count set bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut set: u32 = bitmap.iter().take(full_bytes).map(|b| b.count_ones()).sum();
    if remainder > 0 && full_bytes < bitmap.len() {
        let mask = (1_u8 << remainder) - 1;
        set += (bitmap[full_bytes] & mask).count_ones();
    }
    set
}

/// Count clear bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    count - bitmap_count_set(bitmap, count).min(count)
}

/// Find the first clear bit in the first `count` bits of `bitmap`,
/// starting from `start` and wrapping around.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let start = start.min(count);
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx))
}

/// Length of the run of set bits starting at `idx`, capped at `max`.
#[must_use]
pub fn bitmap_run_set(bitmap: &[u8], idx: u32, max: u32) -> u32 {
    (0..max)
        .take_while(|&i| bitmap_get(bitmap, idx + i))
        .count() as u32
}

// ── Cylinder groups ─────────────────────────────────────────────────────────

/// Typed view over a cylinder-group block.
pub struct CylinderGroup<'a> {
    geometry: &'a FsGeometry,
    group: GroupNumber,
    header: CgHeader,
    data: &'a mut [u8],
}

impl std::fmt::Debug for CylinderGroup<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CylinderGroup")
            .field("group", &self.group)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

fn parse_err(err: ffs_types::ParseError) -> FfsError {
    FfsError::Parse(err.to_string())
}

impl<'a> CylinderGroup<'a> {
    /// Write a fresh cylinder group into `data`: metadata fragments in use,
    /// every data fragment free, no inode allocated except the two reserved
    /// ones of group 0.
    pub fn format(geometry: &'a FsGeometry, group: GroupNumber, data: &'a mut [u8]) -> Result<Self> {
        if data.len() < geometry.bsize as usize {
            return Err(FfsError::Format("cylinder-group buffer too small".to_owned()));
        }
        data.fill(0);
        let iusedoff = CG_HEADER_SIZE as u32;
        let header = CgHeader {
            cgx: group.0,
            cs: CsSummary::default(),
            iusedoff,
            freeoff: iusedoff + geometry.ipg.div_ceil(8),
        };
        let mut cg = Self {
            geometry,
            group,
            header,
            data,
        };
        let first_data = geometry.cgdmin(group).0 - geometry.cgbase(group).0;
        for rel in first_data..u64::from(geometry.fpg) {
            #[expect(clippy::cast_possible_truncation)]
            let rel = rel as u32;
            let off = cg.header.freeoff as usize;
            bitmap_set(&mut cg.data[off..], rel);
        }
        if group.0 == 0 {
            let off = cg.header.iusedoff as usize;
            bitmap_set(&mut cg.data[off..], 0);
            bitmap_set(&mut cg.data[off..], 1);
        }
        cg.recount()?;
        debug!(target: "ffs::alloc", event = "cg_format", cg = group.0, cs = ?cg.header.cs);
        Ok(cg)
    }

    /// Open an existing cylinder-group block.
    pub fn open(geometry: &'a FsGeometry, group: GroupNumber, data: &'a mut [u8]) -> Result<Self> {
        let header = CgHeader::parse(data).map_err(parse_err)?;
        if header.cgx != group.0 {
            return Err(FfsError::Corruption {
                block: geometry.cgtod(group).0,
                detail: format!("cg index {} in block of group {}", header.cgx, group.0),
            });
        }
        let maps_end = header.freeoff as usize + geometry.fpg.div_ceil(8) as usize;
        if (header.iusedoff as usize) < CG_HEADER_SIZE || maps_end > data.len() {
            return Err(FfsError::Corruption {
                block: geometry.cgtod(group).0,
                detail: "cylinder-group maps out of bounds".to_owned(),
            });
        }
        Ok(Self {
            geometry,
            group,
            header,
            data,
        })
    }

    #[must_use]
    pub fn header(&self) -> CgHeader {
        self.header
    }

    #[must_use]
    pub fn summary(&self) -> CsSummary {
        self.header.cs
    }

    fn freemap(&self) -> &[u8] {
        &self.data[self.header.freeoff as usize..]
    }

    fn inosused(&self) -> &[u8] {
        &self.data[self.header.iusedoff as usize..]
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.write(self.data).map_err(parse_err)
    }

    /// Free fragments of the block starting at cg-relative fragment `base`.
    fn block_free_frags(&self, base: u32) -> u32 {
        let frag = self.geometry.frag();
        (base..base + frag)
            .filter(|&rel| bitmap_get(self.freemap(), rel))
            .count() as u32
    }

    fn adjust_counts(&mut self, base: u32, before: u32, after: u32) {
        let frag = self.geometry.frag();
        let contrib = |free: u32| -> (i32, i32) {
            if free == frag {
                (1, 0)
            } else {
                (0, free.cast_signed())
            }
        };
        let (b0, f0) = contrib(before);
        let (b1, f1) = contrib(after);
        self.header.cs.nbfree += b1 - b0;
        self.header.cs.nffree += f1 - f0;
        trace!(target: "ffs::alloc", event = "cg_counts", cg = self.group.0, base, before, after);
    }

    /// Recompute the free counters from the maps; `ndir` is kept.
    pub fn recount(&mut self) -> Result<CsSummary> {
        let frag = self.geometry.frag();
        let mut nbfree = 0_i32;
        let mut nffree = 0_i32;
        for base in (0..self.geometry.fpg).step_by(frag as usize) {
            let free = self.block_free_frags(base);
            if free == frag {
                nbfree += 1;
            } else {
                nffree += free.cast_signed();
            }
        }
        let nifree = bitmap_count_free(self.inosused(), self.geometry.ipg);
        self.header.cs.nbfree = nbfree;
        self.header.cs.nffree = nffree;
        self.header.cs.nifree = nifree.cast_signed();
        self.write_header()?;
        Ok(self.header.cs)
    }

    fn rel_frag(&self, blkno: BlockNumber) -> Result<u32> {
        if self.geometry.dtog(blkno) != self.group {
            return Err(FfsError::Format(format!(
                "fragment {blkno} is not in cylinder group {}",
                self.group
            )));
        }
        Ok(self.geometry.dtogd(blkno))
    }

    fn abs_frag(&self, rel: u32) -> BlockNumber {
        BlockNumber(self.geometry.cgbase(self.group).0 + u64::from(rel))
    }

    /// True when fragment `blkno` is free in the map.
    pub fn is_frag_free(&self, blkno: BlockNumber) -> Result<bool> {
        let rel = self.rel_frag(blkno)?;
        Ok(bitmap_get(self.freemap(), rel))
    }

    fn take_frags(&mut self, rel: u32, nfrags: u32) -> Result<BlockNumber> {
        let frag = self.geometry.frag();
        let base = rel - rel % frag;
        let before = self.block_free_frags(base);
        let off = self.header.freeoff as usize;
        for i in rel..rel + nfrags {
            bitmap_clear(&mut self.data[off..], i);
        }
        let after = self.block_free_frags(base);
        self.adjust_counts(base, before, after);
        self.write_header()?;
        Ok(self.abs_frag(rel))
    }

    /// Allocate a whole block, preferring the first free block at or after
    /// `pref`.
    pub fn alloc_block(&mut self, pref: Option<BlockNumber>) -> Result<BlockNumber> {
        let frag = self.geometry.frag();
        let nblocks = self.geometry.fpg / frag;
        let start = pref
            .filter(|p| self.geometry.dtog(*p) == self.group)
            .map_or(0, |p| self.geometry.dtogd(p) / frag);
        let found = (start..nblocks)
            .chain(0..start)
            .map(|b| b * frag)
            .find(|&base| self.block_free_frags(base) == frag);
        let Some(base) = found else {
            return Err(FfsError::NoSpace);
        };
        let blkno = self.take_frags(base, frag)?;
        debug!(target: "ffs::alloc", event = "alloc_block", cg = self.group.0, blkno = blkno.0);
        Ok(blkno)
    }

    /// Allocate a run of `nfrags` fragments inside one block, splitting a
    /// partially used block before breaking up a free one.
    pub fn alloc_frags(&mut self, nfrags: u32) -> Result<BlockNumber> {
        let frag = self.geometry.frag();
        if nfrags == 0 || nfrags > frag {
            return Err(FfsError::Format(format!("bad fragment count {nfrags}")));
        }
        if nfrags == frag {
            return self.alloc_block(None);
        }
        let mut whole: Option<u32> = None;
        for base in (0..self.geometry.fpg).step_by(frag as usize) {
            let free = self.block_free_frags(base);
            if free == frag {
                whole.get_or_insert(base);
                continue;
            }
            if free < nfrags {
                continue;
            }
            for rel in base..=base + frag - nfrags {
                if bitmap_run_set(self.freemap(), rel, nfrags) == nfrags {
                    let blkno = self.take_frags(rel, nfrags)?;
                    debug!(target: "ffs::alloc", event = "alloc_frags", cg = self.group.0, blkno = blkno.0, nfrags);
                    return Ok(blkno);
                }
            }
        }
        let base = whole.ok_or(FfsError::NoSpace)?;
        let blkno = self.take_frags(base, nfrags)?;
        debug!(target: "ffs::alloc", event = "alloc_frags", cg = self.group.0, blkno = blkno.0, nfrags);
        Ok(blkno)
    }

    /// Grow the fragment run at `blkno` from `old` to `new` fragments in
    /// place. Returns `false` when the following fragments are taken.
    pub fn extend_frags(&mut self, blkno: BlockNumber, old: u32, new: u32) -> Result<bool> {
        let frag = self.geometry.frag();
        let rel = self.rel_frag(blkno)?;
        if new <= old || rel % frag + new > frag {
            return Ok(false);
        }
        if bitmap_run_set(self.freemap(), rel + old, new - old) != new - old {
            return Ok(false);
        }
        self.take_frags(rel + old, new - old)?;
        debug!(target: "ffs::alloc", event = "extend_frags", cg = self.group.0, blkno = blkno.0, old, new);
        Ok(true)
    }

    /// Return `nfrags` fragments starting at `blkno` to the free map.
    pub fn free_frags(&mut self, blkno: BlockNumber, nfrags: u32) -> Result<()> {
        let frag = self.geometry.frag();
        let rel = self.rel_frag(blkno)?;
        if nfrags == 0 || rel % frag + nfrags > frag {
            return Err(FfsError::Format(format!(
                "fragment run {blkno}+{nfrags} crosses a block boundary"
            )));
        }
        let base = rel - rel % frag;
        let before = self.block_free_frags(base);
        let off = self.header.freeoff as usize;
        for i in rel..rel + nfrags {
            if bitmap_get(&self.data[off..], i) {
                return Err(FfsError::Corruption {
                    block: self.abs_frag(i).0,
                    detail: "freeing free fragment".to_owned(),
                });
            }
        }
        for i in rel..rel + nfrags {
            bitmap_set(&mut self.data[off..], i);
        }
        let after = self.block_free_frags(base);
        self.adjust_counts(base, before, after);
        self.write_header()?;
        debug!(target: "ffs::alloc", event = "free_frags", cg = self.group.0, blkno = blkno.0, nfrags);
        Ok(())
    }

    /// True when inode `ino` is marked in use.
    #[must_use]
    pub fn is_inode_used(&self, ino: InodeNumber) -> bool {
        #[expect(clippy::cast_possible_truncation)]
        let rel = (ino.0 % u64::from(self.geometry.ipg)) as u32;
        bitmap_get(self.inosused(), rel)
    }

    /// Allocate the first free inode of this group.
    pub fn alloc_inode(&mut self, is_dir: bool) -> Result<InodeNumber> {
        let rel = bitmap_find_free(self.inosused(), self.geometry.ipg, 0).ok_or(FfsError::NoSpace)?;
        let off = self.header.iusedoff as usize;
        bitmap_set(&mut self.data[off..], rel);
        self.header.cs.nifree -= 1;
        if is_dir {
            self.header.cs.ndir += 1;
        }
        self.write_header()?;
        let ino = InodeNumber(u64::from(self.group.0) * u64::from(self.geometry.ipg) + u64::from(rel));
        debug!(target: "ffs::alloc", event = "alloc_inode", cg = self.group.0, ino = ino.0, is_dir);
        Ok(ino)
    }

    /// Release inode `ino`.
    pub fn free_inode(&mut self, ino: InodeNumber, is_dir: bool) -> Result<()> {
        if self.geometry.ino_to_cg(ino) != self.group {
            return Err(FfsError::Format(format!(
                "inode {ino} is not in cylinder group {}",
                self.group
            )));
        }
        if !self.is_inode_used(ino) {
            return Err(FfsError::Corruption {
                block: self.geometry.cgtod(self.group).0,
                detail: format!("freeing free inode {ino}"),
            });
        }
        #[expect(clippy::cast_possible_truncation)]
        let rel = (ino.0 % u64::from(self.geometry.ipg)) as u32;
        let off = self.header.iusedoff as usize;
        bitmap_clear(&mut self.data[off..], rel);
        self.header.cs.nifree += 1;
        if is_dir {
            self.header.cs.ndir -= 1;
        }
        self.write_header()?;
        debug!(target: "ffs::alloc", event = "free_inode", cg = self.group.0, ino = ino.0, is_dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_types::FsFormat;

    fn geometry() -> FsGeometry {
        FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 2, 4096, 64).expect("geometry")
    }

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 7);
        assert!(bitmap_get(&bm, 7));
        assert_eq!(bm[0], 0x80);

        bitmap_set(&mut bm, 8);
        assert!(bitmap_get(&bm, 8));
        assert_eq!(bm[1], 0x01);
    }

    #[test]
    fn bitmap_counts_respect_partial_bytes() {
        let mut bm = vec![0u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 5);
        bitmap_set(&mut bm, 15);
        assert_eq!(bitmap_count_set(&bm, 16), 3);
        assert_eq!(bitmap_count_free(&bm, 16), 13);
        assert_eq!(bitmap_count_set(&bm, 10), 2);
    }

    #[test]
    fn bitmap_find_free_wraps() {
        let mut bm = vec![0xFFu8; 2];
        bitmap_clear(&mut bm, 3);
        assert_eq!(bitmap_find_free(&bm, 16, 5), Some(3));
        assert_eq!(bitmap_find_free(&[0xFF, 0xFF], 16, 0), None);
    }

    #[test]
    fn format_marks_metadata_used() {
        let g = geometry();
        let mut block = vec![0_u8; 8192];
        let cg = CylinderGroup::format(&g, GroupNumber(0), &mut block).expect("format");
        let first_data = g.cgdmin(GroupNumber(0));
        assert!(!cg.is_frag_free(BlockNumber(0)).expect("sb"));
        assert!(!cg.is_frag_free(BlockNumber(first_data.0 - 1)).expect("last inode frag"));
        assert!(cg.is_frag_free(first_data).expect("first data frag"));
        let data_blocks = (u64::from(g.fpg) - first_data.0) / u64::from(g.frag());
        assert_eq!(cg.summary().nbfree, data_blocks as i32);
        assert_eq!(cg.summary().nifree, 62);
        assert!(cg.is_inode_used(InodeNumber(1)));
    }

    #[test]
    fn block_and_fragment_accounting() {
        let g = geometry();
        let mut block = vec![0_u8; 8192];
        let mut cg = CylinderGroup::format(&g, GroupNumber(1), &mut block).expect("format");
        let start = cg.summary();

        let b = cg.alloc_block(None).expect("block");
        assert_eq!(b, g.cgdmin(GroupNumber(1)));
        assert_eq!(cg.summary().nbfree, start.nbfree - 1);

        let f = cg.alloc_frags(3).expect("frags");
        assert_eq!(cg.summary().nbfree, start.nbfree - 2);
        assert_eq!(cg.summary().nffree, 5);

        // A second small run lands in the already broken block.
        let f2 = cg.alloc_frags(2).expect("frags");
        assert_eq!(f2.0, f.0 + 3);
        assert_eq!(cg.summary().nffree, 3);

        assert!(cg.extend_frags(f2, 2, 3).expect("extend"));
        assert_eq!(cg.summary().nffree, 2);

        cg.free_frags(f, 3).expect("free run");
        cg.free_frags(f2, 3).expect("free run");
        cg.free_frags(b, 8).expect("free block");
        assert_eq!(cg.summary(), start);
        assert!(matches!(cg.free_frags(b, 1), Err(FfsError::Corruption { .. })));
    }

    #[test]
    fn inode_allocation_tracks_ndir() {
        let g = geometry();
        let mut block = vec![0_u8; 8192];
        let mut cg = CylinderGroup::format(&g, GroupNumber(0), &mut block).expect("format");
        let root = cg.alloc_inode(true).expect("root");
        assert_eq!(root, InodeNumber::ROOT);
        let file = cg.alloc_inode(false).expect("file");
        assert_eq!(file, InodeNumber(3));
        assert_eq!(cg.summary().ndir, 1);
        cg.free_inode(root, true).expect("free");
        assert_eq!(cg.summary().ndir, 0);
        assert!(cg.free_inode(root, true).is_err());
        assert!(cg.free_inode(InodeNumber(70), false).is_err());
    }

    #[test]
    fn reopen_and_recount_agree() {
        let g = geometry();
        let mut block = vec![0_u8; 8192];
        {
            let mut cg = CylinderGroup::format(&g, GroupNumber(1), &mut block).expect("format");
            cg.alloc_frags(5).expect("frags");
            cg.alloc_inode(false).expect("inode");
        }
        let mut cg = CylinderGroup::open(&g, GroupNumber(1), &mut block).expect("open");
        let stored = cg.summary();
        assert_eq!(cg.recount().expect("recount"), stored);
        assert!(CylinderGroup::open(&g, GroupNumber(0), &mut vec![0_u8; 8192]).is_err());
    }
}
