#![forbid(unsafe_code)]
//! Core newtypes, geometry and small on-disk codecs for FFS/UFS.
//!
//! Everything here is layout arithmetic: no I/O, no locking. The geometry
//! mirrors the classic FFS macros (`cgtod`, `ino_to_fsba`, `lblkno`, ...) so
//! callers higher up read like the filesystem code they model.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Direct block pointers held in the inode.
pub const NDADDR: usize = 12;
/// Indirect block pointers held in the inode (single, double, triple).
pub const NIADDR: usize = 3;
/// Directory block size: entries never span this boundary.
pub const DIRBLKSIZ: usize = 512;
/// Longest directory entry name.
pub const MAXNAMLEN: usize = 255;
/// Cylinder group magic number.
pub const CG_MAGIC: u32 = 0x0009_0255;

/// Physical fragment address on the device (FFS `daddr_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Logical block within a file.
///
/// Negative values name indirect-block metadata the way FFS does; soft
/// updates only ever stores non-negative data lbns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub i64);

/// Cylinder group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

impl InodeNumber {
    pub const ROOT: Self = Self(2);
}

impl LogicalBlock {
    /// True when the block is mapped by one of the inode's direct pointers.
    #[must_use]
    pub fn is_direct(self) -> bool {
        (0..NDADDR as i64).contains(&self.0)
    }

    /// Index into the direct pointer array, if direct.
    #[must_use]
    pub fn direct_index(self) -> Option<usize> {
        if self.is_direct() {
            usize::try_from(self.0).ok()
        } else {
            None
        }
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian helpers ───────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let actual = data.len().saturating_sub(offset);
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// ── On-disk format variant ──────────────────────────────────────────────────

/// UFS flavour. Decides inode size and block-pointer width.
///
/// All multi-byte fields are little-endian regardless of host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsFormat {
    /// 128-byte inodes, 32-bit block pointers.
    Ufs1,
    /// 256-byte inodes, 64-bit block pointers.
    Ufs2,
}

impl FsFormat {
    #[must_use]
    pub fn dinode_size(self) -> usize {
        match self {
            Self::Ufs1 => 128,
            Self::Ufs2 => 256,
        }
    }

    /// Width in bytes of one block pointer inside an indirect block.
    #[must_use]
    pub fn pointer_width(self) -> usize {
        match self {
            Self::Ufs1 => 4,
            Self::Ufs2 => 8,
        }
    }

    /// Read pointer `index` of an indirect block image.
    pub fn read_block_ptr(self, data: &[u8], index: usize) -> Result<i64, ParseError> {
        let offset = index
            .checked_mul(self.pointer_width())
            .ok_or(ParseError::IntegerConversion { field: "ptr_index" })?;
        match self {
            Self::Ufs1 => Ok(i64::from(read_le_u32(data, offset)?.cast_signed())),
            Self::Ufs2 => Ok(read_le_u64(data, offset)?.cast_signed()),
        }
    }

    /// Store pointer `index` of an indirect block image.
    ///
    /// UFS1 rejects values that do not fit its 32-bit pointer.
    pub fn write_block_ptr(self, data: &mut [u8], index: usize, value: i64) -> Result<(), ParseError> {
        let offset = index
            .checked_mul(self.pointer_width())
            .ok_or(ParseError::IntegerConversion { field: "ptr_index" })?;
        match self {
            Self::Ufs1 => {
                let narrow = i32::try_from(value)
                    .map_err(|_| ParseError::IntegerConversion { field: "ufs1_block_ptr" })?;
                write_le_u32(data, offset, narrow.cast_unsigned())
            }
            Self::Ufs2 => write_le_u64(data, offset, value.cast_unsigned()),
        }
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Filesystem geometry, all addresses in fragments.
///
/// Cylinder group `g` starts at fragment `g * fpg` and is laid out as:
/// one block reserved for a superblock copy, one block of cylinder-group
/// header and bitmaps, the inode blocks, then data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub format: FsFormat,
    /// Block size in bytes.
    pub bsize: u32,
    /// Fragment size in bytes.
    pub fsize: u32,
    /// Number of cylinder groups.
    pub ncg: u32,
    /// Fragments per cylinder group.
    pub fpg: u32,
    /// Inodes per cylinder group.
    pub ipg: u32,
}

impl FsGeometry {
    pub fn new(
        format: FsFormat,
        bsize: u32,
        fsize: u32,
        ncg: u32,
        fpg: u32,
        ipg: u32,
    ) -> Result<Self, ParseError> {
        if !bsize.is_power_of_two() || !(4096..=65536).contains(&bsize) {
            return Err(ParseError::InvalidField {
                field: "bsize",
                reason: "must be power of two in 4096..=65536",
            });
        }
        if !fsize.is_power_of_two() || fsize > bsize || bsize / fsize > 8 {
            return Err(ParseError::InvalidField {
                field: "fsize",
                reason: "must divide bsize into at most 8 fragments",
            });
        }
        if ncg == 0 {
            return Err(ParseError::InvalidField {
                field: "ncg",
                reason: "must be non-zero",
            });
        }
        let geometry = Self {
            format,
            bsize,
            fsize,
            ncg,
            fpg,
            ipg,
        };
        if ipg == 0 || ipg % geometry.inopb() != 0 {
            return Err(ParseError::InvalidField {
                field: "ipg",
                reason: "must be a non-zero multiple of inodes per block",
            });
        }
        if fpg % geometry.frag() != 0 || u64::from(fpg) <= geometry.cgdmin_offset() {
            return Err(ParseError::InvalidField {
                field: "fpg",
                reason: "must be block aligned and leave room for data",
            });
        }
        if fpg > bsize.saturating_sub(CG_HEADER_SIZE as u32 + ipg.div_ceil(8)) * 8 {
            return Err(ParseError::InvalidField {
                field: "fpg",
                reason: "free map does not fit in one cylinder-group block",
            });
        }
        Ok(geometry)
    }

    /// Fragments per block.
    #[must_use]
    pub fn frag(&self) -> u32 {
        self.bsize / self.fsize
    }

    /// Inodes per block.
    #[must_use]
    pub fn inopb(&self) -> u32 {
        self.bsize / self.format.dinode_size() as u32
    }

    /// Block pointers per indirect block.
    #[must_use]
    pub fn nindir(&self) -> u64 {
        u64::from(self.bsize) / self.format.pointer_width() as u64
    }

    #[must_use]
    pub fn total_frags(&self) -> u64 {
        u64::from(self.ncg) * u64::from(self.fpg)
    }

    #[must_use]
    pub fn total_inodes(&self) -> u64 {
        u64::from(self.ncg) * u64::from(self.ipg)
    }

    fn cgdmin_offset(&self) -> u64 {
        let inode_blocks = u64::from(self.ipg / self.inopb());
        u64::from(self.frag()) * (2 + inode_blocks)
    }

    /// First fragment of cylinder group `cg`.
    #[must_use]
    pub fn cgbase(&self, cg: GroupNumber) -> BlockNumber {
        BlockNumber(u64::from(cg.0) * u64::from(self.fpg))
    }

    /// Superblock copy of cylinder group `cg`.
    #[must_use]
    pub fn cgsblock(&self, cg: GroupNumber) -> BlockNumber {
        self.cgbase(cg)
    }

    /// Cylinder-group header block (`cgtod`).
    #[must_use]
    pub fn cgtod(&self, cg: GroupNumber) -> BlockNumber {
        BlockNumber(self.cgbase(cg).0 + u64::from(self.frag()))
    }

    /// First inode block of cylinder group `cg`.
    #[must_use]
    pub fn cgimin(&self, cg: GroupNumber) -> BlockNumber {
        BlockNumber(self.cgbase(cg).0 + 2 * u64::from(self.frag()))
    }

    /// First data fragment of cylinder group `cg`.
    #[must_use]
    pub fn cgdmin(&self, cg: GroupNumber) -> BlockNumber {
        BlockNumber(self.cgbase(cg).0 + self.cgdmin_offset())
    }

    /// Cylinder group holding inode `ino`.
    #[must_use]
    pub fn ino_to_cg(&self, ino: InodeNumber) -> GroupNumber {
        #[expect(clippy::cast_possible_truncation)]
        let cg = (ino.0 / u64::from(self.ipg)) as u32;
        GroupNumber(cg)
    }

    /// Fragment address of the block holding inode `ino`.
    #[must_use]
    pub fn ino_to_fsba(&self, ino: InodeNumber) -> BlockNumber {
        let cg = self.ino_to_cg(ino);
        let index = ino.0 % u64::from(self.ipg);
        let block = index / u64::from(self.inopb());
        BlockNumber(self.cgimin(cg).0 + block * u64::from(self.frag()))
    }

    /// Index of inode `ino` within its inode block.
    #[must_use]
    pub fn ino_to_fsbo(&self, ino: InodeNumber) -> usize {
        #[expect(clippy::cast_possible_truncation)]
        let slot = (ino.0 % u64::from(self.inopb())) as usize;
        slot
    }

    /// Byte offset of inode `ino` within its inode block.
    #[must_use]
    pub fn ino_offset(&self, ino: InodeNumber) -> usize {
        self.ino_to_fsbo(ino) * self.format.dinode_size()
    }

    /// Cylinder group holding fragment `blkno`.
    #[must_use]
    pub fn dtog(&self, blkno: BlockNumber) -> GroupNumber {
        #[expect(clippy::cast_possible_truncation)]
        let cg = (blkno.0 / u64::from(self.fpg)) as u32;
        GroupNumber(cg)
    }

    /// Fragment offset of `blkno` within its cylinder group.
    #[must_use]
    pub fn dtogd(&self, blkno: BlockNumber) -> u32 {
        #[expect(clippy::cast_possible_truncation)]
        let rel = (blkno.0 % u64::from(self.fpg)) as u32;
        rel
    }

    /// Logical block containing byte `pos`.
    #[must_use]
    pub fn lblkno(&self, pos: u64) -> LogicalBlock {
        LogicalBlock((pos / u64::from(self.bsize)).cast_signed())
    }

    /// Byte offset of `pos` within its block.
    #[must_use]
    pub fn blkoff(&self, pos: u64) -> u64 {
        pos % u64::from(self.bsize)
    }

    /// Byte offset of the start of logical block `lbn`.
    #[must_use]
    pub fn lblktosize(&self, lbn: LogicalBlock) -> u64 {
        lbn.0.cast_unsigned().saturating_mul(u64::from(self.bsize))
    }

    /// Round `size` up to a whole number of fragments.
    #[must_use]
    pub fn fragroundup(&self, size: u64) -> u64 {
        size.div_ceil(u64::from(self.fsize)) * u64::from(self.fsize)
    }

    /// Number of fragments covering `size` bytes.
    #[must_use]
    pub fn numfrags(&self, size: u64) -> u64 {
        size.div_ceil(u64::from(self.fsize))
    }

    /// Allocated size of block `lbn` for a file of `file_size` bytes.
    ///
    /// Only the last direct block of a file may be a fragment run.
    #[must_use]
    pub fn blksize(&self, file_size: u64, lbn: LogicalBlock) -> u32 {
        let start = self.lblktosize(lbn);
        if !lbn.is_direct() || start.saturating_add(u64::from(self.bsize)) <= file_size {
            return self.bsize;
        }
        let tail = file_size.saturating_sub(start);
        #[expect(clippy::cast_possible_truncation)]
        let rounded = self.fragroundup(tail).max(u64::from(self.fsize)) as u32;
        rounded.min(self.bsize)
    }

    /// Byte offset of fragment `blkno` on the device.
    #[must_use]
    pub fn frag_to_byte(&self, blkno: BlockNumber) -> u64 {
        blkno.0 * u64::from(self.fsize)
    }

    /// Number of data blocks addressed by one indirect block at `level`
    /// (0 = single indirect).
    #[must_use]
    pub fn blocks_per_indir_level(&self, level: usize) -> u64 {
        let mut count = self.nindir();
        for _ in 0..level {
            count = count.saturating_mul(self.nindir());
        }
        count
    }
}

// ── Cylinder-group header ───────────────────────────────────────────────────

/// Bytes reserved at the start of a cylinder-group block for the header.
pub const CG_HEADER_SIZE: usize = 168;

const CG_MAGIC_OFF: usize = 4;
const CG_CGX_OFF: usize = 12;
const CG_CS_OFF: usize = 24;
const CG_IUSEDOFF_OFF: usize = 92;
const CG_FREEOFF_OFF: usize = 96;

/// Free/used counters kept per cylinder group and summed in the superblock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsSummary {
    pub ndir: i32,
    pub nbfree: i32,
    pub nifree: i32,
    pub nffree: i32,
}

impl CsSummary {
    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        Self {
            ndir: self.ndir + other.ndir,
            nbfree: self.nbfree + other.nbfree,
            nifree: self.nifree + other.nifree,
            nffree: self.nffree + other.nffree,
        }
    }
}

/// The parts of `struct cg` this workspace reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgHeader {
    pub cgx: u32,
    pub cs: CsSummary,
    /// Byte offset of the inode-used map.
    pub iusedoff: u32,
    /// Byte offset of the fragment free map.
    pub freeoff: u32,
}

impl CgHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, CG_MAGIC_OFF)?;
        if magic != CG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(CG_MAGIC),
                actual: u64::from(magic),
            });
        }
        let cs = CsSummary {
            ndir: read_le_u32(data, CG_CS_OFF)?.cast_signed(),
            nbfree: read_le_u32(data, CG_CS_OFF + 4)?.cast_signed(),
            nifree: read_le_u32(data, CG_CS_OFF + 8)?.cast_signed(),
            nffree: read_le_u32(data, CG_CS_OFF + 12)?.cast_signed(),
        };
        Ok(Self {
            cgx: read_le_u32(data, CG_CGX_OFF)?,
            cs,
            iusedoff: read_le_u32(data, CG_IUSEDOFF_OFF)?,
            freeoff: read_le_u32(data, CG_FREEOFF_OFF)?,
        })
    }

    pub fn write(&self, data: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(data, CG_MAGIC_OFF, CG_MAGIC)?;
        write_le_u32(data, CG_CGX_OFF, self.cgx)?;
        write_le_u32(data, CG_CS_OFF, self.cs.ndir.cast_unsigned())?;
        write_le_u32(data, CG_CS_OFF + 4, self.cs.nbfree.cast_unsigned())?;
        write_le_u32(data, CG_CS_OFF + 8, self.cs.nifree.cast_unsigned())?;
        write_le_u32(data, CG_CS_OFF + 12, self.cs.nffree.cast_unsigned())?;
        write_le_u32(data, CG_IUSEDOFF_OFF, self.iusedoff)?;
        write_le_u32(data, CG_FREEOFF_OFF, self.freeoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ufs2_geometry() -> FsGeometry {
        FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 4, 4096, 256).expect("geometry")
    }

    #[test]
    fn test_read_write_helpers() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0x1234).expect("u16");
        write_le_u32(&mut buf, 2, 0xdead_beef).expect("u32");
        write_le_u64(&mut buf, 8, 0x0102_0304_0506_0708).expect("u64");
        assert_eq!(read_le_u16(&buf, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&buf, 2).expect("u32"), 0xdead_beef);
        assert_eq!(buf[8], 0x08, "little-endian low byte first");
        assert!(write_le_u32(&mut buf, 14, 1).is_err());
        assert!(read_le_u64(&buf, 9).is_err());
    }

    #[test]
    fn geometry_rejects_bad_shapes() {
        assert!(FsGeometry::new(FsFormat::Ufs2, 3000, 1024, 1, 4096, 256).is_err());
        assert!(FsGeometry::new(FsFormat::Ufs2, 8192, 512, 1, 4096, 256).is_err());
        assert!(FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 0, 4096, 256).is_err());
        assert!(FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 1, 4096, 30).is_err());
        assert!(FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 1, 40, 256).is_err());
    }

    #[test]
    fn inode_location_math() {
        let g = ufs2_geometry();
        assert_eq!(g.inopb(), 32);
        assert_eq!(g.frag(), 8);
        // Inode 2 lives in the first inode block of cg 0, slot 2.
        assert_eq!(g.ino_to_fsba(InodeNumber(2)), g.cgimin(GroupNumber(0)));
        assert_eq!(g.ino_offset(InodeNumber(2)), 512);
        // First inode of cg 1.
        assert_eq!(g.ino_to_cg(InodeNumber(256)), GroupNumber(1));
        assert_eq!(g.ino_to_fsba(InodeNumber(256)), g.cgimin(GroupNumber(1)));
        // Second inode block of cg 0.
        assert_eq!(
            g.ino_to_fsba(InodeNumber(40)).0,
            g.cgimin(GroupNumber(0)).0 + 8
        );
        assert_eq!(g.cgdmin(GroupNumber(0)).0, 8 * (2 + 8));
    }

    #[test]
    fn block_math() {
        let g = ufs2_geometry();
        assert_eq!(g.lblkno(8192 * 3 + 5), LogicalBlock(3));
        assert_eq!(g.blkoff(8192 * 3 + 5), 5);
        assert_eq!(g.fragroundup(1), 1024);
        assert_eq!(g.numfrags(2049), 3);
        assert_eq!(g.blksize(3000, LogicalBlock(0)), 3072);
        assert_eq!(g.blksize(20_000, LogicalBlock(0)), 8192);
        assert_eq!(g.blksize(20_000, LogicalBlock(2)), 4096);
        assert_eq!(g.dtog(BlockNumber(4096 + 17)), GroupNumber(1));
        assert_eq!(g.dtogd(BlockNumber(4096 + 17)), 17);
        assert_eq!(g.nindir(), 1024);
        assert_eq!(g.blocks_per_indir_level(1), 1024 * 1024);
    }

    #[test]
    fn pointer_codec_width_is_explicit() {
        let mut block = vec![0_u8; 64];
        FsFormat::Ufs1.write_block_ptr(&mut block, 3, 0x0102_0304).expect("ufs1 write");
        assert_eq!(&block[12..16], &[4, 3, 2, 1]);
        assert_eq!(FsFormat::Ufs1.read_block_ptr(&block, 3).expect("ufs1 read"), 0x0102_0304);
        assert!(FsFormat::Ufs1.write_block_ptr(&mut block, 0, 1 << 40).is_err());

        FsFormat::Ufs2.write_block_ptr(&mut block, 3, 1 << 40).expect("ufs2 write");
        assert_eq!(&block[24..32], &(1_u64 << 40).to_le_bytes());
        assert_eq!(FsFormat::Ufs2.read_block_ptr(&block, 3).expect("ufs2 read"), 1 << 40);
        assert!(FsFormat::Ufs2.read_block_ptr(&block, 8).is_err());
    }

    #[test]
    fn cg_header_rejects_bad_magic() {
        let mut block = vec![0_u8; 4096];
        assert!(matches!(
            CgHeader::parse(&block),
            Err(ParseError::InvalidMagic { .. })
        ));
        let header = CgHeader {
            cgx: 3,
            cs: CsSummary {
                ndir: 1,
                nbfree: 10,
                nifree: 20,
                nffree: 5,
            },
            iusedoff: 168,
            freeoff: 200,
        };
        header.write(&mut block).expect("write header");
        assert_eq!(CgHeader::parse(&block).expect("parse"), header);
    }

    #[test]
    fn summary_serde_round_trip() {
        let cs = CsSummary {
            ndir: 2,
            nbfree: 7,
            nifree: 9,
            nffree: 1,
        };
        let json = serde_json::to_string(&cs).expect("serialize");
        let back: CsSummary = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.plus(cs).nbfree, 14);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn ufs1_pointer_writes_never_touch_neighbours(
            index in 0_usize..16,
            value in i64::from(i32::MIN)..=i64::from(i32::MAX),
        ) {
            let mut block = vec![0xA5_u8; 64];
            FsFormat::Ufs1.write_block_ptr(&mut block, index, value).expect("write");
            for (i, byte) in block.iter().enumerate() {
                if i / 4 != index {
                    prop_assert_eq!(*byte, 0xA5);
                }
            }
            prop_assert_eq!(FsFormat::Ufs1.read_block_ptr(&block, index).expect("read"), value);
        }

        #[test]
        fn every_inode_maps_inside_its_group(ino in 0_u64..1024) {
            let g = ufs2_geometry();
            let ino = InodeNumber(ino);
            let cg = g.ino_to_cg(ino);
            let fsba = g.ino_to_fsba(ino);
            prop_assert!(fsba >= g.cgimin(cg));
            prop_assert!(fsba < g.cgdmin(cg));
            prop_assert!(g.ino_offset(ino) + 256 <= 8192);
        }
    }
}
