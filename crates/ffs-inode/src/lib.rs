#![forbid(unsafe_code)]
//! Inode management.
//!
//! UFS1/UFS2 on-disk inode (`dinode`) codec and the in-core [`Inode`]
//! carried by the filesystem above the dependency engine. Only the fields
//! that block allocation, truncation and link counting touch are decoded;
//! every other byte of the on-disk image is preserved on write-back.

use ffs_types::{
    FsFormat, FsGeometry, InodeNumber, NDADDR, NIADDR, ParseError, ensure_slice, read_le_u16,
    read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const IFMT: u16 = 0o170_000;
pub const IFDIR: u16 = 0o040_000;
pub const IFREG: u16 = 0o100_000;

/// Byte offsets of the decoded fields for one format.
struct Layout {
    size: usize,
    blocks: usize,
    generation: usize,
    flags: usize,
    db: usize,
    ib: usize,
}

const UFS1_LAYOUT: Layout = Layout {
    size: 8,
    blocks: 104,
    generation: 108,
    flags: 100,
    db: 40,
    ib: 88,
};

const UFS2_LAYOUT: Layout = Layout {
    size: 16,
    blocks: 24,
    generation: 80,
    flags: 88,
    db: 112,
    ib: 208,
};

fn layout(format: FsFormat) -> &'static Layout {
    match format {
        FsFormat::Ufs1 => &UFS1_LAYOUT,
        FsFormat::Ufs2 => &UFS2_LAYOUT,
    }
}

/// Decoded view of an on-disk inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dinode {
    pub mode: u16,
    pub nlink: i16,
    pub size: u64,
    /// Fragments held, in `fsize` units.
    pub blocks: u64,
    pub generation: u32,
    pub flags: u32,
    pub db: [i64; NDADDR],
    pub ib: [i64; NIADDR],
}

impl Dinode {
    /// Decode the inode image at the start of `data`.
    pub fn decode(format: FsFormat, data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, format.dinode_size())?;
        let l = layout(format);
        let mut din = Self {
            mode: read_le_u16(data, 0)?,
            nlink: read_le_u16(data, 2)?.cast_signed(),
            size: read_le_u64(data, l.size)?,
            blocks: match format {
                FsFormat::Ufs1 => u64::from(read_le_u32(data, l.blocks)?),
                FsFormat::Ufs2 => read_le_u64(data, l.blocks)?,
            },
            generation: read_le_u32(data, l.generation)?,
            flags: read_le_u32(data, l.flags)?,
            ..Self::default()
        };
        for (i, slot) in din.db.iter_mut().enumerate() {
            *slot = format.read_block_ptr(&data[l.db..], i)?;
        }
        for (i, slot) in din.ib.iter_mut().enumerate() {
            *slot = format.read_block_ptr(&data[l.ib..], i)?;
        }
        Ok(din)
    }

    /// Encode into the inode image at the start of `data`, leaving the
    /// fields this type does not model untouched.
    pub fn encode_into(&self, format: FsFormat, data: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(data, 0, format.dinode_size())?;
        let l = layout(format);
        write_le_u16(data, 0, self.mode)?;
        write_le_u16(data, 2, self.nlink.cast_unsigned())?;
        write_le_u64(data, l.size, self.size)?;
        match format {
            FsFormat::Ufs1 => {
                let blocks = u32::try_from(self.blocks)
                    .map_err(|_| ParseError::IntegerConversion { field: "di_blocks" })?;
                write_le_u32(data, l.blocks, blocks)?;
            }
            FsFormat::Ufs2 => write_le_u64(data, l.blocks, self.blocks)?,
        }
        write_le_u32(data, l.generation, self.generation)?;
        write_le_u32(data, l.flags, self.flags)?;
        for (i, ptr) in self.db.iter().enumerate() {
            format.write_block_ptr(&mut data[l.db..], i, *ptr)?;
        }
        for (i, ptr) in self.ib.iter().enumerate() {
            format.write_block_ptr(&mut data[l.ib..], i, *ptr)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & IFMT == IFDIR
    }

    /// True when the image is entirely unallocated.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode == 0 && self.nlink == 0
    }
}

/// Slice of an inode block holding inode `ino`.
pub fn dinode_slice<'a>(
    geometry: &FsGeometry,
    block: &'a [u8],
    ino: InodeNumber,
) -> Result<&'a [u8], ParseError> {
    ensure_slice(block, geometry.ino_offset(ino), geometry.format.dinode_size())
}

/// Mutable slice of an inode block holding inode `ino`.
pub fn dinode_slice_mut<'a>(
    geometry: &FsGeometry,
    block: &'a mut [u8],
    ino: InodeNumber,
) -> Result<&'a mut [u8], ParseError> {
    let offset = geometry.ino_offset(ino);
    let len = geometry.format.dinode_size();
    ensure_slice(block, offset, len)?;
    Ok(&mut block[offset..offset + len])
}

/// In-core inode.
///
/// `effnlink` is the link count the namespace currently sees; `din.nlink`
/// lags behind it while directory removals wait on the disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub number: InodeNumber,
    pub din: Dinode,
    pub effnlink: i32,
}

impl Inode {
    #[must_use]
    pub fn new(number: InodeNumber, din: Dinode) -> Self {
        Self {
            number,
            effnlink: i32::from(din.nlink),
            din,
        }
    }

    /// Read inode `ino` out of its inode block.
    pub fn load(geometry: &FsGeometry, block: &[u8], ino: InodeNumber) -> Result<Self, ParseError> {
        let din = Dinode::decode(geometry.format, dinode_slice(geometry, block, ino)?)?;
        Ok(Self::new(ino, din))
    }

    /// Copy the in-core dinode into its inode block.
    pub fn store(&self, geometry: &FsGeometry, block: &mut [u8]) -> Result<(), ParseError> {
        let slot = dinode_slice_mut(geometry, block, self.number)?;
        self.din.encode_into(geometry.format, slot)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.din.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_types::{GroupNumber, LogicalBlock};
    use proptest::prelude::*;

    fn sample() -> Dinode {
        let mut din = Dinode {
            mode: IFREG | 0o644,
            nlink: 1,
            size: 3 * 8192 + 100,
            blocks: 33,
            generation: 7,
            flags: 0,
            ..Dinode::default()
        };
        din.db[0] = 100;
        din.db[3] = 124;
        din.ib[0] = 900;
        din
    }

    #[test]
    fn ufs1_field_offsets_match_on_disk_layout() {
        let mut image = vec![0_u8; 128];
        sample().encode_into(FsFormat::Ufs1, &mut image).expect("encode");
        assert_eq!(read_le_u16(&image, 0).expect("mode"), IFREG | 0o644);
        assert_eq!(read_le_u32(&image, 40).expect("db0"), 100);
        assert_eq!(read_le_u32(&image, 52).expect("db3"), 124);
        assert_eq!(read_le_u32(&image, 88).expect("ib0"), 900);
        assert_eq!(read_le_u32(&image, 104).expect("blocks"), 33);
    }

    #[test]
    fn ufs2_field_offsets_match_on_disk_layout() {
        let mut image = vec![0_u8; 256];
        sample().encode_into(FsFormat::Ufs2, &mut image).expect("encode");
        assert_eq!(read_le_u64(&image, 16).expect("size"), 3 * 8192 + 100);
        assert_eq!(read_le_u64(&image, 112).expect("db0"), 100);
        assert_eq!(read_le_u64(&image, 208).expect("ib0"), 900);
        assert_eq!(Dinode::decode(FsFormat::Ufs2, &image).expect("decode"), sample());
    }

    #[test]
    fn encode_preserves_unmodelled_bytes() {
        let mut image = vec![0xEE_u8; 256];
        sample().encode_into(FsFormat::Ufs2, &mut image).expect("encode");
        // di_uid lives at offset 4 and is not modelled.
        assert_eq!(&image[4..8], &[0xEE; 4]);
    }

    #[test]
    fn ufs1_rejects_wide_block_counts() {
        let mut din = sample();
        din.blocks = u64::from(u32::MAX) + 1;
        let mut image = vec![0_u8; 128];
        assert!(din.encode_into(FsFormat::Ufs1, &mut image).is_err());
    }

    #[test]
    fn inode_load_store_in_block() {
        let g = FsGeometry::new(FsFormat::Ufs2, 8192, 1024, 1, 4096, 64).expect("geometry");
        let mut block = vec![0_u8; 8192];
        let mut ip = Inode::new(InodeNumber(5), sample());
        ip.din.mode = IFDIR | 0o755;
        ip.store(&g, &mut block).expect("store");
        let back = Inode::load(&g, &block, InodeNumber(5)).expect("load");
        assert!(back.is_dir());
        assert_eq!(back.effnlink, 1);
        assert!(Inode::load(&g, &block, InodeNumber(6)).expect("neighbour").din.is_free());
        assert_eq!(g.ino_to_fsba(InodeNumber(5)), g.cgimin(GroupNumber(0)));
        assert!(LogicalBlock(11).is_direct());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn ufs1_pointers_survive_encoding(
            db in proptest::array::uniform12(0_i64..i64::from(i32::MAX)),
            size in 0_u64..(1 << 40),
        ) {
            let din = Dinode { mode: IFREG, nlink: 1, size, db, ..Dinode::default() };
            let mut image = vec![0_u8; 128];
            din.encode_into(FsFormat::Ufs1, &mut image).expect("encode");
            prop_assert_eq!(Dinode::decode(FsFormat::Ufs1, &image).expect("decode"), din);
        }
    }
}
