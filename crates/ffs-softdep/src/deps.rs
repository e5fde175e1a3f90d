#![forbid(unsafe_code)]
//! Dependency records.
//!
//! Fourteen kinds of record make up the graph. Each carries a
//! [`WorkHeader`] with its state flags and the one work list it is linked
//! on, if any. Cross references between records are arena indices; the
//! typed sub-lists (an inode's pending block updates, a page's offset-hashed
//! directory additions, ...) are plain vectors of indices in the owner.

use crate::arena::Idx;
use bitflags::bitflags;
use ffs_types::{BlockNumber, InodeNumber, LogicalBlock, NDADDR, NIADDR};
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Per-record state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DepState: u32 {
        const ATTACHED = 0x0001;
        const UNDONE = 0x0002;
        const COMPLETE = 0x0004;
        const DEPCOMPLETE = 0x0008;
        const MKDIR_PARENT = 0x0010;
        const MKDIR_BODY = 0x0020;
        const RMDIR = 0x0040;
        const DIRCHG = 0x0080;
        const GOINGAWAY = 0x0100;
        const IOSTARTED = 0x0200;
        const NEWBLOCK = 0x0800;
        const UFS1FMT = 0x2000;
        const ONWORKLIST = 0x8000;
        const ALLCOMPLETE = Self::ATTACHED.bits() | Self::COMPLETE.bits() | Self::DEPCOMPLETE.bits();
    }
}

impl DepState {
    /// All of `ATTACHED`, `COMPLETE` and `DEPCOMPLETE` are set.
    #[must_use]
    pub fn all_complete(self) -> bool {
        self.contains(Self::ALLCOMPLETE)
    }
}

/// Number of offset-hashed addition lists per directory page.
pub const DAHASHSZ: usize = 14;

/// Addition-list bucket for a directory entry at byte `offset` of its block.
#[must_use]
pub fn dahash(offset: usize) -> usize {
    (offset >> 2) % DAHASHSZ
}

/// The work list a record is currently linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListId {
    /// Dependency list of the buffer at this address.
    Buf(BlockNumber),
    /// Parked indirect-block record of a truncated file, keyed by the
    /// indirect block's address.
    GoingAway(BlockNumber),
    /// Released when the inode block is written.
    BufWait(Idx<InodeDep>),
    /// Released on the next inode update.
    InoWait(Idx<InodeDep>),
    /// Directory additions whose inode is durable.
    PendingHd(Idx<InodeDep>),
    /// New directory block waiting for its block pointer.
    NewDirBlk(Idx<AllocDirect>),
    /// The global queue of deferred actions.
    Worklist,
}

/// Header shared by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkHeader {
    pub state: DepState,
    pub link: Option<ListId>,
}

impl WorkHeader {
    #[must_use]
    pub fn new(state: DepState) -> Self {
        Self { state, link: None }
    }
}

/// Reference to any record: a closed sum over the fourteen kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkRef {
    PageDep(Idx<PageDep>),
    InodeDep(Idx<InodeDep>),
    NewBlk(Idx<NewBlk>),
    BmSafeMap(Idx<BmSafeMap>),
    AllocDirect(Idx<AllocDirect>),
    IndirDep(Idx<IndirDep>),
    AllocIndir(Idx<AllocIndir>),
    FreeFrag(Idx<FreeFrag>),
    FreeBlks(Idx<FreeBlks>),
    FreeFile(Idx<FreeFile>),
    DirAdd(Idx<DirAdd>),
    Mkdir(Idx<Mkdir>),
    DirRem(Idx<DirRem>),
    NewDirBlk(Idx<NewDirBlk>),
}

/// Kind tag, used for diagnostics and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepKind {
    PageDep,
    InodeDep,
    NewBlk,
    BmSafeMap,
    AllocDirect,
    IndirDep,
    AllocIndir,
    FreeFrag,
    FreeBlks,
    FreeFile,
    DirAdd,
    Mkdir,
    DirRem,
    NewDirBlk,
}

impl DepKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::PageDep => "pagedep",
            Self::InodeDep => "inodedep",
            Self::NewBlk => "newblk",
            Self::BmSafeMap => "bmsafemap",
            Self::AllocDirect => "allocdirect",
            Self::IndirDep => "indirdep",
            Self::AllocIndir => "allocindir",
            Self::FreeFrag => "freefrag",
            Self::FreeBlks => "freeblks",
            Self::FreeFile => "freefile",
            Self::DirAdd => "diradd",
            Self::Mkdir => "mkdir",
            Self::DirRem => "dirrem",
            Self::NewDirBlk => "newdirblk",
        }
    }
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl WorkRef {
    #[must_use]
    pub fn kind(self) -> DepKind {
        match self {
            Self::PageDep(_) => DepKind::PageDep,
            Self::InodeDep(_) => DepKind::InodeDep,
            Self::NewBlk(_) => DepKind::NewBlk,
            Self::BmSafeMap(_) => DepKind::BmSafeMap,
            Self::AllocDirect(_) => DepKind::AllocDirect,
            Self::IndirDep(_) => DepKind::IndirDep,
            Self::AllocIndir(_) => DepKind::AllocIndir,
            Self::FreeFrag(_) => DepKind::FreeFrag,
            Self::FreeBlks(_) => DepKind::FreeBlks,
            Self::FreeFile(_) => DepKind::FreeFile,
            Self::DirAdd(_) => DepKind::DirAdd,
            Self::Mkdir(_) => DepKind::Mkdir,
            Self::DirRem(_) => DepKind::DirRem,
            Self::NewDirBlk(_) => DepKind::NewDirBlk,
        }
    }
}

/// Pending directory changes of one directory block.
#[derive(Debug)]
pub struct PageDep {
    pub hdr: WorkHeader,
    pub ino: InodeNumber,
    pub lbn: LogicalBlock,
    /// Removals waiting for the block to be written.
    pub dirremhd: Vec<Idx<DirRem>>,
    /// Additions whose inode is not yet durable, bucketed by [`dahash`].
    pub diraddhd: [Vec<Idx<DirAdd>>; DAHASHSZ],
    /// Additions that are safe but whose block has not been written.
    pub pendinghd: Vec<Idx<DirAdd>>,
}

impl PageDep {
    #[must_use]
    pub fn new(ino: InodeNumber, lbn: LogicalBlock) -> Self {
        Self {
            hdr: WorkHeader::new(DepState::empty()),
            ino,
            lbn,
            dirremhd: Vec::new(),
            diraddhd: Default::default(),
            pendinghd: Vec::new(),
        }
    }

    #[must_use]
    pub fn has_additions(&self) -> bool {
        self.diraddhd.iter().any(|l| !l.is_empty())
    }
}

/// Everything pending against one inode.
#[derive(Debug)]
pub struct InodeDep {
    pub hdr: WorkHeader,
    pub ino: InodeNumber,
    /// On-disk link count minus effective link count.
    pub nlinkdelta: i32,
    /// Image of a never-written inode, held while zeroes go to disk.
    pub saved_image: Option<Vec<u8>>,
    /// Real file size while a rolled-back size is on its way to disk.
    pub savedsize: Option<u64>,
    /// Bitmap record the inode allocation waits on.
    pub bmsafemap: Option<Idx<BmSafeMap>>,
    pub pendinghd: Vec<WorkRef>,
    pub bufwait: Vec<WorkRef>,
    pub inowait: Vec<WorkRef>,
    /// Block pointer updates already copied to the inode buffer, by lbn.
    pub inoupdt: Vec<Idx<AllocDirect>>,
    /// Block pointer updates made since the last inode update, by lbn.
    pub newinoupdt: Vec<Idx<AllocDirect>>,
}

impl InodeDep {
    #[must_use]
    pub fn new(ino: InodeNumber) -> Self {
        Self {
            hdr: WorkHeader::new(DepState::ALLCOMPLETE),
            ino,
            nlinkdelta: 0,
            saved_image: None,
            savedsize: None,
            bmsafemap: None,
            pendinghd: Vec::new(),
            bufwait: Vec::new(),
            inowait: Vec::new(),
            inoupdt: Vec::new(),
            newinoupdt: Vec::new(),
        }
    }

    /// No list holds anything.
    #[must_use]
    pub fn lists_empty(&self) -> bool {
        self.pendinghd.is_empty()
            && self.bufwait.is_empty()
            && self.inowait.is_empty()
            && self.inoupdt.is_empty()
            && self.newinoupdt.is_empty()
    }
}

/// A freshly allocated block waiting to be claimed by its pointer record.
#[derive(Debug)]
pub struct NewBlk {
    pub hdr: WorkHeader,
    pub newblkno: BlockNumber,
    pub bmsafemap: Option<Idx<BmSafeMap>>,
}

/// Records waiting on one cylinder-group bitmap write.
#[derive(Debug)]
pub struct BmSafeMap {
    pub hdr: WorkHeader,
    pub buf: BlockNumber,
    pub allocdirecthd: Vec<Idx<AllocDirect>>,
    pub allocindirhd: Vec<Idx<AllocIndir>>,
    pub inodedephd: Vec<Idx<InodeDep>>,
    pub newblkhd: Vec<Idx<NewBlk>>,
}

/// A new direct (or inode-held indirect) block pointer.
///
/// Direct blocks use lbn `0..NDADDR`; the inode's indirect pointer `i`
/// uses lbn `NDADDR + i`.
#[derive(Debug)]
pub struct AllocDirect {
    pub hdr: WorkHeader,
    pub lbn: LogicalBlock,
    pub newblkno: BlockNumber,
    pub oldblkno: BlockNumber,
    pub newsize: u32,
    pub oldsize: u32,
    pub freefrag: Option<Idx<FreeFrag>>,
    pub inodedep: Idx<InodeDep>,
    pub bmsafemap: Option<Idx<BmSafeMap>>,
    /// Buffer of the new block; the record is on its dependency list.
    pub buf: BlockNumber,
    /// At most one [`NewDirBlk`].
    pub newdirblk: Vec<WorkRef>,
}

impl AllocDirect {
    /// Pointer slot in the inode: direct index or `NDADDR + indirect level`.
    #[must_use]
    pub fn slot(&self) -> usize {
        usize::try_from(self.lbn.0).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.slot() < NDADDR
    }
}

/// One indirect-block buffer with pointers that are not yet safe.
#[derive(Debug)]
pub struct IndirDep {
    pub hdr: WorkHeader,
    /// Address of the indirect block.
    pub blkno: BlockNumber,
    /// Contents that are safe to put on disk.
    pub safecopy: Vec<u8>,
    /// Live contents while the safe copy is being written.
    pub saveddata: Option<Vec<u8>>,
    pub deplisthd: Vec<Idx<AllocIndir>>,
    /// Completed while a write was in flight; finished on completion.
    pub donehd: Vec<Idx<AllocIndir>>,
}

/// A new pointer inside an indirect block.
#[derive(Debug)]
pub struct AllocIndir {
    pub hdr: WorkHeader,
    /// Pointer index within the indirect block.
    pub offset: usize,
    pub newblkno: BlockNumber,
    pub oldblkno: BlockNumber,
    pub freefrag: Option<Idx<FreeFrag>>,
    pub indirdep: Option<Idx<IndirDep>>,
    pub bmsafemap: Option<Idx<BmSafeMap>>,
    /// Buffer of the new block.
    pub buf: BlockNumber,
}

/// Fragment run to release once the replacing pointer is durable.
#[derive(Debug)]
pub struct FreeFrag {
    pub hdr: WorkHeader,
    pub ino: InodeNumber,
    pub blkno: BlockNumber,
    pub size: u32,
}

/// Blocks of a truncated file, released once the zeroed inode is durable.
#[derive(Debug)]
pub struct FreeBlks {
    pub hdr: WorkHeader,
    pub ino: InodeNumber,
    pub oldsize: u64,
    /// Fragments the inode claimed, for the release cross-check.
    pub chkcnt: u64,
    pub dblks: [i64; NDADDR],
    pub iblks: [i64; NIADDR],
}

/// An inode to release once its zeroed image is durable.
#[derive(Debug)]
pub struct FreeFile {
    pub hdr: WorkHeader,
    pub ino: InodeNumber,
    pub mode: u16,
}

/// A directory entry whose inode is not yet known to be durable.
#[derive(Debug)]
pub struct DirAdd {
    pub hdr: WorkHeader,
    /// Byte offset of the entry within its directory block.
    pub offset: usize,
    pub newinum: InodeNumber,
    pub pagedep: Idx<PageDep>,
    /// For a changed entry: the removal of the name it replaced.
    pub previous: Option<Idx<DirRem>>,
}

/// Half of the `.`/`..` ordering of a new directory.
#[derive(Debug)]
pub struct Mkdir {
    pub hdr: WorkHeader,
    pub diradd: Idx<DirAdd>,
    /// Buffer whose write satisfies this half.
    pub buf: BlockNumber,
}

/// A removed directory entry; decrements the link count once the
/// directory block is durable.
#[derive(Debug)]
pub struct DirRem {
    pub hdr: WorkHeader,
    pub oldinum: InodeNumber,
    /// Directory that held the entry.
    pub dirinum: InodeNumber,
    /// Page the removal waits on; cleared once it is actionable.
    pub pagedep: Option<Idx<PageDep>>,
}

/// First write of a brand-new directory block.
#[derive(Debug)]
pub struct NewDirBlk {
    pub hdr: WorkHeader,
    pub pagedep: Idx<PageDep>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allcomplete_is_the_three_completion_bits() {
        let s = DepState::ATTACHED | DepState::COMPLETE;
        assert!(!s.all_complete());
        assert!((s | DepState::DEPCOMPLETE).all_complete());
        assert_eq!(DepState::ALLCOMPLETE.bits(), 0xd);
    }

    #[test]
    fn dahash_buckets_by_word_offset() {
        assert_eq!(dahash(0), 0);
        assert_eq!(dahash(12), 3);
        assert_eq!(dahash(56), 0);
        assert!((0..4096).step_by(4).all(|o| dahash(o) < DAHASHSZ));
    }
}
