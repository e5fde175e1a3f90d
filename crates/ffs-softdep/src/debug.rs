#![forbid(unsafe_code)]
//! Human-readable dumps of buffer dependency lists.

use crate::deps::WorkRef;
use crate::graph::DepGraph;
use crate::Softdep;
use ffs_types::BlockNumber;
use std::fmt::{self, Write};

/// Widest indentation a nested dump uses.
const MAX_DEPTH: usize = 16;

impl DepGraph {
    /// Write every dependency attached to the buffer at `blkno`.
    pub fn print(&self, blkno: BlockNumber, full: usize, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "  deps:")?;
        for &item in self.buf_deps(blkno) {
            self.worklist_print(item, full, out)?;
        }
        Ok(())
    }

    /// Write one record, indented by `full` levels.
    pub fn worklist_print(&self, item: WorkRef, full: usize, out: &mut impl Write) -> fmt::Result {
        let prefix = " ".repeat(2 * full.min(MAX_DEPTH));
        let Ok(hdr) = self.header(item) else {
            return writeln!(out, "{prefix}{}(stale)", item.kind());
        };
        write!(out, "{prefix}{}({item:?}) state {:?}\n{prefix}", item.kind(), hdr.state)?;
        let stale = |out: &mut dyn Write| writeln!(out, "(stale)");
        match item {
            WorkRef::PageDep(i) => match self.get(i) {
                Ok(p) => writeln!(out, "ino {} lbn {}", p.ino, p.lbn),
                Err(_) => stale(out),
            },
            WorkRef::InodeDep(i) => match self.get(i) {
                Ok(d) => writeln!(
                    out,
                    "ino {} nlinkdelta {} saved {}\n{prefix}  bmsafemap {:?} savsz {:?}",
                    d.ino,
                    d.nlinkdelta,
                    d.saved_image.is_some(),
                    d.bmsafemap,
                    d.savedsize
                ),
                Err(_) => stale(out),
            },
            WorkRef::NewBlk(i) => match self.get(i) {
                Ok(n) => writeln!(out, "newblk {} bmsafemap {:?}", n.newblkno, n.bmsafemap),
                Err(_) => stale(out),
            },
            WorkRef::BmSafeMap(i) => match self.get(i) {
                Ok(m) => writeln!(out, "buf {}", m.buf),
                Err(_) => stale(out),
            },
            WorkRef::AllocDirect(i) => match self.get(i) {
                Ok(a) => writeln!(
                    out,
                    "lbn {} newblk {} oldblk {} newsize {} oldsize {}\n{prefix}  bp {} inodedep {:?} freefrag {:?}",
                    a.lbn, a.newblkno, a.oldblkno, a.newsize, a.oldsize, a.buf, a.inodedep, a.freefrag
                ),
                Err(_) => stale(out),
            },
            WorkRef::IndirDep(i) => match self.get(i) {
                Ok(d) => writeln!(
                    out,
                    "blkno {} saved {} pending {} done {}",
                    d.blkno,
                    d.saveddata.is_some(),
                    d.deplisthd.len(),
                    d.donehd.len()
                ),
                Err(_) => stale(out),
            },
            WorkRef::AllocIndir(i) => match self.get(i) {
                Ok(a) => writeln!(
                    out,
                    "off {} newblk {} oldblk {} freefrag {:?}\n{prefix}  indirdep {:?} buf {}",
                    a.offset, a.newblkno, a.oldblkno, a.freefrag, a.indirdep, a.buf
                ),
                Err(_) => stale(out),
            },
            WorkRef::FreeFrag(i) => match self.get(i) {
                Ok(f) => writeln!(out, "blkno {} fsize {} ino {}", f.blkno, f.size, f.ino),
                Err(_) => stale(out),
            },
            WorkRef::FreeBlks(i) => match self.get(i) {
                Ok(f) => writeln!(out, "previno {} oldsz {}\n{prefix}  chkcnt {}", f.ino, f.oldsize, f.chkcnt),
                Err(_) => stale(out),
            },
            WorkRef::FreeFile(i) => match self.get(i) {
                Ok(f) => writeln!(out, "mode {:o} oldino {}", f.mode, f.ino),
                Err(_) => stale(out),
            },
            WorkRef::DirAdd(i) => match self.get(i) {
                Ok(d) => writeln!(out, "off {} ino {} previous {:?}", d.offset, d.newinum, d.previous),
                Err(_) => stale(out),
            },
            WorkRef::Mkdir(i) => match self.get(i) {
                Ok(m) => writeln!(out, "diradd {:?} bp {}", m.diradd, m.buf),
                Err(_) => stale(out),
            },
            WorkRef::DirRem(i) => match self.get(i) {
                Ok(d) => writeln!(out, "ino {} dirino {} pagedep {:?}", d.oldinum, d.dirinum, d.pagedep),
                Err(_) => stale(out),
            },
            WorkRef::NewDirBlk(i) => match self.get(i) {
                Ok(d) => writeln!(out, "pagedep {:?}", d.pagedep),
                Err(_) => stale(out),
            },
        }
    }
}

impl Softdep {
    /// Render the dependency list of the buffer at `blkno`.
    #[must_use]
    pub fn print(&self, blkno: BlockNumber) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.with_graph(|g| g.print(blkno, 1, &mut out));
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::deps::{DepState, ListId, PageDep};
    use crate::graph::tests::graph;
    use crate::WorkRef;
    use ffs_types::{BlockNumber, InodeNumber, LogicalBlock};

    #[test]
    fn dump_names_each_record_on_the_buffer() {
        let mut g = graph();
        let pd = g.alloc(PageDep::new(InodeNumber(2), LogicalBlock(3)));
        g.worklist_insert(ListId::Buf(BlockNumber(40)), WorkRef::PageDep(pd))
            .expect("attach");
        *g.state_mut(pd).expect("state") |= DepState::NEWBLOCK;

        let mut out = String::new();
        g.print(BlockNumber(40), 1, &mut out).expect("format");
        assert!(out.starts_with("  deps:\n"));
        assert!(out.contains("pagedep"));
        assert!(out.contains("ino 2 lbn 3"));
        assert!(out.contains("NEWBLOCK"));

        let mut empty = String::new();
        g.print(BlockNumber(41), 1, &mut empty).expect("format");
        assert_eq!(empty, "  deps:\n");
    }
}
