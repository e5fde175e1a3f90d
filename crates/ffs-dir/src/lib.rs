#![forbid(unsafe_code)]
//! Directory operations.
//!
//! UFS `struct direct` codec over a directory block: linear scan, entry
//! creation and deletion, rename-in-place, per-chunk compaction and `.`/`..`
//! management. Entries never cross a `DIRBLKSIZ` (512-byte) boundary.
//!
//! Compaction moves live entries; callers that track per-offset state (the
//! soft-updates engine) supply the mover so the bookkeeping follows the
//! bytes.

use ffs_error::{FfsError, Result};
use ffs_types::{DIRBLKSIZ, MAXNAMLEN};

/// `struct direct` header size (d_ino, d_reclen, d_type, d_namlen).
pub const DIR_ENTRY_HEADER_LEN: usize = 8;

pub const DT_UNKNOWN: u8 = 0;
pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Space an entry with a `name_len`-byte name needs (`DIRSIZ`).
#[must_use]
pub fn dirsiz(name_len: usize) -> usize {
    align4(DIR_ENTRY_HEADER_LEN + name_len + 1)
}

fn corrupt(detail: &str) -> FfsError {
    FfsError::Corruption {
        block: 0,
        detail: detail.to_owned(),
    }
}

fn read_u16_le(buf: &[u8], off: usize) -> Result<u16> {
    let bytes = buf
        .get(off..off + 2)
        .ok_or_else(|| corrupt("u16 read out of bounds"))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32_le(buf: &[u8], off: usize) -> Result<u32> {
    let bytes = buf
        .get(off..off + 4)
        .ok_or_else(|| corrupt("u32 read out of bounds"))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_u16_le(buf: &mut [u8], off: usize, value: u16) -> Result<()> {
    let dst = buf
        .get_mut(off..off + 2)
        .ok_or_else(|| corrupt("u16 write out of bounds"))?;
    dst.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_u32_le(buf: &mut [u8], off: usize, value: u32) -> Result<()> {
    let dst = buf
        .get_mut(off..off + 4)
        .ok_or_else(|| corrupt("u32 write out of bounds"))?;
    dst.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(FfsError::Format(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > MAXNAMLEN {
        return Err(FfsError::NameTooLong);
    }
    Ok(())
}

/// One directory entry as found in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Byte offset of the entry within the block.
    pub offset: usize,
    pub ino: u32,
    pub reclen: usize,
    pub file_type: u8,
    pub name: Vec<u8>,
}

/// Raw header of the entry at `off`, validated against its chunk.
fn entry_at(block: &[u8], off: usize) -> Result<(u32, usize, usize)> {
    let reclen = usize::from(read_u16_le(block, off + 4)?);
    let chunk_end = (off / DIRBLKSIZ + 1) * DIRBLKSIZ;
    if reclen < DIR_ENTRY_HEADER_LEN || reclen % 4 != 0 || off + reclen > chunk_end {
        return Err(corrupt("invalid directory entry reclen"));
    }
    let ino = read_u32_le(block, off)?;
    let namlen = usize::from(block[off + 7]);
    if ino != 0 && dirsiz(namlen) > reclen {
        return Err(corrupt("directory entry name exceeds reclen"));
    }
    Ok((ino, reclen, namlen))
}

fn write_entry(
    block: &mut [u8],
    offset: usize,
    ino: u32,
    reclen: usize,
    file_type: u8,
    name: &[u8],
) -> Result<()> {
    let namlen = u8::try_from(name.len()).map_err(|_| FfsError::NameTooLong)?;
    let reclen_u16 = u16::try_from(reclen)
        .map_err(|_| FfsError::Format("directory entry reclen exceeds u16".to_owned()))?;
    if reclen < dirsiz(name.len()) {
        return Err(FfsError::Format(
            "directory entry reclen smaller than minimum".to_owned(),
        ));
    }
    let end = offset + reclen;
    if end > block.len() {
        return Err(corrupt("directory entry exceeds block boundary"));
    }
    write_u32_le(block, offset, ino)?;
    write_u16_le(block, offset + 4, reclen_u16)?;
    block[offset + 6] = file_type;
    block[offset + 7] = namlen;
    let name_start = offset + DIR_ENTRY_HEADER_LEN;
    block[name_start..name_start + name.len()].copy_from_slice(name);
    block[name_start + name.len()..end].fill(0);
    Ok(())
}

/// Format an empty directory block: one free entry per chunk.
pub fn init_empty_block(block: &mut [u8]) -> Result<()> {
    if block.len() % DIRBLKSIZ != 0 {
        return Err(FfsError::Format(
            "directory block is not a multiple of DIRBLKSIZ".to_owned(),
        ));
    }
    block.fill(0);
    for chunk in (0..block.len()).step_by(DIRBLKSIZ) {
        write_u16_le(block, chunk + 4, DIRBLKSIZ as u16)?;
    }
    Ok(())
}

/// Initialize the first block of a new directory with `.` and `..`.
pub fn init_dir_block(block: &mut [u8], self_ino: u32, parent_ino: u32) -> Result<()> {
    init_empty_block(block)?;
    let dot_len = dirsiz(1);
    write_entry(block, 0, self_ino, dot_len, DT_DIR, b".")?;
    write_entry(block, dot_len, parent_ino, DIRBLKSIZ - dot_len, DT_DIR, b"..")?;
    Ok(())
}

/// All live entries of a block, in offset order.
pub fn parse_block(block: &[u8]) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut off = 0_usize;
    while off + DIR_ENTRY_HEADER_LEN <= block.len() {
        let (ino, reclen, namlen) = entry_at(block, off)?;
        if ino != 0 {
            let start = off + DIR_ENTRY_HEADER_LEN;
            entries.push(DirEntry {
                offset: off,
                ino,
                reclen,
                file_type: block[off + 6],
                name: block[start..start + namlen].to_vec(),
            });
        }
        off += reclen;
    }
    Ok(entries)
}

/// Find a live entry by name.
pub fn lookup(block: &[u8], name: &[u8]) -> Result<Option<DirEntry>> {
    validate_name(name)?;
    Ok(parse_block(block)?.into_iter().find(|e| e.name == name))
}

/// True when the block holds nothing but `.` and `..`.
pub fn is_empty_dir_block(block: &[u8]) -> Result<bool> {
    Ok(parse_block(block)?
        .iter()
        .all(|e| e.name == b"." || e.name == b".."))
}

/// Add an entry without moving any existing one.
///
/// Reuses a free leading slot of a chunk, otherwise splits the slack of a
/// live entry. Returns the offset of the new entry, or `NoSpace` when no
/// single slot is large enough (the chunk may still be compactable).
pub fn add_entry(block: &mut [u8], ino: u32, name: &[u8], file_type: u8) -> Result<usize> {
    if ino == 0 {
        return Err(FfsError::Format(
            "directory entry inode cannot be zero".to_owned(),
        ));
    }
    validate_name(name)?;
    let need = dirsiz(name.len());

    let mut off = 0_usize;
    while off + DIR_ENTRY_HEADER_LEN <= block.len() {
        let (cur_ino, reclen, namlen) = entry_at(block, off)?;
        if cur_ino == 0 {
            if reclen >= need {
                write_entry(block, off, ino, reclen, file_type, name)?;
                return Ok(off);
            }
        } else {
            let used = dirsiz(namlen);
            if reclen - used >= need {
                write_u16_le(block, off + 4, used as u16)?;
                let new_off = off + used;
                write_entry(block, new_off, ino, reclen - used, file_type, name)?;
                return Ok(new_off);
            }
        }
        off += reclen;
    }

    Err(FfsError::NoSpace)
}

/// Remove the entry named `name`.
///
/// A chunk's leading entry is cleared in place (`d_ino = 0`); any other
/// entry is absorbed into its predecessor's reclen. Returns the removed
/// entry's offset and inode number.
pub fn remove_entry(block: &mut [u8], name: &[u8]) -> Result<Option<(usize, u32)>> {
    validate_name(name)?;
    let mut off = 0_usize;
    let mut prev: Option<usize> = None;
    while off + DIR_ENTRY_HEADER_LEN <= block.len() {
        if off % DIRBLKSIZ == 0 {
            prev = None;
        }
        let (ino, reclen, namlen) = entry_at(block, off)?;
        let start = off + DIR_ENTRY_HEADER_LEN;
        if ino != 0 && &block[start..start + namlen] == name {
            match prev {
                Some(prev_off) => {
                    let prev_len = usize::from(read_u16_le(block, prev_off + 4)?);
                    let merged = u16::try_from(prev_len + reclen)
                        .map_err(|_| FfsError::Format("merged reclen exceeds u16".to_owned()))?;
                    write_u16_le(block, prev_off + 4, merged)?;
                }
                None => write_u32_le(block, off, 0)?,
            }
            return Ok(Some((off, ino)));
        }
        prev = Some(off);
        off += reclen;
    }
    Ok(None)
}

/// Inode number stored in the entry at `offset`.
pub fn entry_ino(block: &[u8], offset: usize) -> Result<u32> {
    read_u32_le(block, offset)
}

/// Point the entry at `offset` to a different inode (rename over an
/// existing name).
pub fn set_entry_ino(block: &mut [u8], offset: usize, ino: u32, file_type: u8) -> Result<()> {
    entry_at(block, offset)?;
    write_u32_le(block, offset, ino)?;
    block[offset + 6] = file_type;
    Ok(())
}

/// One relocation performed by [`compact_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMove {
    pub old_offset: usize,
    pub new_offset: usize,
    pub len: usize,
}

/// Squeeze the live entries of the chunk starting at `chunk` to the front,
/// leaving all free space in the last entry's reclen.
///
/// `mover` performs each byte move (`block`, `EntryMove`) so callers can keep
/// offset-indexed bookkeeping in step; [`move_entry_bytes`] is the plain
/// implementation. Returns the size of the free tail.
pub fn compact_chunk<F>(block: &mut [u8], chunk: usize, mut mover: F) -> Result<usize>
where
    F: FnMut(&mut [u8], EntryMove) -> Result<()>,
{
    if chunk % DIRBLKSIZ != 0 || chunk + DIRBLKSIZ > block.len() {
        return Err(FfsError::Format("compaction outside block".to_owned()));
    }
    let mut live = Vec::new();
    let mut off = chunk;
    while off < chunk + DIRBLKSIZ {
        let (ino, reclen, namlen) = entry_at(block, off)?;
        if ino != 0 {
            live.push((off, dirsiz(namlen)));
        }
        off += reclen;
    }

    let mut dest = chunk;
    let mut last: Option<usize> = None;
    for (src, size) in live {
        write_u16_le(block, src + 4, size as u16)?;
        if src != dest {
            mover(
                block,
                EntryMove {
                    old_offset: src,
                    new_offset: dest,
                    len: size,
                },
            )?;
        }
        last = Some(dest);
        dest += size;
    }

    let free = chunk + DIRBLKSIZ - dest;
    match last {
        Some(last_off) => {
            let size = usize::from(read_u16_le(block, last_off + 4)?);
            write_u16_le(block, last_off + 4, (size + free) as u16)?;
        }
        None => {
            write_u32_le(block, chunk, 0)?;
            write_u16_le(block, chunk + 4, DIRBLKSIZ as u16)?;
        }
    }
    Ok(free)
}

/// Plain byte move for [`compact_chunk`].
pub fn move_entry_bytes(block: &mut [u8], mv: EntryMove) -> Result<()> {
    if mv.old_offset + mv.len > block.len() || mv.new_offset + mv.len > block.len() {
        return Err(corrupt("entry move out of bounds"));
    }
    block.copy_within(mv.old_offset..mv.old_offset + mv.len, mv.new_offset);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_dir_block_contains_dot_and_dotdot() {
        let mut block = vec![0_u8; 2048];
        init_dir_block(&mut block, 11, 2).expect("init");
        let entries = parse_block(&block).expect("parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b".".to_vec());
        assert_eq!(entries[0].ino, 11);
        assert_eq!(entries[1].name, b"..".to_vec());
        assert_eq!(entries[1].ino, 2);
        assert_eq!(entries[1].offset, 12);
        assert!(is_empty_dir_block(&block).expect("empty"));
    }

    #[test]
    fn add_entry_splits_live_slot_slack() {
        let mut block = vec![0_u8; 1024];
        init_dir_block(&mut block, 3, 2).expect("init");
        let off = add_entry(&mut block, 33, b"hello", DT_REG).expect("add");
        assert_eq!(off, 24);
        let found = lookup(&block, b"hello").expect("lookup").expect("present");
        assert_eq!(found.ino, 33);
        assert_eq!(found.reclen, DIRBLKSIZ - 24);
        assert!(!is_empty_dir_block(&block).expect("not empty"));
    }

    #[test]
    fn add_entry_uses_free_leading_slot_of_next_chunk() {
        let mut block = vec![0_u8; 1024];
        init_empty_block(&mut block).expect("init");
        let off = add_entry(&mut block, 9, b"a", DT_REG).expect("first");
        assert_eq!(off, 0);
        // Fill the first chunk so the next add spills into chunk 1.
        let mut n = 0_u32;
        while add_entry(&mut block, 100 + n, format!("f{n:04}").as_bytes(), DT_REG)
            .expect("add")
            < DIRBLKSIZ
        {
            n += 1;
        }
        assert!(parse_block(&block).expect("parse").iter().any(|e| e.offset == DIRBLKSIZ));
    }

    #[test]
    fn remove_entry_coalesces_into_predecessor() {
        let mut block = vec![0_u8; 512];
        init_dir_block(&mut block, 3, 2).expect("init");
        let off = add_entry(&mut block, 40, b"victim", DT_REG).expect("add");
        let removed = remove_entry(&mut block, b"victim").expect("remove");
        assert_eq!(removed, Some((off, 40)));
        assert!(lookup(&block, b"victim").expect("lookup").is_none());
        assert_eq!(remove_entry(&mut block, b"victim").expect("again"), None);
        assert_eq!(parse_block(&block).expect("parse")[1].reclen, DIRBLKSIZ - 12);
    }

    #[test]
    fn remove_leading_entry_clears_ino() {
        let mut block = vec![0_u8; 512];
        init_empty_block(&mut block).expect("init");
        add_entry(&mut block, 5, b"only", DT_REG).expect("add");
        assert_eq!(remove_entry(&mut block, b"only").expect("rm"), Some((0, 5)));
        assert_eq!(entry_ino(&block, 0).expect("ino"), 0);
    }

    #[test]
    fn compaction_reports_every_move() {
        let mut block = vec![0_u8; 512];
        init_dir_block(&mut block, 3, 2).expect("init");
        let a = add_entry(&mut block, 10, b"aaaa", DT_REG).expect("a");
        add_entry(&mut block, 11, b"bbbb", DT_REG).expect("b");
        add_entry(&mut block, 12, b"cccc", DT_REG).expect("c");
        remove_entry(&mut block, b"aaaa").expect("rm a");
        // "aaaa" was folded into ".."'s reclen, leaving a hole before "bbbb".
        let mut moves = Vec::new();
        let free = compact_chunk(&mut block, 0, |blk, mv| {
            moves.push(mv);
            move_entry_bytes(blk, mv)
        })
        .expect("compact");
        assert_eq!(moves.len(), 2, "bbbb and cccc slide down");
        assert_eq!(moves[0].new_offset, a);
        let entries = parse_block(&block).expect("parse");
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].name, b"cccc".to_vec());
        assert_eq!(free + entries.iter().map(|e| dirsiz(e.name.len())).sum::<usize>(), DIRBLKSIZ);
    }

    #[test]
    fn rename_in_place_rewrites_ino() {
        let mut block = vec![0_u8; 512];
        init_dir_block(&mut block, 3, 2).expect("init");
        let off = add_entry(&mut block, 10, b"name", DT_REG).expect("add");
        set_entry_ino(&mut block, off, 77, DT_REG).expect("set");
        assert_eq!(entry_ino(&block, off).expect("ino"), 77);
    }

    #[test]
    fn rejects_corrupt_reclen() {
        let mut block = vec![0_u8; 512];
        init_empty_block(&mut block).expect("init");
        block[4] = 6;
        block[5] = 0;
        assert!(parse_block(&block).is_err());
        assert!(matches!(
            add_entry(&mut vec![0_u8; 512], 1, &[b'x'; 300], DT_REG),
            Err(FfsError::NameTooLong)
        ));
    }
}
