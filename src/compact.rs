//! Online segment compaction.
//!
//! Candidates arrive as the dirty set: segments whose valid bytes
//! shrank since the last cycle. A pass first deletes empty segments,
//! then tries to combine each survivor with a neighbour, preferring the
//! left one so records only ever move leftward in the segment order.
//!
//! Crash safety: a combine never removes data from the source file
//! until the destination has been synced with the combined contents,
//! and hole rewriting inside the destination goes through a synced
//! `.rdt` temp file that recovery knows how to classify.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::handles::HandleCache;
use crate::msg_index::{LocationIndex, MsgLoc};
use crate::record::{MsgId, FRAMING};
use crate::segment::{self, segment_path, temp_path};
use crate::summary::SummaryIndex;
use crate::{Error, Result};

pub struct CompactCtx<'a> {
    pub root: &'a Path,
    pub cap: u64,
    pub current_segment: u64,
    pub summary: &'a mut SummaryIndex,
    pub index: &'a mut Box<dyn LocationIndex>,
    pub handles: &'a mut HandleCache,
}

/// Run one compaction cycle over the dirty set, which is drained.
pub fn run(ctx: &mut CompactCtx<'_>, dirty: &mut HashSet<u64>) -> Result<()> {
    let mut candidates: Vec<u64> = dirty.drain().collect();
    candidates.sort_unstable();

    let mut survivors = Vec::new();
    for seg in candidates {
        let summary = match ctx.summary.lookup(seg) {
            Some(summary) => summary,
            None => continue,
        };
        if summary.valid_bytes == 0 && seg != ctx.current_segment {
            delete_segment(ctx, seg)?;
        } else {
            survivors.push(seg);
        }
    }

    for seg in survivors {
        // The survivor may itself have been absorbed earlier this pass.
        let summary = match ctx.summary.lookup(seg) {
            Some(summary) => summary,
            None => continue,
        };
        if seg == ctx.current_segment {
            // The append segment is never compacted; its holes stay on
            // the candidate list for after it rolls.
            dirty.insert(seg);
            continue;
        }
        if let Some(left) = summary.left {
            let left_valid = ctx
                .summary
                .lookup(left)
                .ok_or(Error::Corrupt("left neighbour missing from summary"))?
                .valid_bytes;
            if left != ctx.current_segment && left_valid + summary.valid_bytes <= ctx.cap {
                combine(ctx, left, seg)?;
                continue;
            }
        }
        if let Some(right) = summary.right {
            let right_valid = ctx
                .summary
                .lookup(right)
                .ok_or(Error::Corrupt("right neighbour missing from summary"))?
                .valid_bytes;
            if right != ctx.current_segment && summary.valid_bytes + right_valid <= ctx.cap {
                combine(ctx, seg, right)?;
            }
        }
    }
    Ok(())
}

fn delete_segment(ctx: &mut CompactCtx<'_>, seg: u64) -> Result<()> {
    ctx.handles.evict(seg);
    ctx.summary.unlink(seg)?;
    std::fs::remove_file(segment_path(ctx.root, seg))?;
    log::debug!("deleted empty segment {seg}");
    Ok(())
}

/// Absorb `source` into its left neighbour `dest`.
fn combine(ctx: &mut CompactCtx<'_>, dest: u64, source: u64) -> Result<()> {
    ctx.handles.evict(dest);
    ctx.handles.evict(source);
    let dest_summary = ctx
        .summary
        .lookup(dest)
        .ok_or(Error::Corrupt("combine destination missing from summary"))?;
    let source_summary = ctx
        .summary
        .lookup(source)
        .ok_or(Error::Corrupt("combine source missing from summary"))?;
    let total = dest_summary.valid_bytes + source_summary.valid_bytes;

    if dest_summary.contiguous_prefix < dest_summary.valid_bytes {
        rewrite_holes(
            ctx,
            dest,
            dest_summary.contiguous_prefix,
            dest_summary.valid_bytes,
            total,
        )?;
    }
    copy_live(ctx, source, dest, dest_summary.valid_bytes)?;

    {
        let d = ctx
            .summary
            .get_mut(dest)
            .ok_or(Error::Corrupt("combine destination missing from summary"))?;
        d.valid_bytes = total;
        d.contiguous_prefix = total;
        d.right = source_summary.right;
    }
    if let Some(right) = source_summary.right {
        if let Some(r) = ctx.summary.get_mut(right) {
            r.left = Some(dest);
        }
    }
    ctx.summary.remove(source);
    std::fs::remove_file(segment_path(ctx.root, source))?;
    log::debug!("combined segment {source} into {dest}, {total} valid bytes");
    Ok(())
}

/// Pack the destination's live records above its contiguous prefix
/// through a temp file, then truncate-and-extend to make room for
/// `total` combined bytes.
fn rewrite_holes(
    ctx: &mut CompactCtx<'_>,
    dest: u64,
    contig: u64,
    valid: u64,
    total: u64,
) -> Result<()> {
    let mut moved: Vec<(MsgId, MsgLoc)> = ctx
        .index
        .match_by_segment(dest)?
        .into_iter()
        .filter(|(_, loc)| loc.offset >= contig)
        .collect();
    moved.sort_by_key(|(_, loc)| loc.offset);

    let tmp = temp_path(ctx.root, dest);
    let mut reader = File::open(segment_path(ctx.root, dest))?;
    {
        let tmp_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(tmp_file);
        let mut buf = Vec::new();
        for (_, loc) in &moved {
            read_exact_at(&mut reader, loc.offset, loc.size + FRAMING, &mut buf)?;
            writer.write_all(&buf)?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
    }
    debug_assert_eq!(
        contig + moved.iter().map(|(_, l)| l.size + FRAMING).sum::<u64>(),
        valid
    );

    // The temp file is durable; only now is the destination disturbed.
    let mut dest_file = segment::truncate_and_extend(&segment_path(ctx.root, dest), contig, total)?;
    let mut tmp_reader = File::open(&tmp)?;
    io::copy(&mut tmp_reader, &mut dest_file)?;
    dest_file.sync_data()?;
    std::fs::remove_file(&tmp)?;

    let mut new_offset = contig;
    for (id, mut loc) in moved {
        loc.offset = new_offset;
        new_offset += loc.size + FRAMING;
        ctx.index.insert(id, loc)?;
    }
    Ok(())
}

/// Stream the source's live records, in ascending offset order, onto
/// the destination starting at `write_from`. Adjacent records are
/// copied as a single block.
fn copy_live(ctx: &mut CompactCtx<'_>, source: u64, dest: u64, write_from: u64) -> Result<()> {
    let mut live = ctx.index.match_by_segment(source)?;
    live.sort_by_key(|(_, loc)| loc.offset);

    let mut reader = File::open(segment_path(ctx.root, source))?;
    let dest_file = OpenOptions::new()
        .write(true)
        .open(segment_path(ctx.root, dest))?;
    let mut writer = BufWriter::new(dest_file);
    writer.seek(SeekFrom::Start(write_from))?;

    let mut buf = Vec::new();
    let mut moves: Vec<(MsgId, MsgLoc)> = Vec::with_capacity(live.len());
    let mut new_offset = write_from;
    let mut i = 0;
    while i < live.len() {
        let start = live[i].1.offset;
        let mut end = start + live[i].1.size + FRAMING;
        let mut j = i + 1;
        while j < live.len() && live[j].1.offset == end {
            end += live[j].1.size + FRAMING;
            j += 1;
        }
        read_exact_at(&mut reader, start, end - start, &mut buf)?;
        writer.write_all(&buf)?;
        for (id, loc) in &live[i..j] {
            let mut rewritten = *loc;
            rewritten.segment = dest;
            rewritten.offset = new_offset + (loc.offset - start);
            moves.push((*id, rewritten));
        }
        new_offset += end - start;
        i = j;
    }
    writer.flush()?;
    writer.get_ref().sync_data()?;

    for (id, loc) in moves {
        ctx.index.insert(id, loc)?;
    }
    Ok(())
}

fn read_exact_at(file: &mut File, offset: u64, len: u64, buf: &mut Vec<u8>) -> Result<()> {
    buf.resize(len as usize, 0);
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;
    Ok(())
}
