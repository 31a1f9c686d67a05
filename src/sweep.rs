use crate::globals::{align_down, align_up, BLOCK_SIZE};
use crate::header::Preheader;
use crate::manager::MemoryManager;
use crate::region::{Region, RegionKind};
use crate::small::{block_bit_clear, block_bit_test};

#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct SmallSweepStats {
    /// Bytes occupied by surviving objects, headers included.
    pub marked: usize,
    /// Bytes returned to the free lists.
    pub free: usize,
}

/// Free space recovered by a sweep, before installation into the area's
/// lists. Chunks are sub-block fragments; runs are whole free blocks.
#[derive(Default)]
struct Reclaimed {
    chunks: Vec<(*mut u8, usize)>,
    runs: Vec<(*mut u8, usize)>,
    stats: SmallSweepStats,
}

/// Sweeps the small object area. With a live set from Mark the selective
/// strategy touches only the marked objects; otherwise every in-use block is
/// walked header by header. Both strategies leave the area in an identical
/// state for identical liveness.
pub(crate) fn sweep_small(
    mm: &mut MemoryManager,
    live: Option<Vec<*mut Preheader>>,
) -> SmallSweepStats {
    mm.small.reset_free_lists();
    let reclaimed = match live {
        Some(set) => selective(mm, set),
        None => normal(mm),
    };
    unsafe {
        for &(start, len) in reclaimed.runs.iter() {
            mm.small.insert_block_run(start, len);
        }
    }
    mm.small.install_chunks(reclaimed.chunks);
    reclaimed.stats
}

impl Reclaimed {
    /// Splits the gap `[from, to)` into a leading chunk, whole-block runs and
    /// a trailing chunk, clearing the bitmap bit of every fully free block.
    unsafe fn reclaim_gap(&mut self, region: &Region, from: usize, to: usize) {
        debug_assert!(from < to);
        self.stats.free += to - from;
        let mut pos = from;
        if pos != align_down(pos, BLOCK_SIZE) {
            let end = to.min(align_up(pos, BLOCK_SIZE));
            self.chunks.push((pos as *mut u8, end - pos));
            pos = end;
        }
        let run_end = align_down(to, BLOCK_SIZE);
        if pos < run_end {
            for idx in region.block_index(pos)..region.block_index(run_end - 1) + 1 {
                block_bit_clear(region, idx);
            }
            self.runs.push((pos as *mut u8, run_end - pos));
            pos = run_end;
        }
        if pos < to {
            self.chunks.push((pos as *mut u8, to - pos));
        }
    }

    /// Closes the open run of free blocks, if any, at `end`.
    fn flush_run(&mut self, run_start: &mut Option<usize>, end: usize) {
        if let Some(start) = run_start.take() {
            self.stats.free += end - start;
            self.runs.push((start as *mut u8, end - start));
        }
    }
}

/// Selective sweep: sorts the live set by address, then reclaims the gaps
/// between consecutive survivors without ever parsing a header of dead
/// memory.
fn selective(mm: &mut MemoryManager, set: Vec<*mut Preheader>) -> Reclaimed {
    let mut addrs: Vec<usize> = set
        .into_iter()
        .map(|h| h as usize)
        .filter(|&a| {
            matches!(
                mm.regions.find_region(a).map(|r| r.kind),
                Some(RegionKind::Small)
            )
        })
        .collect();
    radix_sort(&mut addrs);

    let mut out = Reclaimed::default();
    let mut i = 0;
    unsafe {
        for region in mm.regions.iter() {
            if region.kind != RegionKind::Small {
                continue;
            }
            let region_end = region.end as usize;
            let mut prev = region.start as usize;
            while i < addrs.len() && addrs[i] < region_end {
                let addr = addrs[i];
                i += 1;
                debug_assert!(addr >= prev);
                if addr > prev {
                    out.reclaim_gap(region, prev, addr);
                }
                let h = addr as *mut Preheader;
                (*h).clear_mark();
                out.stats.marked += (*h).size();
                prev = addr + (*h).size();
            }
            if prev < region_end {
                out.reclaim_gap(region, prev, region_end);
            }
        }
    }
    out
}

/// Normal sweep: walks every block of every small region. In-use blocks are
/// parsed header by header; blocks that come out (or already were) entirely
/// free coalesce into maximal runs.
fn normal(mm: &mut MemoryManager) -> Reclaimed {
    let mut out = Reclaimed::default();
    unsafe {
        for region in mm.regions.iter() {
            if region.kind != RegionKind::Small {
                continue;
            }
            let mut run_start: Option<usize> = None;
            for idx in 0..region.block_count() {
                let block_start = region.start as usize + idx * BLOCK_SIZE;
                if !block_bit_test(region, idx) {
                    run_start.get_or_insert(block_start);
                    continue;
                }
                let end = block_start + BLOCK_SIZE;
                let mut pos = block_start;
                let mut gap_start = None;
                let mut any_live = false;
                let mut block_chunks: Vec<(usize, usize)> = Vec::new();
                while pos < end {
                    let h = pos as *mut Preheader;
                    let size = (*h).size();
                    if size == 0 {
                        break;
                    }
                    if !(*h).is_free() && (*h).is_marked() {
                        (*h).clear_mark();
                        out.stats.marked += size;
                        any_live = true;
                        if let Some(start) = gap_start.take() {
                            block_chunks.push((start, pos - start));
                        }
                    } else if gap_start.is_none() {
                        gap_start = Some(pos);
                    }
                    pos += size;
                }
                if let Some(start) = gap_start {
                    block_chunks.push((start, pos - start));
                }
                if any_live {
                    out.flush_run(&mut run_start, block_start);
                    for (start, len) in block_chunks {
                        out.stats.free += len;
                        out.chunks.push((start as *mut u8, len));
                    }
                } else {
                    block_bit_clear(region, idx);
                    run_start.get_or_insert(block_start);
                }
            }
            out.flush_run(&mut run_start, region.end as usize);
        }
    }
    out
}

/// Byte-wise LSD radix sort; passes whose digit is constant across the whole
/// input are skipped, so region-local address sets take two or three passes.
pub(crate) fn radix_sort(v: &mut Vec<usize>) {
    if v.len() < 2 {
        return;
    }
    let mut aux = vec![0usize; v.len()];
    for pass in 0..std::mem::size_of::<usize>() {
        let shift = pass * 8;
        let mut counts = [0usize; 256];
        let first = (v[0] >> shift) & 0xff;
        let mut uniform = true;
        for &x in v.iter() {
            let digit = (x >> shift) & 0xff;
            counts[digit] += 1;
            uniform &= digit == first;
        }
        if uniform {
            continue;
        }
        let mut total = 0;
        for c in counts.iter_mut() {
            let n = *c;
            *c = total;
            total += n;
        }
        for &x in v.iter() {
            let digit = (x >> shift) & 0xff;
            aux[counts[digit]] = x;
            counts[digit] += 1;
        }
        std::mem::swap(v, &mut aux);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radix_sort_orders_addresses() {
        let mut v = vec![
            0x7f00_0042_3000usize,
            0x7f00_0040_1008,
            0x7f00_0040_1000,
            0x7f00_0041_0ff8,
            0x7f00_0040_1008,
        ];
        let mut expected = v.clone();
        expected.sort_unstable();
        radix_sort(&mut v);
        assert_eq!(v, expected);
    }

    #[test]
    fn radix_sort_handles_trivial_inputs() {
        let mut empty: Vec<usize> = Vec::new();
        radix_sort(&mut empty);
        assert!(empty.is_empty());
        let mut one = vec![42];
        radix_sort(&mut one);
        assert_eq!(one, vec![42]);
    }
}
