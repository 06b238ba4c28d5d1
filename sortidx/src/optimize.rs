// Reorder engine. Queries get cheaper when slice ranges overlap less, so
// optimization reorders chunks within each block (by per-chunk start, stop
// or median values) and slices within each superblock (by per-slice range
// endpoints or median-of-medians), re-sorting every touched slice and
// rewriting its derived arrays. All data movement goes through a scratch
// area beside the index; the scratch holds plain uncompressed mirrors and
// is removed on every exit path.
//
// Overlap statistics are recomputed after each phase and stop the schedule
// early once the index is ordered enough: fewer than four overlapping
// pairs, under 1% non-zero multiplicity, an overlap index under 0.1%, or a
// chunk swap that improved the overlap index by less than 10%.

use tempfile::TempDir;
use tracing::debug;

use crate::array::ChunkedArray;
use crate::index::{derived_rows, Index};
use crate::ioutil::Media;
use crate::key::IndexKey;
use crate::meta::ReordOpts;
use sortidx_base::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapMode {
    Start,
    Stop,
    Median,
}

#[derive(Debug, Clone, Copy)]
enum SwapAction {
    Create,
    Chunks(SwapMode),
    Slices(SwapMode),
}

const TH_NOVER: usize = 4; // minimum overlapping pairs
const TH_MULT: f64 = 0.01; // minimum non-zero multiplicity ratio
const TH_TOVER: f64 = 0.001; // minimum overlap index
const TH_IMPROVE: f64 = 0.1; // minimum per-chunk-swap improvement

struct Scratch<T: IndexKey> {
    // Dropping the guard removes the whole scratch directory.
    _guard: Option<TempDir>,
    sorted: ChunkedArray<T>,
    indices: ChunkedArray<i64>,
    ranges: ChunkedArray<T>,
    bounds: ChunkedArray<T>,
    abounds: ChunkedArray<T>,
    zbounds: ChunkedArray<T>,
    mbounds: ChunkedArray<T>,
    mranges: ChunkedArray<T>,
}

impl<T: IndexKey> Index<T> {
    /// Run the reorder phases for `level` (or the defaults stored at
    /// creation when `None`).
    pub fn optimize(&mut self, level: Option<u8>) -> Result<()> {
        if self.nslices() <= 1 {
            debug!(target: "sortidx", "single slice, skipping optimization");
            return Ok(());
        }
        let opts = match level {
            Some(l) => ReordOpts::for_level(l),
            None => self.reord,
        };
        if !opts.any() {
            return Ok(());
        }
        let mut scratch = self.create_scratch()?;
        let mut last_tover = 0.0_f64;
        // The statistics right after scratch creation already decide
        // whether any phase is worth running at all.
        if self.swap(SwapAction::Create, &mut scratch, &mut last_tover)? {
            return Ok(());
        }
        'phases: {
            if opts.full {
                if self.swap(SwapAction::Chunks(SwapMode::Median), &mut scratch, &mut last_tover)? {
                    break 'phases;
                }
                if self.nblocks() > 1 {
                    // Slice swaps only pay off across several blocks.
                    if self.swap(SwapAction::Slices(SwapMode::Median), &mut scratch, &mut last_tover)? {
                        break 'phases;
                    }
                    if self.swap(SwapAction::Chunks(SwapMode::Median), &mut scratch, &mut last_tover)? {
                        break 'phases;
                    }
                }
                if self.swap(SwapAction::Chunks(SwapMode::Start), &mut scratch, &mut last_tover)? {
                    break 'phases;
                }
                if self.swap(SwapAction::Chunks(SwapMode::Stop), &mut scratch, &mut last_tover)? {
                    break 'phases;
                }
            } else {
                if opts.median
                    && self.swap(SwapAction::Chunks(SwapMode::Median), &mut scratch, &mut last_tover)?
                {
                    break 'phases;
                }
                if opts.starts
                    && self.swap(SwapAction::Chunks(SwapMode::Start), &mut scratch, &mut last_tover)?
                {
                    break 'phases;
                }
                if opts.stops
                    && self.swap(SwapAction::Chunks(SwapMode::Stop), &mut scratch, &mut last_tover)?
                {
                    break 'phases;
                }
            }
        }
        self.dirtycache = true;
        Ok(())
    }

    // One phase plus the termination check, in the order the statistics are
    // consulted: improvement rate first (chunk swaps only), then the
    // absolute thresholds.
    fn swap(
        &mut self,
        action: SwapAction,
        scratch: &mut Scratch<T>,
        last_tover: &mut f64,
    ) -> Result<bool> {
        let label = match action {
            SwapAction::Create => "create",
            SwapAction::Chunks(SwapMode::Start) => "swap_chunks(start)",
            SwapAction::Chunks(SwapMode::Stop) => "swap_chunks(stop)",
            SwapAction::Chunks(SwapMode::Median) => "swap_chunks(median)",
            SwapAction::Slices(SwapMode::Start) => "swap_slices(start)",
            SwapAction::Slices(SwapMode::Stop) => "swap_slices(stop)",
            SwapAction::Slices(SwapMode::Median) => "swap_slices(median)",
        };
        match action {
            SwapAction::Create => {}
            SwapAction::Chunks(mode) => self.swap_chunks(mode, scratch)?,
            SwapAction::Slices(mode) => self.swap_slices(mode, scratch)?,
        }
        let (noverlaps, multiplicity, toverlap) = self.compute_overlaps()?;
        debug!(
            target: "sortidx",
            "overlaps ({}): {} {}", label, noverlaps, toverlap
        );
        if matches!(action, SwapAction::Chunks(_)) && *last_tover > 0.0 && toverlap > 0.0 {
            let improvement = (*last_tover - toverlap) / *last_tover;
            if improvement < TH_IMPROVE {
                return Ok(true);
            }
        }
        *last_tover = toverlap;
        let nonzero = multiplicity.iter().filter(|&&m| m != 0).count();
        let rmult = nonzero as f64 / multiplicity.len() as f64;
        if noverlaps < TH_NOVER {
            return Ok(true);
        }
        if rmult < TH_MULT {
            return Ok(true);
        }
        if toverlap >= 0.0 && toverlap < TH_TOVER {
            return Ok(true);
        }
        Ok(false)
    }

    fn create_scratch(&mut self) -> Result<Scratch<T>> {
        let nslices = self.nslices();
        let ss = self.geo.slicesize;
        let nb = self.geo.nbounds_slice();
        let nchunks = self.nchunks();
        let itemsize = self.itemsize;
        let (guard, dir) = match self.scratch_parent() {
            Some(parent) => {
                let tmp = tempfile::Builder::new()
                    .prefix("sortidx-")
                    .suffix(".tmp")
                    .tempdir_in(parent)
                    .map_err(|e| Error::new(ErrorKind::Scratch, e))?;
                let path = tmp.path().to_path_buf();
                (Some(tmp), Some(path))
            }
            None => (None, None),
        };
        // Scratch mirrors carry no filter pipeline; compressing data that
        // lives for one optimization pass costs more than it saves.
        let media = |name: &str| -> Result<Media> {
            match &dir {
                Some(d) => {
                    let file = std::fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create_new(true)
                        .open(d.join(name))
                        .map_err(|e| Error::new(ErrorKind::Scratch, e))?;
                    Ok(Media::File(file))
                }
                None => Ok(Media::mem()),
            }
        };
        Ok(Scratch {
            sorted: ChunkedArray::create_sized(media("sorted")?, itemsize, ss, nslices)?,
            indices: ChunkedArray::create_sized(media("indices")?, 0, ss, nslices)?,
            ranges: ChunkedArray::create_sized(media("ranges")?, itemsize, 2, nslices)?,
            bounds: ChunkedArray::create_sized(media("bounds")?, itemsize, nb, nslices)?,
            abounds: ChunkedArray::create_sized(media("abounds")?, itemsize, 1, nchunks)?,
            zbounds: ChunkedArray::create_sized(media("zbounds")?, itemsize, 1, nchunks)?,
            mbounds: ChunkedArray::create_sized(media("mbounds")?, itemsize, 1, nchunks)?,
            mranges: ChunkedArray::create_sized(media("mranges")?, itemsize, 1, nslices)?,
            _guard: guard,
        })
    }

    fn swap_chunks(&mut self, mode: SwapMode, scratch: &mut Scratch<T>) -> Result<()> {
        let cs = self.geo.chunksize;
        let ss = self.geo.slicesize;
        if ss % cs != 0 {
            // Gathering chunks across slices needs equal-size chunks;
            // unaligned (test) geometries keep their slice order.
            debug!(target: "sortidx", "slice length not chunk-aligned, skipping chunk swaps");
            return Ok(());
        }
        let ncs = self.geo.nchunks_slice();
        let nsb = self.geo.nslices_block();
        let ncb = ncs * nsb;
        let nchunks = self.nchunks();
        for nblock in 0..self.nblocks() {
            let mut ncb2 = ncb;
            let remaining = nchunks - nblock * ncb;
            if remaining < ncb {
                // The tail is rounded down to whole slices.
                ncb2 = (remaining / ncs) * ncs;
            }
            if ncb2 <= 1 {
                break;
            }
            let nslices_here = ncb2 / ncs;
            let keys = match mode {
                SwapMode::Start => self.abounds.read_flat(nblock * ncb, ncb2)?,
                SwapMode::Stop => self.zbounds.read_flat(nblock * ncb, ncb2)?,
                SwapMode::Median => self.mbounds.read_flat(nblock * ncb, ncb2)?,
            };
            let mut perm: Vec<usize> = (0..ncb2).collect();
            perm.sort_by(|&a, &b| keys[a].cmp(&keys[b]));
            let ndiff = perm.iter().enumerate().filter(|&(i, &p)| p != i).count() / 2;
            if ndiff * 20 < ncb2 {
                // Under 5% movement is not worth the rewrite.
                debug!(target: "sortidx", "skipping reordering of block {}", nblock);
                continue;
            }
            let offset = nblock * nsb;
            let mut tsorted: Vec<T> = Vec::with_capacity(ss);
            let mut tindices: Vec<i64> = Vec::with_capacity(ss);
            for i in 0..nslices_here {
                tsorted.clear();
                tindices.clear();
                for j in 0..ncs {
                    let idx = perm[i * ncs + j];
                    let ins = offset + idx / ncs;
                    let inc = (idx % ncs) * cs;
                    self.sorted.read_cells(ins, inc, cs, &mut tsorted)?;
                    self.indices.read_cells(ins, inc, cs, &mut tindices)?;
                }
                scratch.sorted.write_row(offset + i, &tsorted)?;
                scratch.indices.write_row(offset + i, &tindices)?;
            }
            // Up to here only the scratch changed. It now holds every chunk
            // of the block, so it doubles as the undo image: if the
            // writeback dies midway, the chunks scatter back through the
            // inverse permutation and the block returns to its old state.
            if let Err(e) = self.reorder_slices(offset, nslices_here, scratch) {
                if self
                    .scatter_chunks_back(offset, nslices_here, &perm, scratch)
                    .is_err()
                {
                    self.set_dirty(true);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    // Undo a half-applied chunk swap: every gathered chunk goes back to the
    // slice and position it came from, then the derived rows are rebuilt.
    fn scatter_chunks_back(
        &mut self,
        offset: usize,
        nslices: usize,
        perm: &[usize],
        scratch: &mut Scratch<T>,
    ) -> Result<()> {
        let cs = self.geo.chunksize;
        let ncs = self.geo.nchunks_slice();
        for i in 0..nslices {
            let row = scratch.sorted.read_row(offset + i)?;
            let idx = scratch.indices.read_row(offset + i)?;
            for j in 0..ncs {
                let k = perm[i * ncs + j];
                let ins = offset + k / ncs;
                let inc = (k % ncs) * cs;
                self.sorted.write_cells(ins, inc, &row[j * cs..(j + 1) * cs])?;
                self.indices
                    .write_cells(ins, inc, &idx[j * cs..(j + 1) * cs])?;
            }
        }
        for ns in offset..offset + nslices {
            let arr = self.sorted.read_row(ns)?;
            self.rewrite_derived(ns, &arr)?;
        }
        Ok(())
    }

    // Re-sort every rewritten slice and rebuild its derived rows.
    fn reorder_slices(&mut self, first: usize, n: usize, scratch: &mut Scratch<T>) -> Result<()> {
        for ns in first..first + n {
            let row = scratch.sorted.read_row(ns)?;
            let idx_row = scratch.indices.read_row(ns)?;
            let mut perm: Vec<usize> = (0..row.len()).collect();
            perm.sort_by(|&a, &b| row[a].cmp(&row[b]));
            let arr: Vec<T> = perm.iter().map(|&i| row[i].clone()).collect();
            let idx: Vec<i64> = perm.iter().map(|&i| idx_row[i]).collect();
            self.sorted.write_row(ns, &arr)?;
            self.indices.write_row(ns, &idx)?;
            self.rewrite_derived(ns, &arr)?;
        }
        Ok(())
    }

    fn rewrite_derived(&mut self, row: usize, arr: &[T]) -> Result<()> {
        let ncs = self.geo.nchunks_slice();
        let d = derived_rows(arr, &self.geo);
        self.ranges.write_row(row, &d.range)?;
        self.bounds.write_row(row, &d.seps)?;
        self.abounds.write_flat(row * ncs, &d.firsts)?;
        self.zbounds.write_flat(row * ncs, &d.lasts)?;
        self.mbounds.write_flat(row * ncs, &d.medians)?;
        self.mranges.write_flat(row, std::slice::from_ref(&d.mrange))?;
        Ok(())
    }

    fn swap_slices(&mut self, mode: SwapMode, scratch: &mut Scratch<T>) -> Result<()> {
        let nss = self.geo.superblocksize / self.geo.slicesize;
        let nslices = self.nslices();
        for sblock in 0..self.nsuperblocks() {
            let mut nss2 = nss;
            let remaining = nslices - sblock * nss;
            if remaining < nss {
                nss2 = remaining;
            }
            if nss2 <= 1 {
                break;
            }
            let base = sblock * nss;
            let keys: Vec<T> = match mode {
                SwapMode::Start | SwapMode::Stop => {
                    let cell = matches!(mode, SwapMode::Stop) as usize;
                    let mut v = Vec::with_capacity(nss2);
                    for r in base..base + nss2 {
                        let rng = self.ranges.read_row(r)?;
                        v.push(rng[cell].clone());
                    }
                    v
                }
                SwapMode::Median => self.mranges.read_flat(base, nss2)?,
            };
            let mut perm: Vec<usize> = (0..nss2).collect();
            perm.sort_by(|&a, &b| keys[a].cmp(&keys[b]));
            let ndiff = perm.iter().enumerate().filter(|&(i, &p)| p != i).count() / 2;
            if ndiff * 50 < nss2 {
                // Under 2.5% movement is not worth the rewrite.
                debug!(target: "sortidx", "skipping reordering of superblock {}", sblock);
                continue;
            }
            // Gather into the scratch in permuted order; only the scratch
            // changes here, so a failure just propagates.
            for i in 0..nss2 {
                self.copy_slice_to_scratch(scratch, base + perm[i], base + i)?;
            }
            // The scratch holds the whole superblock, so a half-applied
            // copy-back is undone by writing each scratch row to its
            // pre-swap home.
            if let Err(e) = self.copy_back_slices(base, nss2, scratch) {
                if self.unswap_slices(base, nss2, &perm, scratch).is_err() {
                    self.set_dirty(true);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn copy_back_slices(&mut self, base: usize, n: usize, scratch: &mut Scratch<T>) -> Result<()> {
        for i in 0..n {
            self.copy_slice_from_scratch(scratch, base + i, base + i)?;
        }
        Ok(())
    }

    fn unswap_slices(
        &mut self,
        base: usize,
        n: usize,
        perm: &[usize],
        scratch: &mut Scratch<T>,
    ) -> Result<()> {
        for i in 0..n {
            self.copy_slice_from_scratch(scratch, base + i, base + perm[i])?;
        }
        Ok(())
    }

    // One slice plus its derived rows, live -> scratch.
    fn copy_slice_to_scratch(
        &mut self,
        scratch: &mut Scratch<T>,
        src: usize,
        dst: usize,
    ) -> Result<()> {
        let ncs = self.geo.nchunks_slice();
        let row = self.sorted.read_row(src)?;
        scratch.sorted.write_row(dst, &row)?;
        let row = self.indices.read_row(src)?;
        scratch.indices.write_row(dst, &row)?;
        let row = self.ranges.read_row(src)?;
        scratch.ranges.write_row(dst, &row)?;
        let row = self.bounds.read_row(src)?;
        scratch.bounds.write_row(dst, &row)?;
        let v = self.mranges.read_flat(src, 1)?;
        scratch.mranges.write_flat(dst, &v)?;
        let v = self.abounds.read_flat(src * ncs, ncs)?;
        scratch.abounds.write_flat(dst * ncs, &v)?;
        let v = self.zbounds.read_flat(src * ncs, ncs)?;
        scratch.zbounds.write_flat(dst * ncs, &v)?;
        let v = self.mbounds.read_flat(src * ncs, ncs)?;
        scratch.mbounds.write_flat(dst * ncs, &v)?;
        Ok(())
    }

    // One slice plus its derived rows, scratch -> live.
    fn copy_slice_from_scratch(
        &mut self,
        scratch: &mut Scratch<T>,
        src: usize,
        dst: usize,
    ) -> Result<()> {
        let ncs = self.geo.nchunks_slice();
        let row = scratch.sorted.read_row(src)?;
        self.sorted.write_row(dst, &row)?;
        let row = scratch.indices.read_row(src)?;
        self.indices.write_row(dst, &row)?;
        let row = scratch.ranges.read_row(src)?;
        self.ranges.write_row(dst, &row)?;
        let row = scratch.bounds.read_row(src)?;
        self.bounds.write_row(dst, &row)?;
        let v = scratch.mranges.read_flat(src, 1)?;
        self.mranges.write_flat(dst, &v)?;
        let v = scratch.abounds.read_flat(src * ncs, ncs)?;
        self.abounds.write_flat(dst * ncs, &v)?;
        let v = scratch.zbounds.read_flat(src * ncs, ncs)?;
        self.zbounds.write_flat(dst * ncs, &v)?;
        let v = scratch.mbounds.read_flat(src * ncs, ncs)?;
        self.mbounds.write_flat(dst * ncs, &v)?;
        Ok(())
    }

    /// Overlap statistics over the per-slice ranges: the number of ordered
    /// pairs `(i < j)` whose ranges overlap, how often each pair distance
    /// `j - i` occurs, and the summed overlap normalized by the total span
    /// (-1 for byte strings, whose spans have no widening arithmetic).
    pub(crate) fn compute_overlaps(&mut self) -> Result<(usize, Vec<usize>, f64)> {
        let nslices = self.nslices();
        let mut ranges: Vec<(T, T)> = Vec::with_capacity(nslices);
        for row in 0..nslices {
            let r = self.ranges.read_row(row)?;
            ranges.push((r[0].clone(), r[1].clone()));
        }
        let mut noverlaps = 0usize;
        let mut soverlap = 0.0_f64;
        let mut toverlap = -1.0_f64;
        let mut multiplicity = vec![0usize; nslices];
        for i in 0..nslices {
            for j in (i + 1)..nslices {
                if ranges[i].1 > ranges[j].0 {
                    noverlaps += 1;
                    multiplicity[j - i] += 1;
                    // Widening arithmetic keeps large signed ends from
                    // wrapping.
                    if let (Some(a), Some(b)) = (ranges[i].1.to_wide(), ranges[j].0.to_wide()) {
                        soverlap += a - b;
                    }
                }
            }
        }
        if nslices > 0 {
            if let (Some(last), Some(first)) =
                (ranges[nslices - 1].1.to_wide(), ranges[0].0.to_wide())
            {
                let erange = last - first;
                // erange can be zero or negative on degenerate data (large
                // unsigned ends wrap the widening view); toverlap stays -1
                // then.
                if erange > 0.0 {
                    toverlap = soverlap / erange;
                }
            }
        }
        Ok((noverlaps, multiplicity, toverlap))
    }
}
