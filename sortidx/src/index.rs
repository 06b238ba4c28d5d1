// The index proper: geometry, the ten persistent arrays, the last-row
// buffer, the bounds cache and the per-slice search scratch. An index lives
// in one directory of the hosting container, one file per array plus the
// stored attributes.
//
// Appends come in two shapes. A full append adds exactly one slice: the
// incoming values are argsorted, the value row and the original-row-number
// row land in `sorted`/`indices`, and every derived bounds array gets its
// rows before the counters advance. A last-row append buffers a trailing
// partial slice in the two fixed-size LR arrays, with its chunk separators
// (plus begin and end) cached up front so lookups touch at most one chunk.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::array::ChunkedArray;
use crate::cache::LimBoundsCache;
use crate::ioutil::Media;
use crate::key::{IndexKey, Value};
use crate::meta::{Filters, Geometry, IndexMeta, ReordOpts};
use crate::range::{get_lookup_range, Op};
use sortidx_base::{err, ErrorKind, Result};

#[derive(Debug)]
pub struct Index<T: IndexKey> {
    pub(crate) geo: Geometry,
    pub(crate) itemsize: usize,
    pub(crate) optlevel: u8,
    pub(crate) reord: ReordOpts,
    pub(crate) filters: Filters,
    dir: Option<PathBuf>,

    pub(crate) sorted: ChunkedArray<T>,      // nslices x ss
    pub(crate) indices: ChunkedArray<i64>,   // nslices x ss
    pub(crate) ranges: ChunkedArray<T>,      // nslices x 2
    pub(crate) bounds: ChunkedArray<T>,      // nslices x nbounds_slice
    pub(crate) abounds: ChunkedArray<T>,     // flat, per-chunk first
    pub(crate) zbounds: ChunkedArray<T>,     // flat, per-chunk last
    pub(crate) mbounds: ChunkedArray<T>,     // flat, per-chunk median
    pub(crate) mranges: ChunkedArray<T>,     // flat, per-slice median-of-medians
    pub(crate) sorted_lr: ChunkedArray<T>,   // 1 x (2 + nbounds_slice + ss)
    pub(crate) indices_lr: ChunkedArray<i64>, // 1 x ss, last cell is the count

    pub(crate) nelements_lr: usize,
    pub(crate) bebounds: Vec<T>,

    pub(crate) starts: Vec<usize>,
    pub(crate) lengths: Vec<usize>,
    pub(crate) cache: LimBoundsCache<T>,
    pub(crate) dirtycache: bool,
    dirty: bool,
}

fn media_for(dir: Option<&Path>, name: &str, fresh: bool) -> Result<Media> {
    match dir {
        Some(d) => {
            let path = d.join(name);
            if fresh {
                Media::create_file(&path)
            } else {
                Media::open_file(&path)
            }
        }
        None => Ok(Media::mem()),
    }
}

impl<T: IndexKey> Index<T> {
    /// Create a new on-disk index in the container directory `parent`, with
    /// geometry derived from the expected row count.
    pub fn create(
        parent: &Path,
        name: &str,
        itemsize: usize,
        filters: Filters,
        optlevel: u8,
        expectedrows: u64,
    ) -> Result<Index<T>> {
        let geo = Geometry::for_expected_rows(expectedrows);
        let dir = parent.join(name);
        std::fs::create_dir(&dir)?;
        Self::build(Some(dir), itemsize, filters, optlevel, geo)
    }

    /// Create with explicit geometry (tests, unusual tables).
    pub fn create_with_geometry(
        parent: &Path,
        name: &str,
        itemsize: usize,
        filters: Filters,
        optlevel: u8,
        geo: Geometry,
    ) -> Result<Index<T>> {
        let dir = parent.join(name);
        std::fs::create_dir(&dir)?;
        Self::build(Some(dir), itemsize, filters, optlevel, geo)
    }

    /// Backing-store-free index for ephemeral tables and tests.
    pub fn create_mem(
        itemsize: usize,
        filters: Filters,
        optlevel: u8,
        geo: Geometry,
    ) -> Result<Index<T>> {
        Self::build(None, itemsize, filters, optlevel, geo)
    }

    fn build(
        dir: Option<PathBuf>,
        itemsize: usize,
        filters: Filters,
        optlevel: u8,
        geo: Geometry,
    ) -> Result<Index<T>> {
        geo.validate()?;
        if T::KIND == crate::key::KeyKind::Bytes && itemsize == 0 {
            return Err(err(ErrorKind::Unsupported, "byte-string keys need an itemsize"));
        }
        let reord = ReordOpts::for_level(optlevel);
        if let Some(d) = &dir {
            let meta = IndexMeta {
                kind: T::KIND,
                itemsize,
                geo,
                optlevel,
                reord,
                filters,
            };
            meta.write(&mut Media::create_file(&d.join("meta"))?)?;
        }
        let ss = geo.slicesize;
        let nb = geo.nbounds_slice();
        let d = dir.as_deref();
        let index = Index {
            geo,
            itemsize,
            optlevel,
            reord,
            filters,
            sorted: ChunkedArray::create(media_for(d, "sorted", true)?, itemsize, ss),
            indices: ChunkedArray::create(media_for(d, "indices", true)?, 0, ss),
            ranges: ChunkedArray::create(media_for(d, "ranges", true)?, itemsize, 2),
            bounds: ChunkedArray::create(media_for(d, "bounds", true)?, itemsize, nb),
            abounds: ChunkedArray::create(media_for(d, "abounds", true)?, itemsize, 1),
            zbounds: ChunkedArray::create(media_for(d, "zbounds", true)?, itemsize, 1),
            mbounds: ChunkedArray::create(media_for(d, "mbounds", true)?, itemsize, 1),
            mranges: ChunkedArray::create(media_for(d, "mranges", true)?, itemsize, 1),
            sorted_lr: ChunkedArray::create_sized(
                media_for(d, "sortedlr", true)?,
                itemsize,
                2 + nb + ss,
                1,
            )?,
            indices_lr: ChunkedArray::create_sized(media_for(d, "indiceslr", true)?, 0, ss, 1)?,
            nelements_lr: 0,
            bebounds: Vec::new(),
            starts: Vec::new(),
            lengths: Vec::new(),
            cache: LimBoundsCache::new(itemsize),
            dirtycache: true,
            dirty: false,
            dir,
        };
        Ok(index)
    }

    /// Recover an index from disk; all parameters come from the stored
    /// attributes.
    pub fn open(parent: &Path, name: &str) -> Result<Index<T>> {
        let dir = parent.join(name);
        let meta = IndexMeta::read(&mut Media::open_file(&dir.join("meta"))?)?;
        if meta.kind != T::KIND {
            return Err(err(ErrorKind::Unsupported, "index holds a different key kind"));
        }
        let geo = meta.geo;
        let itemsize = meta.itemsize;
        let ss = geo.slicesize;
        let nb = geo.nbounds_slice();
        let d = Some(dir.as_path());
        let mut index = Index {
            geo,
            itemsize,
            optlevel: meta.optlevel,
            reord: meta.reord,
            filters: meta.filters,
            sorted: ChunkedArray::open(media_for(d, "sorted", false)?, itemsize, ss)?,
            indices: ChunkedArray::open(media_for(d, "indices", false)?, 0, ss)?,
            ranges: ChunkedArray::open(media_for(d, "ranges", false)?, itemsize, 2)?,
            bounds: ChunkedArray::open(media_for(d, "bounds", false)?, itemsize, nb)?,
            abounds: ChunkedArray::open(media_for(d, "abounds", false)?, itemsize, 1)?,
            zbounds: ChunkedArray::open(media_for(d, "zbounds", false)?, itemsize, 1)?,
            mbounds: ChunkedArray::open(media_for(d, "mbounds", false)?, itemsize, 1)?,
            mranges: ChunkedArray::open(media_for(d, "mranges", false)?, itemsize, 1)?,
            sorted_lr: ChunkedArray::open_fixed(
                media_for(d, "sortedlr", false)?,
                itemsize,
                2 + nb + ss,
            )?,
            indices_lr: ChunkedArray::open_fixed(media_for(d, "indiceslr", false)?, 0, ss)?,
            nelements_lr: 0,
            bebounds: Vec::new(),
            starts: Vec::new(),
            lengths: Vec::new(),
            cache: LimBoundsCache::new(itemsize),
            dirtycache: true,
            dirty: false,
            dir: Some(dir),
        };
        let nslices = index.sorted.nrows();
        if index.indices.nrows() != nslices
            || index.ranges.nrows() != nslices
            || index.mranges.nrows() != nslices
            || (geo.nbounds_slice() > 0 && index.bounds.nrows() != nslices)
            || index.abounds.nrows() != nslices * geo.nchunks_slice()
            || index.zbounds.nrows() != index.abounds.nrows()
            || index.mbounds.nrows() != index.abounds.nrows()
        {
            return Err(err(ErrorKind::Assertion, "index arrays disagree on row count"));
        }
        // The element count of the last row lives in the trailing cell of
        // its reverse-index array.
        let n = index.indices_lr.read_cell(0, ss - 1)?;
        if n < 0 || n as usize >= ss {
            return Err(err(ErrorKind::Assertion, "bad last-row element count"));
        }
        index.nelements_lr = n as usize;
        if index.nelements_lr > 0 {
            let nbounds_lr = (index.nelements_lr - 1) / geo.chunksize + 2;
            let mut be = Vec::with_capacity(nbounds_lr);
            index.sorted_lr.read_cells(0, 0, nbounds_lr, &mut be)?;
            index.bebounds = be;
        }
        if geo.nbounds_slice() == 0 {
            // Zero-width separator rows leave no trace in the media; restore
            // the logical row count by hand so row bounds keep applying.
            index.bounds.assume_nrows(nslices)?;
        }
        Ok(index)
    }

    // <geometry accessors>

    /// Full slices in the index.
    pub fn nslices(&self) -> usize {
        self.sorted.nrows()
    }

    /// Rows of the search scratch: full slices plus the last row if it
    /// holds anything.
    pub fn nrows(&self) -> usize {
        self.nslices() + (self.nelements_lr > 0) as usize
    }

    pub fn nelements(&self) -> usize {
        self.nslices() * self.geo.slicesize + self.nelements_lr
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows(), self.geo.slicesize)
    }

    pub fn itemsize(&self) -> usize {
        self.itemsize
    }

    pub(crate) fn nchunks(&self) -> usize {
        self.nslices() * self.geo.nchunks_slice()
    }

    pub(crate) fn nblocks(&self) -> usize {
        let nsb = self.geo.nslices_block();
        (self.nslices() + nsb - 1) / nsb
    }

    pub(crate) fn nsuperblocks(&self) -> usize {
        let nss = self.geo.superblocksize / self.geo.slicesize;
        (self.nslices() + nss - 1) / nss
    }

    // </geometry accessors>

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// The owning column calls this when it mutates in a way the index
    /// cannot track; a dirty index must be rebuilt before use.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn reject_nan(vals: &[T]) -> Result<()> {
        if vals.iter().any(|v| v.is_nan()) {
            return Err(err(ErrorKind::Unsupported, "NaN values cannot be indexed"));
        }
        Ok(())
    }

    // Stable argsort; equal values keep their original-row order.
    fn argsort(vals: &[T]) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..vals.len()).collect();
        perm.sort_by(|&a, &b| vals[a].cmp(&vals[b]));
        perm
    }

    /// Append exactly one slice of values.
    pub fn append(&mut self, vals: &[T]) -> Result<()> {
        let ss = self.geo.slicesize;
        if vals.len() != ss {
            return Err(err(ErrorKind::Assertion, "append expects exactly one slice"));
        }
        Self::reject_nan(vals)?;
        let perm = Self::argsort(vals);
        let arr: Vec<T> = perm.iter().map(|&i| vals[i].clone()).collect();
        let offset = (self.sorted.nrows() * ss) as i64;
        let idx: Vec<i64> = perm.iter().map(|&i| offset + i as i64).collect();
        // One transaction: every array gains its rows or none does. A
        // failed write truncates the arrays that did advance back to the
        // recorded marks; if even that fails the index is marked dirty.
        let marks = self.row_marks();
        let old_lr = self.nelements_lr;
        if let Err(e) = self.append_rows(&arr, &idx) {
            if !self.roll_back_append(&marks, old_lr) {
                self.dirty = true;
            }
            return Err(e);
        }
        // A full append supersedes any buffered last row.
        self.nelements_lr = 0;
        self.bebounds.clear();
        self.dirtycache = true;
        Ok(())
    }

    fn append_rows(&mut self, arr: &[T], idx: &[i64]) -> Result<()> {
        let d = derived_rows(arr, &self.geo);
        self.indices.append_row(idx)?;
        self.ranges.append_row(&d.range)?;
        self.bounds.append_row(&d.seps)?;
        self.abounds.append_cells(&d.firsts)?;
        self.zbounds.append_cells(&d.lasts)?;
        self.mbounds.append_cells(&d.medians)?;
        self.mranges.append_cells(std::slice::from_ref(&d.mrange))?;
        self.sorted.append_row(arr)?;
        // The buffered last row is superseded on disk as well.
        let ss = self.geo.slicesize;
        self.indices_lr.write_cells(0, ss - 1, &[0i64])?;
        Ok(())
    }

    fn row_marks(&self) -> RowMarks {
        RowMarks {
            sorted: self.sorted.nrows(),
            indices: self.indices.nrows(),
            ranges: self.ranges.nrows(),
            bounds: self.bounds.nrows(),
            abounds: self.abounds.nrows(),
            zbounds: self.zbounds.nrows(),
            mbounds: self.mbounds.nrows(),
            mranges: self.mranges.nrows(),
        }
    }

    // Best-effort restore to the recorded marks; reports whether every
    // array made it back.
    fn roll_back_append(&mut self, marks: &RowMarks, old_lr: usize) -> bool {
        let mut undone = true;
        undone &= self.sorted.truncate_rows(marks.sorted).is_ok();
        undone &= self.indices.truncate_rows(marks.indices).is_ok();
        undone &= self.ranges.truncate_rows(marks.ranges).is_ok();
        undone &= self.bounds.truncate_rows(marks.bounds).is_ok();
        undone &= self.abounds.truncate_rows(marks.abounds).is_ok();
        undone &= self.zbounds.truncate_rows(marks.zbounds).is_ok();
        undone &= self.mbounds.truncate_rows(marks.mbounds).is_ok();
        undone &= self.mranges.truncate_rows(marks.mranges).is_ok();
        let ss = self.geo.slicesize;
        undone &= self
            .indices_lr
            .write_cells(0, ss - 1, &[old_lr as i64])
            .is_ok();
        undone
    }

    /// Buffer a trailing partial slice. `total_rows` is the column's total
    /// row count; the values must be exactly the rows past the last full
    /// slice.
    pub fn append_last_row(&mut self, vals: &[T], total_rows: u64) -> Result<()> {
        let ss = self.geo.slicesize;
        let cs = self.geo.chunksize;
        if vals.is_empty() || vals.len() >= ss {
            return Err(err(
                ErrorKind::Assertion,
                "last-row append must hold between one value and one slice",
            ));
        }
        Self::reject_nan(vals)?;
        let offset = (self.sorted.nrows() * ss) as u64;
        if total_rows < offset || (total_rows - offset) as usize != vals.len() {
            // The column and the index disagree about how many rows are
            // pending; nothing written past this point can be trusted.
            self.dirty = true;
            return Err(err(
                ErrorKind::Assertion,
                "last-row element count does not match the column",
            ));
        }
        let n = vals.len();
        let perm = Self::argsort(vals);
        let arr: Vec<T> = perm.iter().map(|&i| vals[i].clone()).collect();
        let idx: Vec<i64> = perm.iter().map(|&i| offset as i64 + i as i64).collect();

        // Chunk separators plus begin and end, cached ahead of the values.
        let mut bebounds: Vec<T> = arr.iter().step_by(cs).cloned().collect();
        bebounds.push(arr[n - 1].clone());

        // Stage the live buffer; a failed write puts it back, and a failed
        // restore marks the index for rebuild.
        let old = self.stage_last_row()?;
        if let Err(e) = self.write_last_row(&idx, &bebounds, &arr) {
            if self.restore_last_row(&old).is_err() {
                self.dirty = true;
            }
            return Err(e);
        }
        self.nelements_lr = n;
        self.bebounds = bebounds;
        self.dirtycache = true;
        Ok(())
    }

    fn write_last_row(&mut self, idx: &[i64], bebounds: &[T], arr: &[T]) -> Result<()> {
        let ss = self.geo.slicesize;
        self.indices_lr.write_cells(0, 0, idx)?;
        self.sorted_lr.write_cells(0, 0, bebounds)?;
        self.sorted_lr.write_cells(0, bebounds.len(), arr)?;
        // The count commits the buffer, so it goes last.
        self.indices_lr.write_cells(0, ss - 1, &[idx.len() as i64])?;
        Ok(())
    }

    fn stage_last_row(&mut self) -> Result<LastRowStage<T>> {
        let n = self.nelements_lr;
        let mut idx = Vec::new();
        let mut cells = Vec::new();
        if n > 0 {
            self.indices_lr.read_cells(0, 0, n, &mut idx)?;
            self.sorted_lr
                .read_cells(0, 0, self.bebounds.len() + n, &mut cells)?;
        }
        Ok(LastRowStage { idx, cells, n })
    }

    fn restore_last_row(&mut self, old: &LastRowStage<T>) -> Result<()> {
        if old.n > 0 {
            self.indices_lr.write_cells(0, 0, &old.idx)?;
            self.sorted_lr.write_cells(0, 0, &old.cells)?;
        }
        let ss = self.geo.slicesize;
        self.indices_lr.write_cells(0, ss - 1, &[old.n as i64])?;
        Ok(())
    }

    /// Reallocate the per-slice scratch and drop the bounds cache. Called
    /// lazily on the first search after a mutation; idempotent.
    pub(crate) fn restore_cache(&mut self) {
        self.cache = LimBoundsCache::new(self.itemsize);
        self.starts = vec![0; self.nrows()];
        self.lengths = vec![0; self.nrows()];
        self.dirtycache = false;
    }

    /// Per-slice hit spans of the last search.
    pub fn starts(&self) -> &[usize] {
        &self.starts
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Translate operator/limit pairs with this index's itemsize.
    pub fn lookup_range(&self, ops: &[Op], limits: &[T]) -> Result<Option<(T, T)>> {
        get_lookup_range(ops, limits, self.itemsize)
    }

    /// Collect up to `max_coords` original row numbers from the current
    /// search result, starting at `start_coord` within the concatenation of
    /// the per-slice hit spans.
    pub fn get_coords(&mut self, start_coord: usize, max_coords: usize) -> Result<Vec<i64>> {
        let nslices = self.nslices();
        let mut out = Vec::new();
        let mut skip = start_coord;
        for row in 0..self.lengths.len() {
            let length = self.lengths[row];
            if skip >= length {
                skip -= length;
                continue;
            }
            let start = self.starts[row] + skip;
            let take = (length - skip).min(max_coords - out.len());
            skip = 0;
            if row < nslices {
                self.indices.read_cells(row, start, take, &mut out)?;
            } else {
                self.indices_lr.read_cells(0, start, take, &mut out)?;
            }
            if out.len() >= max_coords {
                break;
            }
        }
        Ok(out)
    }

    /// Flush array media. The container calls this before unmapping the
    /// group.
    pub fn sync(&mut self) -> Result<()> {
        self.sorted.sync()?;
        self.indices.sync()?;
        self.ranges.sync()?;
        self.bounds.sync()?;
        self.abounds.sync()?;
        self.zbounds.sync()?;
        self.mbounds.sync()?;
        self.mranges.sync()?;
        self.sorted_lr.sync()?;
        self.indices_lr.sync()?;
        Ok(())
    }

    /// Remove the index from the container. Removal is always recursive.
    pub fn remove(self) -> Result<()> {
        if let Some(dir) = &self.dir {
            debug!(target: "sortidx", "removing index at {:?}", dir);
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub(crate) fn scratch_parent(&self) -> Option<&Path> {
        self.dir.as_deref().and_then(|d| d.parent())
    }

    /// Dynamic append used by `AnyIndex`.
    pub(crate) fn append_values(&mut self, vals: &[Value]) -> Result<()> {
        let conv = vals
            .iter()
            .map(|v| T::from_value(v, self.itemsize))
            .collect::<Result<Vec<T>>>()?;
        self.append(&conv)
    }

    pub(crate) fn append_last_row_values(&mut self, vals: &[Value], total_rows: u64) -> Result<()> {
        let conv = vals
            .iter()
            .map(|v| T::from_value(v, self.itemsize))
            .collect::<Result<Vec<T>>>()?;
        self.append_last_row(&conv, total_rows)
    }
}

impl<T: IndexKey> std::fmt::Display for Index<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (rows, ss) = self.shape();
        write!(
            f,
            "Index({}, shape=({}, {}), chunksize={})",
            self.nelements(),
            rows,
            ss,
            self.geo.chunksize
        )
    }
}

// Pre-append row counts of every growable array; the rollback target when
// an append transaction fails midway.
struct RowMarks {
    sorted: usize,
    indices: usize,
    ranges: usize,
    bounds: usize,
    abounds: usize,
    zbounds: usize,
    mbounds: usize,
    mranges: usize,
}

// Copy of the live last-row buffer taken before it is overwritten.
struct LastRowStage<T> {
    idx: Vec<i64>,
    cells: Vec<T>,
    n: usize,
}

pub(crate) struct DerivedRows<T> {
    pub(crate) range: Vec<T>,
    pub(crate) seps: Vec<T>,
    pub(crate) firsts: Vec<T>,
    pub(crate) lasts: Vec<T>,
    pub(crate) medians: Vec<T>,
    pub(crate) mrange: T,
}

/// Everything derivable from one sorted slice: its (min,max) pair, the
/// inter-chunk separators, and the per-chunk first/last/median values. The
/// trailing chunk clamps at the slice end when the slice length is not
/// chunk-aligned.
pub(crate) fn derived_rows<T: IndexKey>(arr: &[T], geo: &Geometry) -> DerivedRows<T> {
    let ss = geo.slicesize;
    let cs = geo.chunksize;
    let ncs = geo.nchunks_slice();
    let range = vec![arr[0].clone(), arr[ss - 1].clone()];
    let seps: Vec<T> = (1..=geo.nbounds_slice()).map(|k| arr[k * cs].clone()).collect();
    let firsts: Vec<T> = (0..ncs).map(|j| arr[j * cs].clone()).collect();
    let lasts: Vec<T> = (0..ncs).map(|j| arr[((j + 1) * cs).min(ss) - 1].clone()).collect();
    let medians: Vec<T> = (0..ncs)
        .map(|j| {
            let len = cs.min(ss - j * cs);
            arr[j * cs + len / 2].clone()
        })
        .collect();
    let mrange = medians[ncs / 2].clone();
    DerivedRows {
        range,
        seps,
        firsts,
        lasts,
        medians,
        mrange,
    }
}
