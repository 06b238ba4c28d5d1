// Fixed-width row storage for one persistent index array: `nrows` rows of
// `row_cells` encoded values each. 2-D arrays (sorted, indices, ranges,
// bounds) use their natural row width; the flat per-chunk bounds arrays use
// single-cell rows; the two last-row arrays are a single fixed row.

use std::marker::PhantomData;

use crate::ioutil::Media;
use crate::key::IndexKey;
use sortidx_base::{err, ErrorKind, Result};

#[derive(Debug)]
pub(crate) struct ChunkedArray<T: IndexKey> {
    media: Media,
    width: usize,
    row_cells: usize,
    nrows: usize,
    reads: u64,
    _marker: PhantomData<T>,
}

impl<T: IndexKey> ChunkedArray<T> {
    pub(crate) fn create(media: Media, itemsize: usize, row_cells: usize) -> ChunkedArray<T> {
        ChunkedArray {
            media,
            width: T::width(itemsize),
            row_cells,
            nrows: 0,
            reads: 0,
            _marker: PhantomData,
        }
    }

    /// Preallocated, zero-filled variant (scratch mirrors, last-row arrays).
    pub(crate) fn create_sized(
        media: Media,
        itemsize: usize,
        row_cells: usize,
        nrows: usize,
    ) -> Result<ChunkedArray<T>> {
        let mut arr = Self::create(media, itemsize, row_cells);
        arr.media.set_len(arr.row_bytes() * nrows as u64)?;
        arr.nrows = nrows;
        Ok(arr)
    }

    pub(crate) fn open(media: Media, itemsize: usize, row_cells: usize) -> Result<ChunkedArray<T>> {
        let mut arr = Self::create(media, itemsize, row_cells);
        if arr.row_cells == 0 {
            return Ok(arr);
        }
        let bytes = arr.media.len()?;
        let rowbytes = arr.row_bytes();
        if bytes % rowbytes != 0 {
            return Err(err(
                ErrorKind::Assertion,
                "array length is not a whole number of rows",
            ));
        }
        arr.nrows = (bytes / rowbytes) as usize;
        Ok(arr)
    }

    /// Open an array that must hold exactly one fixed-size row.
    pub(crate) fn open_fixed(
        media: Media,
        itemsize: usize,
        row_cells: usize,
    ) -> Result<ChunkedArray<T>> {
        let arr = Self::open(media, itemsize, row_cells)?;
        if arr.nrows != 1 {
            return Err(err(ErrorKind::Assertion, "fixed array has wrong length"));
        }
        Ok(arr)
    }

    fn row_bytes(&self) -> u64 {
        (self.width * self.row_cells) as u64
    }

    pub(crate) fn nrows(&self) -> usize {
        self.nrows
    }

    fn encode(&self, vals: &[T]) -> Vec<u8> {
        let mut buf = vec![0u8; vals.len() * self.width];
        for (i, v) in vals.iter().enumerate() {
            v.write_to(&mut buf[i * self.width..(i + 1) * self.width]);
        }
        buf
    }

    fn decode_into(&self, buf: &[u8], out: &mut Vec<T>) {
        for cell in buf.chunks_exact(self.width) {
            out.push(T::read_from(cell));
        }
    }

    pub(crate) fn append_row(&mut self, vals: &[T]) -> Result<()> {
        if vals.len() != self.row_cells {
            return Err(err(ErrorKind::Assertion, "appended row has wrong width"));
        }
        let off = self.row_bytes() * self.nrows as u64;
        self.media.write_at(off, &self.encode(vals))?;
        self.nrows += 1;
        Ok(())
    }

    /// Bulk append for single-cell-row arrays (the flat bounds arrays).
    pub(crate) fn append_cells(&mut self, vals: &[T]) -> Result<()> {
        if self.row_cells != 1 {
            return Err(err(ErrorKind::Assertion, "cell append on a 2-D array"));
        }
        let off = self.row_bytes() * self.nrows as u64;
        self.media.write_at(off, &self.encode(vals))?;
        self.nrows += vals.len();
        Ok(())
    }

    pub(crate) fn read_row(&mut self, row: usize) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(self.row_cells);
        self.read_cells(row, 0, self.row_cells, &mut out)?;
        Ok(out)
    }

    pub(crate) fn write_row(&mut self, row: usize, vals: &[T]) -> Result<()> {
        if vals.len() != self.row_cells {
            return Err(err(ErrorKind::Assertion, "written row has wrong width"));
        }
        self.write_cells(row, 0, vals)
    }

    pub(crate) fn read_cells(
        &mut self,
        row: usize,
        cell: usize,
        n: usize,
        out: &mut Vec<T>,
    ) -> Result<()> {
        if row >= self.nrows || cell + n > self.row_cells {
            return Err(err(ErrorKind::OutOfRange, "cell read out of range"));
        }
        if self.row_cells == 0 {
            return Ok(());
        }
        let off = self.row_bytes() * row as u64 + (cell * self.width) as u64;
        let mut buf = vec![0u8; n * self.width];
        self.media.read_at(off, &mut buf)?;
        self.decode_into(&buf, out);
        self.reads += 1;
        Ok(())
    }

    pub(crate) fn write_cells(&mut self, row: usize, cell: usize, vals: &[T]) -> Result<()> {
        if row >= self.nrows || cell + vals.len() > self.row_cells {
            return Err(err(ErrorKind::OutOfRange, "cell write out of range"));
        }
        if self.row_cells == 0 {
            return Ok(());
        }
        let off = self.row_bytes() * row as u64 + (cell * self.width) as u64;
        self.media.write_at(off, &self.encode(vals))
    }

    pub(crate) fn read_cell(&mut self, row: usize, cell: usize) -> Result<T> {
        let mut out = Vec::with_capacity(1);
        self.read_cells(row, cell, 1, &mut out)?;
        out.pop()
            .ok_or_else(|| err(ErrorKind::OutOfRange, "cell read came back empty"))
    }

    /// Flat cell addressing for single-cell-row arrays.
    pub(crate) fn read_flat(&mut self, start: usize, n: usize) -> Result<Vec<T>> {
        if self.row_cells != 1 {
            return Err(err(ErrorKind::Assertion, "flat read on a 2-D array"));
        }
        if start + n > self.nrows {
            return Err(err(ErrorKind::OutOfRange, "flat read out of range"));
        }
        let mut buf = vec![0u8; n * self.width];
        self.media.read_at((start * self.width) as u64, &mut buf)?;
        let mut out = Vec::with_capacity(n);
        self.decode_into(&buf, &mut out);
        self.reads += 1;
        Ok(out)
    }

    pub(crate) fn write_flat(&mut self, start: usize, vals: &[T]) -> Result<()> {
        if self.row_cells != 1 {
            return Err(err(ErrorKind::Assertion, "flat write on a 2-D array"));
        }
        if start + vals.len() > self.nrows {
            return Err(err(ErrorKind::OutOfRange, "flat write out of range"));
        }
        self.media.write_at((start * self.width) as u64, &self.encode(vals))
    }

    /// Drop rows past `nrows`; backs a partially-applied batch out.
    pub(crate) fn truncate_rows(&mut self, nrows: usize) -> Result<()> {
        if nrows > self.nrows {
            return Err(err(ErrorKind::Assertion, "truncate cannot grow an array"));
        }
        self.media.set_len(self.row_bytes() * nrows as u64)?;
        self.nrows = nrows;
        Ok(())
    }

    /// Zero-width rows leave no trace in the media, so reopening cannot
    /// derive their count; the owner restores it from a sibling array.
    pub(crate) fn assume_nrows(&mut self, nrows: usize) -> Result<()> {
        if self.row_cells != 0 {
            return Err(err(
                ErrorKind::Assertion,
                "row count is derived from media length",
            ));
        }
        self.nrows = nrows;
        Ok(())
    }

    pub(crate) fn reads(&self) -> u64 {
        self.reads
    }

    pub(crate) fn reset_reads(&mut self) {
        self.reads = 0;
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.media.sync()
    }
}
