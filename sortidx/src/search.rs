// Range lookup over the closed interval produced by the range translator.
// Per full slice: the (min,max) pair either rejects or accepts the whole
// slice, otherwise one bisection over the separator array picks a chunk and
// one bisection inside that chunk finds the exact position. The buffered
// last row goes through the same two levels against its cached bebounds.

use crate::index::Index;
use crate::key::IndexKey;
use sortidx_base::Result;

/// First position whose value is >= probe (bisect-left).
pub(crate) fn lower_bound<T: Ord>(vals: &[T], probe: &T) -> usize {
    vals.partition_point(|v| v < probe)
}

/// First position whose value is > probe (bisect-right).
pub(crate) fn upper_bound<T: Ord>(vals: &[T], probe: &T) -> usize {
    vals.partition_point(|v| v <= probe)
}

impl<T: IndexKey> Index<T> {
    /// Count the indexed values inside the closed interval, recording the
    /// per-slice hit spans in `starts`/`lengths`. `None` (an unsatisfiable
    /// translation) and inverted intervals report zero rows everywhere.
    pub fn search(&mut self, range: Option<(T, T)>) -> Result<usize> {
        if self.dirtycache {
            self.restore_cache();
        }
        let key = match range {
            Some((lo, hi)) if lo <= hi => (lo, hi),
            _ => {
                self.starts.iter_mut().for_each(|s| *s = 0);
                self.lengths.iter_mut().for_each(|l| *l = 0);
                return Ok(0);
            }
        };
        let mut tlen = 0;

        if let Some(slot) = self.cache.getslot(&key) {
            self.lengths.iter_mut().for_each(|l| *l = 0);
            for &(row, start, length) in self.cache.getitem(slot) {
                self.starts[row] = start;
                self.lengths[row] = length;
                tlen += length;
            }
            return Ok(tlen);
        }

        for row in 0..self.nslices() {
            let (start, stop) = self.search_slice(row, &key.0, &key.1)?;
            self.starts[row] = start;
            self.lengths[row] = stop - start;
            tlen += stop - start;
        }
        if self.nelements_lr > 0 {
            let (start, stop) = self.search_last_row(&key.0, &key.1)?;
            let last = self.nrows() - 1;
            self.starts[last] = start;
            self.lengths[last] = stop - start;
            tlen += stop - start;
        }

        if self.cache.could_enable_cache() {
            // The non-zero spans compress the whole result; sixteen bytes a
            // span approximates the stored footprint, the +1 keeps empty
            // results from accounting as free.
            let spans: Vec<(usize, usize, usize)> = self
                .lengths
                .iter()
                .enumerate()
                .filter(|(_, &l)| l > 0)
                .map(|(row, &l)| (row, self.starts[row], l))
                .collect();
            let size = spans.len() * 16 + 1;
            self.cache.setitem(key, spans, size);
        }
        Ok(tlen)
    }

    fn search_slice(&mut self, row: usize, lo: &T, hi: &T) -> Result<(usize, usize)> {
        let ss = self.geo.slicesize;
        let rng = self.ranges.read_row(row)?;
        let (begin, end) = (&rng[0], &rng[1]);
        let mut start = None;
        let mut stop = None;
        if lo <= begin {
            start = Some(0);
        }
        if hi < begin {
            stop = Some(0);
        }
        if start.is_none() && lo > end {
            start = Some(ss);
        }
        if stop.is_none() && hi >= end {
            stop = Some(ss);
        }
        if let (Some(a), Some(b)) = (start, stop) {
            return Ok((a, b));
        }

        let seps = self.bounds.read_row(row)?;
        let mut held: Option<(usize, Vec<T>)> = None;
        let start = match start {
            Some(s) => s,
            None => {
                let nchunk = lower_bound(&seps, lo);
                let (base, chunk) = self.read_chunk(row, nchunk)?;
                let pos = base + lower_bound(&chunk, lo);
                held = Some((nchunk, chunk));
                pos
            }
        };
        let stop = match stop {
            Some(s) => s,
            None => {
                let nchunk = upper_bound(&seps, hi);
                let (base, chunk) = match held {
                    Some((nc, ch)) if nc == nchunk => (nchunk * self.geo.chunksize, ch),
                    _ => self.read_chunk(row, nchunk)?,
                };
                base + upper_bound(&chunk, hi)
            }
        };
        Ok((start, stop))
    }

    fn read_chunk(&mut self, row: usize, nchunk: usize) -> Result<(usize, Vec<T>)> {
        let ss = self.geo.slicesize;
        let cs = self.geo.chunksize;
        let base = nchunk * cs;
        let len = cs.min(ss - base);
        let mut chunk = Vec::with_capacity(len);
        self.sorted.read_cells(row, base, len, &mut chunk)?;
        Ok((base, chunk))
    }

    fn search_last_row(&mut self, lo: &T, hi: &T) -> Result<(usize, usize)> {
        let n = self.nelements_lr;
        let be = self.bebounds.clone();
        let nbounds = be.len();
        let begin = &be[0];
        let end = &be[nbounds - 1];
        let mut start = None;
        let mut stop = None;
        if lo <= begin {
            start = Some(0);
        }
        if hi < begin {
            stop = Some(0);
        }
        if start.is_none() && lo > end {
            start = Some(n);
        }
        if stop.is_none() && hi >= end {
            stop = Some(n);
        }
        if let (Some(a), Some(b)) = (start, stop) {
            return Ok((a, b));
        }

        let seps = &be[1..nbounds - 1];
        let mut held: Option<(usize, Vec<T>)> = None;
        let start = match start {
            Some(s) => s,
            None => {
                let nchunk = lower_bound(seps, lo);
                let (base, chunk) = self.read_lr_chunk(nbounds, nchunk)?;
                let pos = base + lower_bound(&chunk, lo);
                held = Some((nchunk, chunk));
                pos
            }
        };
        let stop = match stop {
            Some(s) => s,
            None => {
                let nchunk = upper_bound(seps, hi);
                let (base, chunk) = match held {
                    Some((nc, ch)) if nc == nchunk => (nchunk * self.geo.chunksize, ch),
                    _ => self.read_lr_chunk(nbounds, nchunk)?,
                };
                base + upper_bound(&chunk, hi)
            }
        };
        Ok((start, stop))
    }

    fn read_lr_chunk(&mut self, nbounds: usize, nchunk: usize) -> Result<(usize, Vec<T>)> {
        let cs = self.geo.chunksize;
        let n = self.nelements_lr;
        let base = nchunk * cs;
        let len = cs.min(n - base);
        let mut chunk = Vec::with_capacity(len);
        self.sorted_lr.read_cells(0, nbounds + base, len, &mut chunk)?;
        Ok((base, chunk))
    }
}
