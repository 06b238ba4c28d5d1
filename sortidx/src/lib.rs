// A two-level sorted index over one column of a large table.
//
// Values arrive in slice-sized batches. Each batch is sorted and stored as
// one row of a 2-D `sorted` array, with the original row numbers in a
// parallel `indices` row. Derived arrays hold per-slice (min,max) pairs,
// the inter-chunk separators of every slice, and the first/last/median
// value of every chunk, so a range lookup can reject a whole slice on its
// range, bisect the separators to pick one chunk, and bisect that chunk for
// the exact position. A trailing batch shorter than a slice is buffered in
// two fixed-size last-row arrays with its separators cached up front.
//
// Hierarchy (each level a multiple of the next):
//
//   superblock -- unit across which whole slices are reordered
//   block      -- unit across which chunks are reordered
//   slice      -- one sorted row; the unit of appends
//   chunk      -- contiguous run inside a slice; the unit of reads
//
// Slices are individually sorted but their value ranges may overlap. The
// optimizer reorders chunks within blocks and slices within superblocks to
// shrink that overlap, re-sorting every touched slice through a scratch
// area and stopping once the measured overlap is low enough. Lookups are
// correct whether or not optimization ever ran.

mod any;
mod array;
mod cache;
mod index;
mod ioutil;
mod key;
mod meta;
mod optimize;
mod range;
mod search;

#[cfg(test)]
mod test;

pub use any::AnyIndex;
pub use index::Index;
pub use key::{Direction, FixedBytes, IndexKey, KeyKind, Value};
pub use meta::{Complib, Filters, Geometry, ReordOpts};
pub use range::{get_lookup_range, Op};
pub use sortidx_base::{Error, ErrorKind, Result};
