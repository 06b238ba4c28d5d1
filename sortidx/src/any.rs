// The dynamic boundary. Callers that only know the column's type tag at
// runtime go through `AnyIndex`, which dispatches exactly once per call
// into the generic core; literals cross over as `Value`s.

use std::path::Path;

use ordered_float::OrderedFloat;

use crate::index::Index;
use crate::ioutil::Media;
use crate::key::{FixedBytes, IndexKey, KeyKind, Value};
use crate::meta::{Filters, IndexMeta};
use crate::range::Op;
use sortidx_base::Result;

pub enum AnyIndex {
    Bool(Index<bool>),
    Int8(Index<i8>),
    UInt8(Index<u8>),
    Int16(Index<i16>),
    UInt16(Index<u16>),
    Int32(Index<i32>),
    UInt32(Index<u32>),
    Int64(Index<i64>),
    UInt64(Index<u64>),
    Float32(Index<OrderedFloat<f32>>),
    Float64(Index<OrderedFloat<f64>>),
    Bytes(Index<FixedBytes>),
}

macro_rules! dispatch {
    ($any:expr, $ix:ident => $body:expr) => {
        match $any {
            AnyIndex::Bool($ix) => $body,
            AnyIndex::Int8($ix) => $body,
            AnyIndex::UInt8($ix) => $body,
            AnyIndex::Int16($ix) => $body,
            AnyIndex::UInt16($ix) => $body,
            AnyIndex::Int32($ix) => $body,
            AnyIndex::UInt32($ix) => $body,
            AnyIndex::Int64($ix) => $body,
            AnyIndex::UInt64($ix) => $body,
            AnyIndex::Float32($ix) => $body,
            AnyIndex::Float64($ix) => $body,
            AnyIndex::Bytes($ix) => $body,
        }
    };
}

fn kind_of<T: IndexKey>(_: &Index<T>) -> KeyKind {
    T::KIND
}

impl AnyIndex {
    pub fn create(
        parent: &Path,
        name: &str,
        kind: KeyKind,
        itemsize: usize,
        filters: Filters,
        optlevel: u8,
        expectedrows: u64,
    ) -> Result<AnyIndex> {
        Ok(match kind {
            KeyKind::Bool => {
                AnyIndex::Bool(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::Int8 => {
                AnyIndex::Int8(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::UInt8 => {
                AnyIndex::UInt8(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::Int16 => {
                AnyIndex::Int16(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::UInt16 => {
                AnyIndex::UInt16(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::Int32 => {
                AnyIndex::Int32(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::UInt32 => {
                AnyIndex::UInt32(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::Int64 => {
                AnyIndex::Int64(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::UInt64 => {
                AnyIndex::UInt64(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::Float32 => {
                AnyIndex::Float32(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::Float64 => {
                AnyIndex::Float64(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
            KeyKind::Bytes => {
                AnyIndex::Bytes(Index::create(parent, name, itemsize, filters, optlevel, expectedrows)?)
            }
        })
    }

    /// Reopen; the stored attributes pick the variant.
    pub fn open(parent: &Path, name: &str) -> Result<AnyIndex> {
        let meta = IndexMeta::read(&mut Media::open_file(&parent.join(name).join("meta"))?)?;
        Ok(match meta.kind {
            KeyKind::Bool => AnyIndex::Bool(Index::open(parent, name)?),
            KeyKind::Int8 => AnyIndex::Int8(Index::open(parent, name)?),
            KeyKind::UInt8 => AnyIndex::UInt8(Index::open(parent, name)?),
            KeyKind::Int16 => AnyIndex::Int16(Index::open(parent, name)?),
            KeyKind::UInt16 => AnyIndex::UInt16(Index::open(parent, name)?),
            KeyKind::Int32 => AnyIndex::Int32(Index::open(parent, name)?),
            KeyKind::UInt32 => AnyIndex::UInt32(Index::open(parent, name)?),
            KeyKind::Int64 => AnyIndex::Int64(Index::open(parent, name)?),
            KeyKind::UInt64 => AnyIndex::UInt64(Index::open(parent, name)?),
            KeyKind::Float32 => AnyIndex::Float32(Index::open(parent, name)?),
            KeyKind::Float64 => AnyIndex::Float64(Index::open(parent, name)?),
            KeyKind::Bytes => AnyIndex::Bytes(Index::open(parent, name)?),
        })
    }

    pub fn kind(&self) -> KeyKind {
        dispatch!(self, ix => kind_of(ix))
    }

    pub fn append(&mut self, vals: &[Value]) -> Result<()> {
        dispatch!(self, ix => ix.append_values(vals))
    }

    pub fn append_last_row(&mut self, vals: &[Value], total_rows: u64) -> Result<()> {
        dispatch!(self, ix => ix.append_last_row_values(vals, total_rows))
    }

    pub fn lookup_range(&self, ops: &[Op], limits: &[Value]) -> Result<Option<(Value, Value)>> {
        dispatch!(self, ix => {
            let limits = limits
                .iter()
                .map(|v| IndexKey::from_value(v, ix.itemsize()))
                .collect::<Result<Vec<_>>>()?;
            Ok(ix
                .lookup_range(ops, &limits)?
                .map(|(lo, hi)| (lo.to_value(), hi.to_value())))
        })
    }

    pub fn search(&mut self, range: Option<(Value, Value)>) -> Result<usize> {
        dispatch!(self, ix => {
            let range = match &range {
                None => None,
                Some((lo, hi)) => Some((
                    IndexKey::from_value(lo, ix.itemsize())?,
                    IndexKey::from_value(hi, ix.itemsize())?,
                )),
            };
            ix.search(range)
        })
    }

    pub fn get_coords(&mut self, start_coord: usize, max_coords: usize) -> Result<Vec<i64>> {
        dispatch!(self, ix => ix.get_coords(start_coord, max_coords))
    }

    pub fn optimize(&mut self, level: Option<u8>) -> Result<()> {
        dispatch!(self, ix => ix.optimize(level))
    }

    pub fn nelements(&self) -> usize {
        dispatch!(self, ix => ix.nelements())
    }

    pub fn nrows(&self) -> usize {
        dispatch!(self, ix => ix.nrows())
    }

    pub fn starts(&self) -> &[usize] {
        dispatch!(self, ix => ix.starts())
    }

    pub fn lengths(&self) -> &[usize] {
        dispatch!(self, ix => ix.lengths())
    }

    pub fn dirty(&self) -> bool {
        dispatch!(self, ix => ix.dirty())
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        dispatch!(self, ix => ix.set_dirty(dirty))
    }

    pub fn remove(self) -> Result<()> {
        dispatch!(self, ix => ix.remove())
    }
}

impl std::fmt::Display for AnyIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        dispatch!(self, ix => std::fmt::Display::fmt(ix, f))
    }
}
