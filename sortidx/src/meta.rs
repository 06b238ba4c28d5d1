// Stored attributes of an index: geometry, optimization defaults, filter
// properties and the key kind. Written once at creation and read back
// verbatim on open; a future version number is rejected rather than guessed
// at.

use crate::ioutil::Media;
use crate::key::KeyKind;
use sortidx_base::{err, ErrorKind, Result};

#[cfg(test)]
use test_log::test;

/// Compression properties carried for the hosting container. The index core
/// never filters data itself; the value rides along as an attribute so the
/// container can apply the same pipeline when it materializes the arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filters {
    pub complevel: u8,
    pub complib: Complib,
    pub shuffle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complib {
    None,
    Zlib,
    Lzo,
    Bzip2,
    Blosc,
}

impl Default for Filters {
    fn default() -> Filters {
        Filters {
            complevel: 1,
            complib: Complib::Zlib,
            shuffle: true,
        }
    }
}

impl Filters {
    pub fn none() -> Filters {
        Filters {
            complevel: 0,
            complib: Complib::None,
            shuffle: false,
        }
    }

    fn code(&self) -> i64 {
        let lib = match self.complib {
            Complib::None => 0,
            Complib::Zlib => 1,
            Complib::Lzo => 2,
            Complib::Bzip2 => 3,
            Complib::Blosc => 4,
        };
        self.complevel as i64 | lib << 8 | (self.shuffle as i64) << 16
    }

    fn from_code(code: i64) -> Result<Filters> {
        let complib = match (code >> 8) & 0xff {
            0 => Complib::None,
            1 => Complib::Zlib,
            2 => Complib::Lzo,
            3 => Complib::Bzip2,
            4 => Complib::Blosc,
            _ => return Err(err(ErrorKind::Unsupported, "unknown compression library code")),
        };
        Ok(Filters {
            complevel: (code & 0xff) as u8,
            complib,
            shuffle: (code >> 16) & 1 != 0,
        })
    }
}

/// Which reorder phases an optimization pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReordOpts {
    pub median: bool,
    pub starts: bool,
    pub stops: bool,
    pub full: bool,
}

impl ReordOpts {
    /// Level-to-phase table: 0-2 none, 3-5 start swaps, 6-8 start and stop
    /// swaps, 9 the full schedule.
    pub fn for_level(level: u8) -> ReordOpts {
        let mut opts = ReordOpts::default();
        match level {
            0..=2 => {}
            3..=5 => opts.starts = true,
            6..=8 => {
                opts.starts = true;
                opts.stops = true;
            }
            _ => opts.full = true,
        }
        opts
    }

    pub fn any(&self) -> bool {
        self.median || self.starts || self.stops || self.full
    }

    fn bits(&self) -> i64 {
        self.median as i64 | (self.starts as i64) << 1 | (self.stops as i64) << 2 | (self.full as i64) << 3
    }

    fn from_bits(bits: i64) -> ReordOpts {
        ReordOpts {
            median: bits & 1 != 0,
            starts: bits & 2 != 0,
            stops: bits & 4 != 0,
            full: bits & 8 != 0,
        }
    }
}

/// The four nested sizes of the index, in values. Each level divides the
/// next larger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub superblocksize: usize,
    pub blocksize: usize,
    pub slicesize: usize,
    pub chunksize: usize,
}

impl Geometry {
    /// Slice length grows with the square root of the expected row count so
    /// slice count and slice length stay balanced; chunks are a fixed
    /// fraction of a slice, blocks and superblocks fixed multiples.
    pub fn for_expected_rows(expectedrows: u64) -> Geometry {
        const CHUNK: usize = 1024;
        let n = expectedrows.max(1) as f64;
        let target = (n.sqrt() * 8.0) as usize;
        let slicesize = target.clamp(CHUNK, 1 << 20).next_multiple_of(CHUNK);
        Geometry {
            superblocksize: 256 * slicesize,
            blocksize: 16 * slicesize,
            slicesize,
            chunksize: CHUNK,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunksize == 0 || self.slicesize < self.chunksize {
            return Err(err(ErrorKind::Unsupported, "chunksize must fit in slicesize"));
        }
        if self.blocksize < self.slicesize || self.blocksize % self.slicesize != 0 {
            return Err(err(
                ErrorKind::Unsupported,
                "blocksize must be a multiple of slicesize",
            ));
        }
        if self.superblocksize < self.blocksize || self.superblocksize % self.blocksize != 0 {
            return Err(err(
                ErrorKind::Unsupported,
                "superblocksize must be a multiple of blocksize",
            ));
        }
        Ok(())
    }

    /// Chunks per slice; the trailing chunk is short when the slice length
    /// is not chunk-aligned.
    pub fn nchunks_slice(&self) -> usize {
        (self.slicesize + self.chunksize - 1) / self.chunksize
    }

    /// Inter-chunk separators per slice.
    pub fn nbounds_slice(&self) -> usize {
        (self.slicesize - 1) / self.chunksize
    }

    pub fn nslices_block(&self) -> usize {
        self.blocksize / self.slicesize
    }

    pub fn nblocks_superblock(&self) -> usize {
        self.superblocksize / self.blocksize
    }
}

const MAGIC: &[u8; 8] = b"sortidx\0";
const VERS: i64 = 0;

#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexMeta {
    pub(crate) kind: KeyKind,
    pub(crate) itemsize: usize,
    pub(crate) geo: Geometry,
    pub(crate) optlevel: u8,
    pub(crate) reord: ReordOpts,
    pub(crate) filters: Filters,
}

impl IndexMeta {
    pub(crate) fn write(&self, media: &mut Media) -> Result<()> {
        let mut buf = Vec::with_capacity(MAGIC.len() + 10 * 8);
        buf.extend_from_slice(MAGIC);
        for field in [
            VERS,
            self.kind.code(),
            self.itemsize as i64,
            self.geo.superblocksize as i64,
            self.geo.blocksize as i64,
            self.geo.slicesize as i64,
            self.geo.chunksize as i64,
            self.optlevel as i64,
            self.reord.bits(),
            self.filters.code(),
        ] {
            buf.extend_from_slice(&field.to_le_bytes());
        }
        media.set_len(buf.len() as u64)?;
        media.write_at(0, &buf)?;
        media.sync()
    }

    pub(crate) fn read(media: &mut Media) -> Result<IndexMeta> {
        let len = media.len()? as usize;
        let mut buf = vec![0u8; len];
        media.read_at(0, &mut buf)?;
        if len < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
            return Err(err(ErrorKind::Assertion, "bad magic number"));
        }
        let mut pos = MAGIC.len();
        let mut take = || -> Result<i64> {
            let end = pos + 8;
            if end > buf.len() {
                return Err(err(ErrorKind::Assertion, "truncated index attributes"));
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[pos..end]);
            pos = end;
            Ok(i64::from_le_bytes(b))
        };
        let vers = take()?;
        if vers > VERS {
            return Err(err(ErrorKind::Unsupported, "unsupported future version number"));
        }
        let kind = KeyKind::from_code(take()?)?;
        let itemsize = take()? as usize;
        let geo = Geometry {
            superblocksize: take()? as usize,
            blocksize: take()? as usize,
            slicesize: take()? as usize,
            chunksize: take()? as usize,
        };
        let optlevel = take()? as u8;
        let reord = ReordOpts::from_bits(take()?);
        let filters = Filters::from_code(take()?)?;
        geo.validate()?;
        Ok(IndexMeta {
            kind,
            itemsize,
            geo,
            optlevel,
            reord,
            filters,
        })
    }
}

#[test]
fn test_meta_roundtrip() -> Result<()> {
    let meta = IndexMeta {
        kind: KeyKind::Float64,
        itemsize: 0,
        geo: Geometry::for_expected_rows(1_000_000),
        optlevel: 6,
        reord: ReordOpts::for_level(6),
        filters: Filters::default(),
    };
    let mut media = Media::mem();
    meta.write(&mut media)?;
    let back = IndexMeta::read(&mut media)?;
    assert_eq!(back.kind, meta.kind);
    assert_eq!(back.geo, meta.geo);
    assert_eq!(back.optlevel, 6);
    assert_eq!(back.reord, ReordOpts { starts: true, stops: true, ..ReordOpts::default() });
    assert_eq!(back.filters, Filters::default());
    Ok(())
}

#[test]
fn test_geometry_validate() {
    assert!(Geometry { superblocksize: 20, blocksize: 10, slicesize: 5, chunksize: 2 }
        .validate()
        .is_ok());
    assert!(Geometry { superblocksize: 20, blocksize: 12, slicesize: 5, chunksize: 2 }
        .validate()
        .is_err());
    assert!(Geometry { superblocksize: 8, blocksize: 8, slicesize: 8, chunksize: 16 }
        .validate()
        .is_err());
}
