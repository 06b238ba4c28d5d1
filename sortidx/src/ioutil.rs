// Index arrays are mutated in place (the optimizer rewrites whole slices),
// so media expose positioned reads and writes rather than streaming
// reader/writer pairs. The memory backend mirrors the file backend for
// ephemeral indexes and tests.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use sortidx_base::{err, ErrorKind, Result};

#[cfg(test)]
use test_log::test;

#[derive(Debug)]
pub(crate) enum Media {
    Mem(Vec<u8>),
    File(File),
}

impl Media {
    pub(crate) fn mem() -> Media {
        Media::Mem(Vec::new())
    }

    // Fresh index files must not silently clobber existing ones.
    pub(crate) fn create_file(path: &Path) -> Result<Media> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Media::File(file))
    }

    pub(crate) fn open_file(path: &Path) -> Result<Media> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Media::File(file))
    }

    pub(crate) fn len(&mut self) -> Result<u64> {
        match self {
            Media::Mem(v) => Ok(v.len() as u64),
            Media::File(f) => Ok(f.metadata()?.len()),
        }
    }

    pub(crate) fn set_len(&mut self, len: u64) -> Result<()> {
        match self {
            Media::Mem(v) => {
                v.resize(len as usize, 0);
                Ok(())
            }
            Media::File(f) => {
                f.set_len(len)?;
                Ok(())
            }
        }
    }

    pub(crate) fn read_at(&mut self, off: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Media::Mem(v) => {
                let off = off as usize;
                let end = off
                    .checked_add(buf.len())
                    .filter(|&e| e <= v.len())
                    .ok_or_else(|| err(ErrorKind::OutOfRange, "read past end of media"))?;
                buf.copy_from_slice(&v[off..end]);
                Ok(())
            }
            Media::File(f) => {
                f.seek(SeekFrom::Start(off))?;
                f.read_exact(buf)?;
                Ok(())
            }
        }
    }

    pub(crate) fn write_at(&mut self, off: u64, buf: &[u8]) -> Result<()> {
        match self {
            Media::Mem(v) => {
                let off = off as usize;
                let end = off + buf.len();
                if v.len() < end {
                    v.resize(end, 0);
                }
                v[off..end].copy_from_slice(buf);
                Ok(())
            }
            Media::File(f) => {
                f.seek(SeekFrom::Start(off))?;
                f.write_all(buf)?;
                Ok(())
            }
        }
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        match self {
            Media::Mem(_) => Ok(()),
            Media::File(f) => {
                f.sync_all()?;
                Ok(())
            }
        }
    }
}

#[test]
fn test_mem_positioned_io() -> Result<()> {
    let mut m = Media::mem();
    m.write_at(4, &[1, 2, 3])?;
    assert_eq!(m.len()?, 7);
    let mut buf = [0u8; 3];
    m.read_at(4, &mut buf)?;
    assert_eq!(buf, [1, 2, 3]);
    assert!(m.read_at(6, &mut buf).is_err());
    Ok(())
}

#[test]
fn test_create_new_refuses_existing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("arr");
    let _first = Media::create_file(&path)?;
    assert!(Media::create_file(&path).is_err());
    Ok(())
}
