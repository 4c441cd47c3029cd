//! Read-only positional byte sources.
//!
//! Every reader in the crate is opened over a [`SharedSource`]: a whole
//! container file, or a [`SubSource`] view of one of its sections.  Sources
//! are immutable once built and are shared between threads, so reads take
//! `&self` and carry their own offset.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

pub trait ByteSource: Send + Sync + fmt::Debug {
    /// Total number of readable bytes.
    fn len(&self) -> u64;

    /// Fill `buf` from `offset`.  Reading past the end is `UnexpectedEof`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Name used in diagnostics.
    fn name(&self) -> &str;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type SharedSource = Arc<dyn ByteSource>;

fn check_range(name: &str, len: u64, offset: u64, size: u64) -> io::Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("read of {size} bytes at {offset} exceeds '{name}' ({len} bytes)"),
        )),
    }
}

// ── MemorySource ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self { name: name.into(), data: data.into() }
    }

    pub fn shared(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> SharedSource {
        Arc::new(Self::new(name, data))
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(&self.name, self.len(), offset, buf.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ── FileSource ───────────────────────────────────────────────────────────────

/// A file opened once and read with seek + read under a short lock.
#[derive(Debug)]
pub struct FileSource {
    name: String,
    file: Mutex<File>,
    size: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path {} is not a regular file", path.display()),
            ));
        }
        Ok(Self {
            name: path.display().to_string(),
            file: Mutex::new(file),
            size: meta.len(),
        })
    }

    pub fn shared(path: &Path) -> io::Result<SharedSource> {
        Ok(Arc::new(Self::open(path)?))
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(&self.name, self.size, offset, buf.len() as u64)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ── SubSource ────────────────────────────────────────────────────────────────

/// A window `[offset, offset + len)` of another source.
#[derive(Debug)]
pub struct SubSource {
    inner:  SharedSource,
    offset: u64,
    len:    u64,
    name:   String,
}

impl SubSource {
    /// Fails with `UnexpectedEof` when the window does not fit `inner`.
    pub fn new(inner: SharedSource, offset: u64, len: u64, label: &str) -> io::Result<Self> {
        check_range(inner.name(), inner.len(), offset, len)?;
        let name = format!("{}[{label}]", inner.name());
        Ok(Self { inner, offset, len, name })
    }

    pub fn shared(inner: SharedSource, offset: u64, len: u64, label: &str) -> io::Result<SharedSource> {
        Ok(Arc::new(Self::new(inner, offset, len, label)?))
    }
}

impl ByteSource for SubSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(&self.name, self.len, offset, buf.len() as u64)?;
        self.inner.read_at(self.offset + offset, buf)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

pub fn read_vec(src: &dyn ByteSource, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    src.read_at(offset, &mut buf)?;
    Ok(buf)
}

pub fn read_u32_at(src: &dyn ByteSource, offset: u64) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    src.read_at(offset, &mut buf)?;
    Ok(LittleEndian::read_u32(&buf))
}

pub fn read_u64_at(src: &dyn ByteSource, offset: u64) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    src.read_at(offset, &mut buf)?;
    Ok(LittleEndian::read_u64(&buf))
}

/// Sequential `Read` adapter over a source, for stream-shaped decoders.
pub struct SourceReader<'a> {
    src: &'a dyn ByteSource,
    pos: u64,
}

impl<'a> SourceReader<'a> {
    pub fn new(src: &'a dyn ByteSource, pos: u64) -> Self {
        Self { src, pos }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.src.len().saturating_sub(self.pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.src.read_at(self.pos, &mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sub_source_is_windowed() {
        let base = MemorySource::shared("base", b"0123456789".to_vec());
        let sub = SubSource::shared(base, 3, 4, "mid").unwrap();
        assert_eq!(sub.len(), 4);
        assert_eq!(read_vec(sub.as_ref(), 0, 4).unwrap(), b"3456");
        assert_eq!(read_vec(sub.as_ref(), 2, 2).unwrap(), b"56");
        let err = read_vec(sub.as_ref(), 2, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(sub.name(), "base[mid]");
    }

    #[test]
    fn sub_source_must_fit() {
        let base = MemorySource::shared("base", vec![0u8; 8]);
        assert!(SubSource::new(base.clone(), 4, 5, "x").is_err());
        assert!(SubSource::new(base, u64::MAX, 2, "x").is_err());
    }

    #[test]
    fn file_source_reads_at_offsets() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        tmp.flush().unwrap();

        let src = FileSource::open(tmp.path()).unwrap();
        assert_eq!(src.len(), 12);
        assert_eq!(read_u32_at(&src, 0).unwrap(), 1);
        assert_eq!(read_u64_at(&src, 4).unwrap(), 2);
        assert!(read_u32_at(&src, 10).is_err());
    }

    #[test]
    fn source_reader_stops_at_end() {
        let base = MemorySource::new("base", b"abc".to_vec());
        let mut r = SourceReader::new(&base, 1);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"bc");
        assert_eq!(r.position(), 3);
    }
}
