//! Chunked, compressed blob store with random access by blob number.
//!
//! Blobs are grouped into chunks and each chunk is compressed as one unit.
//! `nb` is the number of blobs, `nc` the number of chunks.
//!
//! ```text
//! [3| "Blb"] [1| bits in chunk size]
//! [*| chunk 0    ] [*| chunk 1    ] ... [*| chunk nc-1       ]
//! [4| chunk 0 end] [4| chunk 1 end] ... [4| chunk nc-1 end   ]
//! [4| blob info 0] [4| blob info 1] ... [4| blob info nb-1   ]
//! [4| nb]
//! ```
//!
//! Chunk ends are measured from the first chunk (byte 4 of the region).  A
//! chunk is its compressed payload followed by `[4| uncompressed size]`.
//! A blob info packs the chunk number above the offset of the blob inside
//! the uncompressed chunk:
//!
//! ```text
//! | 32 - bits: chunk number | bits: offset in uncompressed chunk |
//! ```
//!
//! All integers are little-endian.  The trailer is parsed backwards from
//! the end of the region, so the region must be exactly the bytes the
//! builder wrote.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fmt;
use std::io::Write;
use std::ops::Range;

use crate::codec::{get_codec, Codec, CodecId, Decompressor};
use crate::error::{Error, Result};
use crate::source::{read_u32_at, read_vec, SharedSource};

pub const BLOB_MAGIC: &[u8; 3] = b"Blb";
/// Size of the magic plus the bit-split byte; chunk 0 starts here.
pub const START_OFFSET: u64 = 4;
/// Default chunk capacity: 64 KiB of uncompressed blob data.
pub const DEFAULT_BITS_IN_CHUNK_SIZE: u8 = 16;
/// Largest uncompressed chunk a reader will allocate for.  Only a chunk
/// holding a single oversize blob may declare more than `1 << bits`.
pub const MAX_CHUNK_LEN: usize = 1 << 30;

fn read_table(source: &SharedSource, offset: u64, count: u32) -> Result<Vec<u32>> {
    let raw = read_vec(source.as_ref(), offset, count as usize * 4)?;
    Ok(raw.chunks_exact(4).map(LittleEndian::read_u32).collect())
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct BlobStorage {
    source:             SharedSource,
    decompressor:       Decompressor,
    bits_in_chunk_size: u32,
    blob_info:          Vec<u32>,
    chunk_offset:       Vec<u32>,
}

impl fmt::Debug for BlobStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStorage")
            .field("source", &self.source.name())
            .field("bits_in_chunk_size", &self.bits_in_chunk_size)
            .field("blobs", &self.blob_info.len())
            .field("chunks", &self.chunk_offset.len())
            .finish()
    }
}

impl BlobStorage {
    /// Open a blob store spanning the whole of `source`.
    ///
    /// Fails with [`Error::Open`] on a bad magic or a trailer that does not
    /// describe the region, and with [`Error::Read`] when the source fails.
    pub fn open(source: SharedSource, decompressor: Decompressor) -> Result<Self> {
        const WHAT: &str = "blob storage";

        let len = source.len();
        if len < START_OFFSET + 4 {
            return Err(Error::open(WHAT, format!("region of {len} bytes is too short")));
        }

        let header = read_vec(source.as_ref(), 0, START_OFFSET as usize)?;
        if &header[..3] != BLOB_MAGIC {
            return Err(Error::open(WHAT, format!("bad magic {:02x?}", &header[..3])));
        }
        let bits_in_chunk_size = u32::from(header[3]);
        if !(1..=31).contains(&bits_in_chunk_size) {
            return Err(Error::open(WHAT, format!("bits in chunk size {bits_in_chunk_size} out of range")));
        }

        let blob_count = read_u32_at(source.as_ref(), len - 4)?;
        let info_bytes = 4 * u64::from(blob_count);
        if len - 4 < START_OFFSET + info_bytes {
            return Err(Error::open(WHAT, format!("{blob_count} blob infos do not fit {len} bytes")));
        }
        let info_start = len - 4 - info_bytes;
        let blob_info = read_table(&source, info_start, blob_count)?;

        let chunk_count = blob_info.last().map_or(0, |&bi| (bi >> bits_in_chunk_size) + 1);
        let chunk_bytes = 4 * u64::from(chunk_count);
        if info_start < START_OFFSET + chunk_bytes {
            return Err(Error::open(WHAT, format!("{chunk_count} chunk offsets do not fit {len} bytes")));
        }
        let chunk_table_start = info_start - chunk_bytes;
        let chunk_offset = read_table(&source, chunk_table_start, chunk_count)?;

        // Packed infos sort by (chunk, offset), so both tables are monotonic.
        if blob_info.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::open(WHAT, "blob infos are not sorted"));
        }
        if chunk_offset.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::open(WHAT, "chunk offsets are not sorted"));
        }
        let chunks_end = u64::from(chunk_offset.last().copied().unwrap_or(0));
        if START_OFFSET + chunks_end != chunk_table_start {
            return Err(Error::open(
                WHAT,
                format!("chunks end at {chunks_end} but the offset table starts at {chunk_table_start}"),
            ));
        }

        log::trace!(
            "Opened blob storage {}: {blob_count} blobs in {chunk_count} chunks",
            source.name()
        );

        Ok(Self { source, decompressor, bits_in_chunk_size, blob_info, chunk_offset })
    }

    /// Number of blobs.
    pub fn size(&self) -> u32 {
        self.blob_info.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.blob_info.is_empty()
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_offset.len() as u32
    }

    pub fn bits_in_chunk_size(&self) -> u32 {
        self.bits_in_chunk_size
    }

    fn chunk_of(&self, blob_info: u32) -> u32 {
        blob_info >> self.bits_in_chunk_size
    }

    fn offset_of(&self, blob_info: u32) -> u32 {
        blob_info & ((1 << self.bits_in_chunk_size) - 1)
    }

    /// Blob `i`, starting from 0.
    ///
    /// # Panics
    /// When `i >= self.size()`.
    pub fn get_blob(&self, i: u32) -> Result<Vec<u8>> {
        assert!(i < self.size(), "blob index {i} out of range 0..{}", self.size());
        let chunk = self.chunk_of(self.blob_info[i as usize]);
        let data = self.read_chunk(chunk)?;
        let range = self.blob_range(i, data.len())?;
        Ok(data[range].to_vec())
    }

    /// Blobs `range.start..range.end`, decompressing each touched chunk once.
    ///
    /// # Panics
    /// When the range reaches past `self.size()`.
    pub fn get_blobs(&self, range: Range<u32>) -> Result<Vec<Vec<u8>>> {
        assert!(
            range.start <= range.end && range.end <= self.size(),
            "blob range {range:?} out of range 0..{}",
            self.size()
        );
        let mut out = Vec::with_capacity(range.len());
        let mut current: Option<(u32, Vec<u8>)> = None;
        for i in range {
            let chunk = self.chunk_of(self.blob_info[i as usize]);
            if !matches!(&current, Some((c, _)) if *c == chunk) {
                current = Some((chunk, self.read_chunk(chunk)?));
            }
            if let Some((_, data)) = &current {
                let blob_range = self.blob_range(i, data.len())?;
                out.push(data[blob_range].to_vec());
            }
        }
        Ok(out)
    }

    fn read_chunk(&self, chunk: u32) -> Result<Vec<u8>> {
        let chunk = chunk as usize;
        let beg = if chunk == 0 { 0 } else { self.chunk_offset[chunk - 1] };
        let end = self.chunk_offset[chunk];
        let stored_len = (end - beg) as usize;
        if stored_len < 4 {
            return Err(Error::Decode(format!(
                "chunk {chunk} is {stored_len} bytes, too short for its size field"
            )));
        }

        let stored = read_vec(self.source.as_ref(), START_OFFSET + u64::from(beg), stored_len)?;
        let (payload, size_field) = stored.split_at(stored_len - 4);
        let declared = LittleEndian::read_u32(size_field) as usize;
        let limit = if self.blobs_in_chunk(chunk as u32) > 1 {
            1usize << self.bits_in_chunk_size
        } else {
            MAX_CHUNK_LEN
        };
        if declared > limit {
            return Err(Error::Decode(format!(
                "chunk {chunk} declares {declared} bytes, limit is {limit}"
            )));
        }

        let mut data = vec![0u8; declared];
        (self.decompressor)(payload, &mut data)?;
        Ok(data)
    }

    fn blobs_in_chunk(&self, chunk: u32) -> usize {
        let first = self.blob_info.partition_point(|&bi| self.chunk_of(bi) < chunk);
        let last = self.blob_info.partition_point(|&bi| self.chunk_of(bi) <= chunk);
        last - first
    }

    fn blob_range(&self, i: u32, chunk_len: usize) -> Result<Range<usize>> {
        let info = self.blob_info[i as usize];
        let chunk = self.chunk_of(info);
        let start = self.offset_of(info) as usize;
        let end = match self.blob_info.get(i as usize + 1) {
            Some(&next) if self.chunk_of(next) == chunk => self.offset_of(next) as usize,
            _ => chunk_len,
        };
        if start > end || end > chunk_len {
            return Err(Error::Decode(format!(
                "blob {i} spans {start}..{end} of a {chunk_len}-byte chunk"
            )));
        }
        Ok(start..end)
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Writes the region [`BlobStorage`] reads.
///
/// A chunk is closed as soon as the next blob would push its uncompressed
/// size over `1 << bits_in_chunk_size`.  A blob bigger than that gets a
/// chunk of its own.
pub struct BlobStorageBuilder {
    codec:              Box<dyn Codec>,
    level:              i32,
    bits_in_chunk_size: u8,
    chunks:             Vec<u8>,
    chunk_ends:         Vec<u32>,
    blob_info:          Vec<u32>,
    pending:            Vec<u8>,
    pending_blobs:      usize,
}

impl BlobStorageBuilder {
    /// # Panics
    /// When `bits_in_chunk_size` is not in `1..=31`.
    pub fn new(codec: CodecId, level: i32, bits_in_chunk_size: u8) -> Self {
        assert!(
            (1..=31).contains(&bits_in_chunk_size),
            "bits in chunk size {bits_in_chunk_size} out of range 1..=31"
        );
        Self {
            codec: get_codec(codec),
            level,
            bits_in_chunk_size,
            chunks: Vec::new(),
            chunk_ends: Vec::new(),
            blob_info: Vec::new(),
            pending: Vec::new(),
            pending_blobs: 0,
        }
    }

    fn capacity(&self) -> usize {
        1usize << self.bits_in_chunk_size
    }

    pub fn len(&self) -> usize {
        self.blob_info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blob_info.is_empty()
    }

    /// Append a blob and return its number.
    pub fn push(&mut self, blob: &[u8]) -> Result<u32> {
        let cap = self.capacity();
        if self.pending_blobs > 0
            && (self.pending.len() + blob.len() > cap || self.pending.len() >= cap)
        {
            self.flush_chunk()?;
        }

        let chunk = self.chunk_ends.len() as u64;
        let max_chunks = 1u64 << (32 - u32::from(self.bits_in_chunk_size));
        if chunk >= max_chunks {
            return Err(Error::Encode(format!(
                "chunk {chunk} does not fit {} bits",
                32 - self.bits_in_chunk_size
            )));
        }
        if blob.len() > MAX_CHUNK_LEN {
            return Err(Error::Encode(format!(
                "blob of {} bytes exceeds the {MAX_CHUNK_LEN} byte chunk limit",
                blob.len()
            )));
        }
        let index = u32::try_from(self.blob_info.len())
            .map_err(|_| Error::Encode("too many blobs".into()))?;

        let info = ((chunk as u32) << self.bits_in_chunk_size) | self.pending.len() as u32;
        self.blob_info.push(info);
        self.pending.extend_from_slice(blob);
        self.pending_blobs += 1;
        Ok(index)
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.pending_blobs == 0 {
            return Ok(());
        }
        let raw_len = u32::try_from(self.pending.len())
            .map_err(|_| Error::Encode(format!("chunk of {} bytes", self.pending.len())))?;
        let compressed = self
            .codec
            .compress(&self.pending, self.level)
            .map_err(|e| Error::Encode(e.to_string()))?;
        self.chunks.extend_from_slice(&compressed);
        self.chunks.write_u32::<LittleEndian>(raw_len)?;

        let end = u32::try_from(self.chunks.len())
            .map_err(|_| Error::Encode("compressed chunks exceed 4 GiB".into()))?;
        self.chunk_ends.push(end);
        self.pending.clear();
        self.pending_blobs = 0;
        Ok(())
    }

    /// Close the last chunk and write the region.  Returns bytes written.
    pub fn finish<W: Write>(mut self, mut writer: W) -> Result<u64> {
        self.flush_chunk()?;
        writer.write_all(BLOB_MAGIC)?;
        writer.write_u8(self.bits_in_chunk_size)?;
        writer.write_all(&self.chunks)?;
        for &end in &self.chunk_ends {
            writer.write_u32::<LittleEndian>(end)?;
        }
        for &info in &self.blob_info {
            writer.write_u32::<LittleEndian>(info)?;
        }
        writer.write_u32::<LittleEndian>(self.blob_info.len() as u32)?;

        Ok(START_OFFSET
            + self.chunks.len() as u64
            + 4 * (self.chunk_ends.len() + self.blob_info.len()) as u64
            + 4)
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.finish(&mut out)?;
        Ok(out)
    }
}
