//! Container files: a version block followed by tagged sections.
//!
//! ```text
//! [ version block, absent in legacy files ]
//! [*| section 0] [*| section 1] ... [*| section n-1]
//! [ section table ]
//!     [varint n]
//!     n × ( [varint tag len] [tag bytes] [8| offset] [8| length] )
//! [8| section table offset]
//! ```
//!
//! Offsets are absolute within the file; integers are little-endian.  The
//! reader locates the table from the last eight bytes, so sections can be
//! fetched without reading anything else.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{self, Seek, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::header::DataHeader;
use crate::source::{read_u64_at, read_vec, ByteSource, FileSource, SharedSource, SourceReader, SubSource};
use crate::varint::{read_varint, write_varint};
use crate::version::{read_version, write_version_with, ContainerVersion, Format};

pub const HEADER_TAG: &str = "header";
pub const BLOBS_TAG: &str = "blobs";

const MAX_TAG_LEN: u64 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionEntry {
    pub tag:    String,
    pub offset: u64,
    pub len:    u64,
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct ContainerWriter<W: Write + Seek> {
    writer:      W,
    version:     ContainerVersion,
    sections:    Vec<SectionEntry>,
}

impl<W: Write + Seek> ContainerWriter<W> {
    /// Start a container stamped with the latest format and the process
    /// generation timestamp.
    pub fn new(writer: W) -> io::Result<Self> {
        Self::with_version(
            writer,
            ContainerVersion {
                format:    Format::LATEST,
                timestamp: crate::version::generation_timestamp(),
            },
        )
    }

    /// Start a container with an explicit version; `Legacy` omits the block.
    pub fn with_version(mut writer: W, version: ContainerVersion) -> io::Result<Self> {
        write_version_with(&mut writer, version)?;
        Ok(Self { writer, version, sections: Vec::new() })
    }

    pub fn version(&self) -> ContainerVersion {
        self.version
    }

    /// Append a section.  Tags must be unique, non-empty and short.
    pub fn add_section(&mut self, tag: &str, data: &[u8]) -> Result<()> {
        if tag.is_empty() || tag.len() as u64 > MAX_TAG_LEN {
            return Err(Error::Encode(format!("invalid section tag '{tag}'")));
        }
        if self.sections.iter().any(|s| s.tag == tag) {
            return Err(Error::Encode(format!("duplicate section '{tag}'")));
        }
        let offset = self.writer.stream_position()?;
        self.writer.write_all(data)?;
        self.sections.push(SectionEntry { tag: tag.to_owned(), offset, len: data.len() as u64 });
        Ok(())
    }

    pub fn add_header(&mut self, header: &DataHeader) -> Result<()> {
        let mut buf = Vec::new();
        header.write(&mut buf)?;
        self.add_section(HEADER_TAG, &buf)
    }

    /// Write the section table and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        let table_offset = self.writer.stream_position()?;
        write_varint(&mut self.writer, self.sections.len() as u64)?;
        for s in &self.sections {
            write_varint(&mut self.writer, s.tag.len() as u64)?;
            self.writer.write_all(s.tag.as_bytes())?;
            self.writer.write_u64::<LittleEndian>(s.offset)?;
            self.writer.write_u64::<LittleEndian>(s.len)?;
        }
        self.writer.write_u64::<LittleEndian>(table_offset)?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ContainerReader {
    source:   SharedSource,
    version:  ContainerVersion,
    sections: Vec<SectionEntry>,
}

fn corrupt_table(e: io::Error) -> Error {
    Error::open("container", format!("corrupt section table: {e}"))
}

impl ContainerReader {
    pub fn open(source: SharedSource) -> Result<Self> {
        let len = source.len();
        if len < 9 {
            return Err(Error::open("container", format!("{len} bytes is too short")));
        }

        let version = read_version(SourceReader::new(source.as_ref(), 0))?;

        let table_offset = read_u64_at(source.as_ref(), len - 8)?;
        if table_offset >= len - 8 {
            return Err(Error::open(
                "container",
                format!("section table offset {table_offset} is outside the file"),
            ));
        }
        let table_end = len - 8;
        let table = SubSource::new(source.clone(), table_offset, table_end - table_offset, "toc")
            .map_err(corrupt_table)?;
        let mut r = SourceReader::new(&table, 0);

        let count = read_varint(&mut r).map_err(corrupt_table)?;
        if count > table.len() {
            return Err(Error::open("container", format!("{count} sections cannot fit the table")));
        }
        let mut sections = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag_len = read_varint(&mut r).map_err(corrupt_table)?;
            if tag_len == 0 || tag_len > MAX_TAG_LEN {
                return Err(Error::open("container", format!("bad tag length {tag_len}")));
            }
            let mut tag = vec![0u8; tag_len as usize];
            io::Read::read_exact(&mut r, &mut tag).map_err(corrupt_table)?;
            let tag = String::from_utf8(tag)
                .map_err(|_| Error::open("container", "section tag is not UTF-8"))?;
            let offset = r.read_u64::<LittleEndian>().map_err(corrupt_table)?;
            let slen = r.read_u64::<LittleEndian>().map_err(corrupt_table)?;
            match offset.checked_add(slen) {
                Some(end) if end <= table_offset => {}
                _ => {
                    return Err(Error::open(
                        "container",
                        format!("section '{tag}' at {offset}+{slen} overlaps the table"),
                    ))
                }
            }
            sections.push(SectionEntry { tag, offset, len: slen });
        }
        if r.position() != table.len() {
            return Err(Error::open("container", "trailing bytes after the section table"));
        }

        log::debug!(
            "Opened container {} ({:?}, {} sections)",
            source.name(),
            version.format,
            sections.len()
        );
        Ok(Self { source, version, sections })
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(FileSource::shared(path)?)
    }

    pub fn version(&self) -> ContainerVersion {
        self.version
    }

    pub fn sections(&self) -> &[SectionEntry] {
        &self.sections
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    fn entry(&self, tag: &str) -> Result<&SectionEntry> {
        self.sections
            .iter()
            .find(|s| s.tag == tag)
            .ok_or_else(|| Error::NotFound(tag.to_owned()))
    }

    pub fn has_section(&self, tag: &str) -> bool {
        self.sections.iter().any(|s| s.tag == tag)
    }

    /// A view of one section, sharing the container's source.
    pub fn section(&self, tag: &str) -> Result<SharedSource> {
        let e = self.entry(tag)?;
        Ok(SubSource::shared(self.source.clone(), e.offset, e.len, tag)?)
    }

    pub fn section_bytes(&self, tag: &str) -> Result<Vec<u8>> {
        let e = self.entry(tag)?;
        Ok(read_vec(self.source.as_ref(), e.offset, e.len as usize)?)
    }

    /// Parse the map header section.
    pub fn read_header(&self) -> Result<DataHeader> {
        let bytes = self.section_bytes(HEADER_TAG)?;
        DataHeader::read(&bytes[..]).map_err(|e| Error::Decode(format!("map header: {e}")))
    }
}
