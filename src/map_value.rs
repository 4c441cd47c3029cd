//! Decoded map containers and the file-system loader that builds them.
//!
//! ```no_run
//! use mwm::map_value::{FileLoader, LoaderOptions};
//! use mwm::registry::Registry;
//!
//! let registry = Registry::new(FileLoader::new(LoaderOptions {
//!     data_dir: "maps".into(),
//!     ..LoaderOptions::default()
//! }));
//! let id = registry.add("Germany.mwm")?;
//! let lock = registry.acquire(id);
//! if let Some(map) = lock.value() {
//!     println!("{} blobs", map.blob_count());
//! }
//! # Ok::<(), mwm::Error>(())
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Cursor, Seek, Write};
use std::path::{Path, PathBuf};

use crate::blob_storage::{BlobStorage, BlobStorageBuilder, DEFAULT_BITS_IN_CHUNK_SIZE};
use crate::codec::{decompressor, CodecId};
use crate::container::{ContainerReader, ContainerWriter, BLOBS_TAG};
use crate::error::{Error, Result};
use crate::header::DataHeader;
use crate::registry::{ContainerInfo, ContainerLoader, LoadedHeader};
use crate::version::ContainerVersion;

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 6;

// ── PackOptions ──────────────────────────────────────────────────────────────

/// Configuration for [`pack_container`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub codec:              CodecId,
    pub level:              i32,
    pub bits_in_chunk_size: u8,
    /// `None` stamps the latest format and today's generation timestamp.
    pub version:            Option<ContainerVersion>,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            codec:              CodecId::default(),
            level:              DEFAULT_COMPRESSION_LEVEL,
            bits_in_chunk_size: DEFAULT_BITS_IN_CHUNK_SIZE,
            version:            None,
        }
    }
}

/// Write a complete container holding `header` and one blob per item.
pub fn pack_container<W, I, B>(writer: W, header: &DataHeader, blobs: I, opts: &PackOptions) -> Result<W>
where
    W: Write + Seek,
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut builder = BlobStorageBuilder::new(opts.codec, opts.level, opts.bits_in_chunk_size);
    for blob in blobs {
        builder.push(blob.as_ref())?;
    }
    let count = builder.len();
    let region = builder.into_bytes()?;

    let mut w = match opts.version {
        Some(v) => ContainerWriter::with_version(writer, v)?,
        None    => ContainerWriter::new(writer)?,
    };
    w.add_header(header)?;
    w.add_section(BLOBS_TAG, &region)?;
    log::debug!("Packed {count} blobs into {} byte region with {}", region.len(), opts.codec);
    w.finish()
}

/// [`pack_container`] into a new file at `path`.
pub fn pack_file<I, B>(path: &Path, header: &DataHeader, blobs: I, opts: &PackOptions) -> Result<()>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let out = pack_container(BufWriter::new(File::create(path)?), header, blobs, opts)?;
    out.into_inner().map_err(|e| Error::Read(e.into_error()))?;
    Ok(())
}

/// [`pack_container`] into memory.
pub fn pack_bytes<I, B>(header: &DataHeader, blobs: I, opts: &PackOptions) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    Ok(pack_container(Cursor::new(Vec::new()), header, blobs, opts)?.into_inner())
}

// ── MapValue ─────────────────────────────────────────────────────────────────

/// An opened container: parsed header plus its blob store.
#[derive(Debug)]
pub struct MapValue {
    container: ContainerReader,
    header:    DataHeader,
    blobs:     Option<BlobStorage>,
}

impl MapValue {
    /// Open the header and, when present, the blob section of `container`.
    pub fn open(container: ContainerReader, codec: CodecId) -> Result<Self> {
        let header = container.read_header()?;
        let blobs = match container.section(BLOBS_TAG) {
            Ok(region)               => Some(BlobStorage::open(region, decompressor(codec))?),
            Err(Error::NotFound(_)) => None,
            Err(e)                   => return Err(e),
        };
        Ok(Self { container, header, blobs })
    }

    pub fn container(&self) -> &ContainerReader {
        &self.container
    }

    pub fn header(&self) -> &DataHeader {
        &self.header
    }

    pub fn version(&self) -> ContainerVersion {
        self.container.version()
    }

    pub fn blobs(&self) -> Option<&BlobStorage> {
        self.blobs.as_ref()
    }

    pub fn blob_count(&self) -> u32 {
        self.blobs.as_ref().map_or(0, BlobStorage::size)
    }

    /// Blob `i`, or `None` when the container has no blob section or `i`
    /// is past the end.
    pub fn blob(&self, i: u32) -> Option<Result<Vec<u8>>> {
        let store = self.blobs.as_ref()?;
        (i < store.size()).then(|| store.get_blob(i))
    }
}

// ── FileLoader ───────────────────────────────────────────────────────────────

/// Configuration for [`FileLoader`].
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Directory container names are resolved against.
    pub data_dir: PathBuf,
    /// Codec the blob stores were packed with.
    pub codec:    CodecId,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("."), codec: CodecId::default() }
    }
}

/// Suffix of a downloaded replacement waiting to be swapped in.
pub const READY_SUFFIX: &str = ".ready";
/// Suffixes of a download still in progress.
pub const PARTIAL_SUFFIXES: [&str; 2] = [".resume", ".downloading"];

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Loads containers from files named after their registry names.
///
/// Updates are staged next to the container as `<name>.ready`; a download
/// in progress leaves `<name>.resume` and `<name>.downloading` behind.
#[derive(Debug, Clone, Default)]
pub struct FileLoader {
    opts: LoaderOptions,
}

impl FileLoader {
    pub fn new(opts: LoaderOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.opts
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.opts.data_dir.join(name)
    }

    /// Where the staged replacement of `name` is expected.
    pub fn ready_path_of(&self, name: &str) -> PathBuf {
        with_suffix(&self.path_of(name), READY_SUFFIX)
    }
}

impl ContainerLoader<MapValue> for FileLoader {
    fn load_info(&self, name: &str) -> Result<LoadedHeader> {
        let container = ContainerReader::open_path(&self.path_of(name))?;
        let header = container.read_header()?;
        Ok(LoadedHeader { version: container.version(), header })
    }

    fn create_value(&self, name: &str, info: &ContainerInfo) -> Result<MapValue> {
        let container = ContainerReader::open_path(&self.path_of(name))?;
        if container.version() != info.version {
            log::warn!("'{name}' changed on disk since it was registered as {}", info.id);
        }
        MapValue::open(container, self.opts.codec)
    }

    fn delete_files(&self, name: &str) -> Result<()> {
        let path = self.path_of(name);
        remove_if_present(&path)?;
        for suffix in PARTIAL_SUFFIXES.into_iter().chain([READY_SUFFIX]) {
            remove_if_present(&with_suffix(&path, suffix))?;
        }
        Ok(())
    }

    fn replace_with_ready(&self, name: &str) -> Result<()> {
        let path = self.path_of(name);
        std::fs::rename(self.ready_path_of(name), &path)?;
        for suffix in PARTIAL_SUFFIXES {
            remove_if_present(&with_suffix(&path, suffix))?;
        }
        log::info!("Installed update of '{name}'");
        Ok(())
    }
}
