pub mod blob_storage;
pub mod codec;
pub mod container;
pub mod error;
pub mod header;
pub mod map_value;
pub mod registry;
pub mod source;
pub mod varint;
pub mod version;

pub use blob_storage::{BlobStorage, BlobStorageBuilder};
pub use codec::{decompressor, get_codec, CodecId, Decompressor};
pub use container::{ContainerReader, ContainerWriter};
pub use error::{Error, ErrorKind, Result};
pub use header::{DataHeader, Rect};
pub use map_value::{FileLoader, LoaderOptions, MapValue, PackOptions};
pub use registry::{ContainerInfo, ContainerLoader, Lock, PendingFileOp, Registry, SlotId, SlotStatus, UpdateOutcome};
pub use version::{ContainerVersion, Format};
