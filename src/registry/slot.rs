use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::header::{DataHeader, Rect};
use crate::version::ContainerVersion;

/// Stable handle of a registry slot.
///
/// `index` never changes for the life of the registry.  `generation` is
/// bumped each time the slot is reused for another container, which keeps
/// an id issued for the previous occupant from resolving to the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId {
    index:      u32,
    generation: u32,
}

impl SlotId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotStatus {
    Active,
    /// Removed; resources live on until the last lock is released.
    Stale,
}

/// File work owed to a stale slot, run by the release that frees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PendingFileOp {
    /// Delete the container's files.
    Delete,
    /// Move the staged replacement into place and register it again.
    Replace,
}

/// What a loader reports about a container without opening its value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadedHeader {
    pub version: ContainerVersion,
    pub header:  DataHeader,
}

/// Point-in-time metadata of one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerInfo {
    pub id:         SlotId,
    pub name:       String,
    pub version:    ContainerVersion,
    pub min_scale:  u8,
    pub max_scale:  u8,
    pub bounds:     Rect,
    pub status:     SlotStatus,
    pub lock_count: u32,
    pub pending:    Option<PendingFileOp>,
}

impl ContainerInfo {
    pub(crate) fn new(id: SlotId, name: &str, loaded: LoadedHeader) -> Self {
        Self {
            id,
            name:       name.to_owned(),
            version:    loaded.version,
            min_scale:  loaded.header.min_scale,
            max_scale:  loaded.header.max_scale,
            bounds:     loaded.header.bounds,
            status:     SlotStatus::Active,
            lock_count: 0,
            pending:    None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SlotStatus::Active
    }

    /// Stale with nobody holding it and no file work owed: may be
    /// overwritten by the next add.
    pub fn is_reusable(&self) -> bool {
        self.status == SlotStatus::Stale && self.lock_count == 0 && self.pending.is_none()
    }
}

pub(crate) struct Slot<V> {
    pub(crate) info:  ContainerInfo,
    pub(crate) value: Option<Arc<V>>,
}
