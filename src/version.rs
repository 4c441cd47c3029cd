//! The version block at the start of every container.
//!
//! ```text
//! [4| "MWM\0"] [varint format index] [varint generation timestamp]
//! ```
//!
//! Files written before the block existed start directly with container
//! data.  Those are reported as [`Format::Legacy`] with a fixed historical
//! timestamp instead of being rejected.

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::OnceLock;

use crate::varint::{read_varint_u32, write_varint};

pub const PROLOGUE: &[u8; 4] = b"MWM\0";

/// Timestamp reported for files that predate the version block (2011-11-01).
pub const LEGACY_TIMESTAMP: u32 = 111101;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Format {
    /// No version block; never written.
    Legacy,
    /// April 2011.
    V1,
    /// November 2011: type index stored instead of raw type.
    V2,
    /// March 2013: type index in search data as well.
    V3,
}

impl Format {
    pub const LATEST: Format = Format::V3;

    /// On-disk index, `None` for [`Format::Legacy`].
    pub fn index(self) -> Option<u32> {
        match self {
            Format::Legacy => None,
            Format::V1     => Some(0),
            Format::V2     => Some(1),
            Format::V3     => Some(2),
        }
    }

    /// Maps an on-disk index, clamping anything newer to [`Format::LATEST`].
    pub fn from_index(index: u32) -> Format {
        match index {
            0 => Format::V1,
            1 => Format::V2,
            2 => Format::V3,
            _ => {
                log::error!("Unknown container format index {index}, reading as {:?}", Format::LATEST);
                Format::LATEST
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerVersion {
    pub format:    Format,
    pub timestamp: u32,
}

impl ContainerVersion {
    pub const LEGACY: ContainerVersion = ContainerVersion {
        format:    Format::Legacy,
        timestamp: LEGACY_TIMESTAMP,
    };

    pub fn is_legacy(&self) -> bool {
        self.format == Format::Legacy
    }

    /// The timestamp as a calendar date, when it is a valid `YYMMDD`.
    pub fn date(&self) -> Option<NaiveDate> {
        let yy = (self.timestamp / 10000) as i32;
        let mm = (self.timestamp / 100) % 100;
        let dd = self.timestamp % 100;
        NaiveDate::from_ymd_opt(2000 + yy, mm, dd)
    }
}

/// `YYMMDD` for a calendar date.
pub fn yymmdd(date: NaiveDate) -> u32 {
    (date.year().rem_euclid(100) as u32) * 10000 + date.month() * 100 + date.day()
}

/// Timestamp stamped on every container written by this process.
///
/// Computed once, so a batch of containers generated in one run shares it.
pub fn generation_timestamp() -> u32 {
    static GENERATION: OnceLock<u32> = OnceLock::new();
    *GENERATION.get_or_init(|| yymmdd(Utc::now().date_naive()))
}

/// Writes the latest format and the process generation timestamp.
pub fn write_version<W: Write>(writer: W) -> io::Result<()> {
    write_version_with(
        writer,
        ContainerVersion { format: Format::LATEST, timestamp: generation_timestamp() },
    )
}

/// Writes an explicit version.  [`Format::Legacy`] writes nothing.
pub fn write_version_with<W: Write>(mut writer: W, version: ContainerVersion) -> io::Result<()> {
    let Some(index) = version.format.index() else {
        return Ok(());
    };
    writer.write_all(PROLOGUE)?;
    write_varint(&mut writer, u64::from(index))?;
    write_varint(&mut writer, u64::from(version.timestamp))
}

/// Reads the version block.
///
/// A mismatching prologue is not an error: the stream is taken to be a
/// legacy container and the four consumed bytes belong to it.  A stream too
/// short to hold the prologue or a complete varint fails with the read error.
pub fn read_version<R: Read>(mut reader: R) -> io::Result<ContainerVersion> {
    let mut prologue = [0u8; 4];
    reader.read_exact(&mut prologue)?;
    if &prologue != PROLOGUE {
        log::debug!("No version prologue (found {:02x?}), assuming legacy format", prologue);
        return Ok(ContainerVersion::LEGACY);
    }
    let format = Format::from_index(read_varint_u32(&mut reader)?);
    let timestamp = read_varint_u32(&mut reader)?;
    Ok(ContainerVersion { format, timestamp })
}

/// Number of bytes the version block occupies when written for `version`.
pub fn encoded_len(version: ContainerVersion) -> usize {
    let mut buf = Vec::new();
    // writing into a Vec cannot fail
    let _ = write_version_with(&mut buf, version);
    buf.len()
}
