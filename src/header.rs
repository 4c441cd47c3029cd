use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Axis-aligned rectangle in map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn is_valid(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }
}

/// Map header section: coverage and the scales the container is drawn at.
///
/// ```text
/// [8| min_x f64] [8| min_y f64] [8| max_x f64] [8| max_y f64]
/// [1| min_scale] [1| max_scale]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DataHeader {
    pub bounds:    Rect,
    pub min_scale: u8,
    pub max_scale: u8,
}

pub const DATA_HEADER_SIZE: usize = 4 * 8 + 2;

impl DataHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_f64::<LittleEndian>(self.bounds.min_x)?;
        writer.write_f64::<LittleEndian>(self.bounds.min_y)?;
        writer.write_f64::<LittleEndian>(self.bounds.max_x)?;
        writer.write_f64::<LittleEndian>(self.bounds.max_y)?;
        writer.write_u8(self.min_scale)?;
        writer.write_u8(self.max_scale)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let bounds = Rect {
            min_x: reader.read_f64::<LittleEndian>()?,
            min_y: reader.read_f64::<LittleEndian>()?,
            max_x: reader.read_f64::<LittleEndian>()?,
            max_y: reader.read_f64::<LittleEndian>()?,
        };
        let min_scale = reader.read_u8()?;
        let max_scale = reader.read_u8()?;
        if min_scale > max_scale {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("scale range {min_scale}..{max_scale} is inverted"),
            ));
        }
        Ok(Self { bounds, min_scale, max_scale })
    }

    pub fn scale_range(&self) -> (u8, u8) {
        (self.min_scale, self.max_scale)
    }
}
