//! Unsigned LEB128 varints: seven payload bits per byte, high bit set on
//! every byte except the last.

use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub fn write_varint<W: Write>(mut writer: W, mut value: u64) -> io::Result<()> {
    while value >= 0x80 {
        writer.write_u8((value as u8 & 0x7F) | 0x80)?;
        value >>= 7;
    }
    writer.write_u8(value as u8)
}

pub fn read_varint<R: Read>(mut reader: R) -> io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8()?;
        if shift == 63 && byte > 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflows u64"));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"));
        }
    }
}

/// Reads a varint that must fit in 32 bits.
pub fn read_varint_u32<R: Read>(reader: R) -> io::Result<u32> {
    let value = read_varint(reader)?;
    u32::try_from(value).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, format!("varint {value} does not fit u32"))
    })
}
